//! Builders shared by unit tests.

use crate::mirror::event_store::{MemoryEventStore, StoredEvent};
use crate::types::{MessageContent, Participant, RawEvent};

/// A 1:1 text event with `contact`. Our own messages are sent by `"me"` to the contact.
pub fn text_event(contact: &str, from_me: bool, moment: i64, body: &str) -> RawEvent {
    let (sender, chat) = if from_me {
        (Participant::new("me", None), Participant::new(contact, None))
    } else {
        (Participant::new(contact, None), Participant::new(contact, None))
    };

    RawEvent {
        event_type: "ReceivedCallback".to_string(),
        instance_id: "instance-1".to_string(),
        message_id: None,
        from_me,
        is_group: false,
        moment: Some(moment),
        sender,
        chat,
        correlation_id: None,
        content: MessageContent::text(body),
    }
}

pub fn group_event(group: &str, sender: &str, moment: i64, body: &str) -> RawEvent {
    RawEvent {
        event_type: "ReceivedCallback".to_string(),
        instance_id: "instance-1".to_string(),
        message_id: None,
        from_me: false,
        is_group: true,
        moment: Some(moment),
        sender: Participant::new(sender, None),
        chat: Participant::new(group, None),
        correlation_id: None,
        content: MessageContent::text(body),
    }
}

pub fn stored(seq: i64, event: RawEvent) -> StoredEvent {
    StoredEvent {
        seq,
        received_at: event.moment.unwrap_or(seq),
        event,
    }
}

/// A memory store holding `events` in the given append order.
pub async fn memory_store_with(events: impl IntoIterator<Item = RawEvent>) -> MemoryEventStore {
    let store = MemoryEventStore::new();
    for event in events {
        let received_at = event.moment.unwrap_or(0);
        store.append_at(event, received_at).await;
    }
    store
}
