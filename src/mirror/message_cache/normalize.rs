use sha2::{Digest, Sha256};

use super::types::{DeliveryState, KeySource, MessageType, NormalizedMessage};
use crate::mirror::chat_aggregator::{
    AggregationError, NameDirectory, derive_chat_id, effective_timestamp, extract_preview,
    format_phone_number,
};
use crate::mirror::config::DedupKeyPolicy;
use crate::mirror::event_store::StoredEvent;
use crate::types::RawEvent;

const SENDER_PREFIX_CHARS: usize = 8;
const CONTENT_HASH_HEX_CHARS: usize = 12;

/// Converts a stored event into the cache representation.
pub fn normalize(
    stored: &StoredEvent,
    policy: DedupKeyPolicy,
    names: &NameDirectory,
) -> Result<NormalizedMessage, AggregationError> {
    let event = &stored.event;
    let chat_id = derive_chat_id(event)?;
    let timestamp = effective_timestamp(stored);

    let (id, key_source) = match &event.message_id {
        Some(message_id) => (message_id.clone(), KeySource::Provider),
        None => (derived_key(event, policy), KeySource::Derived),
    };

    let sender_name = match event.sender.name() {
        Some(name) => name.to_string(),
        None => names
            .lookup(&event.sender.id)
            .unwrap_or_else(|| format_phone_number(&event.sender.id)),
    };

    Ok(NormalizedMessage {
        id,
        chat_id,
        timestamp,
        from_me: event.from_me,
        is_group: event.is_group,
        sender_id: event.sender.id.clone(),
        sender_name,
        preview: extract_preview(event),
        message_type: MessageType::from(&event.content),
        media_ref: event.content.media_url().map(str::to_string),
        key_source,
        correlation_id: event.correlation_id.clone(),
        delivery: DeliveryState::Confirmed,
    })
}

/// Builds a dedup key for an event the provider did not assign an id to.
///
/// Only fields carried by the event itself go into the key, so the same event
/// gets the same key whether it arrived on the push channel or was read back
/// from the store. Without a `moment` the key is a pure content hash.
pub fn derived_key(event: &RawEvent, policy: DedupKeyPolicy) -> String {
    let sender_prefix: String = event.sender.id.chars().take(SENDER_PREFIX_CHARS).collect();

    match (policy, event.moment) {
        (DedupKeyPolicy::TimestampSender, Some(moment)) => format!("{moment}:{sender_prefix}"),
        (_, Some(moment)) => {
            let digest = content_digest(event, Some(moment));
            format!("derived:{moment}:{sender_prefix}:{digest}")
        }
        (_, None) => {
            let digest = content_digest(event, None);
            format!("derived:{sender_prefix}:{digest}")
        }
    }
}

fn content_digest(event: &RawEvent, moment: Option<i64>) -> String {
    let mut hasher = Sha256::new();
    if let Some(moment) = moment {
        hasher.update(moment.to_be_bytes());
    }
    hasher.update(event.sender.id.as_bytes());
    hasher.update([0u8]);
    hasher.update(event.chat.id.as_bytes());
    hasher.update([0u8]);
    hasher.update(event.instance_id.as_bytes());
    hasher.update([u8::from(event.from_me)]);
    hasher.update(format!("{:?}", event.content).as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..CONTENT_HASH_HEX_CHARS].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{group_event, stored, text_event};
    use crate::types::{ChatId, MessageContent, Participant};

    #[test]
    fn test_provider_id_is_used_when_present() {
        let mut event = text_event("P", false, 10, "hi");
        event.message_id = Some("PROVIDER-1".to_string());

        let message = normalize(&stored(1, event), DedupKeyPolicy::ContentHash, &NameDirectory::new())
            .unwrap();

        assert_eq!(message.id, "PROVIDER-1");
        assert_eq!(message.key_source, KeySource::Provider);
        assert_eq!(message.chat_id, ChatId::from("P"));
        assert_eq!(message.message_type, MessageType::Text);
        assert_eq!(message.delivery, DeliveryState::Confirmed);
    }

    #[test]
    fn test_content_hash_keys_distinguish_same_second_messages() {
        let first = text_event("P", false, 10, "one");
        let second = text_event("P", false, 10, "two");

        let a = derived_key(&first, DedupKeyPolicy::ContentHash);
        let b = derived_key(&second, DedupKeyPolicy::ContentHash);

        assert_ne!(a, b);
        assert!(a.starts_with("derived:10:P:"));
        assert_eq!(a, derived_key(&first, DedupKeyPolicy::ContentHash));
    }

    #[test]
    fn test_timestamp_sender_keys_coalesce_same_second_messages() {
        let first = text_event("5511987654321", false, 10, "one");
        let second = text_event("5511987654321", false, 10, "two");

        let a = derived_key(&first, DedupKeyPolicy::TimestampSender);
        let b = derived_key(&second, DedupKeyPolicy::TimestampSender);

        assert_eq!(a, b);
        assert_eq!(a, "10:55119876");
    }

    #[test]
    fn test_key_without_moment_ignores_ingestion_time() {
        let mut event = text_event("P", false, 0, "no clock");
        event.moment = None;
        let pushed = StoredEvent {
            seq: i64::MAX,
            received_at: 1_000,
            event: event.clone(),
        };
        let polled = StoredEvent {
            seq: 7,
            received_at: 1_002,
            event,
        };

        for policy in [DedupKeyPolicy::ContentHash, DedupKeyPolicy::TimestampSender] {
            let names = NameDirectory::new();
            let a = normalize(&pushed, policy, &names).unwrap();
            let b = normalize(&polled, policy, &names).unwrap();
            assert_eq!(a.id, b.id);
            assert!(a.id.starts_with("derived:P:"));
            assert_eq!(a.timestamp, 1_000);
        }
    }

    #[test]
    fn test_sender_name_falls_back_to_directory_then_phone() {
        let names = NameDirectory::new();
        let mut named = group_event("G", "5511987654321", 1, "hi");
        named.sender = Participant::new("5511987654321", Some("Ana"));
        names.observe(&named);

        let anonymous = group_event("G", "5511987654321", 2, "again");
        let message = normalize(&stored(2, anonymous), DedupKeyPolicy::ContentHash, &names).unwrap();
        assert_eq!(message.sender_name, "Ana");

        let stranger = group_event("G", "5511900000000", 3, "hello");
        let message = normalize(&stored(3, stranger), DedupKeyPolicy::ContentHash, &NameDirectory::new())
            .unwrap();
        assert_eq!(message.sender_name, "+55 11 90000-0000");
    }

    #[test]
    fn test_media_ref_and_type_are_carried() {
        let mut event = text_event("P", false, 1, "");
        event.content = MessageContent::Image {
            caption: None,
            media_url: Some("https://cdn/img.jpg".to_string()),
            mime_type: Some("image/jpeg".to_string()),
        };

        let message = normalize(&stored(1, event), DedupKeyPolicy::ContentHash, &NameDirectory::new())
            .unwrap();

        assert_eq!(message.message_type, MessageType::Image);
        assert_eq!(message.media_ref.as_deref(), Some("https://cdn/img.jpg"));
        assert_eq!(message.preview, "image");
    }

    #[test]
    fn test_unresolvable_chat_is_an_error() {
        let mut event = text_event("P", false, 1, "hi");
        event.sender = Participant::default();

        let result = normalize(&stored(1, event), DedupKeyPolicy::ContentHash, &NameDirectory::new());

        assert_eq!(result, Err(AggregationError::MissingSenderId));
    }
}
