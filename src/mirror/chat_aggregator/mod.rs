//! Chat Aggregation Module
//!
//! Pure functions that derive a stable chat identity and a human preview from a raw
//! event, the chat list built from those, and a small name-resolution cache.

mod names;
mod preview;

#[cfg(test)]
mod tests;

pub use names::{NameDirectory, format_phone_number};
pub use preview::{PREVIEW_MAX_CHARS, extract_preview, preview_for};

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mirror::event_store::StoredEvent;
use crate::types::{ChatId, RawEvent};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("Event has no chat id")]
    MissingChatId,

    #[error("Inbound individual event has no sender id")]
    MissingSenderId,
}

/// Derives the conversation key for an event.
///
/// Groups resolve to the group id. A 1:1 conversation always resolves to the
/// other party: the recipient for our own messages, the sender otherwise.
pub fn derive_chat_id(event: &RawEvent) -> Result<ChatId, AggregationError> {
    if event.is_group || event.from_me {
        non_empty(&event.chat.id)
            .map(ChatId::from)
            .ok_or(AggregationError::MissingChatId)
    } else {
        non_empty(&event.sender.id)
            .map(ChatId::from)
            .ok_or(AggregationError::MissingSenderId)
    }
}

fn non_empty(id: &str) -> Option<&str> {
    let id = id.trim();
    (!id.is_empty()).then_some(id)
}

/// Timestamp used for ordering: the provider moment, or the ingestion time if absent.
pub fn effective_timestamp(stored: &StoredEvent) -> i64 {
    stored.event.moment.unwrap_or(stored.received_at)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatType {
    Individual,
    Group,
}

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub display_name: String,
    pub chat_type: ChatType,
    pub last_activity_timestamp: i64,
    pub last_preview: String,
    pub last_from_me: bool,
    pub participant_count_estimate: usize,
    pub is_business: bool,
}

#[derive(Debug, Default)]
struct ChatEntry {
    summary: Option<ChatSummary>,
    /// `(timestamp, seq)` of the event that owns the summary.
    owner: (i64, i64),
    participants: HashSet<String>,
}

/// Incrementally maintained set of chat summaries, one per derived chat id.
///
/// A summary is always owned by the most recent event for its chat; ties on the
/// timestamp go to the later append.
#[derive(Debug, Default)]
pub struct ChatList {
    entries: HashMap<ChatId, ChatEntry>,
}

impl ChatList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the list from a batch of events in any order.
    pub fn from_events(events: &[StoredEvent], names: &NameDirectory) -> Self {
        let mut list = Self::new();
        for stored in events {
            names.observe(&stored.event);
        }
        for stored in events {
            if let Err(e) = list.apply(stored, names, events) {
                tracing::warn!(
                    target: "chatmirror::chat_aggregator::from_events",
                    "Skipping event {} in chat list: {}",
                    stored.seq,
                    e
                );
            }
        }
        list
    }

    /// Folds one event into the list.
    ///
    /// Returns the updated summary when the event became the chat's most recent one,
    /// `None` when an older event only contributed participants.
    pub fn apply(
        &mut self,
        stored: &StoredEvent,
        names: &NameDirectory,
        context: &[StoredEvent],
    ) -> Result<Option<ChatSummary>, AggregationError> {
        let event = &stored.event;
        let chat_id = derive_chat_id(event)?;
        let entry = self.entries.entry(chat_id.clone()).or_default();

        if event.is_group {
            let participant = if event.from_me { "" } else { event.sender.id.as_str() };
            entry.participants.insert(participant.to_string());
        }

        let ordering = (effective_timestamp(stored), stored.seq);
        if entry.summary.is_some() && ordering < entry.owner {
            if let Some(summary) = entry.summary.as_mut() {
                summary.participant_count_estimate =
                    participant_estimate(event.is_group, &entry.participants);
            }
            return Ok(None);
        }

        let display_name = if event.is_group {
            event
                .chat
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| names.resolve(chat_id.as_str(), context))
        } else {
            let other = if event.from_me { &event.chat } else { &event.sender };
            other
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| names.resolve(chat_id.as_str(), context))
        };

        let is_business = if event.is_group || event.from_me {
            event.chat.is_business
        } else {
            event.sender.is_business || event.chat.is_business
        };

        let summary = ChatSummary {
            chat_id,
            display_name,
            chat_type: if event.is_group {
                ChatType::Group
            } else {
                ChatType::Individual
            },
            last_activity_timestamp: ordering.0,
            last_preview: extract_preview(event),
            last_from_me: event.from_me,
            participant_count_estimate: participant_estimate(event.is_group, &entry.participants),
            is_business,
        };

        entry.owner = ordering;
        entry.summary = Some(summary.clone());
        Ok(Some(summary))
    }

    pub fn get(&self, chat_id: &ChatId) -> Option<&ChatSummary> {
        self.entries.get(chat_id).and_then(|entry| entry.summary.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Summaries ordered by last activity, most recent first.
    pub fn sorted(&self) -> Vec<ChatSummary> {
        let mut summaries: Vec<ChatSummary> = self
            .entries
            .values()
            .filter_map(|entry| entry.summary.clone())
            .collect();
        sort_chat_list(&mut summaries);
        summaries
    }
}

/// Groups count every distinct sender seen plus ourselves; a 1:1 chat is two people.
fn participant_estimate(is_group: bool, participants: &HashSet<String>) -> usize {
    if is_group {
        let mut count = participants.len();
        if !participants.contains("") {
            count += 1;
        }
        count
    } else {
        2
    }
}

fn sort_chat_list(items: &mut [ChatSummary]) {
    items.sort_by(|a, b| {
        b.last_activity_timestamp
            .cmp(&a.last_activity_timestamp)
            .then_with(|| a.chat_id.cmp(&b.chat_id))
    });
}

/// Derives one summary per distinct chat in `events`, most recently active first.
pub fn summarize_chats(events: &[StoredEvent], names: &NameDirectory) -> Vec<ChatSummary> {
    ChatList::from_events(events, names).sorted()
}
