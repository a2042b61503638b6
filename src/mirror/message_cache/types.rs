use serde::{Deserialize, Serialize};

use crate::mirror::chat_aggregator::AggregationError;
use crate::types::{ChatId, MessageContent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Sticker,
    Image,
    Video,
    Audio,
    Document,
    Location,
    Poll,
    Unknown,
}

impl From<&MessageContent> for MessageType {
    fn from(content: &MessageContent) -> Self {
        match content {
            MessageContent::Text { .. } => Self::Text,
            MessageContent::Sticker { .. } => Self::Sticker,
            MessageContent::Image { .. } => Self::Image,
            MessageContent::Video { .. } => Self::Video,
            MessageContent::Audio { .. } => Self::Audio,
            MessageContent::Document { .. } => Self::Document,
            MessageContent::Location { .. } => Self::Location,
            MessageContent::Poll { .. } => Self::Poll,
            MessageContent::Unknown => Self::Unknown,
        }
    }
}

/// Where a message id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// Provider-assigned message id.
    Provider,
    /// Derived from the event fields because the provider sent none.
    Derived,
    /// Temporary id of an optimistic local echo.
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Observed in the event store or on the push channel.
    Confirmed,
    /// Rendered locally, waiting for the provider to echo it back.
    Pending,
    /// The send failed; the entry stays visible until the chat is reloaded.
    Failed,
}

/// The engine's canonical in-memory representation of one delivery event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    /// Dedup key, unique within a chat's cache.
    pub id: String,
    pub chat_id: ChatId,
    /// Epoch seconds.
    pub timestamp: i64,
    pub from_me: bool,
    pub is_group: bool,
    pub sender_id: String,
    pub sender_name: String,
    pub preview: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub media_ref: Option<String>,
    pub key_source: KeySource,
    pub correlation_id: Option<String>,
    pub delivery: DeliveryState,
}

impl NormalizedMessage {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            timestamp: self.timestamp,
            id: self.id.clone(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.key_source == KeySource::Local
    }
}

/// Total order of a chat's cache: `(timestamp, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey {
    pub timestamp: i64,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Unloaded,
    LoadingInitial,
    Ready,
    LoadingOlder,
    Ingesting,
}

/// What happened to a message offered to the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Inserted(NormalizedMessage),
    /// The message confirmed an optimistic echo and replaced it in place.
    Confirmed {
        temp_id: String,
        message: NormalizedMessage,
    },
    Duplicate,
    /// The event belongs to another chat; its summary should be updated instead.
    OtherChat(ChatId),
    Malformed(AggregationError),
}

/// Changes produced by applying a batch of messages to a cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheDelta {
    /// Newly inserted messages in `(timestamp, id)` order.
    pub added: Vec<NormalizedMessage>,
    /// `(temp_id, confirmed message)` for echoes that were replaced.
    pub confirmed: Vec<(String, NormalizedMessage)>,
}

impl CacheDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.confirmed.is_empty()
    }
}

/// Result of a backwards page request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OlderPage {
    pub messages: Vec<NormalizedMessage>,
    pub confirmed: Vec<(String, NormalizedMessage)>,
    /// No older history remains in the store.
    pub exhausted: bool,
}
