//! Bridge-facing types: the intents the presentation layer sends in and the
//! incremental updates it receives back.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::push::PushStatus;
use crate::mirror::chat_aggregator::ChatSummary;
use crate::mirror::message_cache::NormalizedMessage;
use crate::types::ChatId;

const BUFFER_SIZE: usize = 256;

/// User intents emitted by the presentation bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    SelectChat(ChatId),
    /// The visible thread was scrolled to its oldest message.
    ScrolledToTop,
    /// Send a text message to the visible chat.
    Compose { text: String },
    RefreshChatList,
    Logout,
}

/// Incremental deltas for the presentation bridge.
///
/// Message lists are always in `(timestamp, id)` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncUpdate {
    ChatListLoaded {
        chats: Vec<ChatSummary>,
    },
    ChatSummaryUpdated {
        summary: ChatSummary,
    },
    /// Full contents of a chat that just became visible.
    InitialMessagesLoaded {
        chat_id: ChatId,
        messages: Vec<NormalizedMessage>,
        older_exhausted: bool,
    },
    NewMessages {
        chat_id: ChatId,
        messages: Vec<NormalizedMessage>,
    },
    OlderPageLoaded {
        chat_id: ChatId,
        messages: Vec<NormalizedMessage>,
        exhausted: bool,
    },
    /// A local echo was replaced by its confirmed counterpart.
    MessageConfirmed {
        chat_id: ChatId,
        temp_id: String,
        message: NormalizedMessage,
    },
    SendFailed {
        chat_id: ChatId,
        message: NormalizedMessage,
        reason: String,
    },
    Connectivity {
        push: PushStatus,
        store_online: bool,
    },
}

/// Fan-out of [`SyncUpdate`]s to every subscriber.
#[derive(Clone)]
pub struct UpdateStream {
    sender: broadcast::Sender<SyncUpdate>,
}

impl UpdateStream {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(BUFFER_SIZE).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncUpdate> {
        self.sender.subscribe()
    }

    pub fn emit(&self, update: SyncUpdate) {
        if self.sender.send(update).is_err() {
            tracing::trace!(
                target: "chatmirror::sync::updates::emit",
                "No subscribers for update"
            );
        }
    }
}

impl Default for UpdateStream {
    fn default() -> Self {
        Self::new()
    }
}
