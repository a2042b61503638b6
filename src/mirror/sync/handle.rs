use tokio::sync::{broadcast, mpsc};

use super::updates::{Intent, SyncUpdate, UpdateStream};
use crate::error::{ChatMirrorError, Result};
use crate::types::ChatId;

/// Cloneable entry point for the presentation bridge.
///
/// Intents are queued to the coordinator; effects arrive on the update stream.
#[derive(Clone)]
pub struct SyncHandle {
    intents: mpsc::Sender<Intent>,
    updates: UpdateStream,
}

impl SyncHandle {
    pub(crate) fn new(intents: mpsc::Sender<Intent>, updates: UpdateStream) -> Self {
        Self { intents, updates }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncUpdate> {
        self.updates.subscribe()
    }

    pub async fn select_chat(&self, chat_id: impl Into<ChatId>) -> Result<()> {
        self.send(Intent::SelectChat(chat_id.into())).await
    }

    pub async fn scrolled_to_top(&self) -> Result<()> {
        self.send(Intent::ScrolledToTop).await
    }

    pub async fn compose(&self, text: impl Into<String>) -> Result<()> {
        self.send(Intent::Compose { text: text.into() }).await
    }

    pub async fn refresh_chat_list(&self) -> Result<()> {
        self.send(Intent::RefreshChatList).await
    }

    pub async fn logout(&self) -> Result<()> {
        self.send(Intent::Logout).await
    }

    pub async fn send(&self, intent: Intent) -> Result<()> {
        self.intents
            .send(intent)
            .await
            .map_err(|_| ChatMirrorError::CoordinatorStopped)
    }

    pub fn is_running(&self) -> bool {
        !self.intents.is_closed()
    }
}
