use async_trait::async_trait;

use crate::error::Result;
use crate::types::ChatId;

/// Outgoing message transport, provided by the messaging vendor client.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Sends `text` to `chat_id`, tagged with `correlation_id` so the provider can echo
    /// it back on the confirming event.
    ///
    /// Returns the provider-assigned message id when the provider reports one.
    async fn send_text(
        &self,
        chat_id: &ChatId,
        text: &str,
        correlation_id: &str,
    ) -> Result<Option<String>>;
}

/// Result of a send, reported back to the coordinator.
#[derive(Debug)]
pub(crate) struct SendOutcome {
    pub chat_id: ChatId,
    pub correlation_id: String,
    pub result: Result<Option<String>>,
}
