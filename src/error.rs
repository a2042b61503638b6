use thiserror::Error;

use crate::mirror::chat_aggregator::AggregationError;
use crate::mirror::event_store::StoreError;
use crate::mirror::sync::PushError;

pub type Result<T> = core::result::Result<T, ChatMirrorError>;

#[derive(Error, Debug)]
pub enum ChatMirrorError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Logging setup error: {0}")]
    LoggingSetup(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Event store error: {0}")]
    Store(#[from] StoreError),

    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("Push channel error: {0}")]
    Push(#[from] PushError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sync coordinator is not running")]
    CoordinatorStopped,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<Box<dyn std::error::Error + Send + Sync>> for ChatMirrorError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        ChatMirrorError::Other(anyhow::anyhow!(err.to_string()))
    }
}
