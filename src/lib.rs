use std::path::Path;
use std::sync::{Mutex, OnceLock};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

mod error;
pub mod mirror;
mod types;

#[cfg(test)]
mod test_utils;

pub use crate::error::{ChatMirrorError, Result};
pub use crate::mirror::ChatMirror;
pub use crate::mirror::chat_aggregator::{
    AggregationError, ChatList, ChatSummary, ChatType, NameDirectory, derive_chat_id,
    extract_preview, summarize_chats,
};
pub use crate::mirror::config::{DedupKeyPolicy, MirrorConfig, SyncConfig};
pub use crate::mirror::event_store::{
    EventStore, MemoryEventStore, SqliteEventStore, StoreError, StoredEvent,
};
pub use crate::mirror::message_cache::{MessageCache, NormalizedMessage};
pub use crate::mirror::sync::{
    Intent, MessageSender, PushStatus, SyncCoordinator, SyncHandle, SyncUpdate,
};
pub use crate::types::{ChatId, MessageContent, Participant, RawEvent};

static TRACING_GUARDS: OnceLock<Mutex<Option<(WorkerGuard, WorkerGuard)>>> = OnceLock::new();
static TRACING_INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Installs the stdout and daily-rotated file loggers. Only the first call has an effect.
pub(crate) fn init_tracing(logs_dir: &Path) -> Result<()> {
    TRACING_INIT
        .get_or_init(|| {
            let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix("chatmirror")
                .filename_suffix("log")
                .build(logs_dir)
                .map_err(|e| format!("Failed to create file appender: {e}"))?;

            let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
            let (non_blocking_stdout, stdout_guard) =
                tracing_appender::non_blocking(std::io::stdout());

            TRACING_GUARDS
                .set(Mutex::new(Some((file_guard, stdout_guard))))
                .ok();

            let stdout_layer = Layer::new()
                .with_writer(non_blocking_stdout)
                .with_ansi(true)
                .with_target(true);

            let file_layer = Layer::new()
                .with_writer(non_blocking_file)
                .with_ansi(false)
                .with_target(true);

            // A subscriber installed by the host application wins.
            Registry::default()
                .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
                .with(stdout_layer)
                .with(file_layer)
                .try_init()
                .ok();

            Ok(())
        })
        .clone()
        .map_err(ChatMirrorError::LoggingSetup)
}
