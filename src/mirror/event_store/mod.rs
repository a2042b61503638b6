//! Event Store Module
//!
//! The event store is the durable, append-only log of raw delivery events that the
//! external ingestion path writes to. The sync engine only ever reads from it, always
//! newest-first, in bounded pages.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::types::RawEvent;

mod memory;
mod sqlite;

pub use memory::MemoryEventStore;
pub use sqlite::SqliteEventStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Event store unavailable")]
    Unavailable,
}

/// A raw event together with its position in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// Monotonic append sequence number.
    pub seq: i64,
    /// Epoch seconds at which the ingestion path wrote the event.
    pub received_at: i64,
    pub event: RawEvent,
}

/// One newest-first page read from the store.
///
/// `scanned` counts every row read, including rows whose payload could not be
/// decoded, so callers can tell a short page (end of log) from a page with
/// skipped records. `oldest_seq` is the lowest sequence number read and is the
/// cursor for the next page.
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<StoredEvent>,
    pub scanned: usize,
    pub oldest_seq: Option<i64>,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Returns up to `limit` events with a sequence number below `before_seq`, newest
    /// first. `None` starts at the head of the log.
    ///
    /// Paging by sequence number keeps a batched scan stable while the ingestion
    /// path appends.
    async fn recent_page(
        &self,
        before_seq: Option<i64>,
        limit: usize,
    ) -> Result<EventPage, StoreError>;

    /// Total number of events in the log.
    async fn count(&self) -> Result<u64, StoreError>;
}

/// How far back a scan reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanWindow {
    /// The most recent `n` events.
    Recent(usize),
    /// The whole log.
    Everything,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// Events newest first.
    pub events: Vec<StoredEvent>,
    /// The log ended before the window was filled.
    pub exhausted: bool,
    /// The scan stopped early at a cancellation checkpoint.
    pub cancelled: bool,
}

/// Reads a window of events in batches, checking `cancel` between batches.
pub async fn scan_recent(
    store: &dyn EventStore,
    window: ScanWindow,
    batch_size: usize,
    cancel: &CancellationToken,
) -> Result<ScanOutcome, StoreError> {
    let batch_size = batch_size.max(1);
    let mut outcome = ScanOutcome::default();
    let mut scanned = 0usize;
    let mut cursor = None;

    loop {
        if cancel.is_cancelled() {
            tracing::debug!(
                target: "chatmirror::event_store::scan_recent",
                "Scan cancelled after {} rows",
                scanned
            );
            outcome.cancelled = true;
            return Ok(outcome);
        }

        let limit = match window {
            ScanWindow::Recent(n) if scanned >= n => return Ok(outcome),
            ScanWindow::Recent(n) => batch_size.min(n - scanned),
            ScanWindow::Everything => batch_size,
        };

        let page = store.recent_page(cursor, limit).await?;
        scanned += page.scanned;
        outcome.events.extend(page.events);

        if page.scanned < limit {
            outcome.exhausted = true;
            return Ok(outcome);
        }
        cursor = page.oldest_seq;

        tokio::task::yield_now().await;
    }
}
