use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{EventPage, EventStore, StoreError, StoredEvent};
use crate::types::RawEvent;

/// In-process event log. Used by tests and by demos that have no database.
#[derive(Debug)]
pub struct MemoryEventStore {
    events: RwLock<Vec<StoredEvent>>,
    available: AtomicBool,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Appends an event stamped with the current time.
    pub async fn append(&self, event: RawEvent) -> StoredEvent {
        self.append_at(event, Utc::now().timestamp()).await
    }

    /// Appends an event with an explicit ingestion time.
    pub async fn append_at(&self, event: RawEvent, received_at: i64) -> StoredEvent {
        let mut events = self.events.write().await;
        let stored = StoredEvent {
            seq: events.len() as i64 + 1,
            received_at,
            event,
        };
        events.push(stored.clone());
        stored
    }

    /// Simulates the backing store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn recent_page(
        &self,
        before_seq: Option<i64>,
        limit: usize,
    ) -> Result<EventPage, StoreError> {
        self.ensure_available()?;
        let events = self.events.read().await;
        let page: Vec<StoredEvent> = events
            .iter()
            .rev()
            .filter(|stored| before_seq.is_none_or(|before| stored.seq < before))
            .take(limit)
            .cloned()
            .collect();
        Ok(EventPage {
            scanned: page.len(),
            oldest_seq: page.last().map(|stored| stored.seq),
            events: page,
        })
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.ensure_available()?;
        Ok(self.events.read().await.len() as u64)
    }
}
