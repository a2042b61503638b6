//! Message Cache Module
//!
//! Per-chat ordered collection of normalized messages. Owns dedup, the initial
//! load, incremental "newer" loads, reverse "older" pagination and single-event
//! ingestion.
//!
//! Every load is split into a scan (reads the store, touches no cache state, safe
//! to run on a worker task) and an apply step (mutates the cache, runs on the
//! coordinator). The `load_*` methods chain both for callers that own the cache
//! directly.

mod normalize;
mod types;

pub use normalize::{derived_key, normalize};
pub use types::{
    CacheDelta, CacheState, DeliveryState, IngestOutcome, KeySource, MessageKey, MessageType,
    NormalizedMessage, OlderPage,
};

use std::collections::{BTreeMap, HashMap, HashSet};

use tokio_util::sync::CancellationToken;

use crate::mirror::chat_aggregator::{NameDirectory, derive_chat_id, preview_for};
use crate::mirror::config::{DedupKeyPolicy, SyncConfig};
use crate::mirror::event_store::{EventStore, ScanWindow, StoreError, StoredEvent, scan_recent};
use crate::types::{ChatId, MessageContent};

/// Everything a scan needs, borrowed from the owner of the store.
pub struct ScanContext<'a> {
    pub store: &'a dyn EventStore,
    pub names: &'a NameDirectory,
    pub config: &'a SyncConfig,
    pub cancel: &'a CancellationToken,
}

/// Messages of one chat found by a scan, deduplicated and in `(timestamp, id)` order.
#[derive(Debug, Clone, Default)]
pub struct ChatScan {
    pub messages: Vec<NormalizedMessage>,
    pub exhausted: bool,
    pub cancelled: bool,
}

/// Reads a window of the store and keeps the messages belonging to `chat_id`.
pub async fn scan_chat(
    ctx: &ScanContext<'_>,
    chat_id: &ChatId,
    window: ScanWindow,
) -> Result<ChatScan, StoreError> {
    let outcome = scan_recent(ctx.store, window, ctx.config.scan_batch_size, ctx.cancel).await?;
    Ok(ChatScan {
        messages: collect_chat_messages(
            outcome.events,
            chat_id,
            ctx.config.dedup_key_policy,
            ctx.names,
        ),
        exhausted: outcome.exhausted,
        cancelled: outcome.cancelled,
    })
}

/// Scans backwards for a page older than `before`.
///
/// Reads the wider older-page window first and falls back to the whole log when that
/// window holds fewer than `limit` qualifying messages but more history exists.
pub async fn scan_older(
    ctx: &ScanContext<'_>,
    chat_id: &ChatId,
    before: i64,
    limit: usize,
) -> Result<ChatScan, StoreError> {
    let scan = scan_chat(ctx, chat_id, ScanWindow::Recent(ctx.config.older_scan_window)).await?;
    let qualifying = scan.messages.iter().filter(|m| m.timestamp < before).count();
    if scan.exhausted || scan.cancelled || qualifying >= limit {
        return Ok(scan);
    }

    tracing::debug!(
        target: "chatmirror::message_cache::scan_older",
        "Older window for {} held {} of {} messages, scanning whole log",
        chat_id,
        qualifying,
        limit
    );
    scan_chat(ctx, chat_id, ScanWindow::Everything).await
}

/// Filters, normalizes and deduplicates events for one chat.
///
/// Events are considered in append order so the first delivery of an id wins.
/// Malformed events are skipped.
pub fn collect_chat_messages(
    mut events: Vec<StoredEvent>,
    chat_id: &ChatId,
    policy: DedupKeyPolicy,
    names: &NameDirectory,
) -> Vec<NormalizedMessage> {
    events.sort_by_key(|stored| stored.seq);

    let mut seen = HashSet::new();
    let mut messages = Vec::new();

    for stored in &events {
        names.observe(&stored.event);

        match derive_chat_id(&stored.event) {
            Ok(id) if &id == chat_id => {}
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(
                    target: "chatmirror::message_cache::collect_chat_messages",
                    "Skipping malformed event {}: {}",
                    stored.seq,
                    e
                );
                continue;
            }
        }

        match normalize(stored, policy, names) {
            Ok(message) => {
                if seen.insert(message.id.clone()) {
                    messages.push(message);
                } else if message.key_source == KeySource::Derived {
                    tracing::debug!(
                        target: "chatmirror::message_cache::collect_chat_messages",
                        "Derived key {} seen again at event {}, keeping first occurrence",
                        message.id,
                        stored.seq
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    target: "chatmirror::message_cache::collect_chat_messages",
                    "Skipping malformed event {}: {}",
                    stored.seq,
                    e
                );
            }
        }
    }

    messages.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
    messages
}

/// Builds the temporary entry rendered while an outgoing message is in flight.
pub fn local_echo(
    chat_id: ChatId,
    text: &str,
    correlation_id: &str,
    timestamp: i64,
    is_group: bool,
) -> NormalizedMessage {
    NormalizedMessage {
        id: format!("local:{correlation_id}"),
        chat_id,
        timestamp,
        from_me: true,
        is_group,
        sender_id: String::new(),
        sender_name: "You".to_string(),
        preview: preview_for(&MessageContent::text(text)),
        message_type: MessageType::Text,
        media_ref: None,
        key_source: KeySource::Local,
        correlation_id: Some(correlation_id.to_string()),
        delivery: DeliveryState::Pending,
    }
}

/// The cached history of a single chat.
///
/// Within one cache ids are unique and messages are totally ordered by
/// `(timestamp, id)`. The cursors only track store-observed messages; local echoes
/// never move them.
#[derive(Debug)]
pub struct MessageCache {
    chat_id: ChatId,
    state: CacheState,
    messages: BTreeMap<MessageKey, NormalizedMessage>,
    /// id -> timestamp
    index: HashMap<String, i64>,
    oldest_cached_ts: Option<i64>,
    newest_cached_ts: Option<i64>,
    /// correlation id -> temporary message id
    pending_echoes: HashMap<String, String>,
    /// provider message id -> correlation id, for confirmations that lack the correlation id
    sent_ids: HashMap<String, String>,
    older_exhausted: bool,
}

impl MessageCache {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            state: CacheState::Unloaded,
            messages: BTreeMap::new(),
            index: HashMap::new(),
            oldest_cached_ts: None,
            newest_cached_ts: None,
            pending_echoes: HashMap::new(),
            sent_ids: HashMap::new(),
            older_exhausted: false,
        }
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        !matches!(self.state, CacheState::Unloaded | CacheState::LoadingInitial)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn oldest_cached_ts(&self) -> Option<i64> {
        self.oldest_cached_ts
    }

    pub fn newest_cached_ts(&self) -> Option<i64> {
        self.newest_cached_ts
    }

    pub fn older_exhausted(&self) -> bool {
        self.older_exhausted
    }

    pub fn pending_echo_count(&self) -> usize {
        self.pending_echoes.len()
    }

    /// All cached messages in `(timestamp, id)` order.
    pub fn messages(&self) -> Vec<NormalizedMessage> {
        self.messages.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NormalizedMessage> {
        self.messages.values()
    }

    pub fn get(&self, id: &str) -> Option<&NormalizedMessage> {
        let timestamp = *self.index.get(id)?;
        self.messages.get(&MessageKey {
            timestamp,
            id: id.to_string(),
        })
    }

    /// Drops everything; the cache can be loaded again from scratch.
    pub fn clear(&mut self) {
        *self = Self::new(self.chat_id.clone());
    }

    pub fn begin_initial(&mut self) {
        self.state = CacheState::LoadingInitial;
    }

    pub fn begin_older(&mut self) {
        if self.state == CacheState::Ready {
            self.state = CacheState::LoadingOlder;
        }
    }

    /// Returns to the last settled state after a load was abandoned.
    pub fn abort_pending(&mut self) {
        self.state = match self.state {
            CacheState::LoadingInitial => CacheState::Unloaded,
            CacheState::LoadingOlder | CacheState::Ingesting => CacheState::Ready,
            settled => settled,
        };
    }

    /// Scans the recent window and installs the `limit` most recent messages.
    pub async fn load_initial(
        &mut self,
        ctx: &ScanContext<'_>,
        limit: usize,
    ) -> Result<Vec<NormalizedMessage>, StoreError> {
        self.begin_initial();
        let window = ScanWindow::Recent(ctx.config.scan_window);
        let scan = match scan_chat(ctx, &self.chat_id, window).await {
            Ok(scan) if !scan.cancelled => scan,
            Ok(_) => {
                self.abort_pending();
                return Ok(Vec::new());
            }
            Err(e) => {
                self.abort_pending();
                return Err(e);
            }
        };
        Ok(self.apply_initial(scan, limit))
    }

    /// Re-scans the recent window and appends anything not cached yet.
    pub async fn load_newer(&mut self, ctx: &ScanContext<'_>) -> Result<CacheDelta, StoreError> {
        let scan = scan_chat(ctx, &self.chat_id, ScanWindow::Recent(ctx.config.scan_window)).await?;
        if scan.cancelled {
            return Ok(CacheDelta::default());
        }
        Ok(self.apply_newer(scan))
    }

    /// Pages backwards from `before_timestamp`.
    pub async fn load_older(
        &mut self,
        ctx: &ScanContext<'_>,
        before_timestamp: i64,
        limit: usize,
    ) -> Result<OlderPage, StoreError> {
        self.begin_older();
        let scan = match scan_older(ctx, &self.chat_id, before_timestamp, limit).await {
            Ok(scan) if !scan.cancelled => scan,
            Ok(_) => {
                self.abort_pending();
                return Ok(OlderPage::default());
            }
            Err(e) => {
                self.abort_pending();
                return Err(e);
            }
        };
        Ok(self.apply_older(scan, before_timestamp, limit))
    }

    /// Installs the result of an initial scan, merged with anything ingested meanwhile.
    ///
    /// Returns the retained messages.
    pub fn apply_initial(&mut self, scan: ChatScan, limit: usize) -> Vec<NormalizedMessage> {
        for message in scan.messages {
            self.insert(message);
        }
        let trimmed = self.trim_to(limit);

        self.older_exhausted = scan.exhausted && trimmed == 0;
        self.state = CacheState::Ready;
        self.recompute_cursors();

        tracing::debug!(
            target: "chatmirror::message_cache::apply_initial",
            "Chat {} loaded with {} messages ({} trimmed)",
            self.chat_id,
            self.messages.len(),
            trimmed
        );

        self.messages()
    }

    /// Appends messages at or after the newest cursor that are not cached yet.
    ///
    /// Entries sorting before the oldest cached entry are left to `apply_older`; they
    /// can only share its timestamp when the initial load trimmed them. Leaves the
    /// cache untouched and returns an empty delta when nothing qualifies.
    pub fn apply_newer(&mut self, scan: ChatScan) -> CacheDelta {
        let mut delta = CacheDelta::default();
        if !self.is_loaded() {
            return delta;
        }

        let threshold = self.newest_cached_ts;
        let oldest_key = self.oldest_store_key();
        let candidates: Vec<NormalizedMessage> = scan
            .messages
            .into_iter()
            .filter(|m| threshold.is_none_or(|newest| m.timestamp >= newest))
            .filter(|m| oldest_key.as_ref().is_none_or(|oldest| m.key() > *oldest))
            .filter(|m| !self.index.contains_key(&m.id))
            .collect();

        for message in candidates {
            match self.insert(message) {
                IngestOutcome::Inserted(message) => delta.added.push(message),
                IngestOutcome::Confirmed { temp_id, message } => {
                    delta.confirmed.push((temp_id, message))
                }
                _ => {}
            }
        }

        delta
    }

    /// Merges up to `limit` of the most recent messages older than `before_timestamp`.
    ///
    /// Messages sharing `before_timestamp` are included when that is the oldest cursor
    /// and they sort before the oldest cached entry. Once history is exhausted a repeat
    /// call returns an empty page and leaves the cursors alone.
    pub fn apply_older(&mut self, scan: ChatScan, before_timestamp: i64, limit: usize) -> OlderPage {
        self.abort_pending();

        let oldest_key = self.oldest_store_key();

        let mut candidates: Vec<NormalizedMessage> = scan
            .messages
            .into_iter()
            .filter(|m| !self.index.contains_key(&m.id))
            .filter(|m| {
                m.timestamp < before_timestamp
                    || (m.timestamp == before_timestamp
                        && oldest_key
                            .as_ref()
                            .is_some_and(|key| key.timestamp == before_timestamp && m.key() < *key))
            })
            .collect();

        let total = candidates.len();
        let page = candidates.split_off(total.saturating_sub(limit));
        let exhausted = scan.exhausted && total <= limit;

        let mut result = OlderPage {
            exhausted,
            ..Default::default()
        };
        if exhausted {
            self.older_exhausted = true;
        }
        if page.is_empty() {
            return result;
        }

        for message in page {
            match self.insert(message) {
                IngestOutcome::Inserted(message) => result.messages.push(message),
                IngestOutcome::Confirmed { temp_id, message } => {
                    result.confirmed.push((temp_id, message))
                }
                _ => {}
            }
        }

        result
    }

    /// Offers one event to this cache.
    pub fn ingest_single(
        &mut self,
        stored: &StoredEvent,
        policy: DedupKeyPolicy,
        names: &NameDirectory,
    ) -> IngestOutcome {
        names.observe(&stored.event);

        let chat_id = match derive_chat_id(&stored.event) {
            Ok(chat_id) => chat_id,
            Err(e) => return IngestOutcome::Malformed(e),
        };
        if chat_id != self.chat_id {
            return IngestOutcome::OtherChat(chat_id);
        }

        let message = match normalize(stored, policy, names) {
            Ok(message) => message,
            Err(e) => return IngestOutcome::Malformed(e),
        };

        let settled = self.state;
        if settled == CacheState::Ready {
            self.state = CacheState::Ingesting;
        }
        let outcome = self.insert(message);
        self.state = settled;
        outcome
    }

    /// Shows an outgoing message before the provider confirms it.
    pub fn insert_echo(&mut self, echo: NormalizedMessage) -> bool {
        let Some(correlation_id) = echo.correlation_id.clone() else {
            return false;
        };
        if self.index.contains_key(&echo.id) {
            return false;
        }
        self.pending_echoes.insert(correlation_id, echo.id.clone());
        self.put(echo);
        true
    }

    /// Records the provider id returned for an outgoing send.
    ///
    /// If the confirming message is already cached the echo is removed right away and
    /// `(temp_id, confirmed message)` is returned.
    pub fn register_sent(
        &mut self,
        correlation_id: &str,
        provider_id: &str,
    ) -> Option<(String, NormalizedMessage)> {
        if self.index.contains_key(provider_id) {
            let temp_id = self.pending_echoes.remove(correlation_id)?;
            self.remove(&temp_id);
            return self.get(provider_id).cloned().map(|message| (temp_id, message));
        }
        if self.pending_echoes.contains_key(correlation_id) {
            self.sent_ids
                .insert(provider_id.to_string(), correlation_id.to_string());
        }
        None
    }

    /// Flags an echo whose send failed. The echo stays matchable in case the
    /// provider delivered it after all.
    pub fn mark_echo_failed(&mut self, correlation_id: &str) -> Option<NormalizedMessage> {
        let temp_id = self.pending_echoes.get(correlation_id)?.clone();
        let timestamp = *self.index.get(&temp_id)?;
        let message = self.messages.get_mut(&MessageKey {
            timestamp,
            id: temp_id,
        })?;
        message.delivery = DeliveryState::Failed;
        Some(message.clone())
    }

    fn insert(&mut self, message: NormalizedMessage) -> IngestOutcome {
        if let Some(existing) = self.get(&message.id) {
            if message.key_source == KeySource::Derived && existing.preview != message.preview {
                tracing::debug!(
                    target: "chatmirror::message_cache::insert",
                    "Derived key collision in chat {}: {} already cached with different content",
                    self.chat_id,
                    message.id
                );
            }
            return IngestOutcome::Duplicate;
        }

        if !message.is_local() {
            let correlation = message
                .correlation_id
                .clone()
                .or_else(|| self.sent_ids.get(&message.id).cloned());
            if let Some(correlation) = correlation
                && let Some(temp_id) = self.pending_echoes.remove(&correlation)
            {
                self.remove(&temp_id);
                self.sent_ids.remove(&message.id);
                self.put(message.clone());
                return IngestOutcome::Confirmed { temp_id, message };
            }
        }

        self.put(message.clone());
        IngestOutcome::Inserted(message)
    }

    fn put(&mut self, message: NormalizedMessage) {
        if !message.is_local() {
            self.oldest_cached_ts = Some(
                self.oldest_cached_ts
                    .map_or(message.timestamp, |oldest| oldest.min(message.timestamp)),
            );
            self.newest_cached_ts = Some(
                self.newest_cached_ts
                    .map_or(message.timestamp, |newest| newest.max(message.timestamp)),
            );
        }
        self.index.insert(message.id.clone(), message.timestamp);
        self.messages.insert(message.key(), message);
    }

    fn remove(&mut self, id: &str) -> Option<NormalizedMessage> {
        let timestamp = self.index.remove(id)?;
        self.messages.remove(&MessageKey {
            timestamp,
            id: id.to_string(),
        })
    }

    /// Keeps the `limit` most recent store-observed messages. Returns how many were dropped.
    fn trim_to(&mut self, limit: usize) -> usize {
        let confirmed: Vec<String> = self
            .messages
            .values()
            .filter(|message| !message.is_local())
            .map(|message| message.id.clone())
            .collect();
        let excess = confirmed.len().saturating_sub(limit);
        for id in &confirmed[..excess] {
            self.remove(id);
        }
        excess
    }

    /// Key of the oldest message read from the store; local echoes do not count.
    fn oldest_store_key(&self) -> Option<MessageKey> {
        self.messages
            .iter()
            .find(|(_, message)| !message.is_local())
            .map(|(key, _)| key.clone())
    }

    fn recompute_cursors(&mut self) {
        let mut confirmed = self.messages.values().filter(|m| !m.is_local());
        let first = confirmed.next().map(|m| m.timestamp);
        let last = confirmed.last().map(|m| m.timestamp).or(first);
        self.oldest_cached_ts = first;
        self.newest_cached_ts = last;
    }
}

#[cfg(test)]
mod tests;
