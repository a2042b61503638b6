//! Sync Coordinator Module
//!
//! The coordinator is the single consumer that owns every per-chat cache. It
//! serializes store fetches (one outstanding at a time), discards results that
//! belong to a chat the user has already left, and funnels the push and poll
//! ingestion paths into the visible chat's cache.
//!
//! Workers only scan the store. Every mutation happens on the coordinator task in
//! response to an intent, a fetch result, a push event or a poll tick.

mod fetch;
mod handle;
mod push;
mod sender;
mod updates;


pub use handle::SyncHandle;
pub use push::{
    PushConnector, PushError, PushLink, PushReader, PushStatus, TcpPushConnector,
    spawn_push_supervisor,
};
pub use sender::MessageSender;
pub use updates::{Intent, SyncUpdate, UpdateStream};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fetch::{FetchDeps, FetchKind, FetchPayload, FetchRequest, FetchResult, InFlight, spawn_fetch};
use push::live_event;
use sender::SendOutcome;

use crate::mirror::chat_aggregator::{ChatList, ChatType, NameDirectory};
use crate::mirror::config::SyncConfig;
use crate::mirror::event_store::EventStore;
use crate::mirror::message_cache::{
    CacheState, ChatScan, IngestOutcome, MessageCache, local_echo,
};
use crate::types::{ChatId, RawEvent};

const CHANNEL_SIZE: usize = 64;

pub struct SyncCoordinator {
    deps: FetchDeps,
    sender: Option<Arc<dyn MessageSender>>,
    updates: UpdateStream,

    caches: HashMap<ChatId, MessageCache>,
    /// Most recently visible first.
    recency: VecDeque<ChatId>,
    chat_list: ChatList,
    visible: Option<ChatId>,

    generation: u64,
    inflight: Option<InFlight>,
    queue: VecDeque<FetchRequest>,
    results_tx: mpsc::Sender<FetchResult>,
    results_rx: mpsc::Receiver<FetchResult>,
    sends_tx: mpsc::Sender<SendOutcome>,
    sends_rx: mpsc::Receiver<SendOutcome>,

    push_status: PushStatus,
    store_online: bool,
}

impl SyncCoordinator {
    pub fn new(store: Arc<dyn EventStore>, config: SyncConfig) -> Self {
        let (results_tx, results_rx) = mpsc::channel(CHANNEL_SIZE);
        let (sends_tx, sends_rx) = mpsc::channel(CHANNEL_SIZE);

        Self {
            deps: FetchDeps {
                store,
                names: Arc::new(NameDirectory::new()),
                config,
            },
            sender: None,
            updates: UpdateStream::new(),
            caches: HashMap::new(),
            recency: VecDeque::new(),
            chat_list: ChatList::new(),
            visible: None,
            generation: 0,
            inflight: None,
            queue: VecDeque::new(),
            results_tx,
            results_rx,
            sends_tx,
            sends_rx,
            push_status: PushStatus::Disconnected,
            store_online: true,
        }
    }

    pub fn with_sender(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncUpdate> {
        self.updates.subscribe()
    }

    pub fn names(&self) -> &Arc<NameDirectory> {
        &self.deps.names
    }

    pub fn visible_chat(&self) -> Option<&ChatId> {
        self.visible.as_ref()
    }

    pub fn cache(&self, chat_id: &ChatId) -> Option<&MessageCache> {
        self.caches.get(chat_id)
    }

    pub fn cached_chat_count(&self) -> usize {
        self.caches.len()
    }

    pub fn chat_list(&self) -> &ChatList {
        &self.chat_list
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn store_online(&self) -> bool {
        self.store_online
    }

    pub fn is_fetching(&self) -> bool {
        self.inflight.is_some()
    }

    /// Spawns the coordinator loop and returns the bridge handle.
    pub fn spawn(self, push: PushLink, shutdown: CancellationToken) -> (SyncHandle, JoinHandle<()>) {
        let (intents_tx, intents_rx) = mpsc::channel(CHANNEL_SIZE);
        let handle = SyncHandle::new(intents_tx, self.updates.clone());
        let task = tokio::spawn(self.run(intents_rx, push, shutdown));
        (handle, task)
    }

    /// Main coordinator loop. Returns on logout, shutdown, or when every handle is dropped.
    pub async fn run(
        mut self,
        mut intents: mpsc::Receiver<Intent>,
        push: PushLink,
        shutdown: CancellationToken,
    ) {
        tracing::info!(
            target: "chatmirror::sync::run",
            "Starting sync coordinator"
        );

        let PushLink {
            events: mut push_events,
            status: mut push_status,
        } = push;
        let mut push_events_open = true;
        let mut push_status_open = true;
        self.handle_push_status(*push_status.borrow_and_update());

        let mut poll = tokio::time::interval(self.deps.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        poll.tick().await;

        self.refresh_chat_list();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(
                        target: "chatmirror::sync::run",
                        "Shutdown requested"
                    );
                    break;
                }
                intent = intents.recv() => match intent {
                    Some(Intent::Logout) => {
                        self.logout();
                        break;
                    }
                    Some(intent) => self.handle_intent(intent),
                    None => {
                        tracing::debug!(
                            target: "chatmirror::sync::run",
                            "All handles dropped, exiting coordinator loop"
                        );
                        break;
                    }
                },
                Some(result) = self.results_rx.recv() => self.apply_fetch_result(result),
                Some(outcome) = self.sends_rx.recv() => self.apply_send_outcome(outcome),
                event = push_events.recv(), if push_events_open => match event {
                    Some(event) => self.handle_push_event(event),
                    None => push_events_open = false,
                },
                changed = push_status.changed(), if push_status_open => match changed {
                    Ok(()) => {
                        let status = *push_status.borrow_and_update();
                        self.handle_push_status(status);
                    }
                    Err(_) => push_status_open = false,
                },
                _ = poll.tick() => self.poll_tick(),
            }
        }

        self.abort_fetches();
        tracing::info!(
            target: "chatmirror::sync::run",
            "Sync coordinator stopped"
        );
    }

    pub fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::SelectChat(chat_id) => self.select_chat(chat_id),
            Intent::ScrolledToTop => self.scrolled_to_top(),
            Intent::Compose { text } => self.compose(text),
            Intent::RefreshChatList => self.refresh_chat_list(),
            Intent::Logout => self.logout(),
        }
    }

    /// Makes `chat_id` the visible chat.
    ///
    /// Bumps the generation so every in-flight or queued fetch for the previous chat
    /// is discarded when it completes. A chat whose cache survived is shown at once
    /// and topped up with a newer load.
    pub fn select_chat(&mut self, chat_id: ChatId) {
        self.generation += 1;
        tracing::debug!(
            target: "chatmirror::sync::select_chat",
            "Selecting chat {} (generation {})",
            chat_id,
            self.generation
        );

        if let Some(inflight) = &self.inflight
            && inflight.request.kind != FetchKind::ChatList
        {
            inflight.cancel.cancel();
        }
        self.queue.retain(|request| request.kind == FetchKind::ChatList);

        self.visible = Some(chat_id.clone());
        self.touch(&chat_id);

        let cache = self
            .caches
            .entry(chat_id.clone())
            .or_insert_with(|| MessageCache::new(chat_id.clone()));

        if cache.is_loaded() {
            self.updates.emit(SyncUpdate::InitialMessagesLoaded {
                chat_id,
                messages: cache.messages(),
                older_exhausted: cache.older_exhausted(),
            });
            self.request(FetchKind::Newer);
        } else {
            cache.begin_initial();
            let limit = self.deps.config.initial_page_size;
            self.request(FetchKind::Initial { limit });
        }
    }

    /// Requests the page preceding the oldest cached message of the visible chat.
    pub fn scrolled_to_top(&mut self) {
        let Some(chat_id) = self.visible.clone() else {
            return;
        };
        let Some(cache) = self.caches.get_mut(&chat_id) else {
            return;
        };
        if cache.state() != CacheState::Ready {
            return;
        }

        let before = match cache.oldest_cached_ts() {
            Some(before) if !cache.older_exhausted() => before,
            _ => {
                self.updates.emit(SyncUpdate::OlderPageLoaded {
                    chat_id,
                    messages: Vec::new(),
                    exhausted: true,
                });
                return;
            }
        };

        cache.begin_older();
        let limit = self.deps.config.older_page_size;
        self.request(FetchKind::Older { before, limit });
    }

    /// Shows `text` as a pending local echo and hands it to the message sender.
    pub fn compose(&mut self, text: String) {
        let Some(chat_id) = self.visible.clone() else {
            tracing::warn!(
                target: "chatmirror::sync::compose",
                "Compose without a visible chat, ignoring"
            );
            return;
        };
        let Some(cache) = self.caches.get_mut(&chat_id) else {
            return;
        };

        let correlation_id = Uuid::new_v4().to_string();
        let is_group = self
            .chat_list
            .get(&chat_id)
            .is_some_and(|summary| summary.chat_type == ChatType::Group);
        let echo = local_echo(
            chat_id.clone(),
            &text,
            &correlation_id,
            chrono::Utc::now().timestamp(),
            is_group,
        );

        if !cache.insert_echo(echo.clone()) {
            return;
        }
        self.updates.emit(SyncUpdate::NewMessages {
            chat_id: chat_id.clone(),
            messages: vec![echo],
        });

        let Some(sender) = self.sender.clone() else {
            self.fail_echo(&chat_id, &correlation_id, "no message sender configured".to_string());
            return;
        };

        let sends = self.sends_tx.clone();
        tokio::spawn(async move {
            let result = sender.send_text(&chat_id, &text, &correlation_id).await;
            let outcome = SendOutcome {
                chat_id,
                correlation_id,
                result,
            };
            if sends.send(outcome).await.is_err() {
                tracing::debug!(
                    target: "chatmirror::sync::compose",
                    "Coordinator gone, dropping send outcome"
                );
            }
        });
    }

    /// Rebuilds the chat list from the recent window.
    pub fn refresh_chat_list(&mut self) {
        let already_requested = self
            .inflight
            .iter()
            .map(|inflight| &inflight.request)
            .chain(self.queue.iter())
            .any(|request| request.kind == FetchKind::ChatList);
        if !already_requested {
            self.request(FetchKind::ChatList);
        }
    }

    /// Drops every cache and the chat list.
    pub fn logout(&mut self) {
        tracing::info!(
            target: "chatmirror::sync::logout",
            "Clearing {} cached chats",
            self.caches.len()
        );
        self.generation += 1;
        self.abort_fetches();
        self.caches.clear();
        self.recency.clear();
        self.chat_list = ChatList::new();
        self.visible = None;
        self.deps.names.clear();
    }

    /// Routes one live event to the visible chat's cache and the chat list.
    pub fn handle_push_event(&mut self, event: RawEvent) {
        let stored = live_event(event);

        match self.chat_list.apply(&stored, &self.deps.names, &[]) {
            Ok(Some(summary)) => self.updates.emit(SyncUpdate::ChatSummaryUpdated { summary }),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    target: "chatmirror::sync::handle_push_event",
                    "Skipping malformed push event: {}",
                    e
                );
                return;
            }
        }

        let Some(chat_id) = self.visible.clone() else {
            return;
        };
        let Some(cache) = self.caches.get_mut(&chat_id) else {
            return;
        };

        match cache.ingest_single(&stored, self.deps.config.dedup_key_policy, &self.deps.names) {
            IngestOutcome::Inserted(message) => self.updates.emit(SyncUpdate::NewMessages {
                chat_id,
                messages: vec![message],
            }),
            IngestOutcome::Confirmed { temp_id, message } => {
                self.updates.emit(SyncUpdate::MessageConfirmed {
                    chat_id,
                    temp_id,
                    message,
                })
            }
            IngestOutcome::Duplicate | IngestOutcome::OtherChat(_) => {}
            IngestOutcome::Malformed(e) => tracing::warn!(
                target: "chatmirror::sync::handle_push_event",
                "Skipping malformed push event: {}",
                e
            ),
        }
    }

    pub fn handle_push_status(&mut self, status: PushStatus) {
        if status == self.push_status {
            return;
        }
        tracing::info!(
            target: "chatmirror::sync::handle_push_status",
            "Push status {:?} -> {:?}",
            self.push_status,
            status
        );
        self.push_status = status;
        self.emit_connectivity();
    }

    /// Polls the visible chat for newer messages while the push path is down.
    ///
    /// Skipped while any fetch is outstanding or queued.
    pub fn poll_tick(&mut self) {
        if self.push_status == PushStatus::Connected {
            return;
        }
        if self.inflight.is_some() || !self.queue.is_empty() {
            tracing::debug!(
                target: "chatmirror::sync::poll_tick",
                "Fetch outstanding, skipping poll"
            );
            return;
        }
        let Some(chat_id) = self.visible.clone() else {
            return;
        };
        let Some(cache) = self.caches.get_mut(&chat_id) else {
            return;
        };

        if cache.is_loaded() {
            self.request(FetchKind::Newer);
        } else if cache.state() == CacheState::Unloaded {
            // The initial load failed earlier; retry it.
            cache.begin_initial();
            let limit = self.deps.config.initial_page_size;
            self.request(FetchKind::Initial { limit });
        }
    }

    /// Waits for every outstanding and queued fetch and applies the results.
    pub async fn settle(&mut self) {
        while self.inflight.is_some() {
            match self.results_rx.recv().await {
                Some(result) => self.apply_fetch_result(result),
                None => break,
            }
        }
    }

    /// Waits for one send outcome and applies it.
    pub async fn settle_send(&mut self) {
        if let Some(outcome) = self.sends_rx.recv().await {
            self.apply_send_outcome(outcome);
        }
    }

    fn request(&mut self, kind: FetchKind) {
        let request = FetchRequest {
            generation: self.generation,
            chat_id: match kind {
                FetchKind::ChatList => None,
                _ => self.visible.clone(),
            },
            kind,
        };

        if self.inflight.is_none() {
            self.start(request);
        } else {
            self.queue.push_back(request);
        }
    }

    fn start(&mut self, request: FetchRequest) {
        tracing::debug!(
            target: "chatmirror::sync::start",
            "Starting {:?} fetch for {:?} (generation {})",
            request.kind,
            request.chat_id,
            request.generation
        );
        self.inflight = Some(spawn_fetch(
            self.deps.clone(),
            request,
            self.results_tx.clone(),
        ));
    }

    fn start_next(&mut self) {
        while self.inflight.is_none() {
            let Some(request) = self.queue.pop_front() else {
                return;
            };
            if request.is_current(self.generation) {
                self.start(request);
            }
        }
    }

    fn apply_fetch_result(&mut self, result: FetchResult) {
        self.inflight = None;
        let FetchResult { request, outcome } = result;

        let current = request.is_current(self.generation);
        let payload = match outcome {
            Ok(payload) => {
                self.set_store_online(true);
                payload
            }
            Err(e) => {
                tracing::warn!(
                    target: "chatmirror::sync::apply_fetch_result",
                    "{:?} fetch failed: {}",
                    request.kind,
                    e
                );
                self.set_store_online(false);
                if current {
                    self.short_circuit(&request);
                } else {
                    self.abandon(&request);
                }
                self.start_next();
                return;
            }
        };

        let cancelled = matches!(&payload, FetchPayload::Messages(scan) if scan.cancelled);
        if !current || cancelled {
            tracing::debug!(
                target: "chatmirror::sync::apply_fetch_result",
                "Discarding stale {:?} result for {:?} (generation {}, current {})",
                request.kind,
                request.chat_id,
                request.generation,
                self.generation
            );
            self.abandon(&request);
            self.start_next();
            return;
        }

        match payload {
            FetchPayload::ChatList(chat_list) => {
                self.chat_list = chat_list;
                self.updates.emit(SyncUpdate::ChatListLoaded {
                    chats: self.chat_list.sorted(),
                });
            }
            FetchPayload::Messages(scan) => self.apply_scan(&request, scan),
        }

        self.start_next();
    }

    fn apply_scan(&mut self, request: &FetchRequest, scan: ChatScan) {
        let Some(chat_id) = request.chat_id.clone() else {
            return;
        };
        let Some(cache) = self.caches.get_mut(&chat_id) else {
            return;
        };

        match request.kind {
            FetchKind::Initial { limit } => {
                let messages = cache.apply_initial(scan, limit);
                self.updates.emit(SyncUpdate::InitialMessagesLoaded {
                    chat_id,
                    messages,
                    older_exhausted: cache.older_exhausted(),
                });
            }
            FetchKind::Newer => {
                let delta = cache.apply_newer(scan);
                if !delta.added.is_empty() {
                    self.updates.emit(SyncUpdate::NewMessages {
                        chat_id: chat_id.clone(),
                        messages: delta.added,
                    });
                }
                for (temp_id, message) in delta.confirmed {
                    self.updates.emit(SyncUpdate::MessageConfirmed {
                        chat_id: chat_id.clone(),
                        temp_id,
                        message,
                    });
                }
            }
            FetchKind::Older { before, limit } => {
                let page = cache.apply_older(scan, before, limit);
                for (temp_id, message) in page.confirmed {
                    self.updates.emit(SyncUpdate::MessageConfirmed {
                        chat_id: chat_id.clone(),
                        temp_id,
                        message,
                    });
                }
                self.updates.emit(SyncUpdate::OlderPageLoaded {
                    chat_id,
                    messages: page.messages,
                    exhausted: page.exhausted,
                });
            }
            FetchKind::ChatList => {}
        }
    }

    /// Answers a failed fetch for the visible chat with an empty result.
    fn short_circuit(&mut self, request: &FetchRequest) {
        self.abandon(request);
        let Some(chat_id) = request.chat_id.clone() else {
            return;
        };

        match request.kind {
            FetchKind::Initial { .. } => self.updates.emit(SyncUpdate::InitialMessagesLoaded {
                chat_id,
                messages: Vec::new(),
                older_exhausted: false,
            }),
            FetchKind::Older { .. } => self.updates.emit(SyncUpdate::OlderPageLoaded {
                chat_id,
                messages: Vec::new(),
                exhausted: false,
            }),
            FetchKind::Newer | FetchKind::ChatList => {}
        }
    }

    /// Puts the request's cache back in its last settled state, unless it is still
    /// waiting for its first load and a queued initial fetch is about to deliver it.
    fn abandon(&mut self, request: &FetchRequest) {
        let Some(chat_id) = &request.chat_id else {
            return;
        };
        let Some(cache) = self.caches.get_mut(chat_id) else {
            return;
        };

        let initial_queued = cache.state() == CacheState::LoadingInitial
            && self.queue.iter().any(|queued| {
                queued.chat_id.as_ref() == Some(chat_id)
                    && matches!(queued.kind, FetchKind::Initial { .. })
            });
        if !initial_queued {
            cache.abort_pending();
        }
    }

    fn apply_send_outcome(&mut self, outcome: SendOutcome) {
        let SendOutcome {
            chat_id,
            correlation_id,
            result,
        } = outcome;

        match result {
            Ok(provider_id) => {
                tracing::debug!(
                    target: "chatmirror::sync::apply_send_outcome",
                    "Send {} accepted as {:?}",
                    correlation_id,
                    provider_id
                );
                let Some(provider_id) = provider_id else {
                    return;
                };
                let Some(cache) = self.caches.get_mut(&chat_id) else {
                    return;
                };
                if let Some((temp_id, message)) = cache.register_sent(&correlation_id, &provider_id)
                {
                    self.updates.emit(SyncUpdate::MessageConfirmed {
                        chat_id,
                        temp_id,
                        message,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(
                    target: "chatmirror::sync::apply_send_outcome",
                    "Send {} failed: {}",
                    correlation_id,
                    e
                );
                self.fail_echo(&chat_id, &correlation_id, e.to_string());
            }
        }
    }

    fn fail_echo(&mut self, chat_id: &ChatId, correlation_id: &str, reason: String) {
        let failed = self
            .caches
            .get_mut(chat_id)
            .and_then(|cache| cache.mark_echo_failed(correlation_id));
        if let Some(message) = failed {
            self.updates.emit(SyncUpdate::SendFailed {
                chat_id: chat_id.clone(),
                message,
                reason,
            });
        }
    }

    /// Moves `chat_id` to the front of the recency list and evicts caches beyond capacity.
    fn touch(&mut self, chat_id: &ChatId) {
        self.recency.retain(|id| id != chat_id);
        self.recency.push_front(chat_id.clone());

        while self.recency.len() > self.deps.config.max_cached_chats {
            let Some(evicted) = self.recency.pop_back() else {
                break;
            };
            self.caches.remove(&evicted);
            tracing::debug!(
                target: "chatmirror::sync::touch",
                "Evicted cache for chat {}",
                evicted
            );
        }
    }

    fn set_store_online(&mut self, online: bool) {
        if self.store_online != online {
            self.store_online = online;
            tracing::info!(
                target: "chatmirror::sync::set_store_online",
                "Event store {}",
                if online { "online" } else { "unavailable" }
            );
            self.emit_connectivity();
        }
    }

    fn emit_connectivity(&self) {
        self.updates.emit(SyncUpdate::Connectivity {
            push: self.push_status,
            store_online: self.store_online,
        });
    }

    fn abort_fetches(&mut self) {
        self.queue.clear();
        if let Some(inflight) = self.inflight.take() {
            inflight.cancel.cancel();
            inflight.task.abort();
        }
    }
}
