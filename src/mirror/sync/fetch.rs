//! Store reads performed off the coordinator.
//!
//! A fetch only scans; the coordinator decides on arrival whether the result is
//! still current and applies it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::mirror::chat_aggregator::{ChatList, NameDirectory};
use crate::mirror::config::SyncConfig;
use crate::mirror::event_store::{EventStore, ScanWindow, StoreError, scan_recent};
use crate::mirror::message_cache::{ChatScan, ScanContext, scan_chat, scan_older};
use crate::types::ChatId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchKind {
    Initial { limit: usize },
    Newer,
    Older { before: i64, limit: usize },
    ChatList,
}

#[derive(Debug, Clone)]
pub(crate) struct FetchRequest {
    /// Coordinator generation at the time of the request.
    pub generation: u64,
    pub chat_id: Option<ChatId>,
    pub kind: FetchKind,
}

impl FetchRequest {
    /// Chat list fetches do not depend on the visible chat and are never stale.
    pub fn is_current(&self, generation: u64) -> bool {
        self.kind == FetchKind::ChatList || self.generation == generation
    }
}

#[derive(Debug)]
pub(crate) enum FetchPayload {
    Messages(ChatScan),
    ChatList(ChatList),
}

#[derive(Debug)]
pub(crate) struct FetchResult {
    pub request: FetchRequest,
    pub outcome: Result<FetchPayload, StoreError>,
}

/// The single outstanding fetch.
pub(crate) struct InFlight {
    pub request: FetchRequest,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

/// Everything a worker needs, shared with the coordinator.
#[derive(Clone)]
pub(crate) struct FetchDeps {
    pub store: Arc<dyn EventStore>,
    pub names: Arc<NameDirectory>,
    pub config: SyncConfig,
}

/// Spawns a worker for `request`; its result is sent on `results`.
pub(crate) fn spawn_fetch(
    deps: FetchDeps,
    request: FetchRequest,
    results: mpsc::Sender<FetchResult>,
) -> InFlight {
    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let worker_request = request.clone();

    let task = tokio::spawn(async move {
        let outcome = run_fetch(&deps, &worker_request, &worker_cancel).await;
        if results
            .send(FetchResult {
                request: worker_request,
                outcome,
            })
            .await
            .is_err()
        {
            tracing::debug!(
                target: "chatmirror::sync::fetch::spawn_fetch",
                "Coordinator gone, dropping fetch result"
            );
        }
    });

    InFlight {
        request,
        cancel,
        task,
    }
}

async fn run_fetch(
    deps: &FetchDeps,
    request: &FetchRequest,
    cancel: &CancellationToken,
) -> Result<FetchPayload, StoreError> {
    let ctx = ScanContext {
        store: deps.store.as_ref(),
        names: deps.names.as_ref(),
        config: &deps.config,
        cancel,
    };
    let recent = ScanWindow::Recent(deps.config.scan_window);

    let chat_id = match (&request.kind, &request.chat_id) {
        (FetchKind::ChatList, _) => {
            let outcome = scan_recent(
                ctx.store,
                recent,
                deps.config.scan_batch_size,
                cancel,
            )
            .await?;
            return Ok(FetchPayload::ChatList(ChatList::from_events(
                &outcome.events,
                ctx.names,
            )));
        }
        (_, Some(chat_id)) => chat_id,
        (_, None) => return Ok(FetchPayload::Messages(ChatScan::default())),
    };

    let scan = match request.kind {
        FetchKind::Older { before, limit } => scan_older(&ctx, chat_id, before, limit).await?,
        _ => scan_chat(&ctx, chat_id, recent).await?,
    };
    Ok(FetchPayload::Messages(scan))
}
