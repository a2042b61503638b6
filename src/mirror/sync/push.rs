//! Push channel supervision.
//!
//! The push channel is a persistent connection delivering newline-delimited JSON,
//! one raw event per line. The supervisor owns the connection, publishes its status
//! and reconnects on a fixed period after any disconnect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::mirror::event_store::StoredEvent;
use crate::types::RawEvent;

const EVENT_BUFFER_SIZE: usize = 256;

#[derive(Error, Debug)]
pub enum PushError {
    #[error("Push channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Push event consumer is gone")]
    ChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushStatus {
    Connecting,
    Connected,
    Disconnected,
}

pub type PushReader = Box<dyn AsyncBufRead + Unpin + Send>;

/// Opens one push connection. Called again by the supervisor after every disconnect.
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self) -> Result<PushReader, PushError>;
}

/// Plain TCP push endpoint.
pub struct TcpPushConnector {
    addr: String,
}

impl TcpPushConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl PushConnector for TcpPushConnector {
    async fn connect(&self) -> Result<PushReader, PushError> {
        let stream = TcpStream::connect(&self.addr).await?;
        Ok(Box::new(BufReader::new(stream)))
    }
}

/// Receiving side of the push path, consumed by the coordinator.
pub struct PushLink {
    pub events: mpsc::Receiver<RawEvent>,
    pub status: watch::Receiver<PushStatus>,
}

impl PushLink {
    /// A link that never delivers anything and stays disconnected, so polling
    /// carries all updates.
    pub fn disconnected() -> Self {
        let (_, events) = mpsc::channel(1);
        let (_, status) = watch::channel(PushStatus::Disconnected);
        Self { events, status }
    }
}

/// Wraps an event that arrived on the push channel.
///
/// Live events have no log position yet; they order after everything read from the store.
pub(crate) fn live_event(event: RawEvent) -> StoredEvent {
    StoredEvent {
        seq: i64::MAX,
        received_at: chrono::Utc::now().timestamp(),
        event,
    }
}

/// Starts the supervisor task. It stops when `shutdown` is cancelled or the link is dropped.
pub fn spawn_push_supervisor(
    connector: Arc<dyn PushConnector>,
    reconnect_interval: Duration,
    shutdown: CancellationToken,
) -> (PushLink, JoinHandle<()>) {
    let (events_tx, events) = mpsc::channel(EVENT_BUFFER_SIZE);
    let (status_tx, status) = watch::channel(PushStatus::Disconnected);

    let supervisor = PushSupervisor {
        connector,
        reconnect_interval,
        events: events_tx,
        status: status_tx,
    };
    let handle = tokio::spawn(supervisor.run(shutdown));

    (PushLink { events, status }, handle)
}

struct PushSupervisor {
    connector: Arc<dyn PushConnector>,
    reconnect_interval: Duration,
    events: mpsc::Sender<RawEvent>,
    status: watch::Sender<PushStatus>,
}

impl PushSupervisor {
    async fn run(self, shutdown: CancellationToken) {
        tracing::debug!(
            target: "chatmirror::sync::push::run",
            "Starting push supervisor"
        );

        loop {
            self.status.send_replace(PushStatus::Connecting);

            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                connected = self.connector.connect() => connected,
            };

            match connected {
                Ok(reader) => {
                    self.status.send_replace(PushStatus::Connected);
                    tracing::info!(
                        target: "chatmirror::sync::push::run",
                        "Push channel connected"
                    );

                    match self.pump(reader, &shutdown).await {
                        Ok(()) => tracing::info!(
                            target: "chatmirror::sync::push::run",
                            "Push channel closed"
                        ),
                        Err(PushError::ChannelClosed) => {
                            tracing::debug!(
                                target: "chatmirror::sync::push::run",
                                "Push consumer dropped, stopping supervisor"
                            );
                            break;
                        }
                        Err(e) => tracing::warn!(
                            target: "chatmirror::sync::push::run",
                            "Push channel failed: {}",
                            e
                        ),
                    }
                }
                Err(e) => tracing::warn!(
                    target: "chatmirror::sync::push::run",
                    "Push connection failed: {}",
                    e
                ),
            }

            self.status.send_replace(PushStatus::Disconnected);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }

        self.status.send_replace(PushStatus::Disconnected);
        tracing::debug!(
            target: "chatmirror::sync::push::run",
            "Push supervisor stopped"
        );
    }

    /// Forwards events until the peer closes the connection or shutdown is requested.
    ///
    /// Lines that are not valid UTF-8 or not a valid event are logged and skipped.
    async fn pump(
        &self,
        mut reader: PushReader,
        shutdown: &CancellationToken,
    ) -> Result<(), PushError> {
        let mut buffer = Vec::new();

        loop {
            buffer.clear();
            let read = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                read = reader.read_until(b'\n', &mut buffer) => read?,
            };
            if read == 0 {
                return Ok(());
            }

            let line = match std::str::from_utf8(&buffer) {
                Ok(line) => line.trim(),
                Err(e) => {
                    tracing::warn!(
                        target: "chatmirror::sync::push::pump",
                        "Skipping push line that is not UTF-8: {}",
                        e
                    );
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }

            match RawEvent::from_json_line(line) {
                Ok(event) => self
                    .events
                    .send(event)
                    .await
                    .map_err(|_| PushError::ChannelClosed)?,
                Err(e) => tracing::warn!(
                    target: "chatmirror::sync::push::pump",
                    "Skipping malformed push line: {}",
                    e
                ),
            }
        }
    }
}
