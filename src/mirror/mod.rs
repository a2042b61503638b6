pub mod chat_aggregator;
pub mod config;
pub mod event_store;
pub mod message_cache;
pub mod sync;

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ChatMirrorError, Result};
use crate::init_tracing;
use config::MirrorConfig;
use event_store::{EventStore, SqliteEventStore};
use sync::{
    MessageSender, PushLink, SyncCoordinator, SyncHandle, TcpPushConnector, spawn_push_supervisor,
};

/// The running engine: durable event store, push supervisor and sync coordinator.
///
/// Constructed at startup and torn down on logout. Hand [`SyncHandle`]s to the
/// presentation bridge; the coordinator owns all cache state.
pub struct ChatMirror {
    pub config: MirrorConfig,
    store: Arc<SqliteEventStore>,
    handle: SyncHandle,
    shutdown: CancellationToken,
    coordinator_task: JoinHandle<()>,
    push_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ChatMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatMirror")
            .field("config", &self.config)
            .field("store", &self.store.path)
            .field("push", &self.push_task.is_some())
            .finish()
    }
}

impl ChatMirror {
    /// Sets up directories and logging, opens the event store and starts the
    /// coordinator, plus the push supervisor when a push address is configured.
    ///
    /// # Errors
    ///
    /// Fails if a directory cannot be created, the sync configuration is invalid,
    /// or the event store cannot be opened or migrated.
    pub async fn initialize(config: MirrorConfig) -> Result<Self> {
        Self::initialize_with_sender(config, None).await
    }

    pub async fn initialize_with_sender(
        config: MirrorConfig,
        sender: Option<Arc<dyn MessageSender>>,
    ) -> Result<Self> {
        let data_dir = &config.data_dir;
        let logs_dir = &config.logs_dir;

        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))
            .map_err(ChatMirrorError::from)?;
        std::fs::create_dir_all(logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))
            .map_err(ChatMirrorError::from)?;

        init_tracing(logs_dir)?;
        tracing::debug!(
            target: "chatmirror::initialize",
            "Logging initialized in directory: {:?}",
            logs_dir
        );

        config.sync.validate()?;

        let store = Arc::new(SqliteEventStore::open(config.event_store_path()).await?);
        tracing::info!(
            target: "chatmirror::initialize",
            "Event store at {:?} holds {} events",
            store.path,
            store.count().await?
        );

        let shutdown = CancellationToken::new();

        let (push, push_task) = match &config.push_addr {
            Some(addr) => {
                tracing::info!(target: "chatmirror::initialize", "Push channel at {}", addr);
                let (link, task) = spawn_push_supervisor(
                    Arc::new(TcpPushConnector::new(addr.clone())),
                    config.sync.push_reconnect_interval,
                    shutdown.child_token(),
                );
                (link, Some(task))
            }
            None => {
                tracing::info!(
                    target: "chatmirror::initialize",
                    "No push channel configured, polling only"
                );
                (PushLink::disconnected(), None)
            }
        };

        let mut coordinator = SyncCoordinator::new(store.clone(), config.sync.clone());
        if let Some(sender) = sender {
            coordinator = coordinator.with_sender(sender);
        }
        let (handle, coordinator_task) = coordinator.spawn(push, shutdown.child_token());

        Ok(Self {
            config,
            store,
            handle,
            shutdown,
            coordinator_task,
            push_task,
        })
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// The durable log, for the ingestion path to append to.
    pub fn store(&self) -> Arc<SqliteEventStore> {
        self.store.clone()
    }

    /// Clears every cache and stops all background work.
    pub async fn logout(self) -> Result<()> {
        if let Err(e) = self.handle.logout().await {
            tracing::debug!(target: "chatmirror::logout", "Coordinator already stopped: {}", e);
        }
        self.shutdown().await
    }

    /// Stops the coordinator and the push supervisor and waits for both.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();

        self.coordinator_task
            .await
            .context("Sync coordinator task failed")?;
        if let Some(push_task) = self.push_task {
            push_task.await.context("Push supervisor task failed")?;
        }

        tracing::info!(target: "chatmirror::shutdown", "Chat mirror stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::mirror::sync::SyncUpdate;
    use crate::test_utils::text_event;

    #[tokio::test]
    async fn test_initialize_serves_messages_from_disk() {
        let data = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        let config = MirrorConfig::new(data.path(), logs.path());

        let mirror = ChatMirror::initialize(config).await.unwrap();
        assert!(mirror.config.event_store_path().exists());

        let store = mirror.store();
        store.append(&text_event("P", false, 1, "from disk")).await.unwrap();

        let handle = mirror.handle();
        let mut updates = handle.subscribe();
        handle.select_chat("P").await.unwrap();

        let messages = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let SyncUpdate::InitialMessagesLoaded { messages, .. } =
                    updates.recv().await.unwrap()
                {
                    break messages;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].preview, "from disk");

        mirror.logout().await.unwrap();
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_invalid_sync_config_is_rejected() {
        let data = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        let config = MirrorConfig::new(data.path(), logs.path()).with_sync_config(
            crate::mirror::config::SyncConfig {
                scan_window: 0,
                ..Default::default()
            },
        );

        let result = ChatMirror::initialize(config).await;
        assert!(matches!(result, Err(ChatMirrorError::Configuration(_))));
    }
}
