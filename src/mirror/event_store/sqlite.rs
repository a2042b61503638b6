use std::{path::PathBuf, sync::LazyLock, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{
    Sqlite, SqlitePool,
    migrate::{MigrateDatabase, Migrator},
    sqlite::SqlitePoolOptions,
};

use super::{EventPage, EventStore, StoreError, StoredEvent};
use crate::types::RawEvent;

pub static MIGRATOR: LazyLock<Migrator> = LazyLock::new(|| sqlx::migrate!("./db_migrations"));

const DB_ACQUIRE_TIMEOUT_SECS: u64 = 5;
const DB_MAX_CONNECTIONS: u32 = 10;
const DB_BUSY_TIMEOUT_MS: u32 = 5000;

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    seq: i64,
    payload: String,
    received_at: i64,
}

/// SQLite-backed append-only event log.
#[derive(Clone, Debug)]
pub struct SqliteEventStore {
    pub pool: SqlitePool,
    pub path: PathBuf,
}

impl SqliteEventStore {
    pub async fn open(db_path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}", db_path.display());

        match Sqlite::database_exists(&db_url).await {
            Ok(true) => {
                tracing::debug!(
                    target: "chatmirror::event_store::open",
                    "Opening existing event log at {:?}",
                    db_path
                );
            }
            Ok(false) => {
                tracing::info!(
                    target: "chatmirror::event_store::open",
                    "No event log at {:?}, starting an empty one",
                    db_path
                );
                Sqlite::create_database(&db_url).await.map_err(|e| {
                    tracing::error!(
                        target: "chatmirror::event_store::open",
                        "Failed to create event log: {:?}",
                        e
                    );
                    StoreError::Sqlx(e)
                })?;
            }
            Err(e) => {
                tracing::warn!(
                    target: "chatmirror::event_store::open",
                    "Could not check for event log {:?} ({:?}), creating it",
                    db_path,
                    e
                );
                Sqlite::create_database(&db_url).await?;
            }
        }

        let pool = Self::create_connection_pool(&db_url).await?;
        MIGRATOR.run(&pool).await?;

        Ok(Self {
            pool,
            path: db_path,
        })
    }

    async fn create_connection_pool(db_url: &str) -> Result<SqlitePool, StoreError> {
        let pool = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(DB_ACQUIRE_TIMEOUT_SECS))
            .max_connections(DB_MAX_CONNECTIONS)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    let conn = &mut *conn;
                    // The ingestion process writes while we read.
                    sqlx::query("PRAGMA journal_mode=WAL")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query(&format!("PRAGMA busy_timeout={DB_BUSY_TIMEOUT_MS}"))
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("{db_url}?mode=rwc"))
            .await?;
        Ok(pool)
    }

    /// Appends an event stamped with the current time.
    ///
    /// The sync engine never writes; this exists for the ingestion path and tooling.
    pub async fn append(&self, event: &RawEvent) -> Result<StoredEvent, StoreError> {
        let received_at = Utc::now().timestamp();
        let payload = serde_json::to_string(event)?;
        let seq = self.append_payload(&payload, received_at).await?;
        Ok(StoredEvent {
            seq,
            received_at,
            event: event.clone(),
        })
    }

    /// Appends an already-serialized record verbatim.
    pub async fn append_payload(&self, payload: &str, received_at: i64) -> Result<i64, StoreError> {
        let result = sqlx::query("INSERT INTO events (payload, received_at) VALUES (?, ?)")
            .bind(payload)
            .bind(received_at)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn recent_page(
        &self,
        before_seq: Option<i64>,
        limit: usize,
    ) -> Result<EventPage, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT seq, payload, received_at FROM events WHERE seq < ? ORDER BY seq DESC LIMIT ?",
        )
        .bind(before_seq.unwrap_or(i64::MAX))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let scanned = rows.len();
        let oldest_seq = rows.last().map(|row| row.seq);
        let events = rows
            .into_iter()
            .filter_map(|row| match RawEvent::from_json_line(&row.payload) {
                Ok(event) => Some(StoredEvent {
                    seq: row.seq,
                    received_at: row.received_at,
                    event,
                }),
                Err(e) => {
                    tracing::warn!(
                        target: "chatmirror::event_store::recent_page",
                        "Skipping undecodable event {}: {}",
                        row.seq,
                        e
                    );
                    None
                }
            })
            .collect();

        Ok(EventPage {
            events,
            scanned,
            oldest_seq,
        })
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
