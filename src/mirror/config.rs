use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ChatMirrorError, Result};

/// How a message id is derived when the provider did not assign one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DedupKeyPolicy {
    /// Timestamp, sender prefix and a hash of the content. Distinct messages in the
    /// same second get distinct keys; exact redeliveries still coalesce.
    #[default]
    ContentHash,
    /// Timestamp and truncated sender id only. Two messages from one sender in the
    /// same second coalesce.
    TimestampSender,
}

impl FromStr for DedupKeyPolicy {
    type Err = ChatMirrorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "content_hash" | "content-hash" => Ok(Self::ContentHash),
            "timestamp_sender" | "timestamp-sender" => Ok(Self::TimestampSender),
            other => Err(ChatMirrorError::Configuration(format!(
                "Unknown dedup key policy: {other}"
            ))),
        }
    }
}

/// Tunables consumed by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Number of most recent events read by initial and incremental loads.
    pub scan_window: usize,
    /// Events read per store round trip; cancellation is checked between batches.
    pub scan_batch_size: usize,
    /// Wider window read when paging backwards before falling back to the whole log.
    pub older_scan_window: usize,
    pub initial_page_size: usize,
    pub older_page_size: usize,
    pub poll_interval: Duration,
    pub push_reconnect_interval: Duration,
    /// Number of recently visible chats whose caches are kept.
    pub max_cached_chats: usize,
    pub dedup_key_policy: DedupKeyPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            scan_window: 3000,
            scan_batch_size: 500,
            older_scan_window: 12000,
            initial_page_size: 50,
            older_page_size: 50,
            poll_interval: Duration::from_secs(10),
            push_reconnect_interval: Duration::from_secs(5),
            max_cached_chats: 8,
            dedup_key_policy: DedupKeyPolicy::ContentHash,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `CHATMIRROR_*` environment variables (a `.env` file is honoured).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = parse_var(&lookup, "CHATMIRROR_SCAN_WINDOW")? {
            config.scan_window = value;
        }
        if let Some(value) = parse_var(&lookup, "CHATMIRROR_SCAN_BATCH_SIZE")? {
            config.scan_batch_size = value;
        }
        if let Some(value) = parse_var(&lookup, "CHATMIRROR_OLDER_SCAN_WINDOW")? {
            config.older_scan_window = value;
        }
        if let Some(value) = parse_var(&lookup, "CHATMIRROR_INITIAL_PAGE_SIZE")? {
            config.initial_page_size = value;
        }
        if let Some(value) = parse_var(&lookup, "CHATMIRROR_OLDER_PAGE_SIZE")? {
            config.older_page_size = value;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CHATMIRROR_POLL_INTERVAL_SECS")? {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CHATMIRROR_PUSH_RECONNECT_SECS")? {
            config.push_reconnect_interval = Duration::from_secs(secs);
        }
        if let Some(value) = parse_var(&lookup, "CHATMIRROR_MAX_CACHED_CHATS")? {
            config.max_cached_chats = value;
        }
        if let Some(value) = parse_var(&lookup, "CHATMIRROR_DEDUP_KEY_POLICY")? {
            config.dedup_key_policy = value;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.scan_window == 0, "scan_window must be positive"),
            (self.scan_batch_size == 0, "scan_batch_size must be positive"),
            (
                self.older_scan_window < self.scan_window,
                "older_scan_window must be at least scan_window",
            ),
            (self.initial_page_size == 0, "initial_page_size must be positive"),
            (self.older_page_size == 0, "older_page_size must be positive"),
            (self.poll_interval.is_zero(), "poll_interval must be positive"),
            (
                self.push_reconnect_interval.is_zero(),
                "push_reconnect_interval must be positive",
            ),
            (self.max_cached_chats == 0, "max_cached_chats must be positive"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(ChatMirrorError::Configuration(reason.to_string())),
            None => Ok(()),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            ChatMirrorError::Configuration(format!("Invalid value for {key}: {raw:?} ({e})"))
        }),
    }
}

#[derive(Clone, Debug)]
pub struct MirrorConfig {
    /// Directory for application data
    pub data_dir: PathBuf,

    /// Directory for application logs
    pub logs_dir: PathBuf,

    /// `host:port` of the push channel; poll-only when absent
    pub push_addr: Option<String>,

    pub sync: SyncConfig,
}

impl MirrorConfig {
    pub fn new(data_dir: &Path, logs_dir: &Path) -> Self {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };

        Self {
            data_dir: data_dir.join(env_suffix),
            logs_dir: logs_dir.join(env_suffix),
            push_addr: None,
            sync: SyncConfig::default(),
        }
    }

    pub fn with_push_addr(mut self, push_addr: impl Into<String>) -> Self {
        self.push_addr = Some(push_addr.into());
        self
    }

    pub fn with_sync_config(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn event_store_path(&self) -> PathBuf {
        self.data_dir.join("events.sqlite")
    }
}
