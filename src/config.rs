//! Configuration and builder
//!
//! [`HistoryConfig`] holds the tunables of a history instance and can be
//! loaded from JSON; missing fields take their defaults:
//!
//! ```json
//! {
//!   "ttl_days": 30,
//!   "max_storage_bytes": 104857600,
//!   "cleanup_interval_hours": 24,
//!   "compression": { "type": "fast" },
//!   "max_snapshot_bytes": 10485760
//! }
//! ```
//!
//! [`LocalHistoryBuilder`] assembles a [`LocalHistoryManager`] from a config,
//! a key/value store, a tracing span and observers.

use crate::cleanup::CleanupPolicy;
use crate::compression::CompressionStrategy;
use crate::error::{HistoryError, Result};
use crate::kv::{JsonFileStore, KeyValueStore};
use crate::manager::LocalHistoryManager;
use crate::types::HistoryObserver;
use crate::utils::atomic_write;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, Span};

/// File name of the default key/value store inside the storage directory
pub const STATE_FILE: &str = "state.json";

/// Tunables of a history instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Snapshots older than this many days are evicted
    pub ttl_days: u32,
    /// Budget for the aggregate logical size of all snapshots
    pub max_storage_bytes: u64,
    /// Period of the background cleanup
    pub cleanup_interval_hours: u64,
    /// How new blobs are compressed
    pub compression: CompressionStrategy,
    /// Bodies larger than this are refused
    pub max_snapshot_bytes: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        let policy = CleanupPolicy::default();
        Self {
            ttl_days: policy.ttl_days,
            max_storage_bytes: policy.max_storage_bytes,
            cleanup_interval_hours: 24,
            compression: CompressionStrategy::Fast,
            max_snapshot_bytes: 10 * 1024 * 1024,
        }
    }
}

impl HistoryConfig {
    /// Load a config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write(path, &serde_json::to_vec_pretty(self)?)
    }

    /// Reject values no instance can run with
    pub fn validate(&self) -> Result<()> {
        if self.cleanup_interval_hours == 0 {
            return Err(HistoryError::validation("cleanup_interval_hours must be at least 1"));
        }
        if self.max_snapshot_bytes == 0 {
            return Err(HistoryError::validation("max_snapshot_bytes must be positive"));
        }
        Ok(())
    }

    /// Eviction limits
    pub fn cleanup_policy(&self) -> CleanupPolicy {
        CleanupPolicy {
            ttl_days: self.ttl_days,
            max_storage_bytes: self.max_storage_bytes,
        }
    }

    /// Period of the background cleanup
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_hours.saturating_mul(3600))
    }
}

/// Builder for [`LocalHistoryManager`]
///
/// ```rust,no_run
/// use retrace::{CompressionStrategy, LocalHistoryBuilder};
///
/// # fn main() -> retrace::Result<()> {
/// let history = LocalHistoryBuilder::new()
///     .ttl_days(14)
///     .compression(CompressionStrategy::Adaptive { min_size: 4096 })
///     .span(tracing::info_span!("history", workspace = "demo"))
///     .build("./.retrace")?;
/// # Ok(())
/// # }
/// ```
pub struct LocalHistoryBuilder {
    config: HistoryConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    span: Option<Span>,
    observers: Vec<Box<dyn HistoryObserver>>,
}

impl std::fmt::Debug for LocalHistoryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHistoryBuilder")
            .field("config", &self.config)
            .field("store", &self.store.is_some())
            .field("observers", &format!("<{} observers>", self.observers.len()))
            .finish()
    }
}

impl Default for LocalHistoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHistoryBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self {
            config: HistoryConfig::default(),
            store: None,
            span: None,
            observers: Vec::new(),
        }
    }

    /// Replace the whole config
    pub fn config(mut self, config: HistoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Maximum snapshot age in days
    pub fn ttl_days(mut self, days: u32) -> Self {
        self.config.ttl_days = days;
        self
    }

    /// Budget for the aggregate snapshot size
    pub fn max_storage_bytes(mut self, bytes: u64) -> Self {
        self.config.max_storage_bytes = bytes;
        self
    }

    /// Period of the background cleanup
    pub fn cleanup_interval_hours(mut self, hours: u64) -> Self {
        self.config.cleanup_interval_hours = hours;
        self
    }

    /// Compression of new blobs
    pub fn compression(mut self, strategy: CompressionStrategy) -> Self {
        self.config.compression = strategy;
        self
    }

    /// Largest body accepted by `create_snapshot`
    pub fn max_snapshot_bytes(mut self, bytes: u64) -> Self {
        self.config.max_snapshot_bytes = bytes;
        self
    }

    /// Key/value store holding the index
    ///
    /// Defaults to a [`JsonFileStore`] at `<storage>/state.json`.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Span all manager operations are recorded under
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Register an observer
    pub fn observer(mut self, observer: Box<dyn HistoryObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Open the history stored under `storage_path`
    ///
    /// Fails if the config is invalid or the stored schema cannot be migrated.
    pub fn build(self, storage_path: impl Into<PathBuf>) -> Result<LocalHistoryManager> {
        self.config.validate()?;
        let storage_path = storage_path.into();
        std::fs::create_dir_all(&storage_path)?;

        let store: Arc<dyn KeyValueStore> = match self.store {
            Some(store) => store,
            None => Arc::new(JsonFileStore::open(storage_path.join(STATE_FILE))?),
        };
        let span = self.span.unwrap_or_else(|| tracing::info_span!("retrace"));

        LocalHistoryManager::from_parts(self.config, store, storage_path, span, self.observers)
    }
}
