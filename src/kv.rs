//! Key/value persistence capability
//!
//! The storage index lives in a host-provided key/value store, the same way
//! an editor extension keeps state in its workspace memento. The engine only
//! depends on the [`KeyValueStore`] trait; two backings ship with the crate:
//!
//! - [`MemoryStore`]: process-local map, for tests and embedders that persist
//!   state themselves
//! - [`JsonFileStore`]: one JSON document on disk holding every key, written
//!   atomically on each update

use crate::error::Result;
use crate::utils::atomic_write;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Host key/value storage
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Replace the value stored under `key`
    fn update(&self, key: &str, value: Value) -> Result<()>;

    /// All keys currently stored
    fn keys(&self) -> Vec<String>;
}

/// In-memory key/value store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn update(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

/// Key/value store backed by a single JSON file
///
/// The whole document is cached in memory and rewritten on every update.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: RwLock<Map<String, Value>>,
}

impl JsonFileStore {
    /// Open the store at `path`, creating an empty one if the file is absent
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                Map::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            Map::new()
        };

        info!("Opened key/value store at {:?} ({} keys)", path, entries.len());

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn update(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.write();
        entries.insert(key.to_string(), value);
        let json = serde_json::to_vec_pretty(&*entries)?;
        atomic_write(&self.path, &json)?;
        debug!("Persisted key '{}' ({} bytes total)", key, json.len());
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}
