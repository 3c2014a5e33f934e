//! The persisted storage index
//!
//! All snapshot metadata lives in one record stored under [`INDEX_KEY`] in the
//! host key/value store:
//!
//! ```text
//! { version, metadata: { version, created, lastCleanup, totalSnapshots, totalSize },
//!   snapshots: [Snapshot...], index: { fileUri: [id...] } }
//! ```
//!
//! `snapshots` is in creation order and `index[uri]` in append order. Sorting
//! by timestamp happens at query time. The aggregates in `metadata` are
//! recomputed from `snapshots` on every mutation.

use crate::error::{HistoryError, Result};
use crate::kv::KeyValueStore;
use crate::types::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::trace;

/// Key of the storage index record
pub const INDEX_KEY: &str = "retrace.storageIndex";

/// Aggregate metadata of the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMetadata {
    /// Schema version, mirrors the top-level field
    pub version: String,
    /// Creation time in epoch ms
    pub created: i64,
    /// Time of the last cleanup run in epoch ms
    pub last_cleanup: i64,
    /// Number of snapshot records
    pub total_snapshots: usize,
    /// Sum of logical sizes of non-deleted snapshots
    pub total_size: u64,
}

/// The single persisted root record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageIndex {
    /// Schema version
    pub version: String,
    /// Aggregates
    pub metadata: IndexMetadata,
    /// All snapshots in creation order
    pub snapshots: Vec<Snapshot>,
    /// File uri to snapshot ids in append order
    pub index: BTreeMap<String, Vec<String>>,
}

impl StorageIndex {
    /// A fresh, empty index at `version`
    pub fn empty(version: &str, now: i64) -> Self {
        Self {
            version: version.to_string(),
            metadata: IndexMetadata {
                version: version.to_string(),
                created: now,
                last_cleanup: now,
                total_snapshots: 0,
                total_size: 0,
            },
            snapshots: Vec::new(),
            index: BTreeMap::new(),
        }
    }

    /// Read the index from `store`; `None` when no record exists
    pub fn load(store: &dyn KeyValueStore) -> Result<Option<Self>> {
        match store.get(INDEX_KEY)? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| HistoryError::corruption(format!("storage index is unreadable: {}", e))),
        }
    }

    /// Read the index, failing if it has not been initialized
    pub fn load_required(store: &dyn KeyValueStore) -> Result<Self> {
        Self::load(store)?.ok_or_else(|| HistoryError::corruption("storage index record is missing"))
    }

    /// Persist the index to `store`
    pub fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        store.update(INDEX_KEY, serde_json::to_value(self)?)?;
        trace!("Saved storage index ({} snapshots)", self.snapshots.len());
        Ok(())
    }

    /// Find a snapshot by id
    pub fn find(&self, id: &str) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.id == id)
    }

    /// Find a snapshot by id for mutation
    pub fn find_mut(&mut self, id: &str) -> Option<&mut Snapshot> {
        self.snapshots.iter_mut().find(|s| s.id == id)
    }

    /// Snapshots of `uri` in append order
    ///
    /// Ids that do not resolve are reported as corruption.
    pub fn snapshots_for_file(&self, uri: &str) -> Result<Vec<&Snapshot>> {
        let Some(ids) = self.index.get(uri) else {
            return Ok(Vec::new());
        };
        let by_id: HashMap<&str, &Snapshot> = self.snapshots.iter().map(|s| (s.id.as_str(), s)).collect();
        ids.iter()
            .map(|id| {
                by_id
                    .get(id.as_str())
                    .copied()
                    .filter(|s| s.file_uri == uri)
                    .ok_or_else(|| {
                        HistoryError::corruption(format!("index entry for {} lists unknown snapshot {}", uri, id))
                    })
            })
            .collect()
    }

    /// Most recent snapshot of `uri` by timestamp, later insertion winning ties
    pub fn latest_for_file(&self, uri: &str) -> Result<Option<&Snapshot>> {
        let snapshots = self.snapshots_for_file(uri)?;
        Ok(snapshots.into_iter().max_by_key(|s| s.timestamp))
    }

    /// Append a snapshot and its index entry
    pub fn push(&mut self, snapshot: Snapshot) {
        self.index
            .entry(snapshot.file_uri.clone())
            .or_default()
            .push(snapshot.id.clone());
        self.snapshots.push(snapshot);
        self.recompute_aggregates();
    }

    /// Remove a snapshot and its index entry
    pub fn remove(&mut self, id: &str) -> Option<Snapshot> {
        let position = self.snapshots.iter().position(|s| s.id == id)?;
        let snapshot = self.snapshots.remove(position);
        if let Some(ids) = self.index.get_mut(&snapshot.file_uri) {
            ids.retain(|i| i != id);
            if ids.is_empty() {
                self.index.remove(&snapshot.file_uri);
            }
        }
        self.recompute_aggregates();
        Some(snapshot)
    }

    /// Whether any snapshot still references `hash`
    pub fn references_hash(&self, hash: &str) -> bool {
        self.snapshots.iter().any(|s| s.content_hash == hash)
    }

    /// Number of snapshots recorded for `uri`
    pub fn count_for_file(&self, uri: &str) -> usize {
        self.index.get(uri).map_or(0, Vec::len)
    }

    /// Sum of logical sizes of non-deleted snapshots
    pub fn computed_total_size(&self) -> u64 {
        self.snapshots
            .iter()
            .filter(|s| !s.metadata.deleted)
            .map(|s| s.metadata.size)
            .sum()
    }

    /// Bring `totalSnapshots` and `totalSize` in line with the snapshot list
    pub fn recompute_aggregates(&mut self) {
        self.metadata.total_snapshots = self.snapshots.len();
        self.metadata.total_size = self.computed_total_size();
    }

    /// Whether the stored aggregates match the snapshot list
    pub fn aggregates_consistent(&self) -> bool {
        self.metadata.total_snapshots == self.snapshots.len()
            && self.metadata.total_size == self.computed_total_size()
    }

    /// File uris with at least one snapshot that is not a deletion marker
    pub fn tracked_files(&self) -> Vec<String> {
        let files: std::collections::BTreeSet<&str> = self
            .snapshots
            .iter()
            .filter(|s| !s.metadata.deleted)
            .map(|s| s.file_uri.as_str())
            .collect();
        files.into_iter().map(str::to_string).collect()
    }

    /// Problems that make the index unusable
    ///
    /// Duplicate snapshot ids, index ids without a snapshot, and ids listed
    /// under a file they do not belong to.
    pub fn consistency_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut by_id: HashMap<&str, &Snapshot> = HashMap::new();
        for snapshot in &self.snapshots {
            if by_id.insert(snapshot.id.as_str(), snapshot).is_some() {
                errors.push(format!("duplicate snapshot id {}", snapshot.id));
            }
        }

        for (uri, ids) in &self.index {
            let mut seen = HashSet::new();
            for id in ids {
                if !seen.insert(id.as_str()) {
                    errors.push(format!("snapshot {} listed twice under {}", id, uri));
                }
                match by_id.get(id.as_str()) {
                    None => errors.push(format!("orphaned index id {} under {}", id, uri)),
                    Some(s) if s.file_uri != *uri => errors.push(format!(
                        "snapshot {} listed under {} but belongs to {}",
                        id, uri, s.file_uri
                    )),
                    Some(_) => {}
                }
            }
        }
        errors
    }

    /// Snapshots whose id is absent from `index[fileUri]`
    pub fn unindexed_snapshots(&self) -> Vec<&Snapshot> {
        self.snapshots
            .iter()
            .filter(|s| {
                self.index
                    .get(&s.file_uri)
                    .map_or(true, |ids| !ids.iter().any(|id| *id == s.id))
            })
            .collect()
    }
}
