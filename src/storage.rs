//! Snapshot storage service
//!
//! [`StorageService`] ties the persisted [`StorageIndex`] to the blob
//! [`ContentStore`]:
//!
//! ```text
//! key/value store                     storage_root/
//! └── retrace.storageIndex            └── objects/<2>/<62>
//!     ├── metadata (aggregates)
//!     ├── snapshots [...]
//!     └── index { uri: [id...] }
//! ```
//!
//! ## Consistency
//!
//! Every mutation runs under one in-process write lock and re-reads the
//! persisted record inside it, so two interleaved callers never overwrite each
//! other's changes. A blob is only removed once no remaining snapshot
//! references its hash. The index is saved before blobs are removed; a failed
//! blob removal leaves an unreferenced blob that [`StorageService::verify`]
//! reports, never a snapshot without content.
//!
//! Opening the service migrates the schema first; a migration failure aborts
//! construction.
//!
//! ```rust,no_run
//! use retrace::kv::MemoryStore;
//! use retrace::storage::{StorageOptions, StorageService};
//! use std::sync::Arc;
//!
//! # fn main() -> retrace::Result<()> {
//! let storage = StorageService::open(Arc::new(MemoryStore::new()), "./history", StorageOptions::default())?;
//! println!("{} snapshots", storage.stats()?.total_snapshots);
//! # Ok(())
//! # }
//! ```

use crate::compression::CompressionStrategy;
use crate::content::ContentStore;
use crate::error::{HistoryError, Result};
use crate::hash::{compute_hash, short_hash};
use crate::index::StorageIndex;
use crate::kv::KeyValueStore;
use crate::migration::ensure_current_schema;
use crate::types::{DeletedSnapshot, Snapshot, SnapshotFilter, SnapshotUpdate, SortOrder};
use crate::utils::{now_millis, validate_snapshot_id};
use crate::verification::{IndexVerifier, IntegrityReport};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Options for opening a [`StorageService`]
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// How new blobs are compressed
    pub compression: CompressionStrategy,
}

/// Aggregate view of the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    /// Number of snapshot records
    pub total_snapshots: usize,
    /// Logical size of non-deleted snapshots
    pub total_size: u64,
    /// Files with at least one non-deleted snapshot
    pub tracked_files: usize,
    /// Distinct blobs on disk
    pub blob_count: usize,
    /// Last cleanup time in epoch ms
    pub last_cleanup: i64,
}

/// Snapshot storage backed by a key/value store and a blob directory
pub struct StorageService {
    store: Arc<dyn KeyValueStore>,
    content: ContentStore,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for StorageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageService")
            .field("root", &self.content.root())
            .finish()
    }
}

impl StorageService {
    /// Open storage rooted at `root`, migrating the index to the current schema
    #[instrument(skip(store, root, options))]
    pub fn open(store: Arc<dyn KeyValueStore>, root: impl Into<PathBuf>, options: StorageOptions) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let previous = ensure_current_schema(store.as_ref(), &root)?;
        let content = ContentStore::open(&root, options.compression)?;
        info!("Opened snapshot storage at {:?} (schema was {})", root, previous);

        Ok(Self {
            store,
            content,
            write_lock: Mutex::new(()),
        })
    }

    /// Storage root directory
    pub fn root(&self) -> &Path {
        self.content.root()
    }

    /// The underlying blob store
    pub fn content_store(&self) -> &ContentStore {
        &self.content
    }

    /// Read the current index without taking the write lock
    pub fn load_index(&self) -> Result<StorageIndex> {
        StorageIndex::load_required(self.store.as_ref())
    }

    /// Read-modify-write the index under the write lock
    ///
    /// The index is only saved when `f` succeeds.
    fn mutate<T>(&self, f: impl FnOnce(&mut StorageIndex) -> Result<T>) -> Result<T> {
        let _guard = self.write_lock.lock();
        let mut index = self.load_index()?;
        let result = f(&mut index)?;
        index.save(self.store.as_ref())?;
        Ok(result)
    }

    /// Persist a snapshot and its body
    ///
    /// Fills `contentPath`, `metadata.size` and `metadata.compressed`. The
    /// body must hash to `contentHash`.
    pub fn save_snapshot(&self, snapshot: Snapshot, content: &[u8]) -> Result<Snapshot> {
        self.save_snapshot_with(snapshot, content, |_, _| Ok(()))
    }

    /// Persist a snapshot after `prepare` has seen the locked index
    ///
    /// `prepare` runs under the write lock against the latest persisted state,
    /// so fields derived from the file's newest snapshot (timestamp, diff
    /// info) cannot be invalidated by a concurrent save.
    #[instrument(skip(self, snapshot, content, prepare), fields(id = %snapshot.id, uri = %snapshot.file_uri))]
    pub fn save_snapshot_with<F>(&self, mut snapshot: Snapshot, content: &[u8], prepare: F) -> Result<Snapshot>
    where
        F: FnOnce(&StorageIndex, &mut Snapshot) -> Result<()>,
    {
        validate_snapshot_id(&snapshot.id)?;
        let hash = compute_hash(content);
        if snapshot.content_hash != hash {
            return Err(HistoryError::validation(format!(
                "content hash {} does not match body hash {}",
                short_hash(&snapshot.content_hash),
                short_hash(&hash)
            )));
        }

        self.mutate(|index| {
            if index.find(&snapshot.id).is_some() {
                return Err(HistoryError::validation(format!(
                    "snapshot id {} already exists",
                    snapshot.id
                )));
            }
            prepare(index, &mut snapshot)?;

            let blob = self.content.put(&hash, content)?;
            snapshot.content_path = blob.path;
            snapshot.metadata.compressed = blob.compressed;
            snapshot.metadata.size = content.len() as u64;

            index.push(snapshot.clone());
            debug!(
                "Saved snapshot {} ({} bytes, dedup: {})",
                snapshot.short_id(),
                content.len(),
                blob.deduplicated
            );
            Ok(snapshot)
        })
    }

    /// Metadata of snapshot `id`
    pub fn get_snapshot_metadata(&self, id: &str) -> Result<Option<Snapshot>> {
        Ok(self.load_index()?.find(id).cloned())
    }

    /// Body of snapshot `id`
    ///
    /// A missing, unreadable or altered blob is reported as
    /// [`HistoryError::ContentLoad`].
    pub fn get_snapshot_content(&self, id: &str) -> Result<Vec<u8>> {
        let snapshot = self
            .get_snapshot_metadata(id)?
            .ok_or_else(|| HistoryError::SnapshotNotFound(id.to_string()))?;
        self.load_content(&snapshot)
    }

    /// Body of an already resolved snapshot
    pub fn load_content(&self, snapshot: &Snapshot) -> Result<Vec<u8>> {
        let content = self
            .content
            .get(&snapshot.content_path, snapshot.metadata.compressed)
            .map_err(|e| {
                warn!("Failed to load content of snapshot {}: {}", snapshot.id, e);
                HistoryError::content_load(&snapshot.id, e)
            })?;

        if compute_hash(&content) != snapshot.content_hash {
            return Err(HistoryError::content_load(
                &snapshot.id,
                HistoryError::corruption(format!("blob {} does not match its hash", snapshot.content_path)),
            ));
        }
        Ok(content)
    }

    /// Apply a partial update to snapshot `id`
    pub fn update_snapshot(&self, id: &str, update: SnapshotUpdate) -> Result<Snapshot> {
        self.mutate(|index| {
            let snapshot = index
                .find_mut(id)
                .ok_or_else(|| HistoryError::SnapshotNotFound(id.to_string()))?;
            update.apply(snapshot, now_millis());
            trace!("Updated snapshot {} with {:?}", id, update);
            Ok(snapshot.clone())
        })
    }

    /// Snapshots of `uri` matching `filter`
    ///
    /// Cancellation returns an empty list if it happens before filtering is
    /// complete, and whatever was gathered otherwise.
    pub fn list_snapshots_for_file(
        &self,
        uri: &str,
        filter: &SnapshotFilter,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Snapshot>> {
        let cancelled = || cancel.is_some_and(CancellationToken::is_cancelled);
        if cancelled() {
            return Ok(Vec::new());
        }

        let index = self.load_index()?;
        let candidates = index.snapshots_for_file(uri)?;
        if cancelled() {
            return Ok(Vec::new());
        }

        let mut matching: Vec<&Snapshot> = candidates.into_iter().filter(|s| filter.matches(s)).collect();
        if cancelled() {
            return Ok(Vec::new());
        }

        // Stable sort keeps append order for equal timestamps
        matching.sort_by_key(|s| s.timestamp);
        if filter.order == SortOrder::Newest {
            matching.reverse();
        }

        let start = match &filter.cursor_id {
            None => 0,
            Some(cursor) => match matching.iter().position(|s| s.id == *cursor) {
                Some(position) => position + 1,
                None => {
                    debug!("Cursor {} not found for {}", cursor, uri);
                    return Ok(Vec::new());
                }
            },
        };

        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut result = Vec::new();
        for snapshot in matching.into_iter().skip(start).take(limit) {
            if cancelled() {
                break;
            }
            result.push(snapshot.clone());
        }
        Ok(result)
    }

    /// Every snapshot in creation order
    pub fn list_all_snapshots(&self) -> Result<Vec<Snapshot>> {
        Ok(self.load_index()?.snapshots)
    }

    /// Delete snapshot `id`, removing its blob if nothing else references it
    #[instrument(skip(self))]
    pub fn delete_snapshot(&self, id: &str) -> Result<DeletedSnapshot> {
        let mut deleted = self.delete_where(|index| {
            if index.find(id).is_none() {
                return Err(HistoryError::SnapshotNotFound(id.to_string()));
            }
            Ok(vec![id.to_string()])
        })?;
        deleted
            .pop()
            .ok_or_else(|| HistoryError::internal(format!("deletion of {} produced no result", id)))
    }

    /// Delete every snapshot of `uri`; returns how many were removed
    pub fn delete_snapshots_for_file(&self, uri: &str) -> Result<usize> {
        let deleted = self.delete_where(|index| Ok(index.index.get(uri).cloned().unwrap_or_default()))?;
        info!("Deleted {} snapshots of {}", deleted.len(), uri);
        Ok(deleted.len())
    }

    /// Delete every snapshot and blob
    pub fn clear_all(&self) -> Result<usize> {
        let deleted = self.delete_where(|index| Ok(index.snapshots.iter().map(|s| s.id.clone()).collect()))?;

        // Blobs no snapshot points at, including ones saved since the clear
        let _guard = self.write_lock.lock();
        let index = self.load_index()?;
        let referenced: HashSet<&str> = index.snapshots.iter().map(|s| s.content_path.as_str()).collect();
        for path in self.content.list_blobs()? {
            if referenced.contains(path.as_str()) {
                continue;
            }
            if let Err(e) = self.content.delete(&path) {
                warn!("Failed to delete blob {}: {}", path, e);
            }
        }
        info!("Cleared {} snapshots", deleted.len());
        Ok(deleted.len())
    }

    /// Plan deletions against the locked index and carry them out
    ///
    /// The planning closure sees the latest persisted state, and nothing else
    /// can change the index until the deletions are saved. Ids the plan
    /// returns that are not in the index are skipped.
    pub fn evict<F>(&self, plan: F) -> Result<Vec<DeletedSnapshot>>
    where
        F: FnOnce(&StorageIndex) -> Vec<String>,
    {
        self.delete_where(|index| Ok(plan(index)))
    }

    fn delete_where<F>(&self, select: F) -> Result<Vec<DeletedSnapshot>>
    where
        F: FnOnce(&StorageIndex) -> Result<Vec<String>>,
    {
        let _guard = self.write_lock.lock();
        let mut index = self.load_index()?;
        let ids = select(&index)?;

        let mut deleted = Vec::with_capacity(ids.len());
        let mut released_blobs = Vec::new();
        for id in &ids {
            let Some(snapshot) = index.remove(id) else {
                warn!("Skipping deletion of unknown snapshot {}", id);
                continue;
            };
            let released = !index.references_hash(&snapshot.content_hash);
            if released {
                released_blobs.push(snapshot.content_path.clone());
            }
            deleted.push(DeletedSnapshot {
                id: snapshot.id,
                size: if snapshot.metadata.deleted { 0 } else { snapshot.metadata.size },
                blob_removed: released,
            });
        }

        if deleted.is_empty() {
            return Ok(deleted);
        }
        index.save(self.store.as_ref())?;

        for (path, entry) in released_blobs.iter().zip(deleted.iter_mut().filter(|d| d.blob_removed)) {
            match self.content.delete(path) {
                Ok(removed) => entry.blob_removed = removed,
                Err(e) => {
                    warn!("Failed to delete blob {}: {}", path, e);
                    entry.blob_removed = false;
                }
            }
        }

        debug!("Deleted {} snapshots", deleted.len());
        Ok(deleted)
    }

    /// Files with at least one snapshot that is not a deletion marker, sorted
    pub fn get_tracked_files(&self) -> Result<Vec<String>> {
        Ok(self.load_index()?.tracked_files())
    }

    /// Aggregate statistics
    pub fn stats(&self) -> Result<StorageStats> {
        let index = self.load_index()?;
        Ok(StorageStats {
            total_snapshots: index.metadata.total_snapshots,
            total_size: index.metadata.total_size,
            tracked_files: index.tracked_files().len(),
            blob_count: self.content.list_blobs()?.len(),
            last_cleanup: index.metadata.last_cleanup,
        })
    }

    /// Record the time of a cleanup run
    pub fn record_cleanup(&self, timestamp: i64) -> Result<()> {
        self.mutate(|index| {
            index.metadata.last_cleanup = timestamp;
            Ok(())
        })
    }

    /// Check the index against itself and the blob store
    pub fn verify(&self) -> Result<IntegrityReport> {
        IndexVerifier::new(self).verify()
    }
}
