//! The history manager
//!
//! [`LocalHistoryManager`] is what hosts talk to. It turns file contents into
//! snapshots, answers queries, runs diffs and restores, and forwards cleanup
//! to the [`CleanupService`]. Every mutation is followed by a
//! [`HistoryEvent`] to the registered observers.
//!
//! ## Example
//!
//! ```rust,no_run
//! use retrace::{LocalHistoryBuilder, SnapshotSource, SnapshotUpdate};
//!
//! # fn main() -> retrace::Result<()> {
//! let history = LocalHistoryBuilder::new().build("./.retrace")?;
//!
//! let first = history.create_snapshot("file:///src/main.rs", b"fn main() {}\n", SnapshotSource::Save)?;
//! let second = history.create_snapshot(
//!     "file:///src/main.rs",
//!     b"fn main() {\n    run();\n}\n",
//!     SnapshotSource::Typing,
//! )?;
//! assert_eq!(second.diff_info.as_ref().map(|d| d.previous_snapshot_id.as_str()), Some(first.id.as_str()));
//!
//! history.update_snapshot(&first.id, SnapshotUpdate::Accept)?;
//! let diff = history.diff_snapshots(&first.id, &second.id)?;
//! println!("{} changed lines", diff.stats.total());
//! # Ok(())
//! # }
//! ```

use crate::cleanup::{CleanupReport, CleanupService};
use crate::config::{HistoryConfig, LocalHistoryBuilder};
use crate::diff::{compute_diff_stats, diff_contents, line_count, DetailedDiff};
use crate::error::{HistoryError, Result};
use crate::hash::compute_hash;
use crate::host::{file_path_from_uri, FileAccess};
use crate::kv::KeyValueStore;
use crate::storage::{StorageOptions, StorageService, StorageStats};
use crate::types::{
    BatchAction, BatchFailure, BatchOutcome, DiffInfo, HistoryEvent, HistoryObserver, Snapshot,
    SnapshotFilter, SnapshotMetadata, SnapshotSelection, SnapshotSource, SnapshotUpdate, SortOrder,
};
use crate::utils::{format_bytes, now_millis, validate_snapshot_id};
use crate::verification::{IndexVerifier, IntegrityReport};
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Span};
use uuid::Uuid;

/// Entry point for recording and browsing file history
pub struct LocalHistoryManager {
    config: HistoryConfig,
    storage: Arc<StorageService>,
    cleanup: Arc<CleanupService>,
    observers: RwLock<Vec<Box<dyn HistoryObserver>>>,
    span: Span,
}

impl std::fmt::Debug for LocalHistoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHistoryManager")
            .field("config", &self.config)
            .field("storage", &self.storage)
            .field("cleanup", &self.cleanup)
            .field("observers", &format!("<{} observers>", self.observers.read().len()))
            .finish()
    }
}

impl LocalHistoryManager {
    /// Builder for a manager
    pub fn builder() -> LocalHistoryBuilder {
        LocalHistoryBuilder::new()
    }

    pub(crate) fn from_parts(
        config: HistoryConfig,
        store: Arc<dyn KeyValueStore>,
        storage_path: PathBuf,
        span: Span,
        observers: Vec<Box<dyn HistoryObserver>>,
    ) -> Result<Self> {
        let storage = span.in_scope(|| {
            StorageService::open(
                store,
                storage_path,
                StorageOptions {
                    compression: config.compression.clone(),
                },
            )
        })?;
        let storage = Arc::new(storage);
        let cleanup = Arc::new(CleanupService::new(storage.clone(), config.cleanup_policy()));

        Ok(Self {
            config,
            storage,
            cleanup,
            observers: RwLock::new(observers),
            span,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Underlying storage service
    pub fn storage(&self) -> &Arc<StorageService> {
        &self.storage
    }

    /// Underlying cleanup service
    pub fn cleanup_service(&self) -> &Arc<CleanupService> {
        &self.cleanup
    }

    /// Register an observer for change events
    pub fn add_observer(&self, observer: Box<dyn HistoryObserver>) {
        self.observers.write().push(observer);
    }

    fn notify(&self, event: HistoryEvent) {
        for observer in self.observers.read().iter() {
            match catch_unwind(AssertUnwindSafe(|| observer.on_change(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{}", HistoryError::Observer(format!("{:#}", e))),
                Err(_) => warn!("History observer panicked while handling {:?}", event_name(&event)),
            }
        }
    }

    /// Record `content` as the newest version of `uri`
    ///
    /// `diffInfo` is computed against the newest existing snapshot of the
    /// file. If that snapshot's body cannot be loaded the new snapshot is
    /// still saved, without `diffInfo`.
    #[instrument(parent = &self.span, skip(self, content), fields(size = content.len()))]
    pub fn create_snapshot(&self, uri: &str, content: &[u8], source: SnapshotSource) -> Result<Snapshot> {
        if content.len() as u64 > self.config.max_snapshot_bytes {
            return Err(HistoryError::validation(format!(
                "content of {} is {}, above the {} snapshot limit",
                uri,
                format_bytes(content.len() as u64),
                format_bytes(self.config.max_snapshot_bytes)
            )));
        }
        self.record(uri, content, source, false)
    }

    /// Record that `uri` was deleted on disk
    #[instrument(parent = &self.span, skip(self))]
    pub fn create_deletion_snapshot(&self, uri: &str) -> Result<Snapshot> {
        self.record(uri, b"", SnapshotSource::Filesystem, true)
    }

    fn record(&self, uri: &str, content: &[u8], source: SnapshotSource, deleted: bool) -> Result<Snapshot> {
        if uri.trim().is_empty() {
            return Err(HistoryError::validation("file uri must not be empty"));
        }

        let text = String::from_utf8_lossy(content);
        let encoding = if std::str::from_utf8(content).is_ok() { "utf8" } else { "binary" };
        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            file_uri: uri.to_string(),
            file_path: file_path_from_uri(uri).display().to_string(),
            timestamp: 0,
            source,
            content_hash: compute_hash(content),
            content_path: String::new(),
            metadata: SnapshotMetadata {
                size: content.len() as u64,
                line_count: line_count(&text),
                encoding: encoding.to_string(),
                deleted,
                compressed: false,
            },
            diff_info: None,
            accepted: false,
            accepted_timestamp: None,
            discarded: None,
        };

        // The newest snapshot is resolved under the storage lock so concurrent
        // creates on one file chain onto each other.
        let saved = self.storage.save_snapshot_with(snapshot, content, |index, snapshot| {
            let previous = index.latest_for_file(uri)?;
            let now = now_millis();
            snapshot.timestamp = previous.map_or(now, |prev| now.max(prev.timestamp));
            snapshot.diff_info = previous.and_then(|prev| self.diff_info_against(prev, &text));
            Ok(())
        })?;
        info!("Created snapshot {} of {} ({})", saved.short_id(), uri, source);
        self.notify(HistoryEvent::SnapshotCreated(saved.clone()));
        Ok(saved)
    }

    fn diff_info_against(&self, previous: &Snapshot, text: &str) -> Option<DiffInfo> {
        match self.storage.load_content(previous) {
            Ok(prev_body) => {
                let stats = compute_diff_stats(&String::from_utf8_lossy(&prev_body), text);
                Some(DiffInfo {
                    added_lines: stats.added_lines,
                    removed_lines: stats.removed_lines,
                    modified_lines: stats.modified_lines,
                    previous_snapshot_id: previous.id.clone(),
                })
            }
            Err(e) => {
                warn!("Skipping diff against previous snapshot {}: {}", previous.id, e);
                None
            }
        }
    }

    /// Whether `content` hashes the same as the newest snapshot of `uri`
    ///
    /// Lets a change tracker skip redundant snapshots; the manager itself
    /// never does.
    pub fn is_unchanged(&self, uri: &str, content: &[u8]) -> Result<bool> {
        let index = self.storage.load_index()?;
        Ok(index
            .latest_for_file(uri)?
            .is_some_and(|latest| latest.content_hash == compute_hash(content)))
    }

    /// Snapshot metadata by id
    pub fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        validate_snapshot_id(id)?;
        self.storage.get_snapshot_metadata(id)
    }

    fn require_snapshot(&self, id: &str) -> Result<Snapshot> {
        self.get_snapshot(id)?
            .ok_or_else(|| HistoryError::SnapshotNotFound(id.to_string()))
    }

    /// Snapshot body by id
    pub fn get_snapshot_content(&self, id: &str) -> Result<Vec<u8>> {
        validate_snapshot_id(id)?;
        self.storage.get_snapshot_content(id)
    }

    /// Change acceptance or discard state of a snapshot
    #[instrument(parent = &self.span, skip(self))]
    pub fn update_snapshot(&self, id: &str, update: SnapshotUpdate) -> Result<Snapshot> {
        validate_snapshot_id(id)?;
        let updated = self.storage.update_snapshot(id, update)?;
        self.notify(HistoryEvent::SnapshotUpdated(updated.clone()));
        Ok(updated)
    }

    /// Accept the snapshot if it is not accepted, otherwise unaccept it
    pub fn toggle_accept(&self, id: &str) -> Result<Snapshot> {
        let current = self.require_snapshot(id)?;
        let update = if current.accepted {
            SnapshotUpdate::Unaccept
        } else {
            SnapshotUpdate::Accept
        };
        self.update_snapshot(id, update)
    }

    /// Accept every selected snapshot
    pub fn accept(&self, selection: &SnapshotSelection) -> Result<BatchOutcome> {
        self.batch(BatchAction::Accept, selection, |id| {
            self.storage.update_snapshot(id, SnapshotUpdate::Accept).map(drop)
        })
    }

    /// Discard every selected snapshot
    pub fn discard(&self, selection: &SnapshotSelection) -> Result<BatchOutcome> {
        self.batch(BatchAction::Discard, selection, |id| {
            self.storage
                .update_snapshot(id, SnapshotUpdate::SetDiscarded(true))
                .map(drop)
        })
    }

    /// Delete every selected snapshot
    pub fn delete(&self, selection: &SnapshotSelection) -> Result<BatchOutcome> {
        self.batch(BatchAction::Delete, selection, |id| self.storage.delete_snapshot(id).map(drop))
    }

    /// Apply `op` to each id and send one summary event
    ///
    /// Malformed ids fail the whole batch before anything is touched; other
    /// failures are collected per id.
    #[instrument(parent = &self.span, skip(self, selection, op))]
    fn batch<F>(&self, action: BatchAction, selection: &SnapshotSelection, op: F) -> Result<BatchOutcome>
    where
        F: Fn(&str) -> Result<()>,
    {
        let ids = selection.ids()?;
        for id in &ids {
            validate_snapshot_id(id)?;
        }

        let mut outcome = BatchOutcome::default();
        for id in ids {
            match op(id) {
                Ok(()) => outcome.processed.push(id.to_string()),
                Err(e) => {
                    warn!("{:?} of {} failed: {}", action, id, e);
                    outcome.failed.push(BatchFailure {
                        id: id.to_string(),
                        reason: e.user_message(),
                    });
                }
            }
        }

        let summary = outcome.summary(action);
        info!("{}", summary);
        self.notify(HistoryEvent::BatchCompleted {
            action,
            processed: outcome.processed.len(),
            failed: outcome.failed.len(),
            summary,
        });
        Ok(outcome)
    }

    /// Snapshots of `uri` matching `filter`
    pub fn get_snapshots_for_file(
        &self,
        uri: &str,
        filter: &SnapshotFilter,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Snapshot>> {
        if let Some(cursor) = &filter.cursor_id {
            validate_snapshot_id(cursor)?;
        }
        self.storage.list_snapshots_for_file(uri, filter, cancel)
    }

    /// Files with live history, sorted
    pub fn get_tracked_files(&self) -> Result<Vec<String>> {
        self.storage.get_tracked_files()
    }

    /// Line diff from one snapshot to another
    pub fn diff_snapshots(&self, from_id: &str, to_id: &str) -> Result<DetailedDiff> {
        validate_snapshot_id(from_id)?;
        validate_snapshot_id(to_id)?;
        let old = self.storage.get_snapshot_content(from_id)?;
        let new = self.storage.get_snapshot_content(to_id)?;
        Ok(diff_contents(&old, &new))
    }

    /// Line diff from the snapshot preceding `id` in its file to `id`
    ///
    /// The first snapshot of a file is diffed against empty content.
    pub fn diff_with_previous(&self, id: &str) -> Result<DetailedDiff> {
        let snapshot = self.require_snapshot(id)?;
        let history = self.storage.list_snapshots_for_file(
            &snapshot.file_uri,
            &SnapshotFilter {
                order: SortOrder::Oldest,
                ..Default::default()
            },
            None,
        )?;

        let position = history.iter().position(|s| s.id == snapshot.id);
        let old = match position.and_then(|p| p.checked_sub(1)).map(|p| &history[p]) {
            Some(previous) => self.storage.load_content(previous)?,
            None => {
                debug!("Snapshot {} has no predecessor", snapshot.short_id());
                Vec::new()
            }
        };
        let new = self.storage.load_content(&snapshot)?;
        Ok(diff_contents(&old, &new))
    }

    /// Line diff from snapshot `id` to the current file content
    pub fn diff_with_current(&self, id: &str, files: &dyn FileAccess) -> Result<DetailedDiff> {
        let snapshot = self.require_snapshot(id)?;
        let old = self.storage.load_content(&snapshot)?;
        let current = files.read(&snapshot.file_uri)?;
        Ok(diff_contents(&old, &current))
    }

    /// Write the body of snapshot `id` back to its file
    ///
    /// Does not create a new snapshot; the host's change tracking records the
    /// write like any other edit.
    #[instrument(parent = &self.span, skip(self, files))]
    pub fn restore_snapshot(&self, id: &str, files: &dyn FileAccess) -> Result<Snapshot> {
        let snapshot = self.require_snapshot(id)?;
        if snapshot.metadata.deleted {
            return Err(HistoryError::validation(format!(
                "snapshot {} records a deletion and has no content to restore",
                id
            )));
        }

        let content = self.storage.load_content(&snapshot)?;
        files.write(&snapshot.file_uri, &content)?;
        info!("Restored {} from snapshot {}", snapshot.file_uri, snapshot.short_id());
        self.notify(HistoryEvent::SnapshotRestored(snapshot.clone()));
        Ok(snapshot)
    }

    /// Run both eviction passes now
    #[instrument(parent = &self.span, skip(self))]
    pub fn clear_snapshots(&self) -> CleanupReport {
        let report = self.cleanup.run_cleanup();
        if !report.skipped && report.total_deleted() > 0 {
            self.notify(HistoryEvent::CleanupCompleted {
                deleted: report.total_deleted(),
            });
        }
        report
    }

    /// Remove all history of `uri`
    pub fn delete_file_history(&self, uri: &str) -> Result<usize> {
        let deleted = self.storage.delete_snapshots_for_file(uri)?;
        self.notify(HistoryEvent::HistoryCleared {
            file_uri: Some(uri.to_string()),
            deleted,
        });
        Ok(deleted)
    }

    /// Remove all history of every file
    pub fn purge(&self) -> Result<usize> {
        let deleted = self.storage.clear_all()?;
        self.notify(HistoryEvent::HistoryCleared { file_uri: None, deleted });
        Ok(deleted)
    }

    /// Start background cleanup at the configured interval
    ///
    /// Must be called within a tokio runtime.
    pub fn start_periodic_cleanup(&self) -> Result<()> {
        self.cleanup.start_periodic_cleanup(self.config.cleanup_interval())
    }

    /// Stop background cleanup
    pub fn stop_periodic_cleanup(&self) {
        self.cleanup.stop_periodic_cleanup();
    }

    /// Check storage integrity, optionally re-hashing every blob
    pub fn verify(&self, deep: bool) -> Result<IntegrityReport> {
        let verifier = IndexVerifier::new(&self.storage);
        if deep {
            verifier.verify_deep()
        } else {
            verifier.verify()
        }
    }

    /// Storage statistics
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.stats()
    }
}

impl Drop for LocalHistoryManager {
    fn drop(&mut self) {
        self.cleanup.stop_periodic_cleanup();
    }
}

fn event_name(event: &HistoryEvent) -> &'static str {
    match event {
        HistoryEvent::SnapshotCreated(_) => "SnapshotCreated",
        HistoryEvent::SnapshotUpdated(_) => "SnapshotUpdated",
        HistoryEvent::BatchCompleted { .. } => "BatchCompleted",
        HistoryEvent::SnapshotRestored(_) => "SnapshotRestored",
        HistoryEvent::CleanupCompleted { .. } => "CleanupCompleted",
        HistoryEvent::HistoryCleared { .. } => "HistoryCleared",
    }
}
