//! Core data types used throughout retrace
//!
//! ## Overview
//!
//! - **Records**: [`Snapshot`], [`SnapshotMetadata`], [`DiffInfo`] as they are
//!   persisted in the storage index (camelCase JSON, optional fields omitted)
//! - **Commands**: [`SnapshotUpdate`], [`SnapshotSelection`] and the query
//!   parameters in [`SnapshotFilter`]
//! - **Results**: [`BatchOutcome`], [`DeletedSnapshot`]
//! - **Hooks**: [`HistoryObserver`] receives a [`HistoryEvent`] after every
//!   mutation
//!
//! ```rust
//! use retrace::types::{SnapshotFilter, SortOrder};
//!
//! let filter = SnapshotFilter {
//!     accepted: Some(true),
//!     limit: Some(10),
//!     order: SortOrder::Oldest,
//!     ..Default::default()
//! };
//! assert!(!filter.include_discarded);
//! ```

use crate::error::{HistoryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What triggered a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    /// Debounced typing in the editor
    Typing,
    /// Explicit save
    Save,
    /// Change observed on disk
    Filesystem,
    /// User-requested snapshot
    Manual,
}

impl fmt::Display for SnapshotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SnapshotSource::Typing => "typing",
            SnapshotSource::Save => "save",
            SnapshotSource::Filesystem => "filesystem",
            SnapshotSource::Manual => "manual",
        };
        f.write_str(name)
    }
}

impl FromStr for SnapshotSource {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "typing" => Ok(SnapshotSource::Typing),
            "save" => Ok(SnapshotSource::Save),
            "filesystem" => Ok(SnapshotSource::Filesystem),
            "manual" => Ok(SnapshotSource::Manual),
            other => Err(HistoryError::validation(format!(
                "unknown snapshot source '{}': expected typing, save, filesystem or manual",
                other
            ))),
        }
    }
}

fn default_encoding() -> String {
    "utf8".to_string()
}

/// Per-snapshot body metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// Logical (uncompressed) size in bytes
    pub size: u64,
    /// Number of lines as counted by [`crate::diff::line_count`]
    pub line_count: usize,
    /// Text encoding of the body
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// Marker for a file that was deleted on disk
    #[serde(default)]
    pub deleted: bool,
    /// Whether the stored blob is compressed
    #[serde(default)]
    pub compressed: bool,
}

/// Line statistics against the previous snapshot of the same file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffInfo {
    /// Lines only present in this snapshot
    pub added_lines: usize,
    /// Lines only present in the previous snapshot
    pub removed_lines: usize,
    /// Lines changed in place
    pub modified_lines: usize,
    /// The snapshot these numbers are relative to
    pub previous_snapshot_id: String,
}

/// One captured version of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// UUID v4
    pub id: String,
    /// Canonical identifier of the file (scheme + path)
    pub file_uri: String,
    /// Host path, informational only
    pub file_path: String,
    /// Capture time in epoch milliseconds
    pub timestamp: i64,
    /// What triggered the capture
    pub source: SnapshotSource,
    /// SHA-256 hex digest of the body
    pub content_hash: String,
    /// Blob location relative to the storage root
    #[serde(default)]
    pub content_path: String,
    /// Body metadata
    pub metadata: SnapshotMetadata,
    /// Changes relative to the previous snapshot of the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_info: Option<DiffInfo>,
    /// Marked as a known-good baseline
    #[serde(default)]
    pub accepted: bool,
    /// When the snapshot was accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_timestamp: Option<i64>,
    /// Hidden from default listings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discarded: Option<bool>,
}

impl Snapshot {
    /// First 8 characters of the id
    pub fn short_id(&self) -> &str {
        &self.id[..8.min(self.id.len())]
    }

    /// Whether the snapshot has been discarded
    pub fn is_discarded(&self) -> bool {
        self.discarded.unwrap_or(false)
    }

    /// Whether the snapshot marks a deleted file
    pub fn is_deletion_marker(&self) -> bool {
        self.metadata.deleted
    }

    /// Capture time formatted for display
    pub fn display_time(&self) -> String {
        chrono::DateTime::from_timestamp_millis(self.timestamp)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| self.timestamp.to_string())
    }
}

/// Partial update applied to a stored snapshot
///
/// Only the acceptance and discard state of a snapshot ever change after
/// creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotUpdate {
    /// Mark accepted, stamping `acceptedTimestamp`
    Accept,
    /// Clear acceptance and `acceptedTimestamp`
    Unaccept,
    /// Set or clear the discard flag
    SetDiscarded(bool),
}

impl SnapshotUpdate {
    /// Apply the update to `snapshot` at time `now` (epoch ms)
    pub fn apply(&self, snapshot: &mut Snapshot, now: i64) {
        match self {
            SnapshotUpdate::Accept => {
                snapshot.accepted = true;
                snapshot.accepted_timestamp = Some(now);
            }
            SnapshotUpdate::Unaccept => {
                snapshot.accepted = false;
                snapshot.accepted_timestamp = None;
            }
            SnapshotUpdate::SetDiscarded(discarded) => {
                snapshot.discarded = Some(*discarded);
            }
        }
    }
}

/// One or many snapshot ids, as passed to batch commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotSelection {
    /// A single id
    Single(String),
    /// Several ids
    Multiple(Vec<String>),
}

impl SnapshotSelection {
    /// Ids in the selection; an empty selection is a validation error
    pub fn ids(&self) -> Result<Vec<&str>> {
        let ids: Vec<&str> = match self {
            SnapshotSelection::Single(id) => vec![id.as_str()],
            SnapshotSelection::Multiple(ids) => ids.iter().map(String::as_str).collect(),
        };
        if ids.is_empty() {
            return Err(HistoryError::validation("no snapshot ids provided"));
        }
        Ok(ids)
    }
}

impl From<String> for SnapshotSelection {
    fn from(id: String) -> Self {
        SnapshotSelection::Single(id)
    }
}

impl From<Vec<String>> for SnapshotSelection {
    fn from(ids: Vec<String>) -> Self {
        SnapshotSelection::Multiple(ids)
    }
}

/// Order of query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Most recent first
    #[default]
    Newest,
    /// Oldest first
    Oldest,
}

/// Query parameters for listing the snapshots of a file
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    /// Only snapshots with this acceptance state
    pub accepted: Option<bool>,
    /// Inclusive lower bound on timestamp
    pub from: Option<i64>,
    /// Inclusive upper bound on timestamp
    pub to: Option<i64>,
    /// Leave out discarded snapshots
    pub exclude_discarded: bool,
    /// Resume strictly after this id in the sorted sequence
    pub cursor_id: Option<String>,
    /// Maximum number of results
    pub limit: Option<usize>,
    /// Result order
    pub order: SortOrder,
}

impl SnapshotFilter {
    /// Whether `snapshot` passes the non-positional criteria
    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        if let Some(accepted) = self.accepted {
            if snapshot.accepted != accepted {
                return false;
            }
        }
        if self.from.is_some_and(|from| snapshot.timestamp < from) {
            return false;
        }
        if self.to.is_some_and(|to| snapshot.timestamp > to) {
            return false;
        }
        !(self.exclude_discarded && snapshot.is_discarded())
    }
}

/// Result of a snapshot deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedSnapshot {
    /// Id of the deleted snapshot
    pub id: String,
    /// Logical size that no longer counts toward the total
    pub size: u64,
    /// Whether the blob was physically removed
    pub blob_removed: bool,
}

/// A failed item in a batch command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    /// The id that failed
    pub id: String,
    /// User-facing reason
    pub reason: String,
}

/// Result of a batch command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Ids that were processed
    pub processed: Vec<String>,
    /// Ids that failed, with reasons
    pub failed: Vec<BatchFailure>,
}

impl BatchOutcome {
    /// Whether every id was processed
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// One-line summary for a notification
    pub fn summary(&self, action: BatchAction) -> String {
        if self.failed.is_empty() {
            format!("{} {} snapshot(s)", action.past_tense(), self.processed.len())
        } else {
            format!(
                "{} {} snapshot(s), {} failed",
                action.past_tense(),
                self.processed.len(),
                self.failed.len()
            )
        }
    }
}

/// Kind of batch command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAction {
    /// Accept snapshots
    Accept,
    /// Discard snapshots
    Discard,
    /// Delete snapshots
    Delete,
}

impl BatchAction {
    fn past_tense(&self) -> &'static str {
        match self {
            BatchAction::Accept => "Accepted",
            BatchAction::Discard => "Discarded",
            BatchAction::Delete => "Deleted",
        }
    }
}

/// Change notification sent to observers
#[derive(Debug, Clone)]
pub enum HistoryEvent {
    /// A snapshot was recorded
    SnapshotCreated(Snapshot),
    /// A snapshot's acceptance or discard state changed
    SnapshotUpdated(Snapshot),
    /// A batch command finished
    BatchCompleted {
        /// The command
        action: BatchAction,
        /// Number of ids processed
        processed: usize,
        /// Number of ids that failed
        failed: usize,
        /// Notification text
        summary: String,
    },
    /// A snapshot body was written back to its file
    SnapshotRestored(Snapshot),
    /// An eviction run removed snapshots
    CleanupCompleted {
        /// Number of snapshots evicted across passes
        deleted: usize,
    },
    /// All history of one file, or of every file, was removed
    HistoryCleared {
        /// The file, or `None` for everything
        file_uri: Option<String>,
        /// Number of snapshots removed
        deleted: usize,
    },
}

/// Observer of history changes
///
/// Observers are called after the mutation has been persisted. A failing or
/// panicking observer is logged and never affects the operation.
///
/// ```rust
/// use retrace::types::{HistoryEvent, HistoryObserver};
///
/// struct Refresh;
///
/// impl HistoryObserver for Refresh {
///     fn on_change(&self, event: &HistoryEvent) -> anyhow::Result<()> {
///         if let HistoryEvent::SnapshotCreated(snapshot) = event {
///             println!("new snapshot {}", snapshot.short_id());
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait HistoryObserver: Send + Sync {
    /// Called after every mutation
    fn on_change(&self, event: &HistoryEvent) -> anyhow::Result<()>;
}
