//! Storage integrity checking
//!
//! Verification compares the persisted index with itself and with the blob
//! store:
//!
//! 1. **Index level**: duplicate ids, index ids without a snapshot, ids filed
//!    under the wrong file, snapshots missing from the index
//! 2. **Aggregate level**: `totalSnapshots` and `totalSize` against the
//!    snapshot list
//! 3. **Blob level**: snapshots whose blob is missing, blobs no snapshot
//!    references and, in deep mode, blobs whose content no longer matches its
//!    hash
//!
//! Problems are collected into an [`IntegrityReport`]; only failures to read
//! the storage at all are returned as errors.
//!
//! ```rust,no_run
//! # use retrace::storage::StorageService;
//! # fn example(storage: &StorageService) -> retrace::Result<()> {
//! let report = storage.verify()?;
//! if !report.is_valid() {
//!     println!("{}", report.summary());
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use crate::storage::StorageService;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Verifier over a [`StorageService`]
#[derive(Debug)]
pub struct IndexVerifier<'a> {
    storage: &'a StorageService,
}

impl<'a> IndexVerifier<'a> {
    /// Create a verifier for `storage`
    pub fn new(storage: &'a StorageService) -> Self {
        Self { storage }
    }

    /// Structural check without reading blob contents
    pub fn verify(&self) -> Result<IntegrityReport> {
        self.run(false)
    }

    /// Structural check plus decoding and re-hashing every blob
    pub fn verify_deep(&self) -> Result<IntegrityReport> {
        self.run(true)
    }

    fn run(&self, deep: bool) -> Result<IntegrityReport> {
        let start = Instant::now();
        let index = self.storage.load_index()?;
        let content = self.storage.content_store();
        let mut report = IntegrityReport::default();

        report.index_errors = index.consistency_errors();
        report.unindexed_snapshots = index.unindexed_snapshots().iter().map(|s| s.id.clone()).collect();
        report.aggregates_valid = index.aggregates_consistent();
        if !report.aggregates_valid {
            warn!(
                "Aggregates drifted: recorded {} snapshots / {} bytes, actual {} / {}",
                index.metadata.total_snapshots,
                index.metadata.total_size,
                index.snapshots.len(),
                index.computed_total_size()
            );
        }

        let mut referenced = HashSet::new();
        for snapshot in &index.snapshots {
            report.snapshots_checked += 1;
            referenced.insert(snapshot.content_path.as_str());

            if !content.exists(&snapshot.content_path) {
                report.missing_blobs.push(snapshot.id.clone());
                continue;
            }
            if deep {
                if let Err(e) = self.storage.load_content(snapshot) {
                    debug!("Snapshot {} failed deep check: {}", snapshot.id, e);
                    report.corrupt_blobs.push(snapshot.id.clone());
                }
            }
        }

        report.unreferenced_blobs = content
            .list_blobs()?
            .into_iter()
            .filter(|path| !referenced.contains(path.as_str()))
            .collect();

        report.verification_time_ms = start.elapsed().as_millis() as u64;
        info!("Verification finished: {}", report.summary());
        Ok(report)
    }
}

/// Result of an integrity check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Duplicate, orphaned or misfiled index entries
    pub index_errors: Vec<String>,
    /// Snapshot ids absent from the index of their file
    pub unindexed_snapshots: Vec<String>,
    /// Whether the stored aggregates match the snapshot list
    pub aggregates_valid: bool,
    /// Snapshot ids whose blob is missing
    pub missing_blobs: Vec<String>,
    /// Snapshot ids whose blob fails to decode or hash (deep mode only)
    pub corrupt_blobs: Vec<String>,
    /// Blob paths no snapshot references
    pub unreferenced_blobs: Vec<String>,
    /// Number of snapshot records examined
    pub snapshots_checked: usize,
    /// Time taken in milliseconds
    pub verification_time_ms: u64,
}

impl Default for IntegrityReport {
    fn default() -> Self {
        Self {
            index_errors: Vec::new(),
            unindexed_snapshots: Vec::new(),
            aggregates_valid: true,
            missing_blobs: Vec::new(),
            corrupt_blobs: Vec::new(),
            unreferenced_blobs: Vec::new(),
            snapshots_checked: 0,
            verification_time_ms: 0,
        }
    }
}

impl IntegrityReport {
    /// Whether no problem of any kind was found
    pub fn is_valid(&self) -> bool {
        self.index_errors.is_empty()
            && self.unindexed_snapshots.is_empty()
            && self.aggregates_valid
            && self.missing_blobs.is_empty()
            && self.corrupt_blobs.is_empty()
            && self.unreferenced_blobs.is_empty()
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        if self.is_valid() {
            return format!(
                "{} snapshots verified in {}ms, no issues",
                self.snapshots_checked, self.verification_time_ms
            );
        }

        let issues = [
            (!self.index_errors.is_empty()).then(|| format!("{} index errors", self.index_errors.len())),
            (!self.unindexed_snapshots.is_empty())
                .then(|| format!("{} unindexed snapshots", self.unindexed_snapshots.len())),
            (!self.aggregates_valid).then(|| "aggregate drift".to_string()),
            (!self.missing_blobs.is_empty()).then(|| format!("{} missing blobs", self.missing_blobs.len())),
            (!self.corrupt_blobs.is_empty()).then(|| format!("{} corrupt blobs", self.corrupt_blobs.len())),
            (!self.unreferenced_blobs.is_empty())
                .then(|| format!("{} unreferenced blobs", self.unreferenced_blobs.len())),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ");

        format!("{} snapshots checked: {}", self.snapshots_checked, issues)
    }
}
