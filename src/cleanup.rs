//! Snapshot eviction
//!
//! Two passes reclaim space:
//!
//! - **TTL**: snapshots older than `ttl_days` are removed
//! - **Size**: while the aggregate size exceeds the budget, the oldest
//!   snapshots across all files are removed
//!
//! Both passes respect the same protection rule. An accepted snapshot is kept
//! when it is the only remaining snapshot of its file at the moment it would
//! be deleted, so a file never loses its last known-good baseline to cleanup.
//!
//! Planning is pure ([`plan_ttl_eviction`], [`plan_size_eviction`]) and runs
//! inside [`StorageService::evict`], under the storage write lock, so a
//! snapshot saved while a pass is running is never part of that pass's plan.
//!
//! Runs are exclusive: a request that arrives while another run is in flight
//! returns [`CleanupReport::skipped`] without touching storage.

use crate::error::{CleanupPassKind, HistoryError, Result};
use crate::index::StorageIndex;
use crate::storage::StorageService;
use crate::types::{DeletedSnapshot, Snapshot};
use crate::utils::{format_bytes, now_millis, DAY_MS};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Limits applied by [`CleanupService::run_cleanup`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupPolicy {
    /// Maximum snapshot age in days
    pub ttl_days: u32,
    /// Budget for the aggregate logical size
    pub max_storage_bytes: u64,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            ttl_days: 30,
            max_storage_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Snapshots chosen for eviction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    /// Ids to delete, in deletion order
    pub evict: Vec<String>,
    /// Ids kept by the protection rule
    pub protected: Vec<String>,
}

/// Result of one eviction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupOutcome {
    /// Number of snapshots removed
    pub deleted: usize,
    /// Logical bytes no longer counted toward the total
    pub bytes_reclaimed: u64,
    /// Number of snapshots kept by the protection rule
    pub protected: usize,
}

impl CleanupOutcome {
    fn from_deleted(deleted: &[DeletedSnapshot], protected: usize) -> Self {
        Self {
            deleted: deleted.len(),
            bytes_reclaimed: deleted.iter().map(|d| d.size).sum(),
            protected,
        }
    }
}

/// Result of a full cleanup run
///
/// Each pass reports independently; one failing never stops the other.
#[derive(Debug)]
pub struct CleanupReport {
    /// Age pass result
    pub ttl: Result<CleanupOutcome>,
    /// Size pass result
    pub size: Result<CleanupOutcome>,
    /// The run did not happen because another was in flight
    pub skipped: bool,
}

impl CleanupReport {
    /// Report for a run that yielded to one already in flight
    pub fn skipped() -> Self {
        Self {
            ttl: Ok(CleanupOutcome::default()),
            size: Ok(CleanupOutcome::default()),
            skipped: true,
        }
    }

    /// Whether both passes succeeded
    pub fn is_success(&self) -> bool {
        self.ttl.is_ok() && self.size.is_ok()
    }

    /// Snapshots removed across both passes
    pub fn total_deleted(&self) -> usize {
        [&self.ttl, &self.size]
            .into_iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|o| o.deleted)
            .sum()
    }

    /// Bytes reclaimed across both passes
    pub fn total_reclaimed(&self) -> u64 {
        [&self.ttl, &self.size]
            .into_iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|o| o.bytes_reclaimed)
            .sum()
    }

    /// Failures of the individual passes
    pub fn failures(&self) -> Vec<&HistoryError> {
        [&self.ttl, &self.size]
            .into_iter()
            .filter_map(|r| r.as_ref().err())
            .collect()
    }
}

/// Content snapshots left per file; deletion markers do not count as history
fn remaining_per_file(index: &StorageIndex) -> HashMap<&str, usize> {
    let mut remaining = HashMap::new();
    for snapshot in index.snapshots.iter().filter(|s| !s.metadata.deleted) {
        *remaining.entry(snapshot.file_uri.as_str()).or_insert(0) += 1;
    }
    remaining
}

/// Whether removing `snapshot` would drop the last accepted content of its file
fn is_protected(snapshot: &Snapshot, remaining: &HashMap<&str, usize>) -> bool {
    snapshot.accepted
        && !snapshot.metadata.deleted
        && remaining.get(snapshot.file_uri.as_str()).copied().unwrap_or(0) <= 1
}

fn release(snapshot: &Snapshot, remaining: &mut HashMap<&str, usize>) {
    if snapshot.metadata.deleted {
        return;
    }
    if let Some(left) = remaining.get_mut(snapshot.file_uri.as_str()) {
        *left = left.saturating_sub(1);
    }
}

/// Snapshots in `index` sorted oldest first, ties in creation order
fn oldest_first(index: &StorageIndex) -> Vec<&Snapshot> {
    let mut snapshots: Vec<&Snapshot> = index.snapshots.iter().collect();
    snapshots.sort_by_key(|s| s.timestamp);
    snapshots
}

/// Plan removal of every snapshot with `timestamp < cutoff`
///
/// Accepted snapshots are considered after the others that expire, so an
/// accepted baseline outlives expired snapshots of the same file and is
/// protected once it is the last one left.
pub fn plan_ttl_eviction(index: &StorageIndex, cutoff: i64) -> EvictionPlan {
    let mut remaining = remaining_per_file(index);
    let expired: Vec<&Snapshot> = oldest_first(index)
        .into_iter()
        .filter(|s| s.timestamp < cutoff)
        .collect();
    let (accepted, others): (Vec<&Snapshot>, Vec<&Snapshot>) = expired.into_iter().partition(|s| s.accepted);

    let mut plan = EvictionPlan::default();
    let mut chosen = Vec::new();
    for snapshot in others.into_iter().chain(accepted) {
        if is_protected(snapshot, &remaining) {
            plan.protected.push(snapshot.id.clone());
            continue;
        }
        release(snapshot, &mut remaining);
        chosen.push(snapshot);
    }

    chosen.sort_by_key(|s| s.timestamp);
    plan.evict = chosen.into_iter().map(|s| s.id.clone()).collect();
    plan
}

/// Plan removal of the oldest snapshots until the total is within `max_bytes`
///
/// Deletion markers carry no size and are never chosen.
pub fn plan_size_eviction(index: &StorageIndex, max_bytes: u64) -> EvictionPlan {
    let mut plan = EvictionPlan::default();
    let mut total = index.computed_total_size();
    if total <= max_bytes {
        return plan;
    }

    let mut remaining = remaining_per_file(index);
    for snapshot in oldest_first(index) {
        if total <= max_bytes {
            break;
        }
        if snapshot.metadata.deleted {
            continue;
        }
        if is_protected(snapshot, &remaining) {
            plan.protected.push(snapshot.id.clone());
            continue;
        }
        release(snapshot, &mut remaining);
        total = total.saturating_sub(snapshot.metadata.size);
        plan.evict.push(snapshot.id.clone());
    }
    plan
}

/// Runs eviction passes against a [`StorageService`]
pub struct CleanupService {
    storage: Arc<StorageService>,
    policy: CleanupPolicy,
    gate: Mutex<()>,
    periodic: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CleanupService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupService")
            .field("policy", &self.policy)
            .field("running", &self.is_running())
            .finish()
    }
}

impl CleanupService {
    /// Create a cleanup service for `storage`
    pub fn new(storage: Arc<StorageService>, policy: CleanupPolicy) -> Self {
        Self {
            storage,
            policy,
            gate: Mutex::new(()),
            periodic: Mutex::new(None),
        }
    }

    /// Limits used by [`CleanupService::run_cleanup`]
    pub fn policy(&self) -> CleanupPolicy {
        self.policy
    }

    /// Remove snapshots older than `ttl_days`
    pub fn cleanup_by_ttl(&self, ttl_days: u32) -> Result<CleanupOutcome> {
        let cutoff = now_millis() - i64::from(ttl_days) * DAY_MS;
        let mut protected = 0;
        let deleted = self.storage.evict(|index| {
            let plan = plan_ttl_eviction(index, cutoff);
            protected = plan.protected.len();
            plan.evict
        })?;

        let outcome = CleanupOutcome::from_deleted(&deleted, protected);
        debug!(
            "TTL pass removed {} snapshots ({} protected)",
            outcome.deleted, outcome.protected
        );
        Ok(outcome)
    }

    /// Remove the oldest snapshots until the total fits `max_bytes`
    pub fn cleanup_by_size(&self, max_bytes: u64) -> Result<CleanupOutcome> {
        let mut protected = 0;
        let deleted = self.storage.evict(|index| {
            let plan = plan_size_eviction(index, max_bytes);
            protected = plan.protected.len();
            plan.evict
        })?;

        let outcome = CleanupOutcome::from_deleted(&deleted, protected);
        debug!(
            "Size pass removed {} snapshots, reclaimed {}",
            outcome.deleted,
            format_bytes(outcome.bytes_reclaimed)
        );
        Ok(outcome)
    }

    /// Run both passes with the configured policy
    pub fn run_cleanup(&self) -> CleanupReport {
        let Some(_guard) = self.gate.try_lock() else {
            info!("Cleanup already in progress, skipping");
            return CleanupReport::skipped();
        };

        let ttl = self
            .cleanup_by_ttl(self.policy.ttl_days)
            .map_err(|e| HistoryError::cleanup_pass(CleanupPassKind::Ttl, e));
        if let Err(e) = &ttl {
            warn!("{}", e);
        }

        let size = self
            .cleanup_by_size(self.policy.max_storage_bytes)
            .map_err(|e| HistoryError::cleanup_pass(CleanupPassKind::Size, e));
        if let Err(e) = &size {
            warn!("{}", e);
        }

        if ttl.is_ok() || size.is_ok() {
            if let Err(e) = self.storage.record_cleanup(now_millis()) {
                warn!("Failed to record cleanup time: {}", e);
            }
        }

        let report = CleanupReport {
            ttl,
            size,
            skipped: false,
        };
        info!(
            "Cleanup removed {} snapshots, reclaimed {}",
            report.total_deleted(),
            format_bytes(report.total_reclaimed())
        );
        report
    }

    /// Run cleanup every `interval` on the current tokio runtime
    ///
    /// Replaces a previously started task. The first run happens one
    /// interval after the call.
    pub fn start_periodic_cleanup(self: &Arc<Self>, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(HistoryError::validation("cleanup interval must be positive"));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| HistoryError::internal("periodic cleanup needs a tokio runtime"))?;

        let service: Weak<Self> = Arc::downgrade(self);
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(service) = service.upgrade() else {
                    break;
                };
                match tokio::task::spawn_blocking(move || service.run_cleanup()).await {
                    Ok(report) if report.skipped => debug!("Periodic cleanup skipped"),
                    Ok(report) => debug!("Periodic cleanup removed {} snapshots", report.total_deleted()),
                    Err(e) => warn!("Periodic cleanup task failed: {}", e),
                }
            }
        });

        if let Some(previous) = self.periodic.lock().replace(task) {
            previous.abort();
            debug!("Replaced periodic cleanup task");
        }
        info!("Periodic cleanup every {}", humantime::format_duration(interval));
        Ok(())
    }

    /// Stop the periodic task; does nothing when none is running
    pub fn stop_periodic_cleanup(&self) {
        if let Some(task) = self.periodic.lock().take() {
            task.abort();
            info!("Stopped periodic cleanup");
        }
    }

    /// Whether a periodic task is active
    pub fn is_running(&self) -> bool {
        self.periodic.lock().as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for CleanupService {
    fn drop(&mut self) {
        if let Some(task) = self.periodic.get_mut().take() {
            task.abort();
        }
    }
}
