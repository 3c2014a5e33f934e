//! Chaos testing for retrace
//!
//! Damages the blob store and the persisted index behind the manager's back
//! and hammers it from several threads, checking that failures stay typed
//! and contained.

use ::retrace::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use retrace::index::INDEX_KEY;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use tracing::{info, warn};

/// Manager over an inspectable in-memory store
pub struct HistoryChaosTest {
    pub history: Arc<LocalHistoryManager>,
    pub store: Arc<MemoryStore>,
    pub storage_dir: TempDir,
    pub rng: StdRng,
}

impl HistoryChaosTest {
    pub fn new() -> Self {
        let storage_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let history = LocalHistoryBuilder::new()
            .store(store.clone())
            .compression(CompressionStrategy::Fast)
            .build(storage_dir.path())
            .unwrap();

        Self {
            history: Arc::new(history),
            store,
            storage_dir,
            rng: StdRng::seed_from_u64(42),
        }
    }

    /// Create `count` snapshots spread over three files
    pub fn populate(&mut self, count: usize) -> Vec<Snapshot> {
        (0..count)
            .map(|i| {
                let uri = format!("file:///chaos/f{}.txt", i % 3);
                let body = format!("line {}\n{}", i, "data ".repeat(self.rng.random_range(1..50)));
                self.history
                    .create_snapshot(&uri, body.as_bytes(), SnapshotSource::Typing)
                    .unwrap()
            })
            .collect()
    }

    pub fn blob_path(&self, snapshot: &Snapshot) -> std::path::PathBuf {
        self.storage_dir.path().join(&snapshot.content_path)
    }

    /// Apply `f` to the raw persisted index
    pub fn tamper_index(&self, f: impl FnOnce(&mut serde_json::Value)) {
        let mut raw = self.store.get(INDEX_KEY).unwrap().unwrap();
        f(&mut raw);
        self.store.update(INDEX_KEY, raw).unwrap();
    }
}

impl Default for HistoryChaosTest {
    fn default() -> Self {
        Self::new()
    }
}

struct CountingObserver(Arc<AtomicUsize>);

impl HistoryObserver for CountingObserver {
    fn on_change(&self, _event: &HistoryEvent) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_missing_blob_is_contained() {
        let mut chaos = HistoryChaosTest::new();
        let snapshots = chaos.populate(6);
        let victim = &snapshots[3];
        fs::remove_file(chaos.blob_path(victim)).unwrap();

        let err = chaos.history.get_snapshot_content(&victim.id).unwrap_err();
        assert!(matches!(err, HistoryError::ContentLoad { .. }));
        assert!(err.is_corruption());
        assert!(err.user_message().contains(&victim.id));

        // Other snapshots are unaffected
        for snapshot in snapshots.iter().filter(|s| s.id != victim.id) {
            chaos.history.get_snapshot_content(&snapshot.id).unwrap();
        }

        let report = chaos.history.verify(false).unwrap();
        assert_eq!(report.missing_blobs, vec![victim.id.clone()]);
        assert!(!report.is_valid());

        // The victim is the newest of f0, so the next snapshot has no diff info
        let next = chaos
            .history
            .create_snapshot(&victim.file_uri, b"recovered", SnapshotSource::Save)
            .unwrap();
        assert!(next.diff_info.is_none());
        warn!("Recovered after losing blob {}", victim.content_path);
    }

    #[test]
    #[traced_test]
    fn test_corrupt_blob_detected_by_deep_verify() {
        let mut chaos = HistoryChaosTest::new();
        let snapshots = chaos.populate(4);
        let victim = &snapshots[1];
        fs::write(chaos.blob_path(victim), b"not a blob at all").unwrap();

        assert!(chaos.history.verify(false).unwrap().is_valid());
        let deep = chaos.history.verify(true).unwrap();
        assert_eq!(deep.corrupt_blobs, vec![victim.id.clone()]);

        let err = chaos.history.diff_with_previous(&victim.id).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    #[traced_test]
    fn test_orphan_index_entry_reported() {
        let mut chaos = HistoryChaosTest::new();
        let snapshots = chaos.populate(3);
        let orphan = uuid::Uuid::new_v4().to_string();
        let uri = snapshots[0].file_uri.clone();

        chaos.tamper_index(|raw| {
            raw["index"][uri.as_str()].as_array_mut().unwrap().push(orphan.clone().into());
        });

        let report = chaos.history.verify(false).unwrap();
        assert!(!report.index_errors.is_empty());
        assert!(report.index_errors.iter().any(|e| e.contains(&orphan)));

        let err = chaos
            .history
            .get_snapshots_for_file(&uri, &SnapshotFilter::default(), None)
            .unwrap_err();
        assert!(err.is_corruption());

        // Files without damage still list
        let other = &snapshots[1].file_uri;
        assert_eq!(
            chaos
                .history
                .get_snapshots_for_file(other, &SnapshotFilter::default(), None)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    #[traced_test]
    fn test_aggregate_drift_reported() {
        let mut chaos = HistoryChaosTest::new();
        chaos.populate(3);
        chaos.tamper_index(|raw| {
            raw["metadata"]["totalSize"] = serde_json::json!(1);
        });

        let report = chaos.history.verify(false).unwrap();
        assert!(!report.aggregates_valid);
        assert!(report.summary().contains("aggregate drift"));

        // The next mutation recomputes the totals
        chaos.populate(1);
        assert!(chaos.history.verify(false).unwrap().aggregates_valid);
    }

    #[test]
    #[traced_test]
    fn test_stray_blob_reported_and_purged() {
        let mut chaos = HistoryChaosTest::new();
        chaos.populate(2);
        let stray_dir = chaos.storage_dir.path().join("objects").join("ff");
        fs::create_dir_all(&stray_dir).unwrap();
        fs::write(stray_dir.join("f".repeat(62)), b"stray").unwrap();

        let report = chaos.history.verify(false).unwrap();
        assert_eq!(report.unreferenced_blobs.len(), 1);

        assert_eq!(chaos.history.purge().unwrap(), 2);
        let after = chaos.history.verify(false).unwrap();
        assert!(after.is_valid());
        assert_eq!(chaos.history.stats().unwrap().blob_count, 0);
    }

    #[test]
    #[traced_test]
    fn test_unreadable_index_blocks_open() {
        let storage_dir = TempDir::new().unwrap();
        fs::write(storage_dir.path().join("state.json"), b"{ this is not json").unwrap();
        assert!(LocalHistoryBuilder::new().build(storage_dir.path()).is_err());
    }

    #[test]
    #[traced_test]
    fn test_concurrent_writers() {
        let chaos = HistoryChaosTest::new();
        let events = Arc::new(AtomicUsize::new(0));
        chaos.history.add_observer(Box::new(CountingObserver(events.clone())));

        let threads = 6;
        let per_thread = 12;
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let history = Arc::clone(&chaos.history);
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t as u64);
                    for i in 0..per_thread {
                        let uri = format!("file:///shared/{}.rs", rng.random_range(0..4));
                        let body = format!("// thread {} edit {}\nfn f() {{}}", t, i);
                        let snapshot = history
                            .create_snapshot(&uri, body.as_bytes(), SnapshotSource::Typing)
                            .unwrap();
                        if i % 4 == 0 {
                            history.toggle_accept(&snapshot.id).unwrap();
                        }
                        if i % 5 == 0 {
                            let _ = history.clear_snapshots();
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = chaos.history.stats().unwrap();
        assert_eq!(stats.total_snapshots, threads * per_thread);
        assert!(chaos.history.verify(true).unwrap().is_valid());
        // Creates plus accepts, cleanup deleted nothing
        assert_eq!(events.load(Ordering::SeqCst), threads * per_thread + threads * 3);
        info!("{} snapshots after concurrent writes", stats.total_snapshots);
    }

    #[test]
    #[traced_test]
    fn test_concurrent_same_file_creates_chain() {
        let chaos = HistoryChaosTest::new();
        let uri = "file:///chaos/same.txt";
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let history = Arc::clone(&chaos.history);
                thread::spawn(move || {
                    for i in 0..25 {
                        let body = format!("thread {}\nedit {}", t, i);
                        history
                            .create_snapshot(uri, body.as_bytes(), SnapshotSource::Typing)
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshots = chaos.history.storage().load_index().unwrap().snapshots;
        assert_eq!(snapshots.len(), 200);
        assert!(snapshots[0].diff_info.is_none());
        for pair in snapshots.windows(2) {
            let info = pair[1].diff_info.as_ref().unwrap();
            assert_eq!(info.previous_snapshot_id, pair[0].id);
            assert!(pair[1].timestamp >= pair[0].timestamp);
        }

        let oldest_first: Vec<String> = chaos
            .history
            .get_snapshots_for_file(
                uri,
                &SnapshotFilter {
                    order: SortOrder::Oldest,
                    ..Default::default()
                },
                None,
            )
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        let inserted: Vec<String> = snapshots.into_iter().map(|s| s.id).collect();
        assert_eq!(oldest_first, inserted);
    }

    #[test]
    #[traced_test]
    fn test_concurrent_cleanup_single_flight() {
        let chaos = HistoryChaosTest::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let history = Arc::clone(&chaos.history);
                thread::spawn(move || history.clear_snapshots())
            })
            .collect();

        let reports: Vec<CleanupReport> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(reports.iter().all(CleanupReport::is_success));
        assert!(reports.iter().any(|r| !r.skipped));
        assert!(chaos.history.stats().unwrap().last_cleanup > 0);
    }
}
