//! Integration tests for retrace
//!
//! Drives a manager through realistic editing sessions: many edits per
//! file, acceptance, eviction, restores and reopening the same storage.

use ::retrace::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use retrace::hash::compute_hash;
use retrace::host::uri_from_path;
use retrace::utils::DAY_MS;
use std::collections::HashMap;
use std::fs;
use tempfile::TempDir;
use tracing::info;

/// Test harness for editing sessions
pub struct HistoryTestHarness {
    pub work_dir: TempDir,
    pub storage_dir: TempDir,
    pub history: LocalHistoryManager,
    pub editor: EditSimulator,
    pub operation_log: Vec<TestOperation>,
    /// Body recorded for every snapshot id
    pub recorded: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
pub enum TestOperation {
    Snapshot { id: String, file: String },
    Accept { id: String },
    Restore { id: String },
    Cleanup { deleted: usize },
}

impl HistoryTestHarness {
    /// Harness with default settings
    pub fn new() -> Self {
        Self::with_builder(LocalHistoryBuilder::new())
    }

    /// Harness using `builder` for the manager
    pub fn with_builder(builder: LocalHistoryBuilder) -> Self {
        let work_dir = TempDir::new().unwrap();
        let storage_dir = TempDir::new().unwrap();
        let history = builder.build(storage_dir.path()).unwrap();

        Self {
            work_dir,
            storage_dir,
            history,
            editor: EditSimulator::new(42),
            operation_log: Vec::new(),
            recorded: HashMap::new(),
        }
    }

    /// URI of a file in the work directory
    pub fn uri(&self, name: &str) -> String {
        uri_from_path(&self.work_dir.path().join(name))
    }

    /// Write `content` to `name` and snapshot it
    pub fn write_and_snapshot(&mut self, name: &str, content: &[u8], source: SnapshotSource) -> Snapshot {
        let uri = self.uri(name);
        fs::write(self.work_dir.path().join(name), content).unwrap();
        let snapshot = self.history.create_snapshot(&uri, content, source).unwrap();

        self.recorded.insert(snapshot.id.clone(), content.to_vec());
        self.operation_log.push(TestOperation::Snapshot {
            id: snapshot.id.clone(),
            file: name.to_string(),
        });
        snapshot
    }

    /// Apply a random edit to `name` and snapshot the result
    pub fn edit(&mut self, name: &str) -> Snapshot {
        let path = self.work_dir.path().join(name);
        let current = fs::read_to_string(&path).unwrap_or_default();
        let next = self.editor.edit(&current);
        self.write_and_snapshot(name, next.as_bytes(), SnapshotSource::Typing)
    }

    /// Store a snapshot with a timestamp `age_days` in the past
    pub fn insert_aged(&mut self, name: &str, content: &[u8], age_days: i64, accepted: bool) -> Snapshot {
        let timestamp = retrace::utils::now_millis() - age_days * DAY_MS;
        let snapshot = Snapshot {
            id: uuid::Uuid::new_v4().to_string(),
            file_uri: self.uri(name),
            file_path: self.work_dir.path().join(name).display().to_string(),
            timestamp,
            source: SnapshotSource::Save,
            content_hash: compute_hash(content),
            content_path: String::new(),
            metadata: SnapshotMetadata {
                size: content.len() as u64,
                line_count: 1,
                encoding: "utf8".to_string(),
                deleted: false,
                compressed: false,
            },
            diff_info: None,
            accepted,
            accepted_timestamp: accepted.then_some(timestamp),
            discarded: None,
        };
        let saved = self.history.storage().save_snapshot(snapshot, content).unwrap();
        self.recorded.insert(saved.id.clone(), content.to_vec());
        saved
    }

    /// Close the manager and open the same storage again
    pub fn reopen(&mut self) {
        self.history = LocalHistoryBuilder::new().build(self.storage_dir.path()).unwrap();
    }

    /// Check every recorded snapshot still loads with its original body
    pub fn verify_recorded(&self) -> RecordedVerification {
        let mut result = RecordedVerification::default();
        for (id, expected) in &self.recorded {
            match self.history.get_snapshot_content(id) {
                Ok(body) if &body == expected => result.intact += 1,
                Ok(_) => result.mismatched.push(id.clone()),
                Err(e) if e.is_not_found() => result.evicted += 1,
                Err(_) => result.mismatched.push(id.clone()),
            }
        }
        result
    }
}

impl Default for HistoryTestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct RecordedVerification {
    pub intact: usize,
    pub evicted: usize,
    pub mismatched: Vec<String>,
}

/// Generates plausible line edits
pub struct EditSimulator {
    rng: StdRng,
}

impl EditSimulator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Insert, replace or delete one line of `text`
    pub fn edit(&mut self, text: &str) -> String {
        let mut lines: Vec<String> = if text.is_empty() {
            Vec::new()
        } else {
            text.split('\n').map(str::to_string).collect()
        };

        let word = format!("let v{} = {};", self.rng.random_range(0..1000), self.rng.random_range(0..100));
        match (lines.len(), self.rng.random_range(0..3)) {
            (0, _) | (_, 0) => {
                let at = self.rng.random_range(0..=lines.len());
                lines.insert(at, word);
            }
            (n, 1) => {
                let at = self.rng.random_range(0..n);
                lines[at] = word;
            }
            (1, _) => lines.push(word),
            (n, _) => {
                let at = self.rng.random_range(0..n);
                lines.remove(at);
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_editing_session_chains_snapshots() {
        let mut harness = HistoryTestHarness::new();
        harness.write_and_snapshot("main.rs", b"fn main() {}", SnapshotSource::Save);

        for _ in 0..15 {
            harness.edit("main.rs");
        }

        let uri = harness.uri("main.rs");
        let history = harness
            .history
            .get_snapshots_for_file(
                &uri,
                &SnapshotFilter {
                    order: SortOrder::Oldest,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        assert_eq!(history.len(), 16);
        assert!(history[0].diff_info.is_none());

        for pair in history.windows(2) {
            let info = pair[1].diff_info.as_ref().unwrap();
            assert_eq!(info.previous_snapshot_id, pair[0].id);

            let diff = harness.history.diff_with_previous(&pair[1].id).unwrap();
            assert_eq!(diff.stats.added_lines, info.added_lines);
            assert_eq!(diff.stats.removed_lines, info.removed_lines);
            assert_eq!(diff.stats.modified_lines, info.modified_lines);
        }

        let newest: Vec<String> = harness
            .history
            .get_snapshots_for_file(&uri, &SnapshotFilter::default(), None)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        let mut oldest: Vec<String> = history.iter().map(|s| s.id.clone()).collect();
        oldest.reverse();
        assert_eq!(newest, oldest);

        info!("Session produced {} operations", harness.operation_log.len());
    }

    #[test]
    #[traced_test]
    fn test_random_restores() {
        let mut harness = HistoryTestHarness::new();
        let mut ids = vec![harness.write_and_snapshot("lib.rs", b"pub mod a;", SnapshotSource::Save).id];
        for _ in 0..10 {
            ids.push(harness.edit("lib.rs").id);
        }

        let mut rng = StdRng::seed_from_u64(123);
        let path = harness.work_dir.path().join("lib.rs");
        for _ in 0..10 {
            let id = ids[rng.random_range(0..ids.len())].clone();
            harness.history.restore_snapshot(&id, &LocalFileAccess).unwrap();
            harness.operation_log.push(TestOperation::Restore { id: id.clone() });

            assert_eq!(&fs::read(&path).unwrap(), &harness.recorded[&id]);
            assert!(!harness
                .history
                .diff_with_current(&id, &LocalFileAccess)
                .unwrap()
                .has_changes());
        }

        // Restores never add snapshots
        assert_eq!(harness.history.stats().unwrap().total_snapshots, 11);
    }

    #[test]
    #[traced_test]
    fn test_history_survives_reopen() {
        let mut harness = HistoryTestHarness::new();
        let first = harness.write_and_snapshot("a.txt", b"one\ntwo", SnapshotSource::Save);
        harness.write_and_snapshot("b.txt", b"three", SnapshotSource::Save);
        harness.history.toggle_accept(&first.id).unwrap();
        harness.operation_log.push(TestOperation::Accept { id: first.id.clone() });
        let before = harness.history.stats().unwrap();

        harness.reopen();

        let reloaded = harness.history.get_snapshot(&first.id).unwrap().unwrap();
        assert!(reloaded.accepted);
        assert_eq!(harness.history.stats().unwrap(), before);
        assert_eq!(harness.history.get_tracked_files().unwrap().len(), 2);

        let state: serde_json::Value =
            serde_json::from_slice(&fs::read(harness.storage_dir.path().join("state.json")).unwrap()).unwrap();
        assert_eq!(
            state["retrace.storageIndex"]["version"].as_str(),
            Some(CURRENT_SCHEMA_VERSION)
        );

        let verification = harness.verify_recorded();
        assert_eq!(verification.intact, 2);
        assert!(verification.mismatched.is_empty());
    }

    #[test]
    #[traced_test]
    fn test_ttl_cleanup_keeps_lone_accepted_baseline() {
        let mut harness = HistoryTestHarness::new();

        let baseline = harness.insert_aged("a.rs", b"baseline", 40, true);
        let stale = harness.insert_aged("a.rs", b"stale", 35, false);
        let superseded = harness.insert_aged("b.rs", b"old accepted", 40, true);
        let fresh_b = harness.write_and_snapshot("b.rs", b"fresh", SnapshotSource::Save);
        let fresh_c = harness.write_and_snapshot("c.rs", b"untouched", SnapshotSource::Save);

        let report = harness.history.clear_snapshots();
        assert!(report.is_success());
        let ttl = report.ttl.as_ref().unwrap();
        assert_eq!(ttl.deleted, 2);
        assert_eq!(ttl.protected, 1);
        harness.operation_log.push(TestOperation::Cleanup {
            deleted: report.total_deleted(),
        });

        assert!(harness.history.get_snapshot(&baseline.id).unwrap().is_some());
        assert!(harness.history.get_snapshot(&stale.id).unwrap().is_none());
        assert!(harness.history.get_snapshot(&superseded.id).unwrap().is_none());
        assert!(harness.history.get_snapshot(&fresh_b.id).unwrap().is_some());
        assert!(harness.history.get_snapshot(&fresh_c.id).unwrap().is_some());

        let stats = harness.history.stats().unwrap();
        assert!(stats.last_cleanup > 0);
        assert!(harness.history.verify(true).unwrap().is_valid());
    }

    #[test]
    #[traced_test]
    fn test_size_cleanup_fits_budget() {
        let mut harness = HistoryTestHarness::with_builder(LocalHistoryBuilder::new().max_storage_bytes(2_000));
        for i in 0..20 {
            let body = format!("{}{}", "x".repeat(200), i);
            harness.write_and_snapshot(&format!("f{}.txt", i % 3), body.as_bytes(), SnapshotSource::Save);
        }

        let report = harness.history.clear_snapshots();
        let size = report.size.as_ref().unwrap();
        assert!(size.deleted > 0);

        let stats = harness.history.stats().unwrap();
        assert!(stats.total_size <= 2_000);
        assert_eq!(stats.total_snapshots, 20 - size.deleted);

        let verification = harness.verify_recorded();
        assert_eq!(verification.evicted, size.deleted);
        assert!(verification.mismatched.is_empty());
        assert!(harness.history.verify(false).unwrap().is_valid());
    }

    #[test]
    #[traced_test]
    fn test_identical_content_shares_blob() {
        let mut harness = HistoryTestHarness::new();
        let a = harness.write_and_snapshot("a.txt", b"same body", SnapshotSource::Save);
        let b = harness.write_and_snapshot("b.txt", b"same body", SnapshotSource::Save);
        assert_eq!(a.content_path, b.content_path);
        assert_eq!(harness.history.stats().unwrap().blob_count, 1);

        // The blob survives until its last reference is gone
        harness.history.delete(&SnapshotSelection::Single(a.id.clone())).unwrap();
        assert_eq!(harness.history.get_snapshot_content(&b.id).unwrap(), b"same body");
        harness.history.delete(&SnapshotSelection::Single(b.id.clone())).unwrap();
        assert_eq!(harness.history.stats().unwrap().blob_count, 0);
    }

    #[test]
    #[traced_test]
    fn test_discard_and_pagination() {
        let mut harness = HistoryTestHarness::new();
        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(harness.write_and_snapshot("p.txt", format!("v{}", i).as_bytes(), SnapshotSource::Save).id);
        }
        harness
            .history
            .discard(&SnapshotSelection::Multiple(vec![ids[1].clone(), ids[2].clone()]))
            .unwrap();

        let uri = harness.uri("p.txt");
        let page = |cursor: Option<String>| {
            harness
                .history
                .get_snapshots_for_file(
                    &uri,
                    &SnapshotFilter {
                        order: SortOrder::Oldest,
                        exclude_discarded: true,
                        cursor_id: cursor,
                        limit: Some(2),
                        ..Default::default()
                    },
                    None,
                )
                .unwrap()
                .into_iter()
                .map(|s| s.id)
                .collect::<Vec<_>>()
        };

        let first = page(None);
        assert_eq!(first, vec![ids[0].clone(), ids[3].clone()]);
        let second = page(first.last().cloned());
        assert_eq!(second, vec![ids[4].clone(), ids[5].clone()]);
        assert!(page(second.last().cloned()).is_empty());
    }

    #[test]
    #[traced_test]
    fn test_cancelled_listing_is_empty() {
        let mut harness = HistoryTestHarness::new();
        harness.write_and_snapshot("c.txt", b"x", SnapshotSource::Save);

        let token = CancellationToken::new();
        token.cancel();
        let listed = harness
            .history
            .get_snapshots_for_file(&harness.uri("c.txt"), &SnapshotFilter::default(), Some(&token))
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_periodic_cleanup_lifecycle() {
        let harness = HistoryTestHarness::new();
        harness.history.start_periodic_cleanup().unwrap();
        assert!(harness.history.cleanup_service().is_running());

        harness.history.stop_periodic_cleanup();
        assert!(!harness.history.cleanup_service().is_running());
    }
}
