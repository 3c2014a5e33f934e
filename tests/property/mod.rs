//! Property-based testing for retrace
//!
//! Uses proptest to check diff, version and eviction invariants across
//! randomly generated inputs.

use ::retrace::*;
use proptest::prelude::*;
use retrace::cleanup::{plan_size_eviction, plan_ttl_eviction};
use retrace::diff::{compute_diff_stats, diff_contents, split_lines};
use retrace::hash::compute_hash;
use retrace::index::StorageIndex;
use retrace::version::compare_versions;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

/// Source-like text of up to 30 lines drawn from a small vocabulary
fn text_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop_oneof![
            Just(String::new()),
            Just("}".to_string()),
            "[a-z]{1,6}( [a-z]{1,6}){0,3};".prop_map(|s| s),
            "    let [a-z] = [0-9]{1,3};".prop_map(|s| s),
        ],
        0..30,
    )
    .prop_map(|lines| lines.join("\n"))
}

fn version_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(0u64..20, 2..5).prop_map(|parts| {
        parts.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(".")
    })
}

#[derive(Debug, Clone)]
struct SnapshotSpec {
    file: usize,
    age: i64,
    size: u64,
    accepted: bool,
}

fn snapshot_spec_strategy() -> impl Strategy<Value = SnapshotSpec> {
    (0usize..4, 0i64..100, 0u64..500, any::<bool>()).prop_map(|(file, age, size, accepted)| SnapshotSpec {
        file,
        age,
        size,
        accepted,
    })
}

fn index_from(specs: &[SnapshotSpec]) -> StorageIndex {
    let mut index = StorageIndex::empty(CURRENT_SCHEMA_VERSION, 0);
    for spec in specs {
        let body = format!("{:?}", spec);
        index.push(Snapshot {
            id: uuid::Uuid::new_v4().to_string(),
            file_uri: format!("file:///f{}", spec.file),
            file_path: format!("/f{}", spec.file),
            timestamp: 1_000 - spec.age,
            source: SnapshotSource::Save,
            content_hash: compute_hash(body.as_bytes()),
            content_path: String::new(),
            metadata: SnapshotMetadata {
                size: spec.size,
                line_count: 1,
                encoding: "utf8".to_string(),
                deleted: false,
                compressed: false,
            },
            diff_info: None,
            accepted: spec.accepted,
            accepted_timestamp: spec.accepted.then_some(1_000 - spec.age),
            discarded: None,
        });
    }
    index.recompute_aggregates();
    index
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Diffing a text against itself finds nothing
    #[test]
    fn diff_of_identical_text_is_empty(text in text_strategy()) {
        let diff = diff_contents(text.as_bytes(), text.as_bytes());
        prop_assert!(!diff.is_binary);
        prop_assert!(diff.blocks.is_empty());
        prop_assert_eq!(diff.stats, DiffStats::default());
    }

    /// Added minus removed equals the change in line count
    #[test]
    fn diff_stats_balance(old in text_strategy(), new in text_strategy()) {
        let stats = compute_diff_stats(&old, &new);
        let old_len = split_lines(&old).len() as i64;
        let new_len = split_lines(&new).len() as i64;
        prop_assert_eq!(stats.added_lines as i64 - stats.removed_lines as i64, new_len - old_len);
        prop_assert!(stats.added_lines == 0 || stats.removed_lines == 0);
    }

    /// Blocks cover exactly the lines outside the common subsequence
    #[test]
    fn diff_blocks_cover_changed_lines(old in text_strategy(), new in text_strategy()) {
        let diff = diff_contents(old.as_bytes(), new.as_bytes());
        let removed: usize = diff.blocks.iter().map(|b| b.original_length).sum();
        let added: usize = diff.blocks.iter().map(|b| b.modified_length).sum();
        prop_assert_eq!(removed, diff.stats.removed_lines + diff.stats.modified_lines);
        prop_assert_eq!(added, diff.stats.added_lines + diff.stats.modified_lines);
    }

    /// Version comparison is a total order
    #[test]
    fn version_order_is_consistent(a in version_strategy(), b in version_strategy(), c in version_strategy()) {
        let ab = compare_versions(&a, &b).unwrap();
        let bc = compare_versions(&b, &c).unwrap();
        prop_assert_eq!(compare_versions(&b, &a).unwrap(), ab.reverse());
        if ab != Ordering::Greater && bc != Ordering::Greater {
            prop_assert_ne!(compare_versions(&a, &c).unwrap(), Ordering::Greater);
        }
        let padded = format!("{}.0", a);
        prop_assert_eq!(compare_versions(&a, &padded).unwrap(), Ordering::Equal);
    }

    /// The size plan fits the budget unless protection prevents it
    #[test]
    fn size_plan_fits_budget(
        specs in prop::collection::vec(snapshot_spec_strategy(), 0..40),
        budget in 0u64..5_000,
    ) {
        let index = index_from(&specs);
        let plan = plan_size_eviction(&index, budget);

        let evicted: Vec<&Snapshot> = plan.evict.iter().map(|id| index.find(id).unwrap()).collect();
        let freed: u64 = evicted.iter().map(|s| s.metadata.size).sum();
        let left = index.computed_total_size() - freed;

        if left > budget {
            // Every snapshot was either evicted or protected
            prop_assert_eq!(plan.evict.len() + plan.protected.len(), index.snapshots.len());
        }
        prop_assert!(evicted.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    /// The age plan never empties a file that has an accepted snapshot
    #[test]
    fn ttl_plan_keeps_a_baseline(
        specs in prop::collection::vec(snapshot_spec_strategy(), 0..40),
        cutoff in 900i64..1_001,
    ) {
        let index = index_from(&specs);
        let plan = plan_ttl_eviction(&index, cutoff);

        let mut kept: HashMap<&str, usize> = HashMap::new();
        for snapshot in index.snapshots.iter().filter(|s| !plan.evict.contains(&s.id)) {
            *kept.entry(snapshot.file_uri.as_str()).or_default() += 1;
        }
        for snapshot in index.snapshots.iter().filter(|s| s.accepted) {
            prop_assert!(kept.get(snapshot.file_uri.as_str()).copied().unwrap_or(0) > 0);
        }
        prop_assert!(plan.protected.iter().all(|id| !plan.evict.contains(id)));
    }

    /// The size plan never evicts an accepted snapshot as the last one of its file
    #[test]
    fn size_plan_respects_protection(
        specs in prop::collection::vec(snapshot_spec_strategy(), 0..40),
        budget in 0u64..2_000,
    ) {
        let index = index_from(&specs);
        let plan = plan_size_eviction(&index, budget);

        let mut left: HashMap<&str, usize> = HashMap::new();
        for snapshot in &index.snapshots {
            *left.entry(snapshot.file_uri.as_str()).or_default() += 1;
        }
        for id in &plan.evict {
            let snapshot = index.find(id).unwrap();
            let count = left.get_mut(snapshot.file_uri.as_str()).unwrap();
            prop_assert!(!(snapshot.accepted && *count == 1));
            *count -= 1;
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Stored bodies load back byte for byte under every compression mode
    #[test]
    fn stored_content_is_preserved(
        body in prop::collection::vec(any::<u8>(), 0..4096),
        mode in 0usize..3,
    ) {
        let temp_dir = TempDir::new().unwrap();
        let compression = match mode {
            0 => CompressionStrategy::None,
            1 => CompressionStrategy::Fast,
            _ => CompressionStrategy::Adaptive { min_size: 1024 },
        };
        let history = LocalHistoryBuilder::new()
            .store(Arc::new(MemoryStore::new()))
            .compression(compression)
            .build(temp_dir.path())
            .unwrap();

        let snapshot = history.create_snapshot("file:///blob.bin", &body, SnapshotSource::Save).unwrap();
        prop_assert_eq!(history.get_snapshot_content(&snapshot.id).unwrap(), body);
    }
}
