//! Main test module for retrace
//!
//! This module includes all test suites:
//! - Integration tests for editing sessions
//! - Chaos tests for resilience
//! - Property-based tests for invariants

pub mod chaos;
pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::retrace::*;
    use retrace::host::uri_from_path;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn memory_history(dir: &TempDir) -> LocalHistoryManager {
        LocalHistoryBuilder::new()
            .store(Arc::new(MemoryStore::new()))
            .build(dir.path())
            .unwrap()
    }

    #[test]
    fn test_empty_content() {
        let dir = TempDir::new().unwrap();
        let history = memory_history(&dir);

        let empty = history.create_snapshot("file:///e.txt", b"", SnapshotSource::Save).unwrap();
        assert_eq!(empty.metadata.size, 0);
        assert_eq!(empty.metadata.line_count, 1);
        assert_eq!(history.get_snapshot_content(&empty.id).unwrap(), b"");

        let filled = history.create_snapshot("file:///e.txt", b"a\nb", SnapshotSource::Save).unwrap();
        let info = filled.diff_info.unwrap();
        assert_eq!((info.added_lines, info.modified_lines), (1, 1));
    }

    #[test]
    fn test_unicode_and_crlf_content() {
        let dir = TempDir::new().unwrap();
        let history = memory_history(&dir);
        let uri = "file:///docs/%E6%96%87%E4%BB%B6.md";

        let first = history
            .create_snapshot(uri, "héllo\r\nwörld\r\n".as_bytes(), SnapshotSource::Save)
            .unwrap();
        assert_eq!(first.file_path, "/docs/文件.md");
        assert_eq!(first.metadata.encoding, "utf8");

        let second = history
            .create_snapshot(uri, "héllo\nwörld\n".as_bytes(), SnapshotSource::Save)
            .unwrap();
        let diff = history.diff_snapshots(&first.id, &second.id).unwrap();
        assert!(!diff.has_changes());
        assert_ne!(first.content_hash, second.content_hash);
    }

    #[test]
    fn test_binary_content() {
        let dir = TempDir::new().unwrap();
        let history = memory_history(&dir);
        let body = [0u8, 159, 146, 150, 0, 1, 2];

        let a = history.create_snapshot("file:///img.png", &body, SnapshotSource::Filesystem).unwrap();
        assert_eq!(a.metadata.encoding, "binary");
        let b = history.create_snapshot("file:///img.png", &body[..3], SnapshotSource::Filesystem).unwrap();
        assert!(history.diff_snapshots(&a.id, &b.id).unwrap().is_binary);
        assert_eq!(history.get_snapshot_content(&a.id).unwrap(), body);
    }

    #[test]
    fn test_deleted_file_lifecycle() {
        let dir = TempDir::new().unwrap();
        let history = memory_history(&dir);
        let path = dir.path().join("gone.txt");
        let uri = uri_from_path(&path);

        let last = history.create_snapshot(&uri, b"last words", SnapshotSource::Save).unwrap();
        history.create_deletion_snapshot(&uri).unwrap();
        assert!(history.get_tracked_files().unwrap().contains(&uri));

        // The file is gone on disk; diffing against it reports that
        let err = history.diff_with_current(&last.id, &LocalFileAccess).unwrap_err();
        assert!(matches!(err, HistoryError::FileNotFound(_)));

        // Restoring the last real version brings it back
        history.restore_snapshot(&last.id, &LocalFileAccess).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"last words");
    }

    #[test]
    fn test_only_deletion_markers_are_not_tracked() {
        let dir = TempDir::new().unwrap();
        let history = memory_history(&dir);
        history.create_deletion_snapshot("file:///never.txt").unwrap();
        assert!(history.get_tracked_files().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_ids() {
        let dir = TempDir::new().unwrap();
        let history = memory_history(&dir);
        let unknown = uuid::Uuid::new_v4().to_string();

        assert!(history.get_snapshot(&unknown).unwrap().is_none());
        assert!(history.get_snapshot_content(&unknown).unwrap_err().is_not_found());
        assert!(history
            .update_snapshot(&unknown, SnapshotUpdate::Accept)
            .unwrap_err()
            .is_not_found());

        let outcome = history.accept(&SnapshotSelection::Single(unknown.clone())).unwrap();
        assert!(outcome.processed.is_empty());
        assert_eq!(outcome.failed[0].id, unknown);
        assert_eq!(outcome.summary(BatchAction::Accept), "Accepted 0 snapshot(s), 1 failed");
    }

    #[test]
    fn test_empty_uri_rejected() {
        let dir = TempDir::new().unwrap();
        let history = memory_history(&dir);
        assert!(history
            .create_snapshot("  ", b"x", SnapshotSource::Save)
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn test_unknown_cursor_returns_nothing() {
        let dir = TempDir::new().unwrap();
        let history = memory_history(&dir);
        history.create_snapshot("file:///c", b"1", SnapshotSource::Save).unwrap();

        let filter = SnapshotFilter {
            cursor_id: Some(uuid::Uuid::new_v4().to_string()),
            ..Default::default()
        };
        assert!(history.get_snapshots_for_file("file:///c", &filter, None).unwrap().is_empty());

        let malformed = SnapshotFilter {
            cursor_id: Some("cursor".to_string()),
            ..Default::default()
        };
        assert!(history
            .get_snapshots_for_file("file:///c", &malformed, None)
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn test_periodic_cleanup_needs_runtime() {
        let dir = TempDir::new().unwrap();
        let history = memory_history(&dir);
        let err = history.start_periodic_cleanup().unwrap_err();
        assert!(matches!(err, HistoryError::Internal(_)));
        history.stop_periodic_cleanup();
    }
}
