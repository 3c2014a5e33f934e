//! Utility functions shared across retrace
//!
//! Small helpers for durable writes, timestamps, id validation and human
//! readable sizes.

use crate::error::{HistoryError, Result};
use std::io::Write;
use std::path::Path;
use tracing::trace;
use uuid::{Uuid, Version};

/// Current wall-clock time as epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Milliseconds in one day
pub const DAY_MS: i64 = 86_400_000;

/// Validate that `id` is a UUID v4 in canonical hyphenated form
///
/// Every id-taking operation calls this before touching storage.
pub fn validate_snapshot_id(id: &str) -> Result<()> {
    let invalid = || {
        HistoryError::validation(format!(
            "invalid snapshot id '{}': expected UUID v4 (xxxxxxxx-xxxx-4xxx-yxxx-xxxxxxxxxxxx)",
            id
        ))
    };

    if id.len() != 36 {
        return Err(invalid());
    }
    let uuid = Uuid::parse_str(id).map_err(|_| invalid())?;
    if uuid.get_version() != Some(Version::Random) {
        return Err(invalid());
    }
    Ok(())
}

/// Atomic file write (write to temp file then rename)
///
/// The temporary file is created next to `path` so the final rename never
/// crosses a filesystem boundary. Either the whole content is visible at
/// `path` or the previous content is.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| HistoryError::Io(e.error))?;

    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}

/// Format bytes as human-readable string
///
/// Values below 1024 are whole bytes; larger values use binary units with
/// two decimals.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Remove `dir` if it exists and is empty; returns whether it was removed
pub fn remove_dir_if_empty(dir: &Path) -> Result<bool> {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => {
            if entries.next().is_none() {
                std::fs::remove_dir(dir)?;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
