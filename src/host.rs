//! Host file access
//!
//! The engine never reads or writes working files itself; the host hands it
//! a [`FileAccess`] for diffing against the current file and for restores.
//! [`LocalFileAccess`] maps `file://` URIs and plain paths onto the local
//! filesystem.

use crate::error::{HistoryError, Result};
use crate::utils::atomic_write;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

/// Reads and writes the files snapshots are taken of
pub trait FileAccess: Send + Sync {
    /// Current content of `uri`; [`HistoryError::FileNotFound`] when absent
    fn read(&self, uri: &str) -> Result<Vec<u8>>;

    /// Replace the content of `uri`
    fn write(&self, uri: &str, content: &[u8]) -> Result<()>;
}

/// Filesystem path for a `file://` URI or a plain path
///
/// URIs are percent-decoded; anything that does not parse as a local file URL
/// is taken as a path verbatim.
pub fn file_path_from_uri(uri: &str) -> PathBuf {
    if uri.starts_with("file:") {
        if let Some(path) = Url::parse(uri).ok().and_then(|url| url.to_file_path().ok()) {
            return path;
        }
        return PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri));
    }
    PathBuf::from(uri)
}

/// `file://` URI for `path`, made absolute against the working directory
///
/// Falls back to the plain path when no URL can be formed, which
/// [`file_path_from_uri`] maps back unchanged.
pub fn uri_from_path(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        Some(path.to_path_buf())
    } else {
        std::env::current_dir().ok().map(|cwd| cwd.join(path))
    };
    absolute
        .and_then(|p| Url::from_file_path(p).ok())
        .map(String::from)
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// [`FileAccess`] over the local filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileAccess;

impl FileAccess for LocalFileAccess {
    fn read(&self, uri: &str) -> Result<Vec<u8>> {
        let path = file_path_from_uri(uri);
        std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HistoryError::FileNotFound(path.display().to_string())
            } else {
                HistoryError::Io(e)
            }
        })
    }

    fn write(&self, uri: &str, content: &[u8]) -> Result<()> {
        let path = file_path_from_uri(uri);
        atomic_write(&path, content)?;
        debug!("Wrote {} bytes to {:?}", content.len(), path);
        Ok(())
    }
}
