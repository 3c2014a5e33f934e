//! Content-addressed blob store
//!
//! Snapshot bodies are stored once per distinct SHA-256 hash, sharded by the
//! first two hex characters:
//!
//! ```text
//! storage_root/
//! └── objects/
//!     └── <first 2 hex chars>/
//!         └── <remaining 62 hex chars>
//! ```
//!
//! Blob paths handed out and accepted by this module are relative to the
//! storage root and `/`-separated, which is what `Snapshot::content_path`
//! records. The store itself never decides when a blob is unreferenced; the
//! storage service does that against the index.

use crate::compression::{header_kind, CompressionEngine, CompressionStats, CompressionStrategy};
use crate::error::{HistoryError, Result};
use crate::hash::{is_valid_hash, short_hash};
use crate::utils::{atomic_write, remove_dir_if_empty};
use parking_lot::Mutex;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, trace, warn};

/// Directory holding blobs, relative to the storage root
pub const OBJECTS_DIR: &str = "objects";

/// Result of [`ContentStore::put`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// Path relative to the storage root
    pub path: String,
    /// Whether the blob on disk is LZ4 compressed
    pub compressed: bool,
    /// Size of the blob on disk, header included
    pub stored_size: u64,
    /// The blob already existed and nothing was written
    pub deduplicated: bool,
}

/// Blob store rooted at a storage directory
#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
    compression: Mutex<CompressionEngine>,
}

impl ContentStore {
    /// Open the store at `root`, creating the objects directory if needed
    pub fn open(root: impl Into<PathBuf>, strategy: CompressionStrategy) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(OBJECTS_DIR))?;
        Ok(Self {
            root,
            compression: Mutex::new(CompressionEngine::new(strategy)),
        })
    }

    /// Storage root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compression statistics since the store was opened
    pub fn compression_stats(&self) -> CompressionStats {
        self.compression.lock().stats().clone()
    }

    /// Relative blob path for `hash`
    pub fn blob_path_for(hash: &str) -> Result<String> {
        if !is_valid_hash(hash) {
            return Err(HistoryError::validation(format!(
                "invalid content hash '{}': expected 64 lowercase hex characters",
                hash
            )));
        }
        Ok(format!("{}/{}/{}", OBJECTS_DIR, &hash[..2], &hash[2..]))
    }

    /// Store `content` under `hash` unless a blob for it already exists
    pub fn put(&self, hash: &str, content: &[u8]) -> Result<StoredBlob> {
        let path = Self::blob_path_for(hash)?;
        let absolute = self.absolute(&path)?;

        if absolute.exists() {
            let compressed = read_header(&absolute)?;
            let stored_size = fs::metadata(&absolute)?.len();
            debug!("Blob {} already stored, deduplicating", short_hash(hash));
            return Ok(StoredBlob {
                path,
                compressed,
                stored_size,
                deduplicated: true,
            });
        }

        let (encoded, compressed) = self.compression.lock().compress(content)?;
        atomic_write(&absolute, &encoded)?;
        trace!("Stored blob {} ({} bytes)", short_hash(hash), encoded.len());

        Ok(StoredBlob {
            path,
            compressed,
            stored_size: encoded.len() as u64,
            deduplicated: false,
        })
    }

    /// Read the body stored at `path`
    ///
    /// `compressed` is the flag recorded in the snapshot; a blob whose header
    /// disagrees with it is reported as corruption.
    pub fn get(&self, path: &str, compressed: bool) -> Result<Vec<u8>> {
        let absolute = self.absolute(path)?;
        let data = match fs::read(&absolute) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HistoryError::ContentNotFound(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let actual = header_kind(&data)?;
        if actual != compressed {
            return Err(HistoryError::corruption(format!(
                "blob {} is {} but its snapshot records it as {}",
                path,
                describe(actual),
                describe(compressed)
            )));
        }

        self.compression.lock().decompress(&data)
    }

    /// Remove the blob at `path`; returns whether a file was removed
    pub fn delete(&self, path: &str) -> Result<bool> {
        let absolute = self.absolute(path)?;
        match fs::remove_file(&absolute) {
            Ok(()) => {
                if let Some(shard) = absolute.parent() {
                    if let Err(e) = remove_dir_if_empty(shard) {
                        warn!("Failed to remove empty shard {:?}: {}", shard, e);
                    }
                }
                debug!("Deleted blob {}", path);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a blob exists at `path`
    pub fn exists(&self, path: &str) -> bool {
        self.absolute(path).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Relative paths of every stored blob, sorted
    pub fn list_blobs(&self) -> Result<Vec<String>> {
        let objects = self.root.join(OBJECTS_DIR);
        let mut blobs = Vec::new();
        if !objects.exists() {
            return Ok(blobs);
        }

        for shard in fs::read_dir(&objects)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let shard_name = shard.file_name().to_string_lossy().into_owned();
            for blob in fs::read_dir(shard.path())? {
                let blob = blob?;
                if blob.file_type()?.is_file() {
                    let name = blob.file_name().to_string_lossy().into_owned();
                    // Skip in-flight temp files
                    if name.starts_with(".tmp") {
                        continue;
                    }
                    blobs.push(format!("{}/{}/{}", OBJECTS_DIR, shard_name, name));
                }
            }
        }

        blobs.sort();
        Ok(blobs)
    }

    /// Resolve a relative blob path, refusing anything outside `objects/`
    fn absolute(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let inside_objects = relative.starts_with(OBJECTS_DIR)
            && relative.components().all(|c| matches!(c, Component::Normal(_)));
        if !inside_objects {
            return Err(HistoryError::corruption(format!(
                "blob path '{}' is outside the object store",
                path
            )));
        }
        Ok(self.root.join(relative))
    }
}

fn read_header(path: &Path) -> Result<bool> {
    let mut header = [0u8; 4];
    let mut file = fs::File::open(path)?;
    file.read_exact(&mut header)
        .map_err(|_| HistoryError::corruption(format!("blob {:?} is truncated", path)))?;
    header_kind(&header)
}

fn describe(compressed: bool) -> &'static str {
    if compressed {
        "compressed"
    } else {
        "uncompressed"
    }
}
