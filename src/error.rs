//! Error types for the retrace library
//!
//! Every fallible operation returns [`HistoryError`]. The variants follow the
//! failure classes a host needs to tell apart when turning an error into a
//! user notification:
//!
//! - **Validation**: malformed ids, empty selections, bad version strings.
//!   Raised before any storage is touched.
//! - **Not found**: unknown snapshot ids, missing blobs, missing host files.
//! - **Corruption**: the persisted index contradicts itself or the blob store.
//! - **Migration**: the on-disk schema cannot be brought to the expected version.
//! - **Cleanup pass**: an eviction pass failed; wraps the underlying cause.

use std::fmt;
use thiserror::Error;

/// Type alias for Results in the retrace library
pub type Result<T> = std::result::Result<T, HistoryError>;

/// Which eviction pass produced a [`HistoryError::CleanupPass`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPassKind {
    /// Age-based eviction
    Ttl,
    /// Aggregate size budget eviction
    Size,
}

impl fmt::Display for CleanupPassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupPassKind::Ttl => write!(f, "TTL"),
            CleanupPassKind::Size => write!(f, "size"),
        }
    }
}

/// Main error type for all retrace operations
#[derive(Debug, Error)]
pub enum HistoryError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed input rejected before any I/O
    #[error("Validation error: {0}")]
    Validation(String),

    /// Snapshot id not present in the index
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Blob missing from the content store
    #[error("Content not found: {0}")]
    ContentNotFound(String),

    /// Host file missing
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Snapshot exists but its body could not be loaded
    #[error("Failed to load content for snapshot {id}: {source}")]
    ContentLoad {
        /// Snapshot whose content failed to load
        id: String,
        /// Underlying failure
        #[source]
        source: Box<HistoryError>,
    },

    /// The persisted state contradicts itself
    #[error("Storage corruption: {0}")]
    StorageCorruption(String),

    /// Schema migration failed or is impossible
    #[error("Migration error: {0}")]
    Migration(String),

    /// An eviction pass failed
    #[error("{pass} cleanup pass failed: {source}")]
    CleanupPass {
        /// The pass that failed
        pass: CleanupPassKind,
        /// Underlying failure
        #[source]
        source: Box<HistoryError>,
    },

    /// Compression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Decompression errors
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// A change observer reported a failure
    #[error("Observer error: {0}")]
    Observer(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HistoryError {
    /// Create a validation error with a custom message
    pub fn validation(msg: impl Into<String>) -> Self {
        HistoryError::Validation(msg.into())
    }

    /// Create a corruption error with a custom message
    pub fn corruption(msg: impl Into<String>) -> Self {
        HistoryError::StorageCorruption(msg.into())
    }

    /// Create a migration error with a custom message
    pub fn migration(msg: impl Into<String>) -> Self {
        HistoryError::Migration(msg.into())
    }

    /// Create a compression error with a custom message
    pub fn compression(msg: impl Into<String>) -> Self {
        HistoryError::Compression(msg.into())
    }

    /// Create a decompression error with a custom message
    pub fn decompression(msg: impl Into<String>) -> Self {
        HistoryError::Decompression(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        HistoryError::Internal(msg.into())
    }

    /// Wrap a failure to load the body of snapshot `id`
    pub fn content_load(id: impl Into<String>, source: HistoryError) -> Self {
        HistoryError::ContentLoad {
            id: id.into(),
            source: Box::new(source),
        }
    }

    /// Wrap a failure inside an eviction pass
    pub fn cleanup_pass(pass: CleanupPassKind, source: HistoryError) -> Self {
        HistoryError::CleanupPass {
            pass,
            source: Box::new(source),
        }
    }

    /// Check if this error means "the thing asked for does not exist"
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            HistoryError::SnapshotNotFound(_)
                | HistoryError::ContentNotFound(_)
                | HistoryError::FileNotFound(_)
        )
    }

    /// Check if this error indicates corruption
    pub fn is_corruption(&self) -> bool {
        match self {
            HistoryError::StorageCorruption(_) | HistoryError::Decompression(_) => true,
            HistoryError::ContentLoad { source, .. } => {
                source.is_corruption() || matches!(**source, HistoryError::ContentNotFound(_))
            }
            _ => false,
        }
    }

    /// Check if this error is a validation failure
    pub fn is_validation(&self) -> bool {
        matches!(self, HistoryError::Validation(_))
    }

    /// Get a user-facing message suitable for a notification
    pub fn user_message(&self) -> String {
        match self {
            HistoryError::SnapshotNotFound(id) => {
                format!("Snapshot '{}' was not found. It may have been cleaned up.", id)
            }
            HistoryError::ContentLoad { id, .. } => {
                format!("Failed to load the content of snapshot '{}'. The stored copy is missing or damaged.", id)
            }
            HistoryError::Migration(msg) => {
                format!("Local history is unavailable: {}", msg)
            }
            HistoryError::Validation(msg) => msg.clone(),
            _ => self.to_string(),
        }
    }
}
