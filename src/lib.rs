//! # Retrace - Local file history
//!
//! An editor-side history engine that records snapshots of individual files
//! as they are typed, saved or changed on disk, and lets you browse, diff,
//! accept and restore them later.
//!
//! ## Overview
//!
//! Retrace keeps a timestamped history per file URI. You can:
//! - Record snapshots whenever a file changes, with per-snapshot line statistics
//!   against the previous version
//! - Mark snapshots as accepted (protecting them from age-based eviction) or
//!   discard them from listings
//! - Diff any two snapshots, or a snapshot against the current file
//! - Restore a file to any earlier snapshot
//! - Bound storage with age- and size-based eviction, on demand or periodically
//!
//! ## Architecture
//!
//! - **Index**: all snapshot metadata lives in a single JSON document in a
//!   [`KeyValueStore`], versioned and migrated on open
//! - **Content-Addressable Storage**: bodies are stored by SHA-256 under
//!   `objects/`, so identical versions share one blob
//! - **Compression**: blobs are LZ4 compressed according to a
//!   [`CompressionStrategy`]
//! - **Cleanup**: a TTL pass and a size pass, run together through a
//!   single-flight gate and optionally on a tokio interval
//! - **Observers**: every mutation is reported to registered
//!   [`HistoryObserver`]s; a failing observer never fails the operation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use retrace::{LocalFileAccess, LocalHistoryBuilder, SnapshotFilter, SnapshotSource};
//!
//! # fn main() -> retrace::Result<()> {
//! let history = LocalHistoryBuilder::new()
//!     .ttl_days(14)
//!     .build("./.retrace")?;
//!
//! let uri = "file:///project/src/lib.rs";
//! let snapshot = history.create_snapshot(uri, b"pub fn answer() -> u32 { 42 }\n", SnapshotSource::Save)?;
//!
//! for entry in history.get_snapshots_for_file(uri, &SnapshotFilter::default(), None)? {
//!     println!("{} {} {}", entry.short_id(), entry.display_time(), entry.source);
//! }
//!
//! history.restore_snapshot(&snapshot.id, &LocalFileAccess)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`manager`]: the [`LocalHistoryManager`] facade
//! - [`config`]: [`HistoryConfig`] and [`LocalHistoryBuilder`]
//! - [`storage`]: snapshot persistence over the index and blob store
//! - [`cleanup`]: eviction planning and the periodic cleanup task
//! - [`migration`]: schema versions and index migrations
//! - [`diff`]: line statistics and change blocks
//! - [`verification`]: integrity checks
//! - [`types`]: snapshots, filters, events and batch results
//! - [`error`]: error types and handling

pub mod cleanup;
pub mod compression;
pub mod config;
pub mod content;
pub mod diff;
pub mod error;
pub mod hash;
pub mod host;
pub mod index;
pub mod kv;
pub mod manager;
pub mod migration;
pub mod storage;
pub mod types;
pub mod utils;
pub mod verification;
pub mod version;

pub use cleanup::{CleanupOutcome, CleanupPolicy, CleanupReport, CleanupService};
pub use compression::{CompressionEngine, CompressionStrategy};
pub use config::{HistoryConfig, LocalHistoryBuilder};
pub use diff::{ChangeBlock, DetailedDiff, DiffStats};
pub use error::{HistoryError, Result};
pub use host::{FileAccess, LocalFileAccess};
pub use kv::{JsonFileStore, KeyValueStore, MemoryStore};
pub use manager::LocalHistoryManager;
pub use migration::CURRENT_SCHEMA_VERSION;
pub use storage::{StorageService, StorageStats};
pub use types::*;
pub use verification::{IndexVerifier, IntegrityReport};
pub use tokio_util::sync::CancellationToken;
