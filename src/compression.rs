//! LZ4 compression for stored snapshot bodies
//!
//! Every blob written by the content store starts with a 4-byte header that
//! says how the rest is encoded:
//!
//! - `LZ4T`: LZ4 block with the uncompressed size prepended
//! - `\0\0\0\0`: raw bytes
//!
//! The header makes blobs self-describing, so a blob written under one
//! strategy can be read back under any other. The per-snapshot
//! `metadata.compressed` flag is checked against the header on read.
//!
//! ## Strategies
//!
//! - **None**: store everything raw
//! - **Fast**: LZ4 for bodies of at least 1 KiB (default)
//! - **Adaptive**: LZ4 for bodies of at least `min_size` bytes
//!
//! Bodies under 64 bytes are never compressed, and a compressed encoding is
//! only kept when it is smaller than the input.
//!
//! ```rust
//! use retrace::compression::{CompressionEngine, CompressionStrategy};
//!
//! let mut engine = CompressionEngine::new(CompressionStrategy::Fast);
//! let body = "fn main() {}\n".repeat(200);
//! let (encoded, compressed) = engine.compress(body.as_bytes()).unwrap();
//! assert!(compressed);
//! assert_eq!(engine.decompress(&encoded).unwrap(), body.as_bytes());
//! ```

use crate::error::{HistoryError, Result};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, trace};

/// Magic bytes that mark LZ4 compressed data
pub const LZ4_MAGIC: &[u8; 4] = b"LZ4T";

/// Header of raw (uncompressed) data
pub const RAW_MAGIC: &[u8; 4] = &[0, 0, 0, 0];

/// Bodies smaller than this are always stored raw
const MIN_COMPRESSIBLE: usize = 64;

/// When snapshot bodies are compressed
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CompressionStrategy {
    /// No compression
    None,
    /// LZ4 for bodies of at least 1 KiB
    #[default]
    Fast,
    /// LZ4 for bodies of at least `min_size` bytes
    Adaptive {
        /// Skip compression below this size
        min_size: usize,
    },
}

impl CompressionStrategy {
    fn should_compress(&self, size: usize) -> bool {
        match self {
            CompressionStrategy::None => false,
            CompressionStrategy::Fast => size >= 1024,
            CompressionStrategy::Adaptive { min_size } => size >= *min_size,
        }
    }
}

/// Compression statistics for monitoring
#[derive(Debug, Default, Clone)]
pub struct CompressionStats {
    /// Number of bodies compressed
    pub files_compressed: usize,
    /// Number of bodies stored raw
    pub files_stored_raw: usize,
    /// Total bytes saved by compression
    pub bytes_saved: usize,
    /// Total compression time in milliseconds
    pub compression_time_ms: u64,
    /// Total decompression time in milliseconds
    pub decompression_time_ms: u64,
}

impl CompressionStats {
    /// Fraction of bodies that ended up compressed (0.0 to 1.0)
    pub fn compression_ratio(&self) -> f64 {
        let total_files = self.files_compressed + self.files_stored_raw;
        if total_files == 0 {
            return 0.0;
        }
        self.files_compressed as f64 / total_files as f64
    }
}

/// Compression engine
///
/// Not thread-safe by itself; the content store keeps it behind a mutex.
#[derive(Debug)]
pub struct CompressionEngine {
    strategy: CompressionStrategy,
    stats: CompressionStats,
}

impl CompressionEngine {
    /// Create a new compression engine with the specified strategy
    pub fn new(strategy: CompressionStrategy) -> Self {
        Self {
            strategy,
            stats: CompressionStats::default(),
        }
    }

    /// Active strategy
    pub fn strategy(&self) -> &CompressionStrategy {
        &self.strategy
    }

    /// Get current compression statistics
    pub fn stats(&self) -> &CompressionStats {
        &self.stats
    }

    /// Encode a body according to the strategy
    ///
    /// Returns the header-prefixed bytes and whether they are LZ4 compressed.
    pub fn compress(&mut self, content: &[u8]) -> Result<(Vec<u8>, bool)> {
        let start = Instant::now();

        if content.len() < MIN_COMPRESSIBLE || !self.strategy.should_compress(content.len()) {
            trace!("Storing {} bytes raw (strategy)", content.len());
            self.stats.files_stored_raw += 1;
            return Ok((with_header(RAW_MAGIC, content), false));
        }

        let compressed = compress_prepend_size(content);

        if compressed.len() < content.len() {
            let saved = content.len() - compressed.len();
            self.stats.bytes_saved += saved;
            self.stats.files_compressed += 1;
            self.stats.compression_time_ms += start.elapsed().as_millis() as u64;

            debug!(
                "Compressed {} -> {} bytes (saved {:.1}%)",
                content.len(),
                compressed.len(),
                (saved as f64 / content.len() as f64) * 100.0
            );

            Ok((with_header(LZ4_MAGIC, &compressed), true))
        } else {
            trace!("Compression not beneficial for {} bytes, storing raw", content.len());
            self.stats.files_stored_raw += 1;
            Ok((with_header(RAW_MAGIC, content), false))
        }
    }

    /// Decode header-prefixed bytes produced by [`CompressionEngine::compress`]
    ///
    /// An unknown header is reported as a decompression error rather than
    /// guessed at.
    pub fn decompress(&mut self, content: &[u8]) -> Result<Vec<u8>> {
        let start = Instant::now();

        if !header_kind(content)? {
            return Ok(content[RAW_MAGIC.len()..].to_vec());
        }

        let decompressed = decompress_size_prepended(&content[LZ4_MAGIC.len()..])
            .map_err(|e| HistoryError::decompression(format!("LZ4 decompression failed: {}", e)))?;
        self.stats.decompression_time_ms += start.elapsed().as_millis() as u64;
        trace!("Decompressed {} bytes to {} bytes", content.len(), decompressed.len());
        Ok(decompressed)
    }
}

/// Whether header-prefixed bytes are LZ4 compressed
///
/// Fails when the data is too short or carries an unknown header.
pub fn header_kind(content: &[u8]) -> Result<bool> {
    if content.len() < 4 {
        return Err(HistoryError::decompression("Content too short"));
    }
    if content.starts_with(LZ4_MAGIC) {
        Ok(true)
    } else if content.starts_with(RAW_MAGIC) {
        Ok(false)
    } else {
        Err(HistoryError::decompression("Unknown blob header"))
    }
}

fn with_header(magic: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(magic.len() + body.len());
    result.extend_from_slice(magic);
    result.extend_from_slice(body);
    result
}
