//! Content fingerprinting
//!
//! Snapshot bodies are identified by the SHA-256 digest of their bytes,
//! rendered as 64 lowercase hex characters. The digest drives two things:
//! deduplication in the content store, and "nothing changed" detection
//! against the previous snapshot of a file.

use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest
pub const HASH_HEX_LEN: usize = 64;

/// Compute the SHA-256 hash of content
///
/// Deterministic and side-effect free: the same bytes always produce the
/// same 64-character hex string.
///
/// # Example
///
/// ```rust
/// use retrace::hash::compute_hash;
///
/// let hash = compute_hash(b"const x = 1;");
/// assert_eq!(hash.len(), 64);
/// assert_eq!(hash, compute_hash(b"const x = 1;"));
/// ```
pub fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// First eight characters of a hash, for log lines
pub fn short_hash(hash: &str) -> &str {
    &hash[..8.min(hash.len())]
}

/// Whether `hash` looks like a digest produced by [`compute_hash`]
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == HASH_HEX_LEN
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
