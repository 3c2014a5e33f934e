//! Schema version strings
//!
//! Persisted records carry a dotted version such as `1.0` or `1.0.1`. A valid
//! version has at least two components, each a non-empty run of ASCII
//! digits. Versions compare as integer tuples with missing trailing
//! components treated as zero, so `1.0 == 1.0.0` and `1.0 < 1.0.1`.

use crate::error::{HistoryError, Result};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Check whether `version` matches `^\d+(\.\d+)+$`
pub fn is_valid_version(version: &str) -> bool {
    let mut parts = 0;
    for part in version.split('.') {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        parts += 1;
    }
    parts >= 2
}

/// Like [`is_valid_version`], treating an absent version as invalid
pub fn is_valid_version_opt(version: Option<&str>) -> bool {
    version.is_some_and(is_valid_version)
}

/// Compare two version strings component-wise
///
/// Fails with a validation error if either side is not a valid version.
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering> {
    let a: SchemaVersion = a.parse()?;
    let b: SchemaVersion = b.parse()?;
    Ok(a.cmp(&b))
}

/// A parsed, valid schema version
#[derive(Debug, Clone)]
pub struct SchemaVersion {
    raw: String,
    parts: Vec<u64>,
}

impl SchemaVersion {
    /// The version as originally written
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Numeric components
    pub fn parts(&self) -> &[u64] {
        &self.parts
    }
}

impl FromStr for SchemaVersion {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self> {
        if !is_valid_version(s) {
            return Err(HistoryError::validation(format!(
                "invalid version format '{}': expected dotted numbers such as 1.0",
                s
            )));
        }
        let parts = s
            .split('.')
            .map(|p| {
                p.parse::<u64>()
                    .map_err(|_| HistoryError::validation(format!("version component out of range in '{}'", s)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            raw: s.to_string(),
            parts,
        })
    }
}

impl Ord for SchemaVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for SchemaVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SchemaVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SchemaVersion {}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
