//! Line-level diff computation for snapshot contents
//!
//! Both operations here work on lines and are built on the Longest Common
//! Subsequence (LCS) of the two line sequences, computed with the classic
//! dynamic programming table.
//!
//! - [`compute_diff_stats`] summarizes a change as added / removed / modified
//!   line counts. "Modified" is a count balance, not a pairing of specific
//!   lines: `min(removed, added)` lines are reclassified as modifications.
//! - [`compute_detailed_diff`] walks both sequences against the LCS and emits
//!   a [`ChangeBlock`] for every maximal run of non-matching lines.
//!
//! ## Limits
//!
//! The table costs O(n·m) time and memory in line counts. That is fine for
//! source files but is a hard ceiling for very large inputs.
//!
//! The block walker anchors on the next occurrence of each LCS line, scanning
//! forward. When a line repeats, the anchor it picks can differ from the
//! alignment the DP table chose, which shifts block boundaries. This is the
//! expected output of the walker, not something to correct silently.
//!
//! ## Examples
//!
//! ```rust
//! use retrace::diff::{compute_diff_stats, DiffStats};
//!
//! let stats = compute_diff_stats("a\nb\nc", "a\nb\nd");
//! assert_eq!(stats, DiffStats { added_lines: 0, removed_lines: 0, modified_lines: 1 });
//! ```

use serde::{Deserialize, Serialize};

/// Line change counts between two contents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffStats {
    /// Lines present only in the new content (after balancing)
    pub added_lines: usize,
    /// Lines present only in the old content (after balancing)
    pub removed_lines: usize,
    /// Lines counted as changed in place
    pub modified_lines: usize,
}

impl DiffStats {
    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.added_lines > 0 || self.removed_lines > 0 || self.modified_lines > 0
    }

    /// Total number of lines touched
    pub fn total(&self) -> usize {
        self.added_lines + self.removed_lines + self.modified_lines
    }
}

/// One run of non-matching lines between two common anchors
///
/// Starts are 0-based line indices into the respective sequences. Contents
/// are the covered lines joined with `\n` (empty when the length is zero).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBlock {
    /// First line of the run in the old content
    pub original_start: usize,
    /// Number of old lines in the run
    pub original_length: usize,
    /// First line of the run in the new content
    pub modified_start: usize,
    /// Number of new lines in the run
    pub modified_length: usize,
    /// Old lines covered by the run
    pub original_content: String,
    /// New lines covered by the run
    pub modified_content: String,
}

impl ChangeBlock {
    fn from_ranges(
        old_lines: &[&str],
        new_lines: &[&str],
        original_start: usize,
        original_end: usize,
        modified_start: usize,
        modified_end: usize,
    ) -> Self {
        Self {
            original_start,
            original_length: original_end - original_start,
            modified_start,
            modified_length: modified_end - modified_start,
            original_content: old_lines[original_start..original_end].join("\n"),
            modified_content: new_lines[modified_start..modified_end].join("\n"),
        }
    }

    /// Whether the block only inserts lines
    pub fn is_insertion(&self) -> bool {
        self.original_length == 0 && self.modified_length > 0
    }

    /// Whether the block only deletes lines
    pub fn is_deletion(&self) -> bool {
        self.modified_length == 0 && self.original_length > 0
    }
}

/// Statistics and blocks for one comparison
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedDiff {
    /// Balanced line counts
    pub stats: DiffStats,
    /// Change blocks in order
    pub blocks: Vec<ChangeBlock>,
    /// Either side looked binary; no line diff was computed
    pub is_binary: bool,
}

impl DetailedDiff {
    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        !self.blocks.is_empty()
    }
}

/// Split text into lines
///
/// Lines end at `\n`; a `\r` right before it is dropped, so `\r\n` files
/// compare equal to `\n` files. Empty text is a single empty line and a
/// trailing newline yields a trailing empty line.
pub fn split_lines(text: &str) -> Vec<&str> {
    text.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect()
}

/// Number of lines as counted by [`split_lines`]
pub fn line_count(text: &str) -> usize {
    text.bytes().filter(|&b| b == b'\n').count() + 1
}

/// Compute the longest common subsequence of two line sequences
///
/// Returns the common lines in order.
pub fn longest_common_subsequence<'a>(old_lines: &[&'a str], new_lines: &[&str]) -> Vec<&'a str> {
    let m = old_lines.len();
    let n = new_lines.len();
    if m == 0 || n == 0 {
        return Vec::new();
    }

    // Flat (m+1) x (n+1) table
    let width = n + 1;
    let mut dp = vec![0u32; (m + 1) * width];

    for i in 1..=m {
        for j in 1..=n {
            dp[i * width + j] = if old_lines[i - 1] == new_lines[j - 1] {
                dp[(i - 1) * width + (j - 1)] + 1
            } else {
                dp[(i - 1) * width + j].max(dp[i * width + (j - 1)])
            };
        }
    }

    // Backtrack
    let mut lcs = Vec::with_capacity(dp[m * width + n] as usize);
    let mut i = m;
    let mut j = n;

    while i > 0 && j > 0 {
        if old_lines[i - 1] == new_lines[j - 1] {
            lcs.push(old_lines[i - 1]);
            i -= 1;
            j -= 1;
        } else if dp[(i - 1) * width + j] > dp[i * width + (j - 1)] {
            i -= 1;
        } else {
            j -= 1;
        }
    }

    lcs.reverse();
    lcs
}

/// Compute balanced line statistics between two texts
///
/// `removed = |old| - |LCS|` and `added = |new| - |LCS|`; the smaller of the
/// two is moved into `modified_lines` and subtracted from both.
pub fn compute_diff_stats(old: &str, new: &str) -> DiffStats {
    let old_lines = split_lines(old);
    let new_lines = split_lines(new);
    let common = longest_common_subsequence(&old_lines, &new_lines).len();

    let removed = old_lines.len().saturating_sub(common);
    let added = new_lines.len().saturating_sub(common);
    let modified = removed.min(added);

    DiffStats {
        added_lines: added.saturating_sub(modified),
        removed_lines: removed.saturating_sub(modified),
        modified_lines: modified,
    }
}

/// Compute the change blocks between two texts
///
/// For each LCS line in order, both cursors scan forward to the next
/// occurrence of that line. Lines skipped on either side form a block. A
/// final block covers whatever remains after the last anchor.
pub fn compute_detailed_diff(old: &str, new: &str) -> Vec<ChangeBlock> {
    let old_lines = split_lines(old);
    let new_lines = split_lines(new);
    let lcs = longest_common_subsequence(&old_lines, &new_lines);

    let mut blocks = Vec::new();
    let mut old_idx = 0;
    let mut new_idx = 0;

    for token in lcs {
        let mut old_anchor = old_idx;
        while old_anchor < old_lines.len() && old_lines[old_anchor] != token {
            old_anchor += 1;
        }
        let mut new_anchor = new_idx;
        while new_anchor < new_lines.len() && new_lines[new_anchor] != token {
            new_anchor += 1;
        }

        if old_anchor > old_idx || new_anchor > new_idx {
            blocks.push(ChangeBlock::from_ranges(
                &old_lines, &new_lines, old_idx, old_anchor, new_idx, new_anchor,
            ));
        }

        old_idx = (old_anchor + 1).min(old_lines.len());
        new_idx = (new_anchor + 1).min(new_lines.len());
    }

    if old_idx < old_lines.len() || new_idx < new_lines.len() {
        blocks.push(ChangeBlock::from_ranges(
            &old_lines,
            &new_lines,
            old_idx,
            old_lines.len(),
            new_idx,
            new_lines.len(),
        ));
    }

    blocks
}

/// Check if content appears to be binary
pub fn is_binary_content(content: &[u8]) -> bool {
    // Simple heuristic: check for null bytes in first 8KB
    let check_len = content.len().min(8192);
    content[..check_len].contains(&0)
}

/// Diff two raw snapshot bodies
///
/// Binary bodies are flagged and not line-diffed. Text is decoded lossily.
pub fn diff_contents(old: &[u8], new: &[u8]) -> DetailedDiff {
    if is_binary_content(old) || is_binary_content(new) {
        return DetailedDiff {
            is_binary: true,
            ..Default::default()
        };
    }

    let old_text = String::from_utf8_lossy(old);
    let new_text = String::from_utf8_lossy(new);

    DetailedDiff {
        stats: compute_diff_stats(&old_text, &new_text),
        blocks: compute_detailed_diff(&old_text, &new_text),
        is_binary: false,
    }
}
