//! Diff engine: what a rollback would change.
//!
//! This module provides:
//! - Per-file classification (deleted / modified / unchanged) of a checkpoint
//!   against the live filesystem
//! - Line-level content diffs between a current file and its backup
//! - Binary detection and short previews for display
//!
//! Line diffs read "current → backup": `Removed` lines exist only in the
//! current file, `Inserted` lines only in the backup.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::checkpoint::Checkpoint;
use crate::checksums::files_match;
use crate::error::{EngineError, Result};
use crate::store::CheckpointStore;

/// Bytes inspected when deciding whether a file is binary.
pub const BINARY_PROBE_LEN: usize = 512;

/// Above this many lines on either side, LCS gives way to set difference.
pub const DEFAULT_LCS_LINE_LIMIT: usize = 500;

const DEFAULT_MAX_LINES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Deleted,
    Modified,
    Unchanged,
}

/// How much evidence `unchanged` requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffMode {
    /// Equal size is enough
    Fast,
    /// Equal size and equal content digest
    #[default]
    Accurate,
}

#[derive(Debug, Clone)]
pub struct DiffOptions {
    pub mode: DiffMode,
    /// Line count at which content diffs fall back to set difference
    pub lcs_line_limit: usize,
    /// Lines read per file for content diffs
    pub max_lines: usize,
}

impl Default for DiffOptions {
    fn default() -> Self {
        DiffOptions {
            mode: DiffMode::Accurate,
            lcs_line_limit: DEFAULT_LCS_LINE_LIMIT,
            max_lines: DEFAULT_MAX_LINES,
        }
    }
}

/// Classification of one recorded file.
#[derive(Debug, Clone)]
pub struct FileDiff {
    pub path: PathBuf,
    pub backup_path: PathBuf,
    pub status: FileStatus,
    pub recorded_size: u64,
    /// 0 when deleted
    pub current_size: u64,
}

/// Classification of a whole checkpoint.
#[derive(Debug, Default, Clone)]
pub struct DiffSummary {
    pub files: Vec<FileDiff>,
    pub deleted: usize,
    pub modified: usize,
    pub unchanged: usize,
    /// Recorded bytes of every deleted or modified file
    pub bytes_to_restore: u64,
}

impl DiffSummary {
    pub fn has_changes(&self) -> bool {
        self.deleted + self.modified > 0
    }

    fn push(&mut self, diff: FileDiff) {
        match diff.status {
            FileStatus::Deleted => self.deleted += 1,
            FileStatus::Modified => self.modified += 1,
            FileStatus::Unchanged => self.unchanged += 1,
        }
        if diff.status != FileStatus::Unchanged {
            self.bytes_to_restore += diff.recorded_size;
        }
        self.files.push(diff);
    }
}

/// Compare every recorded file of `checkpoint` with the live filesystem.
///
/// Accurate mode reads backup copies and therefore decompresses the
/// checkpoint first; fast mode only stats the originals.
pub fn analyze(
    store: &CheckpointStore,
    checkpoint: &mut Checkpoint,
    options: &DiffOptions,
) -> Result<DiffSummary> {
    if options.mode == DiffMode::Accurate {
        store.ensure_decompressed(checkpoint)?;
    }

    let algorithm = store.config().checksum;
    let mut summary = DiffSummary::default();

    for entry in checkpoint.manifest.regular_files() {
        let (status, current_size) = match fs::metadata(&entry.original_path) {
            Err(_) => (FileStatus::Deleted, 0),
            Ok(m) if !m.is_file() => (FileStatus::Modified, 0),
            Ok(m) if m.len() != entry.size => (FileStatus::Modified, m.len()),
            Ok(m) if options.mode == DiffMode::Fast => (FileStatus::Unchanged, m.len()),
            Ok(m) => match files_match(&entry.original_path, &entry.backup_path, algorithm) {
                Ok(true) => (FileStatus::Unchanged, m.len()),
                Ok(false) => (FileStatus::Modified, m.len()),
                Err(e) => {
                    tracing::warn!(path = %entry.original_path.display(), error = %e, "cannot compare with backup");
                    (FileStatus::Modified, m.len())
                }
            },
        };

        summary.push(FileDiff {
            path: entry.original_path.clone(),
            backup_path: entry.backup_path.clone(),
            status,
            recorded_size: entry.size,
            current_size,
        });
    }

    Ok(summary)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOp {
    /// Present only in the current file
    Removed,
    /// Present only in the backup
    Inserted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineChange {
    pub op: LineOp,
    /// 1-based line number on the side the line belongs to
    pub line_no: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentDiff {
    /// One side contains a NUL byte near the start
    Binary,
    Lines {
        changes: Vec<LineChange>,
        /// True when computed by set difference instead of LCS
        approximate: bool,
    },
}

/// Line diff of `current` against its `backup`.
pub fn content_diff(current: &Path, backup: &Path, options: &DiffOptions) -> Result<ContentDiff> {
    if is_binary_file(current)? || is_binary_file(backup)? {
        return Ok(ContentDiff::Binary);
    }

    let a = read_lines(current, options.max_lines)?;
    let b = read_lines(backup, options.max_lines)?;
    let approximate = a.len() > options.lcs_line_limit || b.len() > options.lcs_line_limit;

    Ok(ContentDiff::Lines {
        changes: compute_line_diff(&a, &b, options.lcs_line_limit),
        approximate,
    })
}

/// Diff two line sequences, choosing LCS or set difference by size.
pub fn compute_line_diff(a: &[String], b: &[String], lcs_line_limit: usize) -> Vec<LineChange> {
    if a.len() > lcs_line_limit || b.len() > lcs_line_limit {
        set_difference(a, b)
    } else {
        lcs_diff(a, b)
    }
}

/// Ordered diff from the longest common subsequence table. O(n·m).
pub fn lcs_diff(a: &[String], b: &[String]) -> Vec<LineChange> {
    let (m, n) = (a.len(), b.len());
    let mut dp = vec![vec![0u32; n + 1]; m + 1];
    for i in 1..=m {
        for j in 1..=n {
            dp[i][j] = if a[i - 1] == b[j - 1] {
                dp[i - 1][j - 1] + 1
            } else {
                dp[i - 1][j].max(dp[i][j - 1])
            };
        }
    }

    let mut changes = Vec::new();
    let (mut i, mut j) = (m, n);
    while i > 0 || j > 0 {
        if i > 0 && j > 0 && a[i - 1] == b[j - 1] {
            i -= 1;
            j -= 1;
        } else if j > 0 && (i == 0 || dp[i][j - 1] >= dp[i - 1][j]) {
            changes.push(LineChange {
                op: LineOp::Inserted,
                line_no: j,
                text: b[j - 1].clone(),
            });
            j -= 1;
        } else {
            changes.push(LineChange {
                op: LineOp::Removed,
                line_no: i,
                text: a[i - 1].clone(),
            });
            i -= 1;
        }
    }
    changes.reverse();
    changes
}

/// Unordered approximation: lines absent from the other side.
pub fn set_difference(a: &[String], b: &[String]) -> Vec<LineChange> {
    let in_a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let in_b: HashSet<&str> = b.iter().map(String::as_str).collect();

    let removed = a
        .iter()
        .enumerate()
        .filter(|(_, line)| !in_b.contains(line.as_str()))
        .map(|(i, line)| LineChange {
            op: LineOp::Removed,
            line_no: i + 1,
            text: line.clone(),
        });
    let inserted = b
        .iter()
        .enumerate()
        .filter(|(_, line)| !in_a.contains(line.as_str()))
        .map(|(i, line)| LineChange {
            op: LineOp::Inserted,
            line_no: i + 1,
            text: line.clone(),
        });

    removed.chain(inserted).collect()
}

/// True when `data` looks binary: a NUL within the first 512 bytes.
pub fn is_binary(data: &[u8]) -> bool {
    data.iter().take(BINARY_PROBE_LEN).any(|&b| b == 0)
}

pub fn is_binary_file(path: &Path) -> Result<bool> {
    let mut file = File::open(path).map_err(|e| EngineError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut buf = Vec::with_capacity(BINARY_PROBE_LEN);
    file.by_ref()
        .take(BINARY_PROBE_LEN as u64)
        .read_to_end(&mut buf)
        .map_err(|e| EngineError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
    Ok(is_binary(&buf))
}

/// The first lines of a file, for showing what a deleted file contained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preview {
    Binary,
    Text { lines: Vec<String>, truncated: bool },
}

pub fn file_preview(path: &Path, max_lines: usize) -> Result<Preview> {
    if is_binary_file(path)? {
        return Ok(Preview::Binary);
    }
    let mut lines = read_lines(path, max_lines + 1)?;
    let truncated = lines.len() > max_lines;
    lines.truncate(max_lines);
    Ok(Preview::Text { lines, truncated })
}

fn read_lines(path: &Path, max_lines: usize) -> Result<Vec<String>> {
    let data = fs::read(path).map_err(|e| EngineError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(String::from_utf8_lossy(&data)
        .lines()
        .take(max_lines)
        .map(str::to_string)
        .collect())
}
