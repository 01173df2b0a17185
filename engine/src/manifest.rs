//! Manifest model: the persisted record of one checkpoint.
//!
//! This module defines:
//! - FileEntry: one backed-up file or directory
//! - Manifest: a checkpoint's inventory plus its state flags
//!
//! A manifest is written once at creation and rewritten in place by every
//! tag, note, rollback or compression change.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// File name of the manifest inside a checkpoint directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// One entry of a checkpoint's file inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Absolute path the content was taken from
    pub original_path: PathBuf,

    /// Absolute path of the copy inside the checkpoint's own tree
    pub backup_path: PathBuf,

    /// Permission bits at backup time
    pub mode: u32,

    /// Size in bytes, 0 for directories
    pub size: u64,

    #[serde(default)]
    pub is_dir: bool,
}

/// The serializable record of one checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Unique, immutable checkpoint identifier
    pub id: String,

    /// Grouping key of the shell session that created the checkpoint
    #[serde(default)]
    pub session_id: String,

    pub timestamp: DateTime<Utc>,

    /// Free-text description of the triggering operation
    pub command: String,

    /// Working directory the targets were resolved against
    pub working_dir: PathBuf,

    #[serde(default)]
    pub files: Vec<FileEntry>,

    /// Set only by a full rollback
    #[serde(default)]
    pub rolled_back: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note: String,

    /// True when the backup tree lives in a single archive
    #[serde(default)]
    pub compressed: bool,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub compressed_size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_at: Option<DateTime<Utc>>,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl Manifest {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        command: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Manifest {
            id: id.into(),
            session_id: session_id.into(),
            timestamp,
            command: command.into(),
            working_dir: working_dir.into(),
            files: Vec::new(),
            rolled_back: false,
            tags: Vec::new(),
            note: String::new(),
            compressed: false,
            compressed_size: 0,
            compressed_at: None,
        }
    }

    pub fn add_file(&mut self, entry: FileEntry) {
        self.files.push(entry);
    }

    /// Entries that carry content (everything except directories).
    pub fn regular_files(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.iter().filter(|f| !f.is_dir)
    }

    /// Number of non-directory entries.
    pub fn file_count(&self) -> usize {
        self.regular_files().count()
    }

    /// Sum of recorded sizes.
    pub fn total_size(&self) -> u64 {
        self.regular_files().map(|f| f.size).sum()
    }

    /// Case-insensitive tag lookup.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Add a tag unless an equal one (ignoring case) is present.
    ///
    /// Returns true if the tag list changed.
    pub fn add_tag(&mut self, tag: &str) -> bool {
        let tag = tag.trim();
        if tag.is_empty() || self.has_tag(tag) {
            return false;
        }
        self.tags.push(tag.to_string());
        true
    }

    /// Remove every tag equal to `tag` ignoring case.
    ///
    /// Returns true if the tag list changed.
    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let before = self.tags.len();
        self.tags.retain(|t| !t.eq_ignore_ascii_case(tag.trim()));
        self.tags.len() != before
    }

    /// Persist to `<dir>/manifest.json`.
    ///
    /// The document is written to a sibling file and renamed into place so a
    /// crash never leaves a truncated manifest behind.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let data = serde_json::to_vec_pretty(self).map_err(|e| EngineError::CorruptManifest {
            path: path.clone(),
            source: e,
        })?;

        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
        fs::write(&tmp, data).map_err(|e| EngineError::WriteError {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| EngineError::WriteError { path, source: e })
    }

    /// Load `<dir>/manifest.json`.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let data = fs::read(&path).map_err(|e| EngineError::ReadError {
            path: path.clone(),
            source: e,
        })?;
        serde_json::from_slice(&data).map_err(|e| EngineError::CorruptManifest { path, source: e })
    }

    /// True if `dir` holds a manifest file, readable or not.
    pub fn exists_in(dir: &Path) -> bool {
        match fs::metadata(dir.join(MANIFEST_FILE)) {
            Ok(m) => m.is_file(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(_) => true,
        }
    }
}
