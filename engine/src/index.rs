//! Checkpoint index: a persisted summary of every checkpoint.
//!
//! - Lets `list`/`get_latest` run without parsing every manifest
//! - Entries carry a monotonic `sequence` that orders checkpoints sharing a timestamp
//! - Every mutation writes through to `<root>/.index.json` immediately
//! - Any divergence from the checkpoint directories on disk triggers a full
//!   rebuild from manifests, never an incremental patch
//!
//! The index is an ordinary value guarded by one `RwLock`; callers construct
//! it explicitly and hand it to the store.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint;
use crate::error::{EngineError, Result};
use crate::manifest::Manifest;

/// File name of the index document inside the state root.
pub const INDEX_FILE: &str = ".index.json";

/// Lightweight projection of a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub command: String,
    pub file_count: usize,
    pub total_size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub rolled_back: bool,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub compressed_size: u64,
}

impl IndexEntry {
    pub fn from_manifest(manifest: &Manifest, sequence: u64) -> Self {
        IndexEntry {
            id: manifest.id.clone(),
            timestamp: manifest.timestamp,
            sequence,
            command: manifest.command.clone(),
            file_count: manifest.file_count(),
            total_size: manifest.total_size(),
            session_id: manifest.session_id.clone(),
            tags: manifest.tags.clone(),
            rolled_back: manifest.rolled_back,
            compressed: manifest.compressed,
            compressed_size: manifest.compressed_size,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexState {
    entries: HashMap<String, IndexEntry>,
    next_sequence: u64,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// Persisted, lock-guarded cache of checkpoint summaries.
#[derive(Debug)]
pub struct CheckpointIndex {
    root: PathBuf,
    path: PathBuf,
    state: RwLock<IndexState>,
}

impl CheckpointIndex {
    /// Load the index for the store at `root`, rebuilding it if the document
    /// is missing, unreadable, or disagrees with the directories on disk.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(INDEX_FILE);
        let index = CheckpointIndex {
            root: root.to_path_buf(),
            path: path.clone(),
            state: RwLock::new(IndexState::default()),
        };

        match read_document(&path) {
            Ok(state) => {
                let on_disk = index.on_disk_ids()?;
                if index.agrees_with_disk(&state, &on_disk) {
                    *index.write() = state;
                    return Ok(index);
                }
                tracing::warn!(
                    indexed = state.entries.len(),
                    on_disk = on_disk.len(),
                    "index disagrees with checkpoint directories, rebuilding"
                );
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(path = %path.display(), "no index yet, building");
            }
            Err(e) => {
                tracing::warn!(error = %e, "index unreadable, rebuilding");
            }
        }

        index.rebuild()?;
        Ok(index)
    }

    /// Rescan every manifest and reassign sequences by `(timestamp, id)`.
    pub fn rebuild(&self) -> Result<()> {
        let mut manifests: Vec<Manifest> = checkpoint::scan(&self.root)?
            .into_iter()
            .map(|cp| cp.manifest)
            .collect();
        manifests.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        let mut state = self.write();
        state.entries = manifests
            .iter()
            .enumerate()
            .map(|(seq, m)| (m.id.clone(), IndexEntry::from_manifest(m, seq as u64)))
            .collect();
        state.next_sequence = manifests.len() as u64;
        tracing::debug!(entries = state.entries.len(), "index rebuilt");
        self.persist(&mut state)
    }

    /// Register a new checkpoint with the next sequence number.
    ///
    /// Re-adding a known id behaves like `update`.
    pub fn add(&self, manifest: &Manifest) -> Result<()> {
        let mut state = self.write();
        let sequence = match state.entries.get(&manifest.id) {
            Some(existing) => existing.sequence,
            None => {
                let seq = state.next_sequence;
                state.next_sequence += 1;
                seq
            }
        };
        state
            .entries
            .insert(manifest.id.clone(), IndexEntry::from_manifest(manifest, sequence));
        self.persist(&mut state)
    }

    /// Refresh an entry's projection, keeping its sequence.
    pub fn update(&self, manifest: &Manifest) -> Result<()> {
        self.add(manifest)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.write();
        if state.entries.remove(id).is_none() {
            return Ok(());
        }
        self.persist(&mut state)
    }

    pub fn get(&self, id: &str) -> Option<IndexEntry> {
        self.read().entries.get(id).cloned()
    }

    /// All entries, newest first: `(timestamp desc, sequence desc)`.
    pub fn list_entries(&self) -> Vec<IndexEntry> {
        let mut entries: Vec<IndexEntry> = self.read().entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });
        entries
    }

    /// The newest entry, if any.
    pub fn latest(&self) -> Option<IndexEntry> {
        self.read()
            .entries
            .values()
            .max_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| a.sequence.cmp(&b.sequence))
            })
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time of the last persisted mutation.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.read().updated_at
    }

    /// Ids of checkpoint directories that hold a manifest.
    fn on_disk_ids(&self) -> Result<Vec<String>> {
        Ok(checkpoint::checkpoint_dirs(&self.root)?
            .into_iter()
            .filter(|dir| Manifest::exists_in(dir))
            .filter_map(|dir| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect())
    }

    /// True when every indexed id has a directory and every directory the
    /// index lacks holds a manifest that cannot be loaded. A rebuild skips
    /// unreadable manifests, so they must not count as divergence.
    fn agrees_with_disk(&self, state: &IndexState, on_disk: &[String]) -> bool {
        let disk: HashSet<&str> = on_disk.iter().map(String::as_str).collect();
        if state.entries.keys().any(|id| !disk.contains(id.as_str())) {
            return false;
        }

        on_disk
            .iter()
            .filter(|id| !state.entries.contains_key(id.as_str()))
            .all(|id| Manifest::load(&self.root.join(id)).is_err())
    }

    fn persist(&self, state: &mut IndexState) -> Result<()> {
        state.updated_at = Some(Utc::now());
        let data = serde_json::to_vec_pretty(&*state).map_err(|e| EngineError::CorruptIndex {
            path: self.path.clone(),
            source: e,
        })?;

        if let Err(e) = fs::create_dir_all(&self.root) {
            return Err(EngineError::DirectoryCreationFailed {
                path: self.root.clone(),
                source: e,
            });
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data).map_err(|e| EngineError::WriteError {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| EngineError::WriteError {
            path: self.path.clone(),
            source: e,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_document(path: &Path) -> Result<IndexState> {
    let data = fs::read(path).map_err(|e| EngineError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    if data.is_empty() {
        return Err(EngineError::ReadError {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "empty index"),
        });
    }
    serde_json::from_slice(&data).map_err(|e| EngineError::CorruptIndex {
        path: path.to_path_buf(),
        source: e,
    })
}
