//! Runtime checkpoint handle plus identifier and session helpers.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::manifest::Manifest;

/// Subdirectory holding the loose backup tree.
pub const FILES_DIR: &str = "files";

/// Archive replacing `files/` while a checkpoint is compressed.
pub const ARCHIVE_FILE: &str = "files.tar.gz";

/// Environment variable overriding the derived session id.
pub const SESSION_ENV: &str = "REWIND_SESSION";

/// A manifest together with its on-disk location.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub id: String,
    pub dir: PathBuf,
    pub files_dir: PathBuf,
    pub manifest: Manifest,
}

impl Checkpoint {
    /// Load the checkpoint stored in `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let manifest = Manifest::load(dir)?;
        Ok(Checkpoint {
            id: manifest.id.clone(),
            dir: dir.to_path_buf(),
            files_dir: dir.join(FILES_DIR),
            manifest,
        })
    }

    pub fn archive_path(&self) -> PathBuf {
        self.dir.join(ARCHIVE_FILE)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.manifest.timestamp
    }

    pub fn is_compressed(&self) -> bool {
        self.manifest.compressed
    }

    pub fn is_rolled_back(&self) -> bool {
        self.manifest.rolled_back
    }

    /// Write the manifest back to disk.
    pub fn save(&self) -> Result<()> {
        self.manifest.save(&self.dir)
    }

    /// Re-read the manifest from disk, discarding in-memory changes.
    pub fn reload(&mut self) -> Result<()> {
        self.manifest = Manifest::load(&self.dir)?;
        Ok(())
    }
}

/// Build a checkpoint id: local `YYYY-MM-DDTHHMMSS` plus 8 random hex chars.
pub fn generate_id(now: DateTime<Utc>) -> String {
    let stamp = now.with_timezone(&Local).format("%Y-%m-%dT%H%M%S");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", stamp, &suffix[..8])
}

/// Identifier grouping checkpoints taken from the same terminal session.
///
/// `$REWIND_SESSION` wins when set. Otherwise the id is derived from today's
/// date and the parent process id, so every command run from one shell on one
/// day shares it.
pub fn session_id() -> String {
    if let Ok(session) = std::env::var(SESSION_ENV) {
        if !session.is_empty() {
            return session;
        }
    }

    let date = Local::now().format("%Y-%m-%d");
    let digest = md5::compute(format!("{}{}", date, parent_pid()));
    format!("{:x}", digest)[..8].to_string()
}

#[cfg(unix)]
fn parent_pid() -> u32 {
    std::os::unix::process::parent_id()
}

#[cfg(not(unix))]
fn parent_pid() -> u32 {
    std::process::id()
}

/// Location of `original`'s copy inside `files_dir`, mirroring the absolute path.
pub fn backup_path_for(files_dir: &Path, original: &Path) -> PathBuf {
    let mut path = files_dir.to_path_buf();
    for component in original.components() {
        if let Component::Normal(part) = component {
            path.push(part);
        }
    }
    path
}

/// Reject ids that are not a single plain path component.
pub fn validate_id(id: &str) -> Result<()> {
    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !id.starts_with('.') => Ok(()),
        _ => Err(EngineError::InvalidCheckpointId { id: id.to_string() }),
    }
}

/// Subdirectories of `root` that may hold a checkpoint, sorted by name.
///
/// Hidden entries (the index, temp files) are ignored. A missing root yields
/// an empty list.
pub fn checkpoint_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(EngineError::ReadError {
                path: root.to_path_buf(),
                source: e,
            })
        }
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| EngineError::ReadError {
            path: root.to_path_buf(),
            source: e,
        })?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir && !hidden {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Load every readable checkpoint under `root`; unreadable ones are skipped.
pub fn scan(root: &Path) -> Result<Vec<Checkpoint>> {
    let mut checkpoints = Vec::new();
    for dir in checkpoint_dirs(root)? {
        match Checkpoint::open(&dir) {
            Ok(cp) => checkpoints.push(cp),
            Err(e) => tracing::debug!(dir = %dir.display(), error = %e, "skipping unreadable checkpoint"),
        }
    }
    Ok(checkpoints)
}
