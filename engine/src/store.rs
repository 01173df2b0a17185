//! Checkpoint store: creation, lookup and maintenance of checkpoints.
//!
//! This module orchestrates the lower layers:
//! - Targets are validated, classified and handed to the backup engine
//! - The manifest is the durable record of success; the index is updated after it
//! - Lookups by recency go through the index, everything else reads manifests
//! - Batch operations (`clean`, `compress_older_than`) log and skip per-checkpoint failures

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};

use crate::checkpoint::{self, backup_path_for, generate_id, session_id, validate_id, Checkpoint, FILES_DIR};
use crate::classify::{normalize, validate_path, PathClassifier};
use crate::compression::{self, ArchiveStats};
use crate::config::Config;
use crate::error::{EngineError, ErrorKind, Result};
use crate::fs_ops::{self, file_mode, BackupMethod};
use crate::index::CheckpointIndex;
use crate::manifest::{FileEntry, Manifest};

const MAX_ID_ATTEMPTS: usize = 8;

/// Per-target outcome of a checkpoint creation.
#[derive(Debug, Default, Clone)]
pub struct BackupReport {
    /// Files backed up as hard links
    pub linked: usize,
    /// Files backed up by copying
    pub copied: usize,
    /// Targets that did not exist
    pub missing: Vec<PathBuf>,
    /// Symlinks and special files left out
    pub skipped: Vec<PathBuf>,
    /// Files above the size ceiling, with their size
    pub oversized: Vec<(PathBuf, u64)>,
    /// Backed-up files matching a sensitive pattern, with the pattern
    pub sensitive: Vec<(PathBuf, String)>,
    /// Files or targets that could not be backed up
    pub failed: Vec<(PathBuf, String)>,
    /// Set when the store is above its configured size ceiling
    pub storage_warning: Option<StorageWarning>,
}

impl BackupReport {
    pub fn backed_up(&self) -> usize {
        self.linked + self.copied
    }

    fn record(&mut self, method: BackupMethod) {
        match method {
            BackupMethod::HardLink => self.linked += 1,
            BackupMethod::Copy => self.copied += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageWarning {
    pub used: u64,
    pub limit: u64,
}

/// Criteria for `CheckpointStore::search`. Every provided criterion must match.
#[derive(Debug, Default, Clone)]
pub struct SearchOptions {
    /// Exact tag, ignoring case
    pub tag: Option<String>,
    /// Substring of the command, ignoring case
    pub command: Option<String>,
    /// Substring of any recorded original path, ignoring case
    pub file: Option<String>,
    /// Created at or after
    pub since: Option<DateTime<Utc>>,
    /// Created at or before
    pub until: Option<DateTime<Utc>>,
}

impl SearchOptions {
    pub fn matches(&self, manifest: &Manifest) -> bool {
        if let Some(tag) = &self.tag {
            if !manifest.has_tag(tag) {
                return false;
            }
        }

        if let Some(command) = &self.command {
            if !manifest.command.to_lowercase().contains(&command.to_lowercase()) {
                return false;
            }
        }

        if let Some(file) = &self.file {
            let needle = file.to_lowercase();
            let found = manifest
                .files
                .iter()
                .any(|f| f.original_path.to_string_lossy().to_lowercase().contains(&needle));
            if !found {
                return false;
            }
        }

        if self.since.is_some_and(|since| manifest.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| manifest.timestamp > until) {
            return false;
        }

        true
    }
}

/// Outcome of `compress_older_than`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchCompression {
    pub compressed: usize,
    pub bytes_saved: u64,
}

/// Summary over the whole store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub checkpoints: usize,
    pub files: usize,
    /// Sum of recorded file sizes
    pub recorded_bytes: u64,
    /// Bytes actually occupied under the store root
    pub disk_usage: u64,
    pub rolled_back: usize,
    pub compressed: usize,
}

/// Owns the state directory and every checkpoint in it.
#[derive(Debug)]
pub struct CheckpointStore {
    root: PathBuf,
    config: Config,
    classifier: PathClassifier,
    index: CheckpointIndex,
}

impl CheckpointStore {
    /// Build a store around an already loaded index.
    ///
    /// The state directory is excluded from every backup, so targets that
    /// contain it never copy checkpoints into themselves.
    pub fn new(root: impl Into<PathBuf>, config: Config, index: CheckpointIndex) -> Self {
        let root = root.into();
        let absolute = if root.is_absolute() {
            root.clone()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&root))
                .unwrap_or_else(|_| root.clone())
        };
        let mut classifier = PathClassifier::new(&config);
        classifier.exclude_subtree(&absolute);

        CheckpointStore {
            root,
            config,
            classifier,
            index,
        }
    }

    /// Create the state directory if needed, load its index and build a store.
    pub fn open(root: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| EngineError::DirectoryCreationFailed {
            path: root.clone(),
            source: e,
        })?;
        let index = CheckpointIndex::load(&root)?;
        Ok(Self::new(root, config, index))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn classifier(&self) -> &PathClassifier {
        &self.classifier
    }

    pub fn index(&self) -> &CheckpointIndex {
        &self.index
    }

    /// Snapshot `targets`, resolving relative paths against the process's
    /// current directory.
    pub fn create<P: AsRef<Path>>(&self, command: &str, targets: &[P]) -> Result<Checkpoint> {
        let working_dir = std::env::current_dir().map_err(EngineError::WorkingDir)?;
        self.create_from(&working_dir, command, targets).map(|(cp, _)| cp)
    }

    /// Snapshot `targets` with relative paths resolved against `working_dir`.
    ///
    /// Missing targets are skipped silently and per-target backup failures are
    /// only reported. Failing to create the checkpoint directory or to persist
    /// the manifest aborts the call.
    pub fn create_from<P: AsRef<Path>>(
        &self,
        working_dir: &Path,
        command: &str,
        targets: &[P],
    ) -> Result<(Checkpoint, BackupReport)> {
        let working_dir = normalize(working_dir);
        let resolved: Vec<PathBuf> = targets
            .iter()
            .map(|t| {
                let t = t.as_ref();
                if t.is_absolute() {
                    normalize(t)
                } else {
                    normalize(&working_dir.join(t))
                }
            })
            .collect();

        for path in &resolved {
            validate_path(path, &self.config)?;
        }

        let now = Utc::now();
        let (id, dir) = self.allocate_dir(now)?;
        let files_dir = dir.join(FILES_DIR);
        fs::create_dir_all(&files_dir).map_err(|e| EngineError::DirectoryCreationFailed {
            path: files_dir.clone(),
            source: e,
        })?;

        let mut manifest = Manifest::new(&id, session_id(), now, command, &working_dir);
        let mut report = BackupReport::default();
        for path in &resolved {
            self.backup_target(path, &files_dir, &mut manifest, &mut report);
        }

        if let Err(e) = manifest.save(&dir) {
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }
        if let Err(e) = self.index.add(&manifest) {
            tracing::warn!(id = %id, error = %e, "failed to update index");
        }

        report.storage_warning = self.check_storage();

        tracing::info!(
            id = %id,
            files = manifest.file_count(),
            linked = report.linked,
            copied = report.copied,
            failed = report.failed.len(),
            "checkpoint created"
        );

        let checkpoint = Checkpoint {
            id,
            dir,
            files_dir,
            manifest,
        };
        Ok((checkpoint, report))
    }

    fn allocate_dir(&self, now: DateTime<Utc>) -> Result<(String, PathBuf)> {
        fs::create_dir_all(&self.root).map_err(|e| EngineError::DirectoryCreationFailed {
            path: self.root.clone(),
            source: e,
        })?;

        let mut last_err = None;
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = generate_id(now);
            let dir = self.root.join(&id);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((id, dir)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::debug!(id = %id, "checkpoint id collision, regenerating");
                    last_err = Some((dir, e));
                }
                Err(e) => {
                    return Err(EngineError::DirectoryCreationFailed {
                        path: dir,
                        source: e,
                    })
                }
            }
        }

        let (path, source) = last_err.unwrap_or_else(|| {
            (
                self.root.clone(),
                io::Error::new(io::ErrorKind::AlreadyExists, "no free checkpoint id"),
            )
        });
        Err(EngineError::DirectoryCreationFailed { path, source })
    }

    fn backup_target(
        &self,
        path: &Path,
        files_dir: &Path,
        manifest: &mut Manifest,
        report: &mut BackupReport,
    ) {
        if self.classifier.is_in_excluded_subtree(path) {
            tracing::warn!(path = %path.display(), "target lies inside the checkpoint store, skipping");
            report.skipped.push(path.to_path_buf());
            return;
        }

        let metadata = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "target does not exist, skipping");
                report.missing.push(path.to_path_buf());
                return;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to stat target");
                report.failed.push((path.to_path_buf(), e.to_string()));
                return;
            }
        };

        let backup_path = backup_path_for(files_dir, path);

        if metadata.file_type().is_symlink() {
            tracing::debug!(path = %path.display(), "symlink target not backed up");
            report.skipped.push(path.to_path_buf());
        } else if metadata.is_dir() {
            let backup = match fs_ops::backup_dir(path, &backup_path, &self.classifier) {
                Ok(backup) => backup,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to back up directory");
                    report.failed.push((path.to_path_buf(), e.to_string()));
                    return;
                }
            };

            manifest.add_file(FileEntry {
                original_path: path.to_path_buf(),
                backup_path,
                mode: file_mode(&metadata),
                size: 0,
                is_dir: true,
            });
            for file in backup.files {
                self.flag_sensitive(&file.original_path, report);
                report.record(file.method);
                manifest.add_file(FileEntry {
                    original_path: file.original_path,
                    backup_path: file.backup_path,
                    mode: file.mode,
                    size: file.size,
                    is_dir: false,
                });
            }
            report.oversized.extend(backup.oversized);
            report.failed.extend(backup.failed);
        } else if metadata.is_file() {
            if self.classifier.exceeds_size_limit(metadata.len()) {
                tracing::warn!(
                    path = %path.display(),
                    size = metadata.len(),
                    "file exceeds size limit, not backed up"
                );
                report.oversized.push((path.to_path_buf(), metadata.len()));
                return;
            }

            self.flag_sensitive(path, report);
            match fs_ops::backup_file(path, &backup_path) {
                Ok(method) => {
                    report.record(method);
                    manifest.add_file(FileEntry {
                        original_path: path.to_path_buf(),
                        backup_path,
                        mode: file_mode(&metadata),
                        size: metadata.len(),
                        is_dir: false,
                    });
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to back up file");
                    report.failed.push((path.to_path_buf(), e.to_string()));
                }
            }
        } else {
            tracing::debug!(path = %path.display(), "special file not backed up");
            report.skipped.push(path.to_path_buf());
        }
    }

    fn flag_sensitive(&self, path: &Path, report: &mut BackupReport) {
        if let Some(pattern) = self.classifier.is_sensitive(path) {
            tracing::warn!(path = %path.display(), pattern, "backing up a sensitive file");
            report.sensitive.push((path.to_path_buf(), pattern.to_string()));
        }
    }

    fn check_storage(&self) -> Option<StorageWarning> {
        let limit = self.config.max_storage_bytes()?;
        match self.storage_usage() {
            Ok(used) if used > limit => {
                tracing::warn!(used, limit, "checkpoint storage above configured limit");
                Some(StorageWarning { used, limit })
            }
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(error = %e, "failed to measure storage");
                None
            }
        }
    }

    /// Every readable checkpoint, newest first.
    ///
    /// Unreadable manifests are skipped. Checkpoints sharing a timestamp are
    /// ordered by their index sequence.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = checkpoint::scan(&self.root)?;
        let sequence = |id: &str| self.index.get(id).map(|e| e.sequence);
        checkpoints.sort_by(|a, b| {
            b.timestamp()
                .cmp(&a.timestamp())
                .then_with(|| sequence(&b.id).cmp(&sequence(&a.id)))
        });
        Ok(checkpoints)
    }

    /// Checkpoints grouped by session; an empty session id groups as `default`.
    pub fn list_by_session(&self) -> Result<BTreeMap<String, Vec<Checkpoint>>> {
        let mut sessions: BTreeMap<String, Vec<Checkpoint>> = BTreeMap::new();
        for cp in self.list()? {
            let key = if cp.manifest.session_id.is_empty() {
                "default".to_string()
            } else {
                cp.manifest.session_id.clone()
            };
            sessions.entry(key).or_default().push(cp);
        }
        Ok(sessions)
    }

    /// Checkpoints created from the calling shell session, newest first.
    pub fn current_session(&self) -> Result<Vec<Checkpoint>> {
        let session = session_id();
        Ok(self
            .list()?
            .into_iter()
            .filter(|cp| cp.manifest.session_id == session)
            .collect())
    }

    pub fn get(&self, id: &str) -> Result<Checkpoint> {
        let dir = self.checkpoint_dir(id)?;
        Checkpoint::open(&dir).map_err(|e| match e {
            EngineError::ReadError { source, .. } if source.kind() == io::ErrorKind::NotFound => {
                EngineError::CheckpointNotFound { id: id.to_string() }
            }
            other => other,
        })
    }

    /// The most recent checkpoint according to the index.
    ///
    /// If the index points at a checkpoint that no longer exists, or is empty
    /// while checkpoints exist on disk, it is rebuilt once before giving up.
    pub fn get_latest(&self) -> Result<Checkpoint> {
        let mut rebuilt = false;
        loop {
            let found = match self.index.latest() {
                Some(entry) => match self.get(&entry.id) {
                    Ok(cp) => return Ok(cp),
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        tracing::warn!(id = %entry.id, "index entry has no checkpoint");
                        true
                    }
                    Err(e) => return Err(e),
                },
                None => !checkpoint::checkpoint_dirs(&self.root)?.is_empty(),
            };

            if !found || rebuilt {
                return Err(EngineError::NoCheckpoints);
            }
            self.index.rebuild()?;
            rebuilt = true;
        }
    }

    /// Remove a checkpoint and everything it holds.
    pub fn delete(&self, id: &str) -> Result<()> {
        let dir = self.checkpoint_dir(id)?;
        if !dir.is_dir() {
            return Err(EngineError::CheckpointNotFound { id: id.to_string() });
        }

        fs::remove_dir_all(&dir).map_err(|e| EngineError::WriteError {
            path: dir.clone(),
            source: e,
        })?;
        if let Err(e) = self.index.remove(id) {
            tracing::warn!(id, error = %e, "failed to update index");
        }
        tracing::info!(id, "checkpoint deleted");
        Ok(())
    }

    /// Delete every checkpoint created before `now - older_than`.
    ///
    /// # Returns
    /// Number of checkpoints deleted
    pub fn clean(&self, older_than: Duration) -> Result<usize> {
        let cutoff = match cutoff(older_than) {
            Some(cutoff) => cutoff,
            None => return Ok(0),
        };
        let stale: Vec<String> = self
            .list()?
            .into_iter()
            .filter(|cp| cp.timestamp() < cutoff)
            .map(|cp| cp.id)
            .collect();
        Ok(self.delete_all(&stale))
    }

    /// Delete all but the `keep` most recent checkpoints.
    pub fn clean_keep(&self, keep: usize) -> Result<usize> {
        let surplus: Vec<String> = self.list()?.into_iter().skip(keep).map(|cp| cp.id).collect();
        Ok(self.delete_all(&surplus))
    }

    fn delete_all(&self, ids: &[String]) -> usize {
        let mut deleted = 0;
        for id in ids {
            match self.delete(id) {
                Ok(()) => deleted += 1,
                Err(e) => tracing::warn!(id = %id, error = %e, "failed to delete checkpoint"),
            }
        }
        deleted
    }

    pub fn add_tag(&self, id: &str, tag: &str) -> Result<Checkpoint> {
        self.modify(id, |m| m.add_tag(tag))
    }

    pub fn remove_tag(&self, id: &str, tag: &str) -> Result<Checkpoint> {
        self.modify(id, |m| m.remove_tag(tag))
    }

    pub fn set_note(&self, id: &str, note: &str) -> Result<Checkpoint> {
        self.modify(id, |m| {
            let note = note.trim();
            if m.note == note {
                return false;
            }
            m.note = note.to_string();
            true
        })
    }

    fn modify(&self, id: &str, change: impl FnOnce(&mut Manifest) -> bool) -> Result<Checkpoint> {
        let mut cp = self.get(id)?;
        if change(&mut cp.manifest) {
            self.save(&cp)?;
        }
        Ok(cp)
    }

    /// Persist a checkpoint's manifest and refresh its index entry.
    ///
    /// Index failures are logged; the manifest is the source of truth.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        checkpoint.save()?;
        if let Err(e) = self.index.update(&checkpoint.manifest) {
            tracing::warn!(id = %checkpoint.id, error = %e, "failed to update index");
        }
        Ok(())
    }

    /// Checkpoints matching every criterion in `options`, newest first.
    pub fn search(&self, options: &SearchOptions) -> Result<Vec<Checkpoint>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|cp| options.matches(&cp.manifest))
            .collect())
    }

    /// Replace a checkpoint's backup tree with a single archive.
    pub fn compress(&self, id: &str) -> Result<ArchiveStats> {
        let mut cp = self.get(id)?;
        if cp.is_compressed() {
            return Err(EngineError::AlreadyCompressed { id: id.to_string() });
        }

        let stats = compression::compress_dir(&cp.files_dir, &cp.archive_path())?;
        cp.manifest.compressed = true;
        cp.manifest.compressed_size = stats.compressed_size;
        cp.manifest.compressed_at = Some(Utc::now());
        self.save(&cp)?;

        tracing::info!(
            id,
            original = stats.original_size,
            compressed = stats.compressed_size,
            "checkpoint compressed"
        );
        Ok(stats)
    }

    /// Restore a checkpoint's loose backup tree. A no-op when not compressed.
    pub fn decompress(&self, id: &str) -> Result<()> {
        let mut cp = self.get(id)?;
        self.ensure_decompressed(&mut cp)
    }

    /// Make `checkpoint`'s backup paths readable, extracting its archive if needed.
    ///
    /// Every reader of `backup_path` values calls this first. The manifest is
    /// reloaded from disk and the compressed flag cleared only after a
    /// successful extraction.
    pub fn ensure_decompressed(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        if !checkpoint.is_compressed() {
            return Ok(());
        }

        let archive = checkpoint.archive_path();
        if archive.exists() {
            let files = compression::decompress_dir(&archive, &checkpoint.files_dir)?;
            tracing::info!(id = %checkpoint.id, files, "checkpoint decompressed");
        } else if !checkpoint.files_dir.is_dir() {
            return Err(EngineError::BackupMissing { path: archive });
        }

        checkpoint.reload()?;
        checkpoint.manifest.compressed = false;
        checkpoint.manifest.compressed_size = 0;
        checkpoint.manifest.compressed_at = None;
        self.save(checkpoint)
    }

    /// Compress every uncompressed checkpoint created before `now - older_than`.
    pub fn compress_older_than(&self, older_than: Duration) -> Result<BatchCompression> {
        let mut batch = BatchCompression::default();
        let cutoff = match cutoff(older_than) {
            Some(cutoff) => cutoff,
            None => return Ok(batch),
        };

        for cp in self.list()? {
            if cp.is_compressed() || cp.timestamp() >= cutoff {
                continue;
            }
            match self.compress(&cp.id) {
                Ok(stats) => {
                    batch.compressed += 1;
                    batch.bytes_saved += stats.bytes_saved();
                }
                Err(e) => tracing::warn!(id = %cp.id, error = %e, "failed to compress checkpoint"),
            }
        }
        Ok(batch)
    }

    /// Bytes occupied by the whole state directory.
    pub fn storage_usage(&self) -> Result<u64> {
        fs_ops::disk_usage(&self.root)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let entries = self.index.list_entries();
        Ok(StoreStats {
            checkpoints: entries.len(),
            files: entries.iter().map(|e| e.file_count).sum(),
            recorded_bytes: entries.iter().map(|e| e.total_size).sum(),
            disk_usage: self.storage_usage()?,
            rolled_back: entries.iter().filter(|e| e.rolled_back).count(),
            compressed: entries.iter().filter(|e| e.compressed).count(),
        })
    }

    fn checkpoint_dir(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.root.join(id))
    }
}

/// `now - age`, or `None` when that lies outside the representable range
/// and therefore nothing can be older.
fn cutoff(age: Duration) -> Option<DateTime<Utc>> {
    Utc::now().checked_sub_signed(age)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        work: PathBuf,
        store: CheckpointStore,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let work = temp.path().join("work");
        fs::create_dir_all(&work).expect("Failed to create work dir");
        let store = CheckpointStore::open(temp.path().join("state"), Config::default())
            .expect("Failed to open store");
        Fixture {
            _temp: temp,
            work,
            store,
        }
    }

    fn write(path: &Path, contents: &str) {
        fs_ops::ensure_parent_dir_exists(path).expect("Failed to create parent");
        fs::write(path, contents).expect("Failed to write file");
    }

    #[test]
    fn test_create_single_file() {
        let f = fixture();
        write(&f.work.join("notes.txt"), "hello");

        let (cp, report) = f
            .store
            .create_from(&f.work, "rm notes.txt", &["notes.txt"])
            .expect("Failed to create checkpoint");

        assert_eq!(report.backed_up(), 1);
        assert_eq!(cp.manifest.files.len(), 1);
        let entry = &cp.manifest.files[0];
        assert_eq!(entry.original_path, f.work.join("notes.txt"));
        assert!(entry.backup_path.starts_with(&cp.files_dir));
        assert_eq!(fs::read_to_string(&entry.backup_path).expect("read"), "hello");
        assert_eq!(cp.manifest.command, "rm notes.txt");
        assert_eq!(cp.manifest.working_dir, f.work);
        assert!(!cp.manifest.session_id.is_empty());
        assert_eq!(f.store.index().len(), 1);
    }

    #[test]
    fn test_create_directory_records_dir_and_files() {
        let f = fixture();
        write(&f.work.join("src").join("a.rs"), "a");
        write(&f.work.join("src").join("nested").join("b.rs"), "bb");

        let (cp, _) = f
            .store
            .create_from(&f.work, "rm -rf src", &["src"])
            .expect("Failed to create checkpoint");

        assert_eq!(cp.manifest.files.iter().filter(|e| e.is_dir).count(), 1);
        assert_eq!(cp.manifest.file_count(), 2);
        assert_eq!(cp.manifest.total_size(), 3);
        for entry in cp.manifest.regular_files() {
            assert!(entry.backup_path.exists());
        }
    }

    #[test]
    fn test_state_dir_inside_target_is_not_backed_up() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let project = temp.path().join("project");
        write(&project.join("a.txt"), "a");
        write(&project.join("src").join("b.txt"), "bb");
        let state = project.join("state");
        let store = CheckpointStore::open(&state, Config::default()).expect("open");

        store.create_from(&project, "rm a.txt", &["a.txt"]).expect("create");
        let (cp, report) = store
            .create_from(&project, "rm -rf .", &["."])
            .expect("Failed to create checkpoint");

        assert!(report.failed.is_empty(), "unexpected failures: {:?}", report.failed);
        assert_eq!(cp.manifest.file_count(), 2);
        for entry in &cp.manifest.files {
            assert!(
                !entry.original_path.starts_with(&state),
                "{} is inside the store",
                entry.original_path.display()
            );
        }

        // naming the state directory itself backs up nothing
        let (cp, report) = store
            .create_from(&project, "rm -rf state", &["state"])
            .expect("Failed to create checkpoint");
        assert!(cp.manifest.files.is_empty());
        assert_eq!(report.skipped, vec![state.clone()]);
    }

    #[test]
    fn test_missing_target_is_skipped() {
        let f = fixture();
        let (cp, report) = f
            .store
            .create_from(&f.work, "rm ghost", &["ghost"])
            .expect("Failed to create checkpoint");

        assert!(cp.manifest.files.is_empty());
        assert_eq!(report.missing, vec![f.work.join("ghost")]);
        assert!(cp.dir.join("manifest.json").exists());
    }

    #[test]
    fn test_protected_target_rejected_before_any_work() {
        let f = fixture();
        let err = f
            .store
            .create_from(&f.work, "rm -rf /etc", &["/etc"])
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(f.store.list().expect("list").is_empty());
    }

    #[test]
    fn test_oversized_and_sensitive_reported() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let config = Config {
            max_file_size_mb: 1,
            ..Config::default()
        };
        let store = CheckpointStore::open(temp.path().join("state"), config).expect("open");
        let work = temp.path().join("work");
        write(&work.join(".env"), "SECRET=1");
        fs::write(work.join("huge.bin"), vec![0u8; 1024 * 1024 + 1]).expect("write");

        let (cp, report) = store
            .create_from(&work, "rm .env huge.bin", &[".env", "huge.bin"])
            .expect("Failed to create checkpoint");

        assert_eq!(cp.manifest.file_count(), 1);
        assert_eq!(report.sensitive.len(), 1);
        assert_eq!(report.sensitive[0].1, ".env");
        assert_eq!(report.oversized.len(), 1);
    }

    #[test]
    fn test_get_unknown_and_invalid_ids() {
        let f = fixture();
        assert!(matches!(
            f.store.get("2000-01-01T000000-deadbeef"),
            Err(EngineError::CheckpointNotFound { .. })
        ));
        assert!(matches!(
            f.store.get("../state"),
            Err(EngineError::InvalidCheckpointId { .. })
        ));
        assert!(matches!(
            f.store.delete("nope"),
            Err(EngineError::CheckpointNotFound { .. })
        ));
        assert!(matches!(f.store.get_latest(), Err(EngineError::NoCheckpoints)));
    }

    #[test]
    fn test_get_latest_recovers_from_stale_index() {
        let f = fixture();
        write(&f.work.join("a"), "a");
        write(&f.work.join("b"), "b");
        let (first, _) = f.store.create_from(&f.work, "rm a", &["a"]).expect("create");
        let (second, _) = f.store.create_from(&f.work, "rm b", &["b"]).expect("create");

        // removed behind the store's back
        fs::remove_dir_all(&second.dir).expect("remove");

        let latest = f.store.get_latest().expect("Failed to get latest");
        assert_eq!(latest.id, first.id);
        assert_eq!(f.store.index().len(), 1);
    }

    #[test]
    fn test_delete_updates_index() {
        let f = fixture();
        write(&f.work.join("a"), "a");
        let (cp, _) = f.store.create_from(&f.work, "rm a", &["a"]).expect("create");

        f.store.delete(&cp.id).expect("Failed to delete");
        assert!(!cp.dir.exists());
        assert!(f.store.index().is_empty());
        assert!(f.store.list().expect("list").is_empty());
    }

    #[test]
    fn test_clean_and_clean_keep() {
        let f = fixture();
        write(&f.work.join("a"), "a");
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (cp, _) = f.store.create_from(&f.work, "rm a", &["a"]).expect("create");
            ids.push(cp.id);
        }

        // age the oldest checkpoint by ten days
        let mut old = f.store.get(&ids[0]).expect("get");
        old.manifest.timestamp = Utc::now() - Duration::days(10);
        f.store.save(&old).expect("save");

        assert_eq!(f.store.clean(Duration::days(7)).expect("clean"), 1);
        assert!(f.store.get(&ids[0]).is_err());

        assert_eq!(f.store.clean_keep(1).expect("clean_keep"), 1);
        let remaining = f.store.list().expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, ids[2]);
    }

    #[test]
    fn test_unrepresentable_age_matches_nothing() {
        let f = fixture();
        write(&f.work.join("a"), "a");
        f.store.create_from(&f.work, "rm a", &["a"]).expect("create");

        let age = Duration::days(1_000_000_000);
        assert_eq!(f.store.clean(age).expect("clean"), 0);
        let batch = f.store.compress_older_than(age).expect("batch");
        assert_eq!(batch, BatchCompression::default());
        assert_eq!(f.store.list().expect("list").len(), 1);
    }

    #[test]
    fn test_tags_and_notes() {
        let f = fixture();
        write(&f.work.join("a"), "a");
        let (cp, _) = f.store.create_from(&f.work, "rm a", &["a"]).expect("create");

        f.store.add_tag(&cp.id, "Important").expect("add tag");
        f.store.add_tag(&cp.id, "important").expect("add duplicate tag");
        f.store.set_note(&cp.id, "  before refactor ").expect("set note");

        let reloaded = f.store.get(&cp.id).expect("get");
        assert_eq!(reloaded.manifest.tags, vec!["Important"]);
        assert_eq!(reloaded.manifest.note, "before refactor");
        assert_eq!(f.store.index().get(&cp.id).unwrap().tags, vec!["Important"]);

        f.store.remove_tag(&cp.id, "IMPORTANT").expect("remove tag");
        assert!(f.store.get(&cp.id).expect("get").manifest.tags.is_empty());
        assert!(f.store.index().get(&cp.id).unwrap().tags.is_empty());
    }

    #[test]
    fn test_search_requires_all_criteria() {
        let f = fixture();
        write(&f.work.join("config.yaml"), "a: 1");
        write(&f.work.join("main.rs"), "fn main() {}");
        let (yaml, _) = f
            .store
            .create_from(&f.work, "rm config.yaml", &["config.yaml"])
            .expect("create");
        let (rs, _) = f
            .store
            .create_from(&f.work, "mv main.rs old.rs", &["main.rs"])
            .expect("create");
        f.store.add_tag(&rs.id, "keep").expect("tag");

        let by_tag = f
            .store
            .search(&SearchOptions {
                tag: Some("KEEP".to_string()),
                ..SearchOptions::default()
            })
            .expect("search");
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].id, rs.id);

        let by_file = f
            .store
            .search(&SearchOptions {
                file: Some("CONFIG".to_string()),
                ..SearchOptions::default()
            })
            .expect("search");
        assert_eq!(by_file.len(), 1);
        assert_eq!(by_file[0].id, yaml.id);

        let none = f
            .store
            .search(&SearchOptions {
                command: Some("rm".to_string()),
                tag: Some("keep".to_string()),
                ..SearchOptions::default()
            })
            .expect("search");
        assert!(none.is_empty());

        let future = f
            .store
            .search(&SearchOptions {
                since: Some(Utc::now() + Duration::hours(1)),
                ..SearchOptions::default()
            })
            .expect("search");
        assert!(future.is_empty());
    }

    #[test]
    fn test_compress_and_decompress() {
        let f = fixture();
        write(&f.work.join("doc.txt"), &"lorem ipsum ".repeat(2000));
        let (cp, _) = f.store.create_from(&f.work, "rm doc.txt", &["doc.txt"]).expect("create");

        let stats = f.store.compress(&cp.id).expect("Failed to compress");
        assert!(stats.compressed_size < stats.original_size);
        let compressed = f.store.get(&cp.id).expect("get");
        assert!(compressed.is_compressed());
        assert!(compressed.manifest.compressed_at.is_some());
        assert!(!compressed.files_dir.exists());
        assert!(f.store.index().get(&cp.id).unwrap().compressed);

        assert!(matches!(
            f.store.compress(&cp.id),
            Err(EngineError::AlreadyCompressed { .. })
        ));

        f.store.decompress(&cp.id).expect("Failed to decompress");
        let restored = f.store.get(&cp.id).expect("get");
        assert!(!restored.is_compressed());
        assert_eq!(restored.manifest.compressed_size, 0);
        assert!(!restored.archive_path().exists());
        assert_eq!(
            fs::read_to_string(&restored.manifest.files[0].backup_path).expect("read"),
            "lorem ipsum ".repeat(2000)
        );

        // decompressing again is a no-op
        f.store.decompress(&cp.id).expect("second decompress");
    }

    #[test]
    fn test_compress_older_than() {
        let f = fixture();
        write(&f.work.join("a"), &"a".repeat(4096));
        let (old, _) = f.store.create_from(&f.work, "rm a", &["a"]).expect("create");
        let (fresh, _) = f.store.create_from(&f.work, "rm a", &["a"]).expect("create");

        let mut aged = f.store.get(&old.id).expect("get");
        aged.manifest.timestamp = Utc::now() - Duration::days(3);
        f.store.save(&aged).expect("save");

        let batch = f.store.compress_older_than(Duration::days(1)).expect("batch");
        assert_eq!(batch.compressed, 1);
        assert!(batch.bytes_saved > 0);
        assert!(f.store.get(&old.id).expect("get").is_compressed());
        assert!(!f.store.get(&fresh.id).expect("get").is_compressed());
    }

    #[test]
    fn test_sessions_and_stats() {
        let f = fixture();
        write(&f.work.join("a"), "abc");
        let (cp, _) = f.store.create_from(&f.work, "rm a", &["a"]).expect("create");

        let mut legacy = f.store.get(&cp.id).expect("get");
        legacy.manifest.session_id.clear();
        f.store.save(&legacy).expect("save");
        f.store.create_from(&f.work, "rm a", &["a"]).expect("create");

        let sessions = f.store.list_by_session().expect("sessions");
        assert_eq!(sessions.get("default").map(Vec::len), Some(1));
        assert_eq!(f.store.current_session().expect("current").len(), 1);

        let stats = f.store.stats().expect("stats");
        assert_eq!(stats.checkpoints, 2);
        assert_eq!(stats.files, 2);
        assert_eq!(stats.recorded_bytes, 6);
        assert!(stats.disk_usage >= 6);
        assert_eq!(stats.rolled_back, 0);
    }
}
