//! Rollback engine: copying backed-up content back out of a checkpoint.
//!
//! A checkpoint moves from active to rolled back only through a full
//! `rollback`; selective and alternate-location restores leave it active.
//! Every variant processes all selected files, counting failures instead of
//! stopping, and reports `PartialRestore` afterwards if any file failed.
//! Successfully restored files are never undone.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::checkpoint::Checkpoint;
use crate::classify::normalize;
use crate::error::{EngineError, Result};
use crate::fs_ops;
use crate::manifest::FileEntry;
use crate::progress::RestoreProgress;
use crate::store::CheckpointStore;

/// A file that could not be restored.
#[derive(Debug, Clone)]
pub struct RestoreFailure {
    pub path: PathBuf,
    pub message: String,
}

/// What a restore pass did.
#[derive(Debug, Default, Clone)]
pub struct RestoreReport {
    pub restored: usize,
    pub failed: Vec<RestoreFailure>,
    pub bytes_restored: u64,
    /// Alternate root the files were written under, if any
    pub destination: Option<PathBuf>,
    /// Requested paths that matched nothing in the manifest
    pub unmatched: Vec<PathBuf>,
    /// True when this pass moved the checkpoint to rolled back
    pub marked_rolled_back: bool,
}

impl RestoreReport {
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn into_result(self) -> Result<Self> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(EngineError::PartialRestore {
                restored: self.restored,
                failed: self.failed.len(),
            })
        }
    }
}

/// Which manifest entries a pass restores.
enum Selection {
    All,
    Paths(Vec<PathBuf>),
}

/// Restore every file of `checkpoint` to its original location and mark the
/// checkpoint rolled back.
///
/// The checkpoint is marked even when some files fail, so it cannot be rolled
/// back twice over a half-restored tree.
pub fn rollback(
    store: &CheckpointStore,
    checkpoint: &mut Checkpoint,
    progress: Option<&dyn RestoreProgress>,
) -> Result<RestoreReport> {
    reject_rolled_back(checkpoint)?;
    store.ensure_decompressed(checkpoint)?;

    let mut report = restore(checkpoint, &Selection::All, None, progress);

    checkpoint.manifest.rolled_back = true;
    store.save(checkpoint)?;
    report.marked_rolled_back = true;

    tracing::info!(
        id = %checkpoint.id,
        restored = report.restored,
        failed = report.failed_count(),
        "checkpoint rolled back"
    );
    report.into_result()
}

/// Restore only the listed original paths.
///
/// Relative paths are resolved against the checkpoint's working directory. A
/// path naming a recorded directory selects every file below it.
pub fn rollback_selective<P: AsRef<Path>>(
    store: &CheckpointStore,
    checkpoint: &mut Checkpoint,
    paths: &[P],
    progress: Option<&dyn RestoreProgress>,
) -> Result<RestoreReport> {
    reject_rolled_back(checkpoint)?;
    store.ensure_decompressed(checkpoint)?;

    let selection = Selection::Paths(resolve_selection(checkpoint, paths));
    let report = restore(checkpoint, &selection, None, progress);
    tracing::info!(
        id = %checkpoint.id,
        restored = report.restored,
        failed = report.failed_count(),
        "selective restore finished"
    );
    report.into_result()
}

/// Restore every file under `dest_root` instead of its original location.
pub fn rollback_to_path(
    store: &CheckpointStore,
    checkpoint: &mut Checkpoint,
    dest_root: &Path,
    progress: Option<&dyn RestoreProgress>,
) -> Result<RestoreReport> {
    store.ensure_decompressed(checkpoint)?;

    let report = restore(checkpoint, &Selection::All, Some(dest_root), progress);
    tracing::info!(
        id = %checkpoint.id,
        destination = %dest_root.display(),
        restored = report.restored,
        failed = report.failed_count(),
        "restore to path finished"
    );
    report.into_result()
}

/// Restore the listed original paths under `dest_root`.
pub fn rollback_selective_to_path<P: AsRef<Path>>(
    store: &CheckpointStore,
    checkpoint: &mut Checkpoint,
    paths: &[P],
    dest_root: &Path,
    progress: Option<&dyn RestoreProgress>,
) -> Result<RestoreReport> {
    store.ensure_decompressed(checkpoint)?;

    let selection = Selection::Paths(resolve_selection(checkpoint, paths));
    let report = restore(checkpoint, &selection, Some(dest_root), progress);
    report.into_result()
}

/// Full rollback of the checkpoint with the given id.
pub fn rollback_by_id(
    store: &CheckpointStore,
    id: &str,
    progress: Option<&dyn RestoreProgress>,
) -> Result<RestoreReport> {
    let mut checkpoint = store.get(id)?;
    rollback(store, &mut checkpoint, progress)
}

/// Full rollback of the most recent checkpoint.
pub fn rollback_latest(
    store: &CheckpointStore,
    progress: Option<&dyn RestoreProgress>,
) -> Result<RestoreReport> {
    let mut checkpoint = store.get_latest()?;
    rollback(store, &mut checkpoint, progress)
}

fn reject_rolled_back(checkpoint: &Checkpoint) -> Result<()> {
    if checkpoint.is_rolled_back() {
        return Err(EngineError::AlreadyRolledBack {
            id: checkpoint.id.clone(),
        });
    }
    Ok(())
}

fn resolve_selection<P: AsRef<Path>>(checkpoint: &Checkpoint, paths: &[P]) -> Vec<PathBuf> {
    paths
        .iter()
        .map(|p| {
            let p = p.as_ref();
            if p.is_absolute() {
                normalize(p)
            } else {
                normalize(&checkpoint.manifest.working_dir.join(p))
            }
        })
        .collect()
}

/// Where `entry` lands when restoring under `dest_root`.
///
/// Paths inside the recorded working directory keep their relative layout;
/// anything else is placed by base name.
pub fn destination_for(entry: &FileEntry, working_dir: &Path, dest_root: Option<&Path>) -> PathBuf {
    let root = match dest_root {
        Some(root) => root,
        None => return entry.original_path.clone(),
    };

    match entry.original_path.strip_prefix(working_dir) {
        Ok(rel) if !rel.as_os_str().is_empty() => root.join(rel),
        _ => match entry.original_path.file_name() {
            Some(name) => root.join(name),
            None => root.to_path_buf(),
        },
    }
}

fn restore(
    checkpoint: &Checkpoint,
    selection: &Selection,
    dest_root: Option<&Path>,
    progress: Option<&dyn RestoreProgress>,
) -> RestoreReport {
    let manifest = &checkpoint.manifest;
    let mut report = RestoreReport {
        destination: dest_root.map(Path::to_path_buf),
        ..RestoreReport::default()
    };

    let mut matched: HashSet<&Path> = HashSet::new();
    let selected: Vec<&FileEntry> = manifest
        .files
        .iter()
        .filter(|entry| match selection {
            Selection::All => true,
            Selection::Paths(paths) => match paths.iter().find(|p| entry.original_path.starts_with(p)) {
                Some(p) => {
                    matched.insert(p.as_path());
                    true
                }
                None => false,
            },
        })
        .collect();

    if let Selection::Paths(paths) = selection {
        report.unmatched = paths
            .iter()
            .filter(|p| !matched.contains(p.as_path()))
            .cloned()
            .collect();
        for path in &report.unmatched {
            tracing::warn!(path = %path.display(), "path not recorded in checkpoint");
        }
    }

    let total = selected.iter().filter(|e| !e.is_dir).count();
    if let Some(p) = progress {
        p.on_restore_started(checkpoint, total);
    }

    for entry in &selected {
        let dest = destination_for(entry, &manifest.working_dir, dest_root);

        if entry.is_dir {
            // recreate empty directories; not counted as restored files
            if let Err(e) = std::fs::create_dir_all(&dest) {
                tracing::debug!(path = %dest.display(), error = %e, "failed to recreate directory");
            }
            continue;
        }

        match restore_entry(entry, &dest) {
            Ok(bytes) => {
                report.restored += 1;
                report.bytes_restored += bytes;
                if let Some(p) = progress {
                    p.on_file_restored(&entry.original_path, &dest, bytes);
                }
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(path = %entry.original_path.display(), error = %message, "failed to restore file");
                if let Some(p) = progress {
                    p.on_file_failed(&entry.original_path, &message);
                }
                report.failed.push(RestoreFailure {
                    path: entry.original_path.clone(),
                    message,
                });
            }
        }
    }

    if let Some(p) = progress {
        p.on_restore_completed(checkpoint, &report);
    }
    report
}

fn restore_entry(entry: &FileEntry, dest: &Path) -> Result<u64> {
    if !entry.backup_path.is_file() {
        return Err(EngineError::BackupMissing {
            path: entry.backup_path.clone(),
        });
    }

    let bytes = fs_ops::restore_file(&entry.backup_path, dest)?;
    apply_recorded_mode(dest, entry.mode);
    Ok(bytes)
}

/// Reapply the recorded mode. The content is already in place, so a failure
/// only warns and the file still counts as restored.
fn apply_recorded_mode(dest: &Path, mode: u32) -> bool {
    match fs_ops::set_file_mode(dest, mode) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(path = %dest.display(), error = %e, "restored file but could not set mode");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf, CheckpointStore) {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let work = temp.path().join("work");
        fs::create_dir_all(&work).expect("Failed to create work dir");
        let store = CheckpointStore::open(temp.path().join("state"), Config::default())
            .expect("Failed to open store");
        (temp, work, store)
    }

    fn write(path: &Path, contents: &str) {
        fs_ops::ensure_parent_dir_exists(path).expect("Failed to create parent");
        fs::write(path, contents).expect("Failed to write file");
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl RestoreProgress for Recorder {
        fn on_restore_started(&self, _: &Checkpoint, total: usize) {
            self.events.lock().unwrap().push(format!("start {}", total));
        }

        fn on_file_restored(&self, original: &Path, _: &Path, _: u64) {
            let name = original.file_name().unwrap().to_string_lossy().into_owned();
            self.events.lock().unwrap().push(format!("ok {}", name));
        }

        fn on_file_failed(&self, original: &Path, _: &str) {
            let name = original.file_name().unwrap().to_string_lossy().into_owned();
            self.events.lock().unwrap().push(format!("fail {}", name));
        }

        fn on_restore_completed(&self, _: &Checkpoint, report: &RestoreReport) {
            self.events.lock().unwrap().push(format!("done {}", report.restored));
        }
    }

    #[test]
    fn test_rollback_deleted_file() {
        let (_temp, work, store) = setup();
        let file = work.join("important.txt");
        write(&file, "precious");
        let (mut cp, _) = store.create_from(&work, "rm important.txt", &["important.txt"]).expect("create");

        fs::remove_file(&file).expect("remove");
        let report = rollback(&store, &mut cp, None).expect("Failed to roll back");

        assert_eq!(report.restored, 1);
        assert_eq!(report.bytes_restored, 8);
        assert!(report.marked_rolled_back);
        assert_eq!(fs::read_to_string(&file).expect("read"), "precious");
        assert!(store.get(&cp.id).expect("get").is_rolled_back());
        assert!(store.index().get(&cp.id).unwrap().rolled_back);
    }

    #[test]
    fn test_rollback_overwritten_copy() {
        let (_temp, work, store) = setup();
        let file = work.join("config.toml");
        write(&file, "original = true");
        let (mut cp, _) = store.create_from(&work, "mv other config.toml", &["config.toml"]).expect("create");

        // a rename over the file leaves the hard-linked backup intact
        let replacement = work.join("other");
        write(&replacement, "replacement");
        fs::rename(&replacement, &file).expect("rename");

        rollback(&store, &mut cp, None).expect("Failed to roll back");
        assert_eq!(fs::read_to_string(&file).expect("read"), "original = true");
    }

    #[test]
    fn test_second_rollback_rejected() {
        let (_temp, work, store) = setup();
        write(&work.join("a"), "a");
        let (mut cp, _) = store.create_from(&work, "rm a", &["a"]).expect("create");

        rollback(&store, &mut cp, None).expect("first rollback");
        let err = rollback(&store, &mut cp, None).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRolledBack { .. }));

        let err = rollback_by_id(&store, &cp.id, None).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRolledBack { .. }));
    }

    #[test]
    fn test_partial_failure_keeps_restored_files() {
        let (_temp, work, store) = setup();
        write(&work.join("dir").join("a.txt"), "a");
        write(&work.join("dir").join("b.txt"), "b");
        let (mut cp, _) = store.create_from(&work, "rm -rf dir", &["dir"]).expect("create");

        fs::remove_dir_all(work.join("dir")).expect("remove");
        let lost = cp
            .manifest
            .regular_files()
            .find(|e| e.original_path.ends_with("b.txt"))
            .unwrap()
            .backup_path
            .clone();
        fs::remove_file(&lost).expect("remove backup");

        let recorder = Recorder::default();
        let err = rollback(&store, &mut cp, Some(&recorder)).unwrap_err();
        assert!(matches!(err, EngineError::PartialRestore { restored: 1, failed: 1 }));
        assert_eq!(fs::read_to_string(work.join("dir").join("a.txt")).expect("read"), "a");
        assert!(!work.join("dir").join("b.txt").exists());
        assert!(store.get(&cp.id).expect("get").is_rolled_back());

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.first().map(String::as_str), Some("start 2"));
        assert!(events.contains(&"ok a.txt".to_string()));
        assert!(events.contains(&"fail b.txt".to_string()));
        assert_eq!(events.last().map(String::as_str), Some("done 1"));
    }

    #[test]
    fn test_selective_restore_does_not_mark() {
        let (_temp, work, store) = setup();
        write(&work.join("a.txt"), "a");
        write(&work.join("b.txt"), "b");
        let (mut cp, _) = store
            .create_from(&work, "rm a.txt b.txt", &["a.txt", "b.txt"])
            .expect("create");
        fs::remove_file(work.join("a.txt")).expect("remove");
        fs::remove_file(work.join("b.txt")).expect("remove");

        let report = rollback_selective(&store, &mut cp, &["a.txt", "missing.txt"], None)
            .expect("Failed to restore selectively");

        assert_eq!(report.restored, 1);
        assert_eq!(report.unmatched, vec![work.join("missing.txt")]);
        assert!(!report.marked_rolled_back);
        assert!(work.join("a.txt").exists());
        assert!(!work.join("b.txt").exists());
        assert!(!store.get(&cp.id).expect("get").is_rolled_back());

        // a full rollback is still possible afterwards
        rollback(&store, &mut cp, None).expect("full rollback");
        assert!(work.join("b.txt").exists());
    }

    #[test]
    fn test_selective_by_directory() {
        let (_temp, work, store) = setup();
        write(&work.join("src").join("a.rs"), "a");
        write(&work.join("src").join("sub").join("b.rs"), "b");
        write(&work.join("docs").join("c.md"), "c");
        let (mut cp, _) = store
            .create_from(&work, "rm -rf src docs", &["src", "docs"])
            .expect("create");
        fs::remove_dir_all(work.join("src")).expect("remove");
        fs::remove_dir_all(work.join("docs")).expect("remove");

        let report = rollback_selective(&store, &mut cp, &[work.join("src")], None).expect("restore");
        assert_eq!(report.restored, 2);
        assert!(work.join("src").join("sub").join("b.rs").exists());
        assert!(!work.join("docs").exists());
    }

    #[test]
    fn test_rollback_to_path_relativizes() {
        let (temp, work, store) = setup();
        write(&work.join("app").join("main.rs"), "fn main() {}");
        let outside = temp.path().join("elsewhere.txt");
        write(&outside, "outside");
        let (mut cp, _) = store
            .create_from(&work, "rm -rf app", &[work.join("app"), outside.clone()])
            .expect("create");

        let dest = temp.path().join("recovered");
        let report = rollback_to_path(&store, &mut cp, &dest, None).expect("Failed to restore");

        assert_eq!(report.restored, 2);
        assert_eq!(report.destination.as_deref(), Some(dest.as_path()));
        assert!(dest.join("app").join("main.rs").exists());
        assert!(dest.join("elsewhere.txt").exists());
        assert!(!store.get(&cp.id).expect("get").is_rolled_back());
    }

    #[test]
    fn test_rollback_selective_to_path() {
        let (temp, work, store) = setup();
        write(&work.join("a.txt"), "a");
        write(&work.join("b.txt"), "b");
        let (mut cp, _) = store
            .create_from(&work, "rm a.txt b.txt", &["a.txt", "b.txt"])
            .expect("create");

        let dest = temp.path().join("out");
        let report = rollback_selective_to_path(&store, &mut cp, &["b.txt"], &dest, None).expect("restore");
        assert_eq!(report.restored, 1);
        assert!(dest.join("b.txt").exists());
        assert!(!dest.join("a.txt").exists());
    }

    #[test]
    fn test_rollback_compressed_checkpoint() {
        let (_temp, work, store) = setup();
        write(&work.join("data.csv"), &"1,2,3\n".repeat(500));
        let (cp, _) = store.create_from(&work, "rm data.csv", &["data.csv"]).expect("create");
        store.compress(&cp.id).expect("compress");
        fs::remove_file(work.join("data.csv")).expect("remove");

        let report = rollback_latest(&store, None).expect("Failed to roll back");
        assert_eq!(report.restored, 1);
        assert_eq!(
            fs::read_to_string(work.join("data.csv")).expect("read"),
            "1,2,3\n".repeat(500)
        );
        let after = store.get(&cp.id).expect("get");
        assert!(after.is_rolled_back());
        assert!(!after.is_compressed());
    }

    #[cfg(unix)]
    #[test]
    fn test_rollback_restores_mode() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp, work, store) = setup();
        let script = work.join("deploy.sh");
        write(&script, "#!/bin/sh\n");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o751)).expect("chmod");
        let (mut cp, _) = store.create_from(&work, "rm deploy.sh", &["deploy.sh"]).expect("create");

        fs::remove_file(&script).expect("remove");
        rollback(&store, &mut cp, None).expect("rollback");

        let mode = fs::metadata(&script).expect("stat").permissions().mode() & 0o7777;
        assert_eq!(mode, 0o751);
    }

    #[test]
    fn test_mode_failure_is_not_a_restore_failure() {
        let (temp, work, store) = setup();
        let file = work.join("a.txt");
        write(&file, "content");
        let (cp, _) = store.create_from(&work, "rm a.txt", &["a.txt"]).expect("create");
        fs::remove_file(&file).expect("remove");

        let entry = &cp.manifest.files[0];
        assert_eq!(restore_entry(entry, &file).expect("restore"), 7);
        assert!(apply_recorded_mode(&file, entry.mode));

        // a vanished file is the portable way to make chmod fail
        let gone = temp.path().join("gone.txt");
        assert!(!apply_recorded_mode(&gone, 0o644));
    }

    #[test]
    fn test_destination_for() {
        let entry = FileEntry {
            original_path: PathBuf::from("/home/u/proj/src/lib.rs"),
            backup_path: PathBuf::from("/s/x/files/home/u/proj/src/lib.rs"),
            mode: 0o644,
            size: 1,
            is_dir: false,
        };
        let wd = Path::new("/home/u/proj");
        assert_eq!(destination_for(&entry, wd, None), entry.original_path);
        assert_eq!(
            destination_for(&entry, wd, Some(Path::new("/r"))),
            PathBuf::from("/r/src/lib.rs")
        );
        assert_eq!(
            destination_for(&entry, Path::new("/other"), Some(Path::new("/r"))),
            PathBuf::from("/r/lib.rs")
        );
    }
}
