//! Filesystem operations module.
//!
//! This module provides the low-level backup and restore primitives:
//! - Zero-copy backup through hard links, with a buffered-copy fallback
//! - Recursive directory backup driven by the path classifier
//! - Restoring a backup copy over an original location
//! - Disk usage accounting

use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use walkdir::WalkDir;

use crate::classify::{PathClassifier, SkipDecision};
use crate::error::{EngineError, Result};

const COPY_BUFFER_SIZE: usize = 32 * 1024;
const COPY_BUFFER_POOL_SIZE: usize = 4;

/// Small free-list of copy buffers.
///
/// Misses allocate a fresh buffer and returns beyond capacity are dropped, so the
/// pool never limits how many copies run.
struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
    buffer_size: usize,
}

impl BufferPool {
    const fn new(capacity: usize, buffer_size: usize) -> Self {
        BufferPool {
            buffers: Mutex::new(Vec::new()),
            capacity,
            buffer_size,
        }
    }

    fn take(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size])
    }

    fn give_back(&self, buf: Vec<u8>) {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if buffers.len() < self.capacity && buf.len() == self.buffer_size {
            buffers.push(buf);
        }
    }
}

static COPY_BUFFERS: BufferPool = BufferPool::new(COPY_BUFFER_POOL_SIZE, COPY_BUFFER_SIZE);

/// How a backup copy came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMethod {
    /// The backup is a second name for the original's data
    HardLink,
    /// The data was duplicated byte for byte
    Copy,
}

/// One regular file captured by `backup_dir`.
#[derive(Debug, Clone)]
pub struct BackedUpFile {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    pub mode: u32,
    pub size: u64,
    pub method: BackupMethod,
}

/// Everything `backup_dir` did and did not capture.
#[derive(Debug, Default)]
pub struct DirBackup {
    /// Regular files now present under the backup root
    pub files: Vec<BackedUpFile>,
    /// Files left out because they exceed the size ceiling
    pub oversized: Vec<(PathBuf, u64)>,
    /// Entries that could not be read or duplicated
    pub failed: Vec<(PathBuf, String)>,
}

/// Permission bits of a file, as recorded in manifests.
pub fn file_mode(metadata: &Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        if metadata.permissions().readonly() {
            0o444
        } else {
            0o644
        }
    }
}

/// Apply recorded permission bits to `path`.
pub fn set_file_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    let permissions = {
        use std::os::unix::fs::PermissionsExt;
        fs::Permissions::from_mode(mode)
    };
    #[cfg(not(unix))]
    let permissions = {
        let mut p = fs::metadata(path)
            .map_err(|e| EngineError::ReadError {
                path: path.to_path_buf(),
                source: e,
            })?
            .permissions();
        p.set_readonly(mode & 0o200 == 0);
        p
    };

    fs::set_permissions(path, permissions).map_err(|e| EngineError::WriteError {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Back up a single file to `dst`.
///
/// A hard link is tried first. Any link failure (different volume, filesystem
/// without link support, permissions) falls back to a buffered copy that keeps
/// the source's permission bits.
pub fn backup_file(src: &Path, dst: &Path) -> Result<BackupMethod> {
    ensure_parent_dir_exists(dst)?;

    match fs::hard_link(src, dst) {
        Ok(()) => Ok(BackupMethod::HardLink),
        Err(e) => {
            tracing::debug!(src = %src.display(), error = %e, "hard link failed, copying");
            copy_file(src, dst)?;
            Ok(BackupMethod::Copy)
        }
    }
}

/// Copy a file byte for byte, preserving permission bits and modification time.
///
/// # Returns
/// Number of bytes copied
pub fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    let read_err = |e| EngineError::ReadError {
        path: src.to_path_buf(),
        source: e,
    };
    let write_err = |e| EngineError::WriteError {
        path: dst.to_path_buf(),
        source: e,
    };

    let mut src_file = File::open(src).map_err(read_err)?;
    let src_metadata = src_file.metadata().map_err(read_err)?;
    let mode = file_mode(&src_metadata);

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    let mut dst_file = options.open(dst).map_err(write_err)?;

    let mut buf = COPY_BUFFERS.take();
    let copied = copy_with_buffer(&mut src_file, &mut dst_file, &mut buf);
    COPY_BUFFERS.give_back(buf);

    let bytes_copied = copied.map_err(|e| {
        if e.kind() == io::ErrorKind::PermissionDenied {
            write_err(e)
        } else {
            read_err(e)
        }
    })?;
    dst_file.flush().map_err(write_err)?;
    drop(dst_file);

    // umask and pre-existing files can leave different bits behind
    if let Err(e) = set_file_mode(dst, mode) {
        tracing::warn!(path = %dst.display(), error = %e, "content copied but mode not applied");
    }

    if let Ok(mtime) = src_metadata.modified() {
        let _ = filetime::set_file_mtime(dst, filetime::FileTime::from_system_time(mtime));
    }

    Ok(bytes_copied)
}

fn copy_with_buffer(src: &mut File, dst: &mut File, buf: &mut [u8]) -> io::Result<u64> {
    let mut total = 0u64;
    loop {
        let n = match src.read(buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        dst.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Recursively back up `src` into `dst`.
///
/// Every entry is passed through the classifier: skipped directories are pruned
/// without recursion, symlinks are never followed. Unreadable entries are
/// recorded and skipped; a partial backup is preferable to none.
///
/// # Errors
/// Only fails if the backup root itself cannot be created.
pub fn backup_dir(src: &Path, dst: &Path, classifier: &PathClassifier) -> Result<DirBackup> {
    fs::create_dir_all(dst).map_err(|e| EngineError::DirectoryCreationFailed {
        path: dst.to_path_buf(),
        source: e,
    })?;

    let mut result = DirBackup::default();
    let mut walker = WalkDir::new(src).follow_links(false).into_iter();

    while let Some(next) = walker.next() {
        let entry = match next {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| src.to_path_buf());
                let denied = e
                    .io_error()
                    .is_some_and(|io| io.kind() == io::ErrorKind::PermissionDenied);
                if denied {
                    tracing::debug!(path = %path.display(), "permission denied, skipping");
                } else {
                    tracing::warn!(path = %path.display(), error = %e, "failed to walk entry");
                    result.failed.push((path, e.to_string()));
                }
                continue;
            }
        };

        let path = entry.path();
        let is_dir = entry.file_type().is_dir();
        // the root was named explicitly and is always walked
        let decision = if entry.depth() == 0 {
            SkipDecision::Include
        } else {
            classifier.should_skip(path, is_dir)
        };
        if decision.skip() {
            if decision.skip_subtree() && is_dir {
                walker.skip_current_dir();
            }
            tracing::debug!(path = %path.display(), ?decision, "excluded from backup");
            continue;
        }

        let rel = match path.strip_prefix(src) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let target = dst.join(rel);

        if is_dir {
            if let Err(e) = fs::create_dir_all(&target) {
                tracing::warn!(path = %target.display(), error = %e, "failed to mirror directory");
                result.failed.push((path.to_path_buf(), e.to_string()));
                walker.skip_current_dir();
            }
            continue;
        }

        if !entry.file_type().is_file() {
            // sockets, fifos, devices
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                result.failed.push((path.to_path_buf(), e.to_string()));
                continue;
            }
        };

        if classifier.exceeds_size_limit(metadata.len()) {
            tracing::warn!(
                path = %path.display(),
                size = metadata.len(),
                "file exceeds size limit, not backed up"
            );
            result.oversized.push((path.to_path_buf(), metadata.len()));
            continue;
        }

        match backup_file(path, &target) {
            Ok(method) => result.files.push(BackedUpFile {
                original_path: path.to_path_buf(),
                backup_path: target,
                mode: file_mode(&metadata),
                size: metadata.len(),
                method,
            }),
            Err(e) => {
                let denied = matches!(
                    &e,
                    EngineError::ReadError { source, .. } if source.kind() == io::ErrorKind::PermissionDenied
                );
                if !denied {
                    tracing::warn!(path = %path.display(), error = %e, "failed to back up file");
                }
                result.failed.push((path.to_path_buf(), e.to_string()));
            }
        }
    }

    Ok(result)
}

/// Restore one backup copy to `original`, replacing whatever is there.
///
/// The content is always copied, never linked, so the restored file does not
/// alias the backup.
pub fn restore_file(backup: &Path, original: &Path) -> Result<u64> {
    ensure_parent_dir_exists(original)?;

    match fs::symlink_metadata(original) {
        Ok(_) => fs::remove_file(original).map_err(|e| EngineError::WriteError {
            path: original.to_path_buf(),
            source: e,
        })?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(EngineError::ReadError {
                path: original.to_path_buf(),
                source: e,
            })
        }
    }

    copy_file(backup, original)
}

/// Total size in bytes of all regular files below `path`.
pub fn disk_usage(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| EngineError::ReadError {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| path.to_path_buf()),
            source: e.into_io_error().unwrap_or_else(|| io::Error::other("filesystem loop")),
        })?;
        if entry.file_type().is_file() {
            total += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(total)
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Returns EngineError if the parent exists but is not a directory, or if
/// directory creation fails
pub fn ensure_parent_dir_exists(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(()),
    };

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "parent path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(parent).map_err(|e| EngineError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn write(path: &Path, contents: &[u8]) {
        ensure_parent_dir_exists(path).expect("Failed to create parent");
        fs::write(path, contents).expect("Failed to write file");
    }

    #[test]
    fn test_backup_file_prefers_hard_link() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("source.txt");
        let dst = temp_dir.path().join("backup").join("nested").join("source.txt");
        write(&src, b"test content");

        let method = backup_file(&src, &dst).expect("Failed to back up");
        assert_eq!(method, BackupMethod::HardLink);
        assert_eq!(fs::read(&dst).expect("Failed to read backup"), b"test content");

        // deleting the original leaves the backup intact
        fs::remove_file(&src).expect("Failed to remove source");
        assert_eq!(fs::read(&dst).expect("Failed to read backup"), b"test content");
    }

    #[test]
    fn test_backup_file_falls_back_to_copy() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("source.txt");
        let dst = temp_dir.path().join("dest.txt");
        write(&src, b"fresh");
        // an existing destination makes the link fail
        write(&dst, b"stale contents");

        let method = backup_file(&src, &dst).expect("Failed to back up");
        assert_eq!(method, BackupMethod::Copy);
        assert_eq!(fs::read(&dst).expect("Failed to read backup"), b"fresh");
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_file_preserves_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("script.sh");
        let dst = temp_dir.path().join("copy.sh");
        write(&src, b"#!/bin/sh\necho hi\n");
        fs::set_permissions(&src, fs::Permissions::from_mode(0o750)).expect("chmod");

        let bytes = copy_file(&src, &dst).expect("Failed to copy");
        assert_eq!(bytes, 18);

        let mode = fs::metadata(&dst).expect("stat").permissions().mode() & 0o7777;
        assert_eq!(mode, 0o750);
    }

    #[test]
    fn test_copy_large_file_uses_multiple_buffers() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("big.bin");
        let dst = temp_dir.path().join("big.copy");
        let data: Vec<u8> = (0..(COPY_BUFFER_SIZE * 3 + 17)).map(|i| (i % 253) as u8).collect();
        write(&src, &data);

        let bytes = copy_file(&src, &dst).expect("Failed to copy");
        assert_eq!(bytes, data.len() as u64);
        assert_eq!(fs::read(&dst).expect("Failed to read copy"), data);
    }

    #[test]
    fn test_buffer_pool_is_advisory() {
        let pool = BufferPool::new(1, 8);
        let a = pool.take();
        let b = pool.take();
        assert_eq!(a.len(), 8);
        assert_eq!(b.len(), 8);

        pool.give_back(a);
        pool.give_back(b);
        assert_eq!(pool.buffers.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_backup_dir_respects_classifier() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("project");
        write(&src.join("main.rs"), b"fn main() {}");
        write(&src.join("src").join("lib.rs"), b"pub fn x() {}");
        write(&src.join(".git").join("HEAD"), b"ref: refs/heads/main");
        write(&src.join("node_modules").join("pkg").join("index.js"), b"module.exports = 1");
        write(&src.join("scratch.tmp"), b"tmp");

        let dst = temp_dir.path().join("backup");
        let classifier = PathClassifier::new(&Config::default());
        let backup = backup_dir(&src, &dst, &classifier).expect("Failed to back up dir");

        let mut names: Vec<_> = backup
            .files
            .iter()
            .map(|f| f.original_path.strip_prefix(&src).unwrap().to_path_buf())
            .collect();
        names.sort();
        assert_eq!(names, vec![PathBuf::from("main.rs"), PathBuf::from("src/lib.rs")]);
        assert!(dst.join("src").join("lib.rs").exists());
        assert!(!dst.join(".git").exists());
        assert!(!dst.join("node_modules").exists());
        assert!(backup.failed.is_empty());
    }

    #[test]
    fn test_backup_dir_skips_oversized_files() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("data");
        write(&src.join("small.txt"), b"ok");
        write(&src.join("large.bin"), &vec![7u8; 1024 * 1024 + 1]);

        let classifier = PathClassifier::new(&Config {
            max_file_size_mb: 1,
            ..Config::default()
        });
        let dst = temp_dir.path().join("backup");
        let backup = backup_dir(&src, &dst, &classifier).expect("Failed to back up dir");

        assert_eq!(backup.files.len(), 1);
        assert_eq!(backup.oversized.len(), 1);
        assert!(backup.oversized[0].0.ends_with("large.bin"));
        assert!(!dst.join("large.bin").exists());
    }

    #[test]
    fn test_restore_file_replaces_existing() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let backup = temp_dir.path().join("backup.txt");
        let original = temp_dir.path().join("restored").join("file.txt");
        write(&backup, b"original bytes");
        write(&original, b"something else entirely");

        let bytes = restore_file(&backup, &original).expect("Failed to restore");
        assert_eq!(bytes, 14);
        assert_eq!(fs::read(&original).expect("Failed to read"), b"original bytes");
    }

    #[test]
    fn test_disk_usage() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        write(&temp_dir.path().join("a"), &[0u8; 100]);
        write(&temp_dir.path().join("sub").join("b"), &[0u8; 50]);

        assert_eq!(disk_usage(temp_dir.path()).expect("Failed to measure"), 150);
    }

    #[test]
    fn test_ensure_parent_dir_exists() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("subdir").join("file.txt");

        ensure_parent_dir_exists(&path).expect("Failed to create parent");
        assert!(path.parent().unwrap().exists());
    }
}
