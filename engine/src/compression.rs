//! Archive compression of cold checkpoints.
//!
//! A checkpoint's `files/` tree is streamed into a single tar+gzip archive and
//! removed only once the archive is completely written. Extraction restores
//! directories first, then files, with their recorded permission bits; the
//! archive is removed only after every entry has been unpacked.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};
use walkdir::WalkDir;

use crate::error::{EngineError, Result};
use crate::fs_ops::{self, set_file_mode};

/// Sizes before and after compressing a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveStats {
    /// Bytes of regular files in the tree
    pub original_size: u64,
    /// Size of the archive file
    pub compressed_size: u64,
}

impl ArchiveStats {
    pub fn bytes_saved(&self) -> u64 {
        self.original_size.saturating_sub(self.compressed_size)
    }
}

/// Archive `src` into `archive`, then delete `src`.
///
/// On failure the partial archive is removed and `src` is left untouched.
pub fn compress_dir(src: &Path, archive: &Path) -> Result<ArchiveStats> {
    let original_size = fs_ops::disk_usage(src)?;

    if let Err(e) = write_archive(src, archive) {
        let _ = fs::remove_file(archive);
        return Err(EngineError::Archive {
            path: archive.to_path_buf(),
            source: e,
        });
    }

    let compressed_size = fs::metadata(archive)
        .map_err(|e| EngineError::ReadError {
            path: archive.to_path_buf(),
            source: e,
        })?
        .len();

    fs::remove_dir_all(src).map_err(|e| EngineError::WriteError {
        path: src.to_path_buf(),
        source: e,
    })?;

    Ok(ArchiveStats {
        original_size,
        compressed_size,
    })
}

fn write_archive(src: &Path, archive: &Path) -> io::Result<()> {
    let file = File::create(archive)?;
    let enc = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = Builder::new(enc);
    builder.follow_symlinks(false);

    for entry in WalkDir::new(src).follow_links(false).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        if entry.file_type().is_dir() {
            builder.append_dir(rel, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), rel)?;
        }
    }

    let enc = builder.into_inner()?;
    let mut writer = enc.finish()?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

/// Extract `archive` into `dest`, then delete `archive`.
///
/// On failure the partially extracted tree is removed and the archive kept.
///
/// # Returns
/// Number of files extracted
pub fn decompress_dir(archive: &Path, dest: &Path) -> Result<usize> {
    let dest_existed = dest.exists();

    match extract(archive, dest) {
        Ok(count) => {
            fs::remove_file(archive).map_err(|e| EngineError::WriteError {
                path: archive.to_path_buf(),
                source: e,
            })?;
            Ok(count)
        }
        Err(e) => {
            if !dest_existed {
                let _ = fs::remove_dir_all(dest);
            }
            Err(e)
        }
    }
}

fn open_archive(archive: &Path) -> Result<Archive<GzDecoder<BufReader<File>>>> {
    let file = File::open(archive).map_err(|e| EngineError::ReadError {
        path: archive.to_path_buf(),
        source: e,
    })?;
    Ok(Archive::new(GzDecoder::new(BufReader::new(file))))
}

fn extract(archive: &Path, dest: &Path) -> Result<usize> {
    let archive_err = |e: io::Error| EngineError::Archive {
        path: archive.to_path_buf(),
        source: e,
    };

    fs::create_dir_all(dest).map_err(|e| EngineError::DirectoryCreationFailed {
        path: dest.to_path_buf(),
        source: e,
    })?;

    // directories first; their modes are applied last so a read-only
    // directory does not block extraction of its own children
    let mut dir_modes: BTreeMap<PathBuf, u32> = BTreeMap::new();
    let mut tar = open_archive(archive)?;
    for entry in tar.entries().map_err(archive_err)? {
        let entry = entry.map_err(archive_err)?;
        if !entry.header().entry_type().is_dir() {
            continue;
        }
        let rel = safe_relative(&entry.path().map_err(archive_err)?).map_err(archive_err)?;
        let target = dest.join(&rel);
        fs::create_dir_all(&target).map_err(|e| EngineError::DirectoryCreationFailed {
            path: target.clone(),
            source: e,
        })?;
        let mode = entry.header().mode().map_err(archive_err)?;
        dir_modes.insert(target, mode & 0o7777);
    }

    let mut count = 0;
    let mut tar = open_archive(archive)?;
    for entry in tar.entries().map_err(archive_err)? {
        let mut entry = entry.map_err(archive_err)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let rel = safe_relative(&entry.path().map_err(archive_err)?).map_err(archive_err)?;
        let target = dest.join(&rel);
        fs_ops::ensure_parent_dir_exists(&target)?;

        let mode = entry.header().mode().map_err(archive_err)?;
        entry.unpack(&target).map_err(archive_err)?;
        set_file_mode(&target, mode & 0o7777)?;
        count += 1;
    }

    // deepest first
    for (dir, mode) in dir_modes.iter().rev() {
        set_file_mode(dir, *mode)?;
    }

    Ok(count)
}

/// Reject absolute paths and `..` components inside an archive.
fn safe_relative(path: &Path) -> io::Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unsafe archive entry path: {}", path.display()),
                ))
            }
        }
    }
    Ok(out)
}
