//! # Rewind Engine - Checkpoint Library
//!
//! The undo core behind the `rewind` command: before a destructive shell
//! command runs, record a recoverable checkpoint of the files it will touch,
//! and restore them later on request.
//!
//! ## Overview
//!
//! The engine is headless and synchronous. It features:
//! - Hard-link-first backups with a buffered-copy fallback
//! - Exclusion of build outputs, dependency caches, VCS internals and symlinks
//! - A persisted index for fast "latest" and listing queries
//! - Full, selective and alternate-location rollback with per-file error isolation
//! - Diffs of a checkpoint against the live filesystem
//! - tar+gzip compression of cold checkpoints
//!
//! ## Basic Usage
//!
//! ```no_run
//! use rewind_engine::{rollback, CheckpointStore, Config};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = CheckpointStore::open("/home/me/.rewind/checkpoints", Config::default())?;
//!
//! // Before running `rm -rf build notes.txt`
//! let checkpoint = store.create("rm -rf build notes.txt", &["build", "notes.txt"])?;
//! println!("checkpoint {} holds {} files", checkpoint.id, checkpoint.manifest.file_count());
//!
//! // Later: undo it
//! let report = rollback::rollback_latest(&store, None)?;
//! println!("restored {} files", report.restored);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **classify**: Path classification (exclusions, symlinks, sensitive files, size gate)
//! - **fs_ops**: Backup and restore primitives
//! - **manifest**: The persisted per-checkpoint record
//! - **checkpoint**: Runtime handle, ids and sessions
//! - **index**: Persisted checkpoint summaries
//! - **store**: Checkpoint creation, lookup and maintenance
//! - **rollback**: Restoring checkpoints
//! - **diff**: Comparing checkpoints with the live filesystem
//! - **compression**: Archiving checkpoint trees
//! - **progress**: Restore progress callback trait
//! - **checksums**: Content digests
//! - **config**: Limits and pattern sets
//! - **error**: Error types and handling

pub mod checkpoint;
pub mod checksums;
pub mod classify;
pub mod compression;
pub mod config;
pub mod diff;
pub mod error;
pub mod fs_ops;
pub mod index;
pub mod manifest;
pub mod progress;
pub mod rollback;
pub mod store;

// Re-export main types and functions
pub use checkpoint::{session_id, Checkpoint};
pub use checksums::{ChecksumAlgorithm, ChecksumValue};
pub use classify::{validate_path, PathClassifier, SkipDecision};
pub use compression::ArchiveStats;
pub use config::Config;
pub use diff::{DiffMode, DiffOptions, DiffSummary, FileStatus};
pub use error::{EngineError, ErrorKind, Result};
pub use fs_ops::BackupMethod;
pub use index::{CheckpointIndex, IndexEntry};
pub use manifest::{FileEntry, Manifest};
pub use progress::RestoreProgress;
pub use rollback::{RestoreFailure, RestoreReport};
pub use store::{BackupReport, BatchCompression, CheckpointStore, SearchOptions, StoreStats};
