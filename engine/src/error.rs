//! Error types for the checkpoint engine.
//!
//! The primary error type is `EngineError`. Operation-level errors (cannot create
//! the checkpoint directory, cannot persist a manifest) abort the call. Per-file
//! errors during backup or restore are collected into reports and only surface
//! here as an aggregate (`PartialRestore`) once the whole batch has been processed.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Coarse classification of an `EngineError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown checkpoint id, or a backup file missing during restore
    NotFound,
    /// A full rollback was requested for a checkpoint already rolled back
    AlreadyRolledBack,
    /// Permission, disk or cross-device failure
    Io,
    /// Unreadable or unparseable manifest/index
    CorruptState,
    /// Target path or checkpoint id rejected before any work started
    Validation,
    /// The requested state transition has already happened
    Conflict,
    /// A batch completed with some per-file failures
    Incomplete,
}

/// Errors produced by the checkpoint engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No checkpoint directory or manifest exists for this id
    #[error("checkpoint not found: {id}")]
    CheckpointNotFound { id: String },

    /// The store holds no checkpoints at all
    #[error("no checkpoints found")]
    NoCheckpoints,

    /// A manifest entry points at a backup copy that no longer exists
    #[error("backup file not found: {}", path.display())]
    BackupMissing { path: PathBuf },

    #[error("checkpoint {id} has already been rolled back")]
    AlreadyRolledBack { id: String },

    #[error("checkpoint {id} is already compressed")]
    AlreadyCompressed { id: String },

    /// Failed to read from a file or directory
    #[error("failed to read {}: {source}", path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write, link, remove or chmod a file
    #[error("failed to write {}: {source}", path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to create a directory
    #[error("failed to create directory {}: {source}", path.display())]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to build or extract a checkpoint archive
    #[error("archive error at {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A manifest exists but cannot be parsed or serialized
    #[error("corrupt manifest {}: {source}", path.display())]
    CorruptManifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The index document cannot be parsed or serialized
    #[error("corrupt index {}: {source}", path.display())]
    CorruptIndex {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Refusing to checkpoint a protected system location
    #[error("cannot checkpoint protected system path: {}", path.display())]
    ProtectedPath { path: PathBuf },

    /// Checkpoint ids are single path components; anything else is rejected
    #[error("invalid checkpoint id: {id:?}")]
    InvalidCheckpointId { id: String },

    /// Some files could not be restored; the rest were restored and kept
    #[error("restored {restored} files, {failed} failed")]
    PartialRestore { restored: usize, failed: usize },

    /// The working directory of the calling process could not be determined
    #[error("failed to determine working directory: {0}")]
    WorkingDir(#[source] io::Error),
}

impl EngineError {
    /// Map this error onto the engine's error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CheckpointNotFound { .. } | Self::NoCheckpoints | Self::BackupMissing { .. } => {
                ErrorKind::NotFound
            }
            Self::AlreadyRolledBack { .. } => ErrorKind::AlreadyRolledBack,
            Self::AlreadyCompressed { .. } => ErrorKind::Conflict,
            Self::ReadError { .. }
            | Self::WriteError { .. }
            | Self::DirectoryCreationFailed { .. }
            | Self::Archive { .. }
            | Self::WorkingDir(_) => ErrorKind::Io,
            Self::CorruptManifest { .. } | Self::CorruptIndex { .. } => ErrorKind::CorruptState,
            Self::ProtectedPath { .. } | Self::InvalidCheckpointId { .. } => ErrorKind::Validation,
            Self::PartialRestore { .. } => ErrorKind::Incomplete,
        }
    }

    /// True for errors caused by a missing file on disk rather than a real I/O fault.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ReadError { source, .. } => source.kind() == io::ErrorKind::NotFound,
            other => other.kind() == ErrorKind::NotFound,
        }
    }
}
