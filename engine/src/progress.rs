//! Restore progress reporting.
//!
//! This module defines the RestoreProgress trait, which decouples the rollback
//! engine from any specific frontend. The CLI implements it for verbose output;
//! library callers can pass `None`.

use std::path::Path;

use crate::checkpoint::Checkpoint;
use crate::rollback::RestoreReport;

/// Trait for receiving progress updates while a checkpoint is restored.
///
/// All methods are called synchronously on the restoring thread.
pub trait RestoreProgress: Send {
    /// Called once before the first file, with the number of files selected.
    fn on_restore_started(&self, checkpoint: &Checkpoint, total_files: usize);

    /// Called after a file has been written to `destination`.
    fn on_file_restored(&self, original: &Path, destination: &Path, bytes: u64);

    /// Called when a file could not be restored; the restore continues.
    fn on_file_failed(&self, original: &Path, error: &str);

    /// Called once after every selected file has been processed.
    fn on_restore_completed(&self, checkpoint: &Checkpoint, report: &RestoreReport);
}
