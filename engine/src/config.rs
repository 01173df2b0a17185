//! Resolved limits and pattern sets read by the engine.
//!
//! The engine never loads configuration from disk. Callers build a `Config`
//! (usually `Config::default()` or a deserialized document) and hand it to the
//! store at construction time.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::checksums::ChecksumAlgorithm;

const MB: u64 = 1024 * 1024;

/// Limits and pattern sets consumed by the checkpoint engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-file size ceiling in megabytes; files above it are skipped. 0 disables.
    pub max_file_size_mb: u64,

    /// Total store size in megabytes above which checkpoint creation warns. 0 disables.
    pub max_storage_mb: u64,

    /// Default age (in days) used when cleaning old checkpoints.
    pub retention_days: u32,

    /// Whether sensitive-file detection runs at all.
    pub warn_sensitive_files: bool,

    /// Extra basename globs excluded from directory backups.
    pub exclude_patterns: Vec<String>,

    /// Sensitive-file patterns: exact basename, basename glob, or path substring.
    pub sensitive_patterns: Vec<String>,

    /// Targets under these prefixes are refused.
    pub protected_paths: Vec<PathBuf>,

    /// Prefixes that are always allowed, checked before `protected_paths`.
    pub allowed_paths: Vec<PathBuf>,

    /// Digest used when comparing current files against their backups.
    pub checksum: ChecksumAlgorithm,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_file_size_mb: 100,
            max_storage_mb: 5000,
            retention_days: 7,
            warn_sensitive_files: true,
            exclude_patterns: strings(&["*.tmp", "*.swp", "*~"]),
            sensitive_patterns: strings(&[
                ".env",
                ".env.*",
                "*.pem",
                "*.key",
                "*.p12",
                "*.pfx",
                "id_rsa",
                "id_ed25519",
                "id_ecdsa",
                "*.keystore",
                "credentials.json",
                "service-account*.json",
                "*secret*",
                "*password*",
                ".netrc",
                ".npmrc",
                ".pypirc",
                "aws_credentials",
                ".aws/credentials",
            ]),
            protected_paths: [
                "/etc",
                "/usr",
                "/bin",
                "/sbin",
                "/lib",
                "/var",
                "/root",
                "/System",
                "/Library",
                "/Applications",
                "/private/etc",
                "/private/var",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
            allowed_paths: vec![
                PathBuf::from("/tmp"),
                PathBuf::from("/var/folders"),
                PathBuf::from("/private/tmp"),
                std::env::temp_dir(),
            ],
            checksum: ChecksumAlgorithm::Blake3,
        }
    }
}

impl Config {
    /// Per-file ceiling in bytes, if one is configured.
    pub fn max_file_size_bytes(&self) -> Option<u64> {
        (self.max_file_size_mb > 0).then(|| self.max_file_size_mb * MB)
    }

    /// Store size ceiling in bytes, if one is configured.
    pub fn max_storage_bytes(&self) -> Option<u64> {
        (self.max_storage_mb > 0).then(|| self.max_storage_mb * MB)
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
