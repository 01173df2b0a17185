//! Path classification: what is eligible for backup.
//!
//! - Symlinks are never followed and never backed up
//! - A fixed list of basenames (build outputs, dependency caches, VCS internals,
//!   IDE caches, our own state directory) is excluded; excluded directories are
//!   pruned along with their whole subtree
//! - `.framework` bundles are pruned as a whole
//! - Sensitive-file detection only flags, it never blocks
//! - Files above the configured ceiling are skipped

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use glob::{MatchOptions, Pattern};

use crate::config::Config;
use crate::error::{EngineError, Result};

/// Name of the tool's own state directory, never backed up.
pub const STATE_DIR_NAME: &str = ".rewind";

/// Basenames excluded from every directory backup.
pub const DEFAULT_EXCLUSIONS: &[&str] = &[
    // build outputs
    ".build",
    "build",
    "dist",
    "out",
    "target",
    // dependencies
    "node_modules",
    "vendor",
    ".venv",
    "venv",
    "__pycache__",
    ".pytest_cache",
    // editors
    ".idea",
    ".vscode",
    // version control
    ".git",
    ".svn",
    ".hg",
    // OS litter
    ".DS_Store",
    "Thumbs.db",
    // caches
    ".cache",
    ".npm",
    ".yarn",
    ".cargo",
    "DerivedData",
    STATE_DIR_NAME,
];

const BUNDLE_SUFFIX: &str = ".framework";

/// Outcome of classifying one walk entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDecision {
    /// Back this entry up
    Include,
    /// Skip this entry only
    SkipEntry,
    /// Skip this directory and everything below it
    SkipSubtree,
}

impl SkipDecision {
    pub fn skip(self) -> bool {
        self != SkipDecision::Include
    }

    pub fn skip_subtree(self) -> bool {
        self == SkipDecision::SkipSubtree
    }
}

/// Decides which paths are backed up, flagged or refused.
#[derive(Debug, Clone)]
pub struct PathClassifier {
    excluded_names: HashSet<String>,
    excluded_globs: Vec<Pattern>,
    sensitive: Vec<SensitivePattern>,
    warn_sensitive: bool,
    max_file_size: Option<u64>,
    /// Directories never descended into, in both lexical and canonical form
    excluded_roots: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
struct SensitivePattern {
    original: String,
    lower: String,
    glob: Option<Pattern>,
}

impl PathClassifier {
    pub fn new(config: &Config) -> Self {
        let excluded_globs = config
            .exclude_patterns
            .iter()
            .filter_map(|p| match Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "ignoring invalid exclude pattern");
                    None
                }
            })
            .collect();

        let sensitive = config
            .sensitive_patterns
            .iter()
            .map(|p| {
                let lower = p.to_lowercase();
                SensitivePattern {
                    original: p.clone(),
                    glob: Pattern::new(&lower).ok(),
                    lower,
                }
            })
            .collect();

        PathClassifier {
            excluded_names: DEFAULT_EXCLUSIONS.iter().map(|s| s.to_string()).collect(),
            excluded_globs,
            sensitive,
            warn_sensitive: config.warn_sensitive_files,
            max_file_size: config.max_file_size_bytes(),
            excluded_roots: Vec::new(),
        }
    }

    /// Never back up anything at or below `dir`, whatever its name.
    ///
    /// Used for the store's own state directory so a target containing it
    /// does not copy checkpoints into themselves.
    pub fn exclude_subtree(&mut self, dir: &Path) {
        let lexical = normalize(dir);
        if let Ok(canonical) = fs::canonicalize(dir) {
            if canonical != lexical {
                self.excluded_roots.push(canonical);
            }
        }
        self.excluded_roots.push(lexical);
    }

    /// True when `path` is an excluded subtree root or lies inside one.
    pub fn is_in_excluded_subtree(&self, path: &Path) -> bool {
        if self.excluded_roots.is_empty() {
            return false;
        }
        let lexical = normalize(path);
        if self.excluded_roots.iter().any(|root| lexical.starts_with(root)) {
            return true;
        }
        fs::canonicalize(path)
            .map(|c| self.excluded_roots.iter().any(|root| c.starts_with(root)))
            .unwrap_or(false)
    }

    fn is_excluded_root(&self, path: &Path) -> bool {
        let name = path.file_name();
        // only resolve paths whose basename could match
        if !self.excluded_roots.iter().any(|root| root.file_name() == name) {
            return false;
        }
        if self.excluded_roots.iter().any(|root| root == path) {
            return true;
        }
        fs::canonicalize(path)
            .map(|c| self.excluded_roots.contains(&c))
            .unwrap_or(false)
    }

    /// Classify a walk entry. Symlinks are detected with `lstat`, never followed.
    pub fn should_skip(&self, path: &Path, is_dir: bool) -> SkipDecision {
        if is_symlink(path) {
            return SkipDecision::SkipEntry;
        }
        if is_dir && self.is_excluded_root(path) {
            return SkipDecision::SkipSubtree;
        }

        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => return SkipDecision::Include,
        };

        let excluded = self.excluded_names.contains(name)
            || self.excluded_globs.iter().any(|g| g.matches(name));
        if excluded {
            return if is_dir {
                SkipDecision::SkipSubtree
            } else {
                SkipDecision::SkipEntry
            };
        }

        if is_dir && name.ends_with(BUNDLE_SUFFIX) {
            return SkipDecision::SkipSubtree;
        }

        SkipDecision::Include
    }

    /// Returns the pattern that flags `path` as sensitive, if any.
    ///
    /// Matching is case-insensitive: exact basename, basename glob, or, for
    /// patterns containing a `/`, substring of the full path.
    pub fn is_sensitive(&self, path: &Path) -> Option<&str> {
        if !self.warn_sensitive {
            return None;
        }

        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let full = path.to_string_lossy().to_lowercase();
        let opts = MatchOptions {
            case_sensitive: false,
            ..MatchOptions::new()
        };

        self.sensitive
            .iter()
            .find(|p| {
                base == p.lower
                    || p.glob.as_ref().is_some_and(|g| g.matches_with(&base, opts))
                    || (p.lower.contains('/') && full.contains(&p.lower))
            })
            .map(|p| p.original.as_str())
    }

    /// True when a file of `size` bytes is above the configured ceiling.
    pub fn exceeds_size_limit(&self, size: u64) -> bool {
        self.max_file_size.is_some_and(|max| size > max)
    }
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// Reject checkpoint targets under protected system prefixes.
///
/// Allowed (temp) prefixes win over protected ones so that e.g. `/var/folders`
/// stays usable while `/var` is refused.
pub fn validate_path(path: &Path, config: &Config) -> Result<()> {
    let path = normalize(path);

    if config.allowed_paths.iter().any(|p| path.starts_with(p)) {
        return Ok(());
    }

    if config.protected_paths.iter().any(|p| path.starts_with(p)) {
        return Err(EngineError::ProtectedPath { path });
    }

    Ok(())
}

/// Lexically resolve `.` and `..` without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
