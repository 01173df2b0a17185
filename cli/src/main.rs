//! Rewind - Command-line interface for the checkpoint engine.
//!
//! Takes checkpoints of files before destructive commands and rolls them back
//! on request. It provides argument parsing, state-directory resolution,
//! optional config loading and progress reporting to the terminal.

mod logger;

use anyhow::{bail, Context};
use chrono::{DateTime, Local, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use rewind_engine::{
    diff::{self, ContentDiff, LineOp, Preview},
    rollback, Checkpoint, CheckpointStore, Config, DiffMode, DiffOptions, EngineError, FileStatus,
    RestoreProgress, RestoreReport, SearchOptions,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

const HOME_ENV: &str = "REWIND_HOME";
const CONFIG_FILE: &str = "config.json";
const CHECKPOINTS_DIR: &str = "checkpoints";
const PREVIEW_LINES: usize = 20;
const MAX_SHOWN_CHANGES: usize = 30;

/// Rewind - undo for destructive shell commands
#[derive(Parser, Debug)]
#[command(name = "rewind")]
#[command(version)]
#[command(about = "Checkpoint files before destructive commands and roll them back")]
struct Args {
    /// State directory (default: $REWIND_HOME or ~/.rewind)
    #[arg(long, global = true, value_name = "PATH")]
    home: Option<PathBuf>,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take a checkpoint of the given paths
    Snapshot {
        /// Description of the operation being protected
        #[arg(long, short, value_name = "TEXT")]
        message: Option<String>,

        #[arg(required = true, value_name = "PATH")]
        paths: Vec<PathBuf>,
    },

    /// List checkpoints, newest first
    List {
        /// Group by terminal session
        #[arg(long)]
        sessions: bool,

        /// Show at most N checkpoints
        #[arg(long, short = 'n', value_name = "N")]
        limit: Option<usize>,
    },

    /// Show one checkpoint (default: latest)
    Show { id: Option<String> },

    /// Compare a checkpoint with the current files (default: latest)
    Diff {
        id: Option<String>,

        /// Classify by size only, without reading contents
        #[arg(long)]
        fast: bool,

        /// Show line-level changes for modified files
        #[arg(long)]
        content: bool,
    },

    /// Restore files from a checkpoint (default: latest)
    Rollback {
        id: Option<String>,

        /// Only restore these paths (comma separated)
        #[arg(long, value_delimiter = ',', value_name = "PATHS")]
        files: Vec<PathBuf>,

        /// Restore under this directory instead of the original locations
        #[arg(long, value_name = "DIR")]
        to: Option<PathBuf>,
    },

    /// Delete checkpoints
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Remove (or compress) old checkpoints
    Clean {
        /// Age threshold such as 7d, 12h or 30m (default: retention_days)
        #[arg(long, value_name = "AGE", conflicts_with = "keep")]
        older_than: Option<String>,

        /// Keep only the N most recent checkpoints
        #[arg(long, value_name = "N")]
        keep: Option<usize>,

        /// Compress old checkpoints instead of deleting them
        #[arg(long, conflicts_with = "keep")]
        compress: bool,
    },

    /// Add or remove tags
    Tag {
        #[command(subcommand)]
        action: TagAction,
    },

    /// Attach a note to a checkpoint
    Note { id: String, text: String },

    /// Find checkpoints by tag, command, file or age
    Search {
        #[arg(long)]
        tag: Option<String>,

        /// Substring of the recorded command
        #[arg(long)]
        command: Option<String>,

        /// Substring of a recorded file path
        #[arg(long)]
        file: Option<String>,

        /// Created within this age, such as 2d
        #[arg(long, value_name = "AGE")]
        since: Option<String>,

        /// Created more than this age ago
        #[arg(long, value_name = "AGE")]
        before: Option<String>,
    },

    /// Compress a checkpoint's backup files into an archive
    Compress { id: String },

    /// Extract a compressed checkpoint
    Decompress { id: String },

    /// Show storage statistics
    Status,
}

#[derive(Subcommand, Debug)]
enum TagAction {
    Add {
        id: String,
        #[arg(required = true)]
        tags: Vec<String>,
    },
    Remove {
        id: String,
        #[arg(required = true)]
        tags: Vec<String>,
    },
}

/// CLI implementation of RestoreProgress for displaying restore progress
struct CliProgress {
    verbose: bool,
    start_time: Instant,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            start_time: Instant::now(),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        if unit_idx == 0 {
            format!("{} B", bytes)
        } else {
            format!("{:.2} {}", size, UNITS[unit_idx])
        }
    }

    fn format_duration(elapsed: std::time::Duration) -> String {
        let millis = elapsed.as_millis();
        if millis < 1000 {
            return format!("{}ms", millis);
        }

        let secs = elapsed.as_secs();
        let mins = secs / 60;
        let secs = secs % 60;
        if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }
}

impl RestoreProgress for CliProgress {
    fn on_restore_started(&self, checkpoint: &Checkpoint, total_files: usize) {
        eprintln!(
            "Restoring {} files from checkpoint {}...",
            total_files, checkpoint.id
        );
    }

    fn on_file_restored(&self, _original: &Path, destination: &Path, bytes: u64) {
        if self.verbose {
            eprintln!("  restored {} ({})", destination.display(), Self::format_bytes(bytes));
        }
    }

    fn on_file_failed(&self, original: &Path, error: &str) {
        eprintln!("  failed {}: {}", original.display(), error);
    }

    fn on_restore_completed(&self, _checkpoint: &Checkpoint, report: &RestoreReport) {
        eprintln!(
            "Summary: {} restored, {} failed ({}) in {}",
            report.restored,
            report.failed_count(),
            Self::format_bytes(report.bytes_restored),
            Self::format_duration(self.start_time.elapsed())
        );
    }
}

/// Parse arguments, install logging, run, and map failures to exit codes
fn main() {
    let args = Args::parse();

    if let Err(e) = logger::init(args.verbose) {
        eprintln!("Warning: failed to initialize logging: {}", e);
    }

    let exit_code = match run_cli(&args) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code_for(&e)
        }
    };

    std::process::exit(exit_code);
}

/// 1 when a restore finished with some failed files, 2 for everything else
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<EngineError>() {
        Some(EngineError::PartialRestore { .. }) => 1,
        _ => 2,
    }
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args) -> anyhow::Result<()> {
    let home = resolve_home(args.home.as_deref())?;
    let config = load_config(&home)?;
    tracing::debug!(home = %home.display(), "using state directory");
    let retention_days = config.retention_days;
    let store = CheckpointStore::open(home.join(CHECKPOINTS_DIR), config)
        .with_context(|| format!("failed to open state directory {}", home.display()))?;

    match &args.command {
        Command::Snapshot { message, paths } => snapshot(&store, message.as_deref(), paths),
        Command::List { sessions, limit } => list(&store, *sessions, *limit),
        Command::Show { id } => show(&lookup(&store, id.as_deref())?),
        Command::Diff { id, fast, content } => {
            let mut cp = lookup(&store, id.as_deref())?;
            show_diff(&store, &mut cp, *fast, *content)
        }
        Command::Rollback { id, files, to } => {
            let mut cp = lookup(&store, id.as_deref())?;
            restore(&store, &mut cp, files, to.as_deref(), args.verbose)
        }
        Command::Delete { ids } => {
            for id in ids {
                store.delete(id)?;
                println!("Deleted checkpoint {}", id);
            }
            Ok(())
        }
        Command::Clean {
            older_than,
            keep,
            compress,
        } => {
            if let Some(keep) = keep {
                let deleted = store.clean_keep(*keep)?;
                println!("Deleted {} checkpoints, kept the {} most recent", deleted, keep);
                return Ok(());
            }

            let age = match older_than {
                Some(text) => parse_duration(text)?,
                None => match TimeDelta::try_days(i64::from(retention_days)) {
                    Some(age) => age,
                    None => bail!("retention_days {} is too large", retention_days),
                },
            };
            if *compress {
                let batch = store.compress_older_than(age)?;
                println!(
                    "Compressed {} checkpoints, saved {}",
                    batch.compressed,
                    CliProgress::format_bytes(batch.bytes_saved)
                );
            } else {
                let deleted = store.clean(age)?;
                println!("Deleted {} checkpoints", deleted);
            }
            Ok(())
        }
        Command::Tag { action } => match action {
            TagAction::Add { id, tags } => {
                for tag in tags {
                    store.add_tag(id, tag)?;
                }
                println!("Tagged {}: {}", id, tags.join(", "));
                Ok(())
            }
            TagAction::Remove { id, tags } => {
                for tag in tags {
                    store.remove_tag(id, tag)?;
                }
                println!("Untagged {}: {}", id, tags.join(", "));
                Ok(())
            }
        },
        Command::Note { id, text } => {
            store.set_note(id, text)?;
            println!("Note saved for {}", id);
            Ok(())
        }
        Command::Search {
            tag,
            command,
            file,
            since,
            before,
        } => {
            let now = Utc::now();
            let options = SearchOptions {
                tag: tag.clone(),
                command: command.clone(),
                file: file.clone(),
                since: since.as_deref().map(parse_duration).transpose()?.map(|d| ago(now, d)),
                until: before.as_deref().map(parse_duration).transpose()?.map(|d| ago(now, d)),
            };
            let found = store.search(&options)?;
            if found.is_empty() {
                println!("No matching checkpoints");
            }
            for cp in &found {
                print_summary_line(cp);
            }
            Ok(())
        }
        Command::Compress { id } => {
            let stats = store.compress(id)?;
            println!(
                "Compressed {}: {} -> {} (saved {})",
                id,
                CliProgress::format_bytes(stats.original_size),
                CliProgress::format_bytes(stats.compressed_size),
                CliProgress::format_bytes(stats.bytes_saved())
            );
            Ok(())
        }
        Command::Decompress { id } => {
            store.decompress(id)?;
            println!("Decompressed {}", id);
            Ok(())
        }
        Command::Status => status(&store),
    }
}

/// `--home`, then `$REWIND_HOME`, then `~/.rewind`
fn resolve_home(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    match dirs::home_dir() {
        Some(home) => Ok(home.join(".rewind")),
        None => bail!("cannot determine home directory; pass --home or set {}", HOME_ENV),
    }
}

/// Read `<home>/config.json` if present, otherwise use defaults
fn load_config(home: &Path) -> anyhow::Result<Config> {
    let path = home.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(Config::default());
    }
    let data = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("invalid config file {}", path.display()))
}

/// Parse ages such as `7d`, `12h`, `30m` or `2w`; a bare number means days
fn parse_duration(text: &str) -> anyhow::Result<TimeDelta> {
    let text = text.trim();
    let (digits, unit) = match text.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => text.split_at(pos),
        None => (text, "d"),
    };
    let amount: i64 = digits
        .parse()
        .with_context(|| format!("invalid duration '{}'", text))?;

    let duration = match unit {
        "w" => TimeDelta::try_weeks(amount),
        "d" => TimeDelta::try_days(amount),
        "h" => TimeDelta::try_hours(amount),
        "m" => TimeDelta::try_minutes(amount),
        _ => bail!("invalid duration '{}': use a number followed by w, d, h or m", text),
    };
    match duration {
        Some(duration) => Ok(duration),
        None => bail!("duration '{}' is too large", text),
    }
}

/// `now - age`, clamped to the earliest representable time.
fn ago(now: DateTime<Utc>, age: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn lookup(store: &CheckpointStore, id: Option<&str>) -> anyhow::Result<Checkpoint> {
    Ok(match id {
        Some(id) => store.get(id)?,
        None => store.get_latest()?,
    })
}

fn local_time(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn snapshot(store: &CheckpointStore, message: Option<&str>, paths: &[PathBuf]) -> anyhow::Result<()> {
    let working_dir = std::env::current_dir().context("failed to determine working directory")?;
    let command = match message {
        Some(m) => m.to_string(),
        None => format!(
            "snapshot {}",
            paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" ")
        ),
    };

    let (cp, report) = store.create_from(&working_dir, &command, paths)?;

    for (path, pattern) in &report.sensitive {
        eprintln!("Warning: {} looks sensitive (matches {})", path.display(), pattern);
    }
    for (path, size) in &report.oversized {
        eprintln!(
            "Warning: skipped {} ({} exceeds the size limit)",
            path.display(),
            CliProgress::format_bytes(*size)
        );
    }
    for (path, err) in &report.failed {
        eprintln!("Warning: failed to back up {}: {}", path.display(), err);
    }
    if let Some(warning) = report.storage_warning {
        eprintln!(
            "Warning: checkpoint storage is {} (limit {}); consider `rewind clean`",
            CliProgress::format_bytes(warning.used),
            CliProgress::format_bytes(warning.limit)
        );
    }

    println!(
        "Checkpoint {} created: {} files ({} linked, {} copied)",
        cp.id,
        report.backed_up(),
        report.linked,
        report.copied
    );
    Ok(())
}

fn print_summary_line(cp: &Checkpoint) {
    let m = &cp.manifest;
    let mut flags = Vec::new();
    if m.rolled_back {
        flags.push("rolled back".to_string());
    }
    if m.compressed {
        flags.push("compressed".to_string());
    }
    if !m.tags.is_empty() {
        flags.push(format!("tags: {}", m.tags.join(", ")));
    }
    let flags = if flags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", flags.join("; "))
    };

    println!(
        "{}  {}  {:>4} files  {:>10}  {}{}",
        cp.id,
        local_time(m.timestamp),
        m.file_count(),
        CliProgress::format_bytes(m.total_size()),
        m.command,
        flags
    );
}

fn list(store: &CheckpointStore, sessions: bool, limit: Option<usize>) -> anyhow::Result<()> {
    if sessions {
        for (session, checkpoints) in store.list_by_session()? {
            println!("Session {} ({} checkpoints)", session, checkpoints.len());
            for cp in checkpoints.iter().take(limit.unwrap_or(usize::MAX)) {
                print!("  ");
                print_summary_line(cp);
            }
        }
        return Ok(());
    }

    let checkpoints = store.list()?;
    if checkpoints.is_empty() {
        println!("No checkpoints");
        return Ok(());
    }
    for cp in checkpoints.iter().take(limit.unwrap_or(usize::MAX)) {
        print_summary_line(cp);
    }
    Ok(())
}

fn show(cp: &Checkpoint) -> anyhow::Result<()> {
    let m = &cp.manifest;
    println!("Checkpoint:  {}", cp.id);
    println!("Created:     {}", local_time(m.timestamp));
    println!("Command:     {}", m.command);
    println!("Directory:   {}", m.working_dir.display());
    println!("Session:     {}", if m.session_id.is_empty() { "default" } else { m.session_id.as_str() });
    println!("Rolled back: {}", if m.rolled_back { "yes" } else { "no" });
    if m.compressed {
        println!(
            "Compressed:  yes ({})",
            CliProgress::format_bytes(m.compressed_size)
        );
    }
    if !m.tags.is_empty() {
        println!("Tags:        {}", m.tags.join(", "));
    }
    if !m.note.is_empty() {
        println!("Note:        {}", m.note);
    }
    println!(
        "Files:       {} ({})",
        m.file_count(),
        CliProgress::format_bytes(m.total_size())
    );
    for entry in &m.files {
        let marker = if entry.is_dir { "d" } else { "-" };
        println!("  {} {:o} {}", marker, entry.mode, entry.original_path.display());
    }
    Ok(())
}

fn show_diff(store: &CheckpointStore, cp: &mut Checkpoint, fast: bool, content: bool) -> anyhow::Result<()> {
    let options = DiffOptions {
        mode: if fast { DiffMode::Fast } else { DiffMode::Accurate },
        ..DiffOptions::default()
    };
    if content {
        // content output reads backup copies even in fast mode
        store.ensure_decompressed(cp)?;
    }
    let summary = diff::analyze(store, cp, &options)?;

    println!("Checkpoint {} ({})", cp.id, cp.manifest.command);
    for file in &summary.files {
        let label = match file.status {
            FileStatus::Deleted => "deleted  ",
            FileStatus::Modified => "modified ",
            FileStatus::Unchanged => "unchanged",
        };
        println!(
            "  {} {} ({} -> {})",
            label,
            file.path.display(),
            CliProgress::format_bytes(file.recorded_size),
            CliProgress::format_bytes(file.current_size)
        );

        if !content {
            continue;
        }
        let shown = match file.status {
            FileStatus::Deleted => print_preview(&file.backup_path),
            FileStatus::Modified => print_content_diff(&file.path, &file.backup_path, &options),
            FileStatus::Unchanged => Ok(()),
        };
        if let Err(e) = shown {
            println!("    (content unavailable: {})", e);
        }
    }

    println!(
        "{} deleted, {} modified, {} unchanged; rollback would restore {}",
        summary.deleted,
        summary.modified,
        summary.unchanged,
        CliProgress::format_bytes(summary.bytes_to_restore)
    );
    Ok(())
}

fn print_preview(backup: &Path) -> anyhow::Result<()> {
    match diff::file_preview(backup, PREVIEW_LINES)? {
        Preview::Binary => println!("    (binary file)"),
        Preview::Text { lines, truncated } => {
            for (i, line) in lines.iter().enumerate() {
                println!("    {:3}: {}", i + 1, line);
            }
            if truncated {
                println!("    ... (truncated)");
            }
        }
    }
    Ok(())
}

fn print_content_diff(current: &Path, backup: &Path, options: &DiffOptions) -> anyhow::Result<()> {
    match diff::content_diff(current, backup, options)? {
        ContentDiff::Binary => println!("    (binary file - content diff not available)"),
        ContentDiff::Lines { changes, approximate } => {
            if approximate {
                println!("    (large file - unordered line comparison)");
            }
            if changes.is_empty() {
                println!("    (no line differences)");
            }
            for change in changes.iter().take(MAX_SHOWN_CHANGES) {
                let sign = match change.op {
                    LineOp::Removed => '-',
                    LineOp::Inserted => '+',
                };
                println!("    {}{:3}: {}", sign, change.line_no, change.text);
            }
            if changes.len() > MAX_SHOWN_CHANGES {
                println!("    ... (diff truncated)");
            }
        }
    }
    Ok(())
}

fn restore(
    store: &CheckpointStore,
    cp: &mut Checkpoint,
    files: &[PathBuf],
    to: Option<&Path>,
    verbose: bool,
) -> anyhow::Result<()> {
    let progress = CliProgress::new(verbose);
    let progress: Option<&dyn RestoreProgress> = Some(&progress);

    let report = match (files.is_empty(), to) {
        (true, None) => rollback::rollback(store, cp, progress)?,
        (false, None) => rollback::rollback_selective(store, cp, files, progress)?,
        (true, Some(dest)) => rollback::rollback_to_path(store, cp, dest, progress)?,
        (false, Some(dest)) => rollback::rollback_selective_to_path(store, cp, files, dest, progress)?,
    };

    for path in &report.unmatched {
        eprintln!("Warning: {} is not part of checkpoint {}", path.display(), cp.id);
    }
    match &report.destination {
        Some(dest) => println!("Restored {} files to {}", report.restored, dest.display()),
        None => println!("Restored {} files from checkpoint {}", report.restored, cp.id),
    }
    Ok(())
}

fn status(store: &CheckpointStore) -> anyhow::Result<()> {
    let stats = store.stats()?;
    println!("State directory: {}", store.root().display());
    println!("Checkpoints:     {}", stats.checkpoints);
    println!("  rolled back:   {}", stats.rolled_back);
    println!("  compressed:    {}", stats.compressed);
    println!("Files recorded:  {} ({})", stats.files, CliProgress::format_bytes(stats.recorded_bytes));
    print!("Disk usage:      {}", CliProgress::format_bytes(stats.disk_usage));
    match store.config().max_storage_bytes() {
        Some(limit) => println!(" of {}", CliProgress::format_bytes(limit)),
        None => println!(),
    }
    if let Ok(latest) = store.get_latest() {
        println!("Latest:          {} ({})", latest.id, latest.manifest.command);
    }
    Ok(())
}
