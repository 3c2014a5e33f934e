//! # Retrace CLI - Local history for your files
//!
//! A command-line front end for the retrace history engine.
//!
//! ## Usage
//! ```bash
//! # Record the current content of a file
//! retrace snapshot src/main.rs
//!
//! # Browse its history
//! retrace list src/main.rs
//!
//! # Compare a snapshot with its predecessor, or with the file on disk
//! retrace diff 3f2a9c1e
//! retrace diff 3f2a9c1e --current
//!
//! # Bring an old version back
//! retrace restore 3f2a9c1e
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use retrace::utils::format_bytes;
use retrace::{
    BatchOutcome, DetailedDiff, FileAccess, HistoryConfig, HistoryError, LocalFileAccess, LocalHistoryBuilder,
    LocalHistoryManager, Result, SnapshotFilter, SnapshotSelection, SnapshotSource, SnapshotUpdate, SortOrder,
};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Retrace CLI - Per-file local history
#[derive(Parser)]
#[command(name = "retrace")]
#[command(version)]
#[command(about = "Local history for your files - snapshot, diff and restore individual files")]
#[command(long_about = None)]
struct Cli {
    /// Storage directory (defaults to .retrace)
    #[arg(short, long, global = true)]
    storage: Option<PathBuf>,

    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record the current content of a file
    #[command(alias = "snap")]
    Snapshot {
        /// File to record
        file: PathBuf,

        /// What triggered the snapshot
        #[arg(long, value_enum, default_value = "manual")]
        source: SourceArg,

        /// Record even if the content matches the latest snapshot
        #[arg(long)]
        force: bool,

        /// Record that the file was deleted
        #[arg(long, conflicts_with = "force")]
        deleted: bool,
    },

    /// List the snapshots of a file
    #[command(alias = "ls")]
    List {
        /// File whose history to show
        file: PathBuf,

        /// Only accepted snapshots
        #[arg(long)]
        accepted: bool,

        /// Include discarded snapshots
        #[arg(short, long)]
        all: bool,

        /// Oldest first
        #[arg(long)]
        oldest: bool,

        /// Continue after this snapshot
        #[arg(long)]
        after: Option<String>,

        /// Limit results
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// List files with history
    Files,

    /// Print the content of a snapshot
    Show {
        /// Snapshot ID or prefix
        snapshot: String,
    },

    /// Compare snapshots
    Diff {
        /// Snapshot ID or prefix
        from: String,

        /// Compare against this snapshot instead of the predecessor
        to: Option<String>,

        /// Compare against the file on disk
        #[arg(long, conflicts_with = "to")]
        current: bool,

        /// Show only statistics
        #[arg(long)]
        stat: bool,
    },

    /// Accept snapshots
    Accept {
        /// Snapshot IDs or prefixes
        #[arg(required = true)]
        snapshots: Vec<String>,
    },

    /// Withdraw acceptance of a snapshot
    Unaccept {
        /// Snapshot ID or prefix
        snapshot: String,
    },

    /// Hide snapshots from listings
    Discard {
        /// Snapshot IDs or prefixes
        #[arg(required = true)]
        snapshots: Vec<String>,
    },

    /// Write a snapshot back to its file
    #[command(alias = "rs")]
    Restore {
        /// Snapshot ID or prefix
        snapshot: String,
    },

    /// Delete snapshots
    #[command(alias = "rm")]
    Delete {
        /// Snapshot IDs or prefixes
        #[arg(required = true)]
        snapshots: Vec<String>,
    },

    /// Run age and size eviction now
    Clear,

    /// Delete all history, or the history of one file
    Purge {
        /// Only this file
        file: Option<PathBuf>,
    },

    /// Verify storage integrity
    Verify {
        /// Re-read and hash every blob
        #[arg(long)]
        deep: bool,
    },

    /// Show storage statistics
    Stats,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum SourceArg {
    Typing,
    Save,
    Filesystem,
    Manual,
}

impl From<SourceArg> for SnapshotSource {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Typing => SnapshotSource::Typing,
            SourceArg::Save => SnapshotSource::Save,
            SourceArg::Filesystem => SnapshotSource::Filesystem,
            SourceArg::Manual => SnapshotSource::Manual,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "retrace=debug" } else { "retrace=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        let message = match e.downcast_ref::<HistoryError>() {
            Some(error) => error.user_message(),
            None => format!("{:#}", e),
        };
        eprintln!("{}: {}", "Error".red().bold(), message);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let storage_path = cli.storage.unwrap_or_else(|| PathBuf::from(".retrace"));
    let config = match &cli.config {
        Some(path) => HistoryConfig::load(path)?,
        None => HistoryConfig::default(),
    };
    let history = LocalHistoryBuilder::new().config(config).build(&storage_path)?;

    match cli.command {
        Commands::Snapshot {
            file,
            source,
            force,
            deleted,
        } => cmd_snapshot(&history, &file, source.into(), force, deleted),
        Commands::List {
            file,
            accepted,
            all,
            oldest,
            after,
            limit,
        } => {
            let filter = SnapshotFilter {
                accepted: accepted.then_some(true),
                exclude_discarded: !all,
                cursor_id: after.map(|prefix| resolve_id(&history, &prefix)).transpose()?,
                limit,
                order: if oldest { SortOrder::Oldest } else { SortOrder::Newest },
                ..Default::default()
            };
            cmd_list(&history, &file, &filter)
        }
        Commands::Files => cmd_files(&history),
        Commands::Show { snapshot } => {
            let id = resolve_id(&history, &snapshot)?;
            let content = history.get_snapshot_content(&id)?;
            print!("{}", String::from_utf8_lossy(&content));
            Ok(())
        }
        Commands::Diff {
            from,
            to,
            current,
            stat,
        } => cmd_diff(&history, &from, to.as_deref(), current, stat),
        Commands::Accept { snapshots } => {
            let outcome = history.accept(&selection(&history, &snapshots)?)?;
            report_batch("Accepted", &outcome)
        }
        Commands::Unaccept { snapshot } => {
            let id = resolve_id(&history, &snapshot)?;
            history.update_snapshot(&id, SnapshotUpdate::Unaccept)?;
            println!("{} Unaccepted {}", "✓".green().bold(), id[..8].yellow());
            Ok(())
        }
        Commands::Discard { snapshots } => {
            let outcome = history.discard(&selection(&history, &snapshots)?)?;
            report_batch("Discarded", &outcome)
        }
        Commands::Restore { snapshot } => {
            let id = resolve_id(&history, &snapshot)?;
            let restored = history.restore_snapshot(&id, &LocalFileAccess)?;
            println!(
                "{} Restored {} from {} ({})",
                "✓".green().bold(),
                restored.file_path.cyan(),
                restored.short_id().yellow(),
                restored.display_time()
            );
            Ok(())
        }
        Commands::Delete { snapshots } => {
            let outcome = history.delete(&selection(&history, &snapshots)?)?;
            report_batch("Deleted", &outcome)
        }
        Commands::Clear => cmd_clear(&history),
        Commands::Purge { file } => {
            let deleted = match file {
                Some(file) => history.delete_file_history(&file_uri(&file)?)?,
                None => history.purge()?,
            };
            println!("{} Removed {} snapshot(s)", "✓".green().bold(), deleted.to_string().yellow());
            Ok(())
        }
        Commands::Verify { deep } => cmd_verify(&history, deep),
        Commands::Stats => cmd_stats(&history, &storage_path),
    }
}

/// URI of `file` as recorded in history
fn file_uri(file: &Path) -> Result<String> {
    let absolute = if file.is_absolute() {
        file.to_path_buf()
    } else {
        std::env::current_dir()?.join(file)
    };
    Ok(retrace::host::uri_from_path(&absolute))
}

/// Expand an id prefix to a full snapshot id
fn resolve_id(history: &LocalHistoryManager, prefix: &str) -> Result<String> {
    if retrace::utils::validate_snapshot_id(prefix).is_ok() {
        return Ok(prefix.to_string());
    }

    let matches: Vec<String> = history
        .storage()
        .list_all_snapshots()?
        .into_iter()
        .filter(|s| s.id.starts_with(prefix))
        .map(|s| s.id)
        .collect();

    match matches.as_slice() {
        [id] => Ok(id.clone()),
        [] => Err(HistoryError::SnapshotNotFound(prefix.to_string())),
        _ => Err(HistoryError::validation(format!(
            "snapshot prefix '{}' is ambiguous ({} matches)",
            prefix,
            matches.len()
        ))),
    }
}

fn selection(history: &LocalHistoryManager, prefixes: &[String]) -> Result<SnapshotSelection> {
    let ids = prefixes
        .iter()
        .map(|prefix| resolve_id(history, prefix))
        .collect::<Result<Vec<_>>>()?;
    Ok(SnapshotSelection::Multiple(ids))
}

fn cmd_snapshot(
    history: &LocalHistoryManager,
    file: &Path,
    source: SnapshotSource,
    force: bool,
    deleted: bool,
) -> anyhow::Result<()> {
    let uri = file_uri(file)?;

    if deleted {
        let marker = history.create_deletion_snapshot(&uri)?;
        println!("{} Recorded deletion {}", "✓".green().bold(), marker.short_id().yellow().bold());
        return Ok(());
    }

    let content = LocalFileAccess.read(&uri)?;
    if !force && history.is_unchanged(&uri, &content)? {
        println!("{}", "No changes since the last snapshot".yellow());
        return Ok(());
    }

    let snapshot = history.create_snapshot(&uri, &content, source)?;
    println!("{} Created snapshot {}", "✓".green().bold(), snapshot.short_id().yellow().bold());
    println!("  File: {}", snapshot.file_path.cyan());
    println!("  Size: {}", format_bytes(snapshot.metadata.size).cyan());
    println!("  Lines: {}", snapshot.metadata.line_count.to_string().cyan());
    if let Some(info) = &snapshot.diff_info {
        println!(
            "  Changes: {} {} {}",
            format!("+{}", info.added_lines).green(),
            format!("-{}", info.removed_lines).red(),
            format!("~{}", info.modified_lines).yellow()
        );
    }
    Ok(())
}

fn cmd_list(history: &LocalHistoryManager, file: &Path, filter: &SnapshotFilter) -> anyhow::Result<()> {
    let uri = file_uri(file)?;
    let snapshots = history.get_snapshots_for_file(&uri, filter, None)?;

    if snapshots.is_empty() {
        println!("{}", "No snapshots found".yellow());
        return Ok(());
    }

    println!("{} ({} snapshots)\n", file.display().to_string().blue().bold(), snapshots.len());
    for snapshot in &snapshots {
        let mut marks = Vec::new();
        if snapshot.accepted {
            marks.push("accepted".green().to_string());
        }
        if snapshot.is_discarded() {
            marks.push("discarded".dimmed().to_string());
        }
        if snapshot.is_deletion_marker() {
            marks.push("deleted".red().to_string());
        }

        let changes = snapshot
            .diff_info
            .as_ref()
            .map(|d| format!("+{} -{} ~{}", d.added_lines, d.removed_lines, d.modified_lines))
            .unwrap_or_default();

        print!(
            "{} {} {:<10} {:>10} {}",
            snapshot.short_id().yellow(),
            snapshot.display_time(),
            snapshot.source.to_string().cyan(),
            format_bytes(snapshot.metadata.size),
            changes.dimmed()
        );
        if !marks.is_empty() {
            print!(" [{}]", marks.join(", "));
        }
        println!();
    }
    Ok(())
}

fn cmd_files(history: &LocalHistoryManager) -> anyhow::Result<()> {
    let files = history.get_tracked_files()?;
    if files.is_empty() {
        println!("{}", "No files tracked".yellow());
    }
    for uri in files {
        println!("{}", retrace::host::file_path_from_uri(&uri).display());
    }
    Ok(())
}

fn cmd_diff(
    history: &LocalHistoryManager,
    from: &str,
    to: Option<&str>,
    current: bool,
    stat_only: bool,
) -> anyhow::Result<()> {
    let from = resolve_id(history, from)?;
    let diff = match (to, current) {
        (_, true) => history.diff_with_current(&from, &LocalFileAccess)?,
        (Some(to), false) => history.diff_snapshots(&from, &resolve_id(history, to)?)?,
        (None, false) => history.diff_with_previous(&from)?,
    };
    print_diff(&diff, stat_only);
    Ok(())
}

fn print_diff(diff: &DetailedDiff, stat_only: bool) {
    if diff.is_binary {
        println!("{}", "Binary content differs".yellow());
        return;
    }
    if !diff.has_changes() {
        println!("{}", "No differences".green());
        return;
    }

    if !stat_only {
        for block in &diff.blocks {
            println!(
                "{}",
                format!(
                    "@@ -{},{} +{},{} @@",
                    block.original_start + 1,
                    block.original_length,
                    block.modified_start + 1,
                    block.modified_length
                )
                .cyan()
            );
            if block.original_length > 0 {
                for line in block.original_content.split('\n') {
                    println!("{}{}", "-".red(), line.red());
                }
            }
            if block.modified_length > 0 {
                for line in block.modified_content.split('\n') {
                    println!("{}{}", "+".green(), line.green());
                }
            }
        }
        println!();
    }

    println!(
        "{} added, {} removed, {} modified",
        diff.stats.added_lines.to_string().green(),
        diff.stats.removed_lines.to_string().red(),
        diff.stats.modified_lines.to_string().yellow()
    );
}

fn report_batch(verb: &str, outcome: &BatchOutcome) -> anyhow::Result<()> {
    println!(
        "{} {} {} snapshot(s)",
        "✓".green().bold(),
        verb,
        outcome.processed.len().to_string().yellow()
    );
    for failure in &outcome.failed {
        println!("  {} {}: {}", "✗".red(), failure.id, failure.reason);
    }
    if outcome.is_complete() {
        Ok(())
    } else {
        anyhow::bail!("{} snapshot(s) failed", outcome.failed.len())
    }
}

fn cmd_clear(history: &LocalHistoryManager) -> anyhow::Result<()> {
    let start = Instant::now();
    let report = history.clear_snapshots();
    if report.skipped {
        println!("{}", "Cleanup already in progress".yellow());
        return Ok(());
    }

    println!(
        "{} Removed {} snapshot(s), reclaimed {} in {}",
        "✓".green().bold(),
        report.total_deleted().to_string().yellow(),
        format_bytes(report.total_reclaimed()).cyan(),
        format_duration(start.elapsed())
    );
    for failure in report.failures() {
        println!("  {} {}", "✗".red(), failure.user_message());
    }
    if report.is_success() {
        Ok(())
    } else {
        anyhow::bail!("cleanup finished with errors")
    }
}

fn cmd_verify(history: &LocalHistoryManager, deep: bool) -> anyhow::Result<()> {
    println!("{}", "Verifying storage...".blue().bold());
    let report = history.verify(deep)?;

    let status = |problems: &[String]| {
        if problems.is_empty() {
            "✓ None".green()
        } else {
            format!("✗ {}", problems.len()).red()
        }
    };
    println!("  Snapshots checked: {}", report.snapshots_checked.to_string().cyan());
    println!("  Index errors: {}", status(&report.index_errors));
    println!("  Unindexed snapshots: {}", status(&report.unindexed_snapshots));
    println!(
        "  Aggregates: {}",
        if report.aggregates_valid { "✓ Valid".green() } else { "✗ Drifted".red() }
    );
    println!("  Missing blobs: {}", status(&report.missing_blobs));
    if deep {
        println!("  Corrupt blobs: {}", status(&report.corrupt_blobs));
    }
    println!("  Unreferenced blobs: {}", status(&report.unreferenced_blobs));

    if report.is_valid() {
        println!("\n{} {}", "✓".green().bold(), report.summary());
        Ok(())
    } else {
        Err(HistoryError::corruption(report.summary()).into())
    }
}

fn cmd_stats(history: &LocalHistoryManager, storage_path: &Path) -> anyhow::Result<()> {
    let stats = history.stats()?;
    let last_cleanup = if stats.last_cleanup > 0 {
        chrono::DateTime::from_timestamp_millis(stats.last_cleanup)
            .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "unknown".to_string())
    } else {
        "never".to_string()
    };

    println!("{}", "Local history".blue().bold());
    println!("  Storage: {}", storage_path.display().to_string().cyan());
    println!("  Snapshots: {}", stats.total_snapshots.to_string().cyan());
    println!("  Files: {}", stats.tracked_files.to_string().cyan());
    println!("  Size: {}", format_bytes(stats.total_size).cyan());
    println!("  Blobs: {}", stats.blob_count.to_string().cyan());
    println!("  Last cleanup: {}", last_cleanup.cyan());
    println!(
        "  Limits: {} days, {}",
        history.config().ttl_days,
        format_bytes(history.config().max_storage_bytes)
    );
    Ok(())
}
