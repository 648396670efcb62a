//! remote-diff - Main entry point
//!
//! Collect configuration files from a set of servers and show where they
//! differ.

mod logger;
mod shutdown;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use remote_diff::analyze::{run_analysis, AnalysisReport, UnifiedDiff};
use remote_diff::collect::{run_collection, CollectionReport};
use remote_diff::config::{DEFAULT_DIFF_DIR, DEFAULT_MAX_CONCURRENCY};
use remote_diff::session::SshConnector;
use remote_diff::{Manifest, RunConfig, SshCredentials, SshOptions, TargetOverrides, Targets};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Base directory for conf/ and collected-files/
    #[arg(short, long, global = true, default_value = ".")]
    output_dir: PathBuf,

    /// Maximum number of servers or files processed at once
    #[arg(short, long, global = true, default_value_t = DEFAULT_MAX_CONCURRENCY)]
    concurrency: usize,

    /// Log file (default: logs/remote_diff_<timestamp>.log)
    #[arg(long, global = true, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Collect files from all servers and build the manifest
    Collect(TargetArgs),

    /// Compare previously collected files
    Analyze(DiffArgs),

    /// Collect, then analyze
    All {
        #[command(flatten)]
        targets: TargetArgs,

        #[command(flatten)]
        diffs: DiffArgs,
    },
}

#[derive(clap::Args, Debug)]
struct TargetArgs {
    /// Comma-separated server list
    #[arg(short, long)]
    servers: Option<String>,

    /// Comma-separated absolute file paths
    #[arg(short, long)]
    files: Option<String>,

    /// Comma-separated absolute directory paths
    #[arg(short, long)]
    dirs: Option<String>,
}

impl TargetArgs {
    fn overrides(&self) -> TargetOverrides {
        TargetOverrides {
            hosts: self.servers.clone(),
            files: self.files.clone(),
            dirs: self.dirs.clone(),
        }
    }
}

#[derive(clap::Args, Debug)]
struct DiffArgs {
    /// Write each pairwise diff to --diff-dir
    #[arg(long)]
    save_diffs: bool,

    #[arg(long, value_name = "DIR", default_value = DEFAULT_DIFF_DIR)]
    diff_dir: PathBuf,
}

impl DiffArgs {
    fn diff_dir(&self) -> Option<PathBuf> {
        self.save_diffs.then(|| self.diff_dir.clone())
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let dotenv = dotenvy::dotenv();

    let log_path = logger::init(&args.log_level, args.log_file.as_deref())?;
    if let Some(path) = &log_path {
        eprintln!("Logging to {}", path.display());
    }
    match dotenv {
        Ok(path) => tracing::debug!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => tracing::debug!("No .env file found"),
        Err(e) => tracing::warn!("Failed to load .env file: {}", e),
    }

    tracing::info!("Starting remote-diff v{}", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    shutdown::cancel_on_signal(cancel.clone());

    let ok = match &args.command {
        Command::Collect(targets) => {
            let config = build_config(&args, load_targets_for_collect(&args, targets)?, None);
            collect(config, cancel).await?
        }
        Command::Analyze(diffs) => {
            let config = build_config(&args, load_targets_for_analyze(&args)?, diffs.diff_dir());
            analyze(config, cancel).await?
        }
        Command::All { targets, diffs } => {
            let config = build_config(&args, load_targets_for_collect(&args, targets)?, diffs.diff_dir());
            if collect(Arc::clone(&config), cancel.clone()).await? {
                analyze(config, cancel).await?
            } else {
                eprintln!("Collection failed, skipping analysis.");
                false
            }
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn build_config(args: &Args, targets: Targets, diff_dir: Option<PathBuf>) -> Arc<RunConfig> {
    Arc::new(
        RunConfig::new(targets, &args.output_dir)
            .with_max_concurrency(args.concurrency)
            .with_diff_dir(diff_dir),
    )
}

/// Merge command line values over `conf/config.json` and persist the result.
fn load_targets_for_collect(args: &Args, targets: &TargetArgs) -> Result<Targets> {
    let merged = Targets::load_with_overrides(&args.output_dir, &targets.overrides())
        .context("Invalid collection targets")?;
    merged
        .save(&args.output_dir)
        .context("Failed to save configuration")?;
    Ok(merged)
}

fn load_targets_for_analyze(args: &Args) -> Result<Targets> {
    let mut targets = Targets::load(&args.output_dir)
        .context("Failed to read configuration")?
        .with_context(|| {
            format!(
                "No configuration found in {}. Run 'collect' first",
                args.output_dir.display()
            )
        })?;
    targets.validate().context("Invalid configuration")?;
    Ok(targets)
}

async fn collect(config: Arc<RunConfig>, cancel: CancellationToken) -> Result<bool> {
    let credentials = SshCredentials::from_env().context("Failed to load SSH credentials")?;
    let remote_user = credentials.username.clone();
    let connector = Arc::new(SshConnector::new(credentials, SshOptions::default()));

    let report = run_collection(config, &remote_user, connector, cancel)
        .await
        .context("Collection failed")?;
    print_collection(&report);
    Ok(report.is_success())
}

async fn analyze(config: Arc<RunConfig>, cancel: CancellationToken) -> Result<bool> {
    let manifest = Manifest::load(&config.output_dir).context("Failed to load manifest")?;
    let report = run_analysis(config, Arc::new(manifest), Arc::new(UnifiedDiff::default()), cancel)
        .await
        .context("Analysis failed")?;
    print_analysis(&report);
    Ok(report.error_count() == 0)
}

fn print_collection(report: &CollectionReport) {
    println!("Collection results:");
    for host in &report.succeeded {
        println!(
            "  [OK]     {}: {} files fingerprinted, {} missing, {} errors",
            host.host, host.fingerprinted, host.missing, host.errors
        );
        for warning in &host.extract_warnings {
            println!("           warning: {}", warning);
        }
    }
    for (host, e) in &report.failures {
        println!("  [FAILED] {}: {}", host, e);
    }
    match (&report.manifest_path, &report.manifest_error) {
        (Some(path), _) => println!("Manifest saved to {}", path.display()),
        (None, Some(e)) => println!("Manifest could not be saved: {}", e),
        (None, None) => println!("Manifest not saved: some servers failed"),
    }
}

fn print_analysis(report: &AnalysisReport) {
    for result in &report.results {
        if result.differs {
            println!("=== {}: differences found", result.path);
            for (pair, diff) in &result.diffs {
                println!("--- {} ---", pair);
                print!("{}", diff);
            }
        } else if result.errors.is_empty() {
            println!("=== {}: identical", result.path);
        } else {
            println!("=== {}: not compared", result.path);
        }
        for e in &result.errors {
            println!("    error: {}", e);
        }
        for w in &result.warnings {
            println!("    warning: {}", w);
        }
    }
    println!();
    print!("{}", report);
    if report.differences_found() {
        println!("Differences found.");
    } else {
        println!("No differences found.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_accepts_target_and_diff_flags() {
        let args = Args::parse_from([
            "remote-diff",
            "all",
            "-s",
            "a,b",
            "-f",
            "/etc/hosts",
            "--save-diffs",
            "-c",
            "4",
        ]);
        assert_eq!(args.concurrency, 4);
        match args.command {
            Command::All { targets, diffs } => {
                assert_eq!(targets.servers.as_deref(), Some("a,b"));
                assert_eq!(diffs.diff_dir(), Some(PathBuf::from(DEFAULT_DIFF_DIR)));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_diffs_not_saved_by_default() {
        let args = Args::parse_from(["remote-diff", "analyze"]);
        assert_eq!(args.output_dir, PathBuf::from("."));
        assert_eq!(args.concurrency, DEFAULT_MAX_CONCURRENCY);
        match args.command {
            Command::Analyze(diffs) => assert_eq!(diffs.diff_dir(), None),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
