//! Analysis stage: compare collected copies across hosts.
//!
//! Only paths with a valid fingerprint on every configured host are
//! compared. Files whose checksums all match are never diffed. Each
//! comparison runs as its own task under the concurrency limit and reports
//! into a single aggregator over a channel.

pub mod textdiff;

use crate::archive::extract::resolve_entry_path;
use crate::config::{host_collection_dir, RunConfig};
use crate::manifest::Manifest;
use crate::{RemoteDiffError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Produces a unified diff between two local files.
pub trait ContentDiff: Send + Sync {
    /// Empty output means no textual difference.
    fn diff(&self, left: &Path, right: &Path, left_label: &str, right_label: &str) -> Result<String>;
}

/// In-process line diff.
#[derive(Debug, Clone)]
pub struct UnifiedDiff {
    pub context: usize,
}

impl Default for UnifiedDiff {
    fn default() -> Self {
        Self {
            context: textdiff::DEFAULT_CONTEXT,
        }
    }
}

fn read_for_diff(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .map_err(|e| RemoteDiffError::Comparison(format!("failed to read {}: {}", path.display(), e)))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

impl ContentDiff for UnifiedDiff {
    fn diff(&self, left: &Path, right: &Path, left_label: &str, right_label: &str) -> Result<String> {
        let old = read_for_diff(left)?;
        let new = read_for_diff(right)?;
        Ok(textdiff::unified_diff(&old, &new, left_label, right_label, self.context))
    }
}

/// Outcome of comparing one path across all hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComparisonResult {
    pub path: String,
    pub differs: bool,

    /// Unified diff per host pair, keyed `<hostA>_vs_<hostB>`
    pub diffs: BTreeMap<String, String>,

    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ComparisonResult {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Default::default()
        }
    }
}

/// Aggregated outcome of an analysis run.
#[derive(Debug, Default)]
pub struct AnalysisReport {
    /// Sorted by path
    pub results: Vec<ComparisonResult>,
    pub total: usize,
    pub identical: usize,
    pub differing: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl AnalysisReport {
    pub fn differences_found(&self) -> bool {
        self.differing > 0
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    fn record(&mut self, result: ComparisonResult) {
        self.total += 1;
        if result.differs {
            self.differing += 1;
        } else if result.errors.is_empty() {
            self.identical += 1;
        }
        for e in &result.errors {
            error!(path = %result.path, "{}", e);
            self.errors.push(format!("{}: {}", result.path, e));
        }
        for w in &result.warnings {
            warn!(path = %result.path, "{}", w);
            self.warnings.push(format!("{}: {}", result.path, w));
        }
        self.results.push(result);
    }
}

impl fmt::Display for AnalysisReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Analysis summary:")?;
        writeln!(f, "  Files compared: {}", self.total)?;
        writeln!(f, "  Identical:      {}", self.identical)?;
        writeln!(f, "  Differing:      {}", self.differing)?;
        if !self.warnings.is_empty() {
            writeln!(f, "  Warnings:       {}", self.warnings.len())?;
        }
        if !self.errors.is_empty() {
            writeln!(f, "  Errors:         {}", self.errors.len())?;
        }
        Ok(())
    }
}

/// Paths with a valid record on every host, sorted.
pub fn files_to_compare(hosts: &[String], manifest: &Manifest) -> Vec<String> {
    manifest.with_files(|files| {
        let mut all_paths: Vec<&String> = files.values().flat_map(|records| records.keys()).collect();
        all_paths.sort();
        all_paths.dedup();

        let mut common = Vec::new();
        for path in all_paths {
            let (present, missing): (Vec<&str>, Vec<&str>) = hosts.iter().map(String::as_str).partition(|host| {
                files
                    .get(*host)
                    .and_then(|records| records.get(path))
                    .is_some_and(|record| record.is_valid())
            });
            if missing.is_empty() {
                common.push(path.clone());
            } else {
                info!(
                    %path,
                    present = ?present,
                    missing = ?missing,
                    "Skipping file not collected successfully on every server"
                );
            }
        }
        common
    })
}

fn pair_key(left: &str, right: &str) -> String {
    format!("{}_vs_{}", left, right)
}

/// File name of a persisted pairwise diff.
pub fn diff_file_name(path: &str, left: &str, right: &str) -> String {
    format!("{}__{}.diff", path.replace('/', "_"), pair_key(left, right))
}

/// `path` as a relative path that stays inside a host's collection dir.
fn confined_relative(path: &str) -> Option<PathBuf> {
    resolve_entry_path(Path::new(""), Path::new(path)).filter(|p| !p.as_os_str().is_empty())
}

/// Compare one path across `hosts`. Never fails; problems land in the result.
pub fn compare_file(
    path: &str,
    hosts: &[String],
    manifest: &Manifest,
    output_dir: &Path,
    diff_dir: Option<&Path>,
    differ: &dyn ContentDiff,
) -> ComparisonResult {
    let mut result = ComparisonResult::new(path);

    let Some(relative) = confined_relative(path) else {
        warn!(%path, "Manifest path escapes the collection directory");
        result
            .errors
            .push(format!("path {:?} is outside the collection directory", path));
        return result;
    };

    let mut checksums = Vec::with_capacity(hosts.len());
    for host in hosts {
        match manifest.get_file_info(host, path) {
            Some(record) if record.is_valid() => checksums.push(record.checksum),
            _ => {
                result
                    .errors
                    .push(format!("no valid fingerprint on {}", host));
                return result;
            }
        }
    }

    if checksums.windows(2).all(|w| w[0] == w[1]) {
        debug!(%path, "Checksums match on all servers");
        return result;
    }
    result.differs = true;

    for (i, left) in hosts.iter().enumerate() {
        for right in &hosts[i + 1..] {
            let key = pair_key(left, right);
            let left_path = host_collection_dir(output_dir, left).join(&relative);
            let right_path = host_collection_dir(output_dir, right).join(&relative);

            let diff = match differ.diff(
                &left_path,
                &right_path,
                &format!("{}/{}", left, path),
                &format!("{}/{}", right, path),
            ) {
                Ok(diff) => diff,
                Err(e) => {
                    result.errors.push(format!("diff {} failed: {}", key, e));
                    continue;
                }
            };

            if diff.is_empty() {
                result.warnings.push(format!(
                    "checksums differ between {} and {} but no textual difference was found",
                    left, right
                ));
                continue;
            }

            if let Some(dir) = diff_dir {
                let target = dir.join(diff_file_name(path, left, right));
                match std::fs::write(&target, &diff) {
                    Ok(()) => debug!(%path, "Diff saved to {}", target.display()),
                    Err(e) => result
                        .errors
                        .push(format!("failed to write {}: {}", target.display(), e)),
                }
            }
            result.diffs.insert(key, diff);
        }
    }

    result
}

/// Compare every common path across the configured hosts.
pub async fn run_analysis(
    config: Arc<RunConfig>,
    manifest: Arc<Manifest>,
    differ: Arc<dyn ContentDiff>,
    cancel: CancellationToken,
) -> Result<AnalysisReport> {
    let hosts = config.hosts().to_vec();
    if hosts.len() < 2 {
        warn!("Fewer than two servers configured, nothing to compare against");
    }
    for host in &hosts {
        let dir = host_collection_dir(&config.output_dir, host);
        if !dir.is_dir() {
            return Err(RemoteDiffError::MissingCollection {
                host: host.clone(),
                path: dir,
            });
        }
    }

    if let Some(dir) = &config.diff_dir {
        std::fs::create_dir_all(dir)?;
        info!("Saving diffs to {}", dir.display());
    }

    let paths = files_to_compare(&hosts, &manifest);
    info!(
        "Comparing {} files across {} servers (max concurrency: {})",
        paths.len(),
        hosts.len(),
        config.max_concurrency
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<ComparisonResult>();

    let aggregator = tokio::spawn(async move {
        let mut report = AnalysisReport::default();
        while let Some(result) = rx.recv().await {
            report.record(result);
        }
        report.results.sort_by(|a, b| a.path.cmp(&b.path));
        report
    });

    let hosts = Arc::new(hosts);
    let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
    let mut handles = Vec::with_capacity(paths.len());

    for path in paths {
        let sem = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let config = Arc::clone(&config);
        let manifest = Arc::clone(&manifest);
        let differ = Arc::clone(&differ);
        let hosts = Arc::clone(&hosts);
        let tx = tx.clone();

        let handle = tokio::spawn(async move {
            let permit = tokio::select! {
                result = sem.acquire_owned() => result.map_err(|e| RemoteDiffError::Limiter(e.to_string())),
                _ = cancel.cancelled() => Err(RemoteDiffError::Limiter("cancelled while waiting for a slot".into())),
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(e) => {
                    let mut result = ComparisonResult::new(&path);
                    result.errors.push(e.to_string());
                    let _ = tx.send(result);
                    return;
                }
            };
            if cancel.is_cancelled() {
                drop(permit);
                let mut result = ComparisonResult::new(&path);
                result.errors.push("cancelled before comparison started".to_string());
                let _ = tx.send(result);
                return;
            }

            let task_path = path.clone();
            let result = tokio::task::spawn_blocking(move || {
                compare_file(
                    &task_path,
                    &hosts,
                    &manifest,
                    &config.output_dir,
                    config.diff_dir.as_deref(),
                    differ.as_ref(),
                )
            })
            .await
            .unwrap_or_else(|e| {
                let mut result = ComparisonResult::new(&path);
                result.errors.push(RemoteDiffError::Task(e.to_string()).to_string());
                result
            });
            drop(permit);

            let _ = tx.send(result);
        });
        handles.push(handle);
    }
    drop(tx);

    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Comparison task panicked: {}", e);
        }
    }

    let report = aggregator
        .await
        .map_err(|e| RemoteDiffError::Task(e.to_string()))?;

    info!(
        total = report.total,
        identical = report.identical,
        differing = report.differing,
        errors = report.error_count(),
        "Analysis finished"
    );
    Ok(report)
}
