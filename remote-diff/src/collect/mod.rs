//! Collection stage: pull the configured files from every host in parallel.
//!
//! One task per host, bounded by a semaphore of `max_concurrency` permits.
//! The blocking session work for each host runs on the blocking pool. The
//! manifest is saved only when every host succeeded.

pub mod pipeline;

use crate::config::RunConfig;
use crate::manifest::Manifest;
use crate::session::Connector;
use crate::{RemoteDiffError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use pipeline::{collect_host, HostPlan, HostSummary, MISSING_ON_REMOTE};

/// Outcome of a collection run.
#[derive(Debug)]
pub struct CollectionReport {
    /// Successful hosts, in configured order
    pub succeeded: Vec<HostSummary>,

    /// Failed hosts with the stage-tagged error, in configured order
    pub failures: Vec<(String, RemoteDiffError)>,

    /// Set when the manifest was written
    pub manifest_path: Option<PathBuf>,

    /// Set when every host succeeded but the manifest could not be written
    pub manifest_error: Option<RemoteDiffError>,
}

impl CollectionReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.manifest_error.is_none()
    }
}

/// Collect from every configured host.
///
/// Per-host failures are reported, not returned; the `Err` case is reserved
/// for problems that prevent the run from starting at all.
pub async fn run_collection(
    config: Arc<RunConfig>,
    remote_user: &str,
    connector: Arc<dyn Connector>,
    cancel: CancellationToken,
) -> Result<CollectionReport> {
    let hosts = config.hosts().to_vec();
    if hosts.is_empty() {
        return Err(RemoteDiffError::Config("no servers to collect from".into()));
    }

    std::fs::create_dir_all(config.output_dir.join(crate::config::COLLECTED_FILES_DIR))?;

    info!(
        "Starting collection from {} servers (max concurrency: {})",
        hosts.len(),
        config.max_concurrency
    );

    let manifest = Arc::new(Manifest::new());
    let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
    let mut handles = Vec::with_capacity(hosts.len());

    for host in hosts {
        let sem = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let config = Arc::clone(&config);
        let connector = Arc::clone(&connector);
        let manifest = Arc::clone(&manifest);
        let remote_user = remote_user.to_string();

        let handle = tokio::spawn(async move {
            let permit = tokio::select! {
                result = sem.acquire_owned() => {
                    match result {
                        Ok(permit) => permit,
                        Err(e) => return (host, Err(RemoteDiffError::Limiter(e.to_string()))),
                    }
                }
                _ = cancel.cancelled() => {
                    return (host, Err(RemoteDiffError::Limiter("cancelled while waiting for a slot".into())));
                }
            };

            if cancel.is_cancelled() {
                drop(permit);
                return (host, Err(RemoteDiffError::Limiter("cancelled".into())));
            }

            let task_host = host.clone();
            let result = tokio::task::spawn_blocking(move || {
                let plan = HostPlan {
                    files: &config.targets.files,
                    dirs: &config.targets.dirs,
                    remote_user: &remote_user,
                    output_dir: &config.output_dir,
                };
                collect_host(&task_host, &plan, connector.as_ref(), &manifest)
            })
            .await
            .unwrap_or_else(|e| Err(RemoteDiffError::Task(e.to_string())));

            drop(permit);
            (host, result)
        });

        handles.push(handle);
    }

    let mut succeeded = Vec::new();
    let mut failures = Vec::new();
    for handle in handles {
        match handle.await {
            Ok((_, Ok(summary))) => succeeded.push(summary),
            Ok((host, Err(e))) => {
                error!(host = %host, "Collection failed: {}", e);
                failures.push((host, e));
            }
            Err(e) => {
                warn!("Collection task panicked: {}", e);
                failures.push(("<unknown>".to_string(), RemoteDiffError::Task(e.to_string())));
            }
        }
    }

    let mut report = CollectionReport {
        succeeded,
        failures,
        manifest_path: None,
        manifest_error: None,
    };

    if !report.failures.is_empty() {
        error!(
            "{} of {} servers failed, manifest not saved",
            report.failures.len(),
            report.failures.len() + report.succeeded.len()
        );
        return Ok(report);
    }

    info!("Collection completed for all servers, saving manifest...");
    match manifest.save(&config.output_dir) {
        Ok(path) => {
            info!(records = manifest.total_records(), "Manifest saved to {}", path.display());
            report.manifest_path = Some(path);
        }
        Err(e) => {
            error!("Failed to save manifest: {}", e);
            report.manifest_error = Some(e);
        }
    }
    Ok(report)
}
