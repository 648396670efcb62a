//! Per-host collection workflow.
//!
//! `Connect → UploadScript → ExecuteScript → DownloadArchive → Extract →
//! Fingerprint → Cleanup`. Each failing stage is tagged with [`Stage`]. Once
//! the script is on the remote host, [`RemoteStaging`] guarantees a
//! best-effort cleanup on every exit path, and [`SessionGuard`] closes the
//! session.

use crate::archive::script::render;
use crate::archive::{extract_tar_gz, sha256_file, MissingMarkers, RemoteLayout};
use crate::config::host_collection_dir;
use crate::error::Stage;
use crate::manifest::Manifest;
use crate::session::{Connector, RemoteSession};
use crate::{RemoteDiffError, Result};
use std::fs::File;
use std::io::Write;
use std::ops::Deref;
use std::path::Path;
use walkdir::WalkDir;

pub const MISSING_ON_REMOTE: &str = "Missing on remote";

/// What to collect from one host.
#[derive(Debug, Clone, Copy)]
pub struct HostPlan<'a> {
    pub files: &'a [String],
    pub dirs: &'a [String],
    pub remote_user: &'a str,
    pub output_dir: &'a Path,
}

/// Outcome of a successful host collection.
#[derive(Debug, Clone, Default)]
pub struct HostSummary {
    pub host: String,
    pub fingerprinted: usize,
    pub missing: usize,
    pub errors: usize,
    pub extract_warnings: Vec<String>,
}

/// Closes the session when dropped.
struct SessionGuard(Box<dyn RemoteSession>);

impl Deref for SessionGuard {
    type Target = dyn RemoteSession;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Remote script, staging tree and tarball for one run. Removed on drop
/// unless [`RemoteStaging::finish`] already did it.
struct RemoteStaging<'s> {
    session: &'s dyn RemoteSession,
    host: &'s str,
    layout: &'s RemoteLayout,
    armed: bool,
}

impl<'s> RemoteStaging<'s> {
    fn new(session: &'s dyn RemoteSession, host: &'s str, layout: &'s RemoteLayout) -> Self {
        Self {
            session,
            host,
            layout,
            armed: true,
        }
    }

    fn cleanup(&mut self) -> Result<()> {
        self.armed = false;
        tracing::info!(host = self.host, "Cleaning up remote files...");
        self.session
            .run_command(&self.layout.cleanup_command(), false)
            .map(|_| ())
    }

    /// Clean up now. Failures are logged, never returned.
    fn finish(mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(host = self.host, "Remote cleanup failed: {}", e);
        }
    }
}

impl Drop for RemoteStaging<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.cleanup() {
                tracing::warn!(host = self.host, "Remote cleanup after failure failed: {}", e);
            }
        }
    }
}

/// Collect one host into `manifest`.
pub fn collect_host(
    host: &str,
    plan: &HostPlan<'_>,
    connector: &dyn Connector,
    manifest: &Manifest,
) -> Result<HostSummary> {
    tracing::info!(host, "Starting collection");

    let session = SessionGuard(connector.connect(host).map_err(|e| e.at(host, Stage::Connect))?);

    // Advisory: the script itself decides whether elevation works.
    session.check_privilege_escalation();

    let layout = RemoteLayout::for_user(plan.remote_user);
    upload_script(&*session, plan, &layout).map_err(|e| e.at(host, Stage::UploadScript))?;
    tracing::debug!(host, "Collection script uploaded to {}", layout.script_path);

    let staging = RemoteStaging::new(&*session, host, &layout);

    execute_script(&*session, host, &layout).map_err(|e| e.at(host, Stage::ExecuteScript))?;

    let tarball = tempfile::Builder::new()
        .prefix(&format!("remote_backup_{}_", host))
        .suffix(".tar.gz")
        .tempfile()
        .map_err(|e| RemoteDiffError::from(e).at(host, Stage::DownloadArchive))?;
    tracing::info!(host, "Downloading {}...", layout.tarball);
    session
        .download_file(&layout.tarball, tarball.path())
        .map_err(|e| e.at(host, Stage::DownloadArchive))?;

    let host_dir = host_collection_dir(plan.output_dir, host);
    let extract_warnings = extract(host, tarball.path(), &host_dir).map_err(|e| e.at(host, Stage::Extract))?;

    let markers = MissingMarkers::new(plan.files, plan.dirs);
    let mut summary =
        fingerprint_tree(host, &host_dir, &markers, manifest).map_err(|e| e.at(host, Stage::Fingerprint))?;
    summary.extract_warnings = extract_warnings;

    staging.finish();

    tracing::info!(
        host,
        files = summary.fingerprinted,
        missing = summary.missing,
        errors = summary.errors,
        "Collection finished"
    );
    Ok(summary)
}

fn upload_script(session: &dyn RemoteSession, plan: &HostPlan<'_>, layout: &RemoteLayout) -> Result<()> {
    let content = render(plan.files, plan.dirs, layout);
    let mut local = tempfile::Builder::new()
        .prefix("collect_script_")
        .suffix(".sh")
        .tempfile()?;
    local.write_all(content.as_bytes())?;
    local.flush()?;
    session.upload_file(local.path(), &layout.script_path)
}

fn execute_script(session: &dyn RemoteSession, host: &str, layout: &RemoteLayout) -> Result<()> {
    let script = layout.script_path.as_str();
    if let Err(e) = session.run_command(&format!("chmod +x {}", script), false) {
        tracing::warn!(host, "Failed to chmod script (continuing anyway): {}", e);
    }

    tracing::info!(host, "Running collection script...");
    match session.run_command(script, false) {
        Ok(output) => {
            tracing::debug!(host, stdout = %output.stdout, "Collection script output");
            tracing::info!(host, "Collection script finished successfully");
            Ok(())
        }
        Err(e) => {
            if let RemoteDiffError::RemoteExecution { stderr, .. } = &e {
                tracing::error!(host, %stderr, "Collection script failed");
            }
            Err(e)
        }
    }
}

/// Replace `host_dir` with the contents of `tarball`.
fn extract(host: &str, tarball: &Path, host_dir: &Path) -> Result<Vec<String>> {
    if host_dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(host_dir) {
            tracing::warn!(host, "Failed to clear previous output {}: {}", host_dir.display(), e);
        }
    }
    std::fs::create_dir_all(host_dir)?;

    tracing::info!(host, "Extracting archive to {}...", host_dir.display());
    let report = extract_tar_gz(File::open(tarball)?, host_dir)?;
    tracing::debug!(host, files = report.files, dirs = report.dirs, "Archive extracted");
    Ok(report.warnings)
}

/// Record every regular file under `root` in the manifest.
fn fingerprint_tree(host: &str, root: &Path, markers: &MissingMarkers, manifest: &Manifest) -> Result<HostSummary> {
    tracing::info!(host, "Calculating checksums for files in {}...", root.display());
    let mut summary = HostSummary {
        host: host.to_string(),
        ..Default::default()
    };

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(std::io::Error::from(e).into()),
            Err(e) => {
                tracing::error!(host, "Error accessing path during walk: {}", e);
                if let Some(relative) = e.path().and_then(|p| relative_slash_path(root, p)) {
                    manifest.add_file(host, &relative, "", &e.to_string());
                    summary.errors += 1;
                }
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(relative) = relative_slash_path(root, entry.path()) else {
            continue;
        };

        if let Some(original) = markers.original(&relative) {
            tracing::warn!(host, path = original, "Marked as missing on remote");
            manifest.add_file(host, original, "", MISSING_ON_REMOTE);
            summary.missing += 1;
            continue;
        }

        match sha256_file(entry.path()) {
            Ok(checksum) => {
                tracing::trace!(host, path = %relative, %checksum, "Checksum");
                manifest.add_file(host, &relative, &checksum, "");
                summary.fingerprinted += 1;
            }
            Err(e) => {
                tracing::error!(host, path = %relative, "Failed to calculate checksum: {}", e);
                manifest.add_file(host, &relative, "", &e.to_string());
                summary.errors += 1;
            }
        }
    }

    Ok(summary)
}

fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
