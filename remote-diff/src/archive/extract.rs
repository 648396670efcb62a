//! Gzip-compressed tar extraction with path sanitization.
//!
//! Every entry name is resolved lexically against the destination before
//! anything touches the filesystem. An entry that would land outside the
//! destination aborts the whole extraction.

use crate::{RemoteDiffError, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};

/// Summary of one extraction.
#[derive(Debug, Default, Clone)]
pub struct ExtractReport {
    pub files: usize,
    pub dirs: usize,

    /// Entries that were recognized but not materialized (links, unknown types)
    pub warnings: Vec<String>,
}

/// Resolve `name` under `dest` without touching the filesystem.
///
/// Returns `None` when the name is absolute or climbs above `dest`.
pub(crate) fn resolve_entry_path(dest: &Path, name: &Path) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in name.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !relative.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(dest.join(relative))
}

/// Unpack a `.tar.gz` stream into `dest`, creating it if needed.
///
/// # Errors
/// * `ExtractionSecurity` if any entry escapes `dest`
/// * `Io` for read/write failures; a partially written file is removed first
pub fn extract_tar_gz<R: Read>(reader: R, dest: &Path) -> Result<ExtractReport> {
    fs::create_dir_all(dest)?;

    let mut archive = Archive::new(GzDecoder::new(reader));
    let mut report = ExtractReport::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();

        if name == "." || name == "./" {
            tracing::debug!("Skipping tar archive root entry: {}", name);
            continue;
        }

        let target = match resolve_entry_path(dest, Path::new(&name)) {
            Some(target) => target,
            None => {
                tracing::error!(entry = %name, dest = %dest.display(), "Path sanitization failed");
                return Err(RemoteDiffError::ExtractionSecurity {
                    entry: name,
                    dest: dest.to_path_buf(),
                });
            }
        };
        if target == dest {
            continue;
        }

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                report.dirs += 1;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mode = entry.header().mode().ok();
                let size = entry.size();
                write_entry(&mut entry, &target, size)?;
                apply_mode(&target, mode)?;
                report.files += 1;
            }
            EntryType::Symlink | EntryType::Link => {
                let link = entry
                    .link_name()
                    .ok()
                    .flatten()
                    .map(|l| l.display().to_string())
                    .unwrap_or_default();
                let msg = format!("Skipping link extraction (not supported): {} -> {}", name, link);
                tracing::warn!("{}", msg);
                report.warnings.push(msg);
            }
            other => {
                let msg = format!("Unsupported tar entry type {:?} for {}", other, name);
                tracing::warn!("{}", msg);
                report.warnings.push(msg);
            }
        }
    }

    Ok(report)
}

fn write_entry<R: Read>(entry: &mut R, target: &Path, expected: u64) -> Result<()> {
    let mut out = File::create(target)?;
    let copied = io::copy(entry, &mut out).and_then(|bytes| {
        if bytes == expected {
            Ok(bytes)
        } else {
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("archive entry truncated: {} of {} bytes", bytes, expected),
            ))
        }
    });

    match copied {
        Ok(bytes) => {
            tracing::trace!("Extracted {} bytes to {}", bytes, target.display());
            Ok(())
        }
        Err(e) => {
            drop(out);
            if let Err(rm) = fs::remove_file(target) {
                tracing::warn!("Failed to remove partial file {}: {}", target.display(), rm);
            }
            Err(e.into())
        }
    }
}

/// Apply the archived mode bits, keeping the file readable by the owner so it
/// can be fingerprinted.
#[cfg(unix)]
fn apply_mode(target: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = mode {
        fs::set_permissions(target, fs::Permissions::from_mode((mode & 0o777) | 0o600))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_mode(_target: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}
