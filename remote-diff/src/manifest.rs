//! Fingerprint manifest shared by collection and analysis.
//!
//! Maps host → relative path → [`FileRecord`]. Collection workers upsert
//! under an exclusive lock; analysis readers take the shared lock. Persisted
//! as `collected-files/manifest.json` under the output directory.

use crate::config::manifest_path;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

type FilesByHost = BTreeMap<String, BTreeMap<String, FileRecord>>;

/// Fingerprint (or failure) for one collected file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Forward-slash path relative to the host's collection root
    pub path: String,

    /// Lowercase hex SHA-256, empty when `error` is set
    #[serde(default)]
    pub checksum: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl FileRecord {
    /// Whether this record can take part in a comparison.
    pub fn is_valid(&self) -> bool {
        self.error.is_empty() && !self.checksum.is_empty()
    }
}

#[derive(Serialize, Deserialize)]
struct ManifestDocument {
    #[serde(default)]
    files_by_server: FilesByHost,
}

#[derive(Debug, Default)]
pub struct Manifest {
    files: RwLock<FilesByHost>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, FilesByHost> {
        self.files.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FilesByHost> {
        self.files.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the record for `host`/`relative_path`.
    pub fn add_file(&self, host: &str, relative_path: &str, checksum: &str, error: &str) {
        let mut files = self.write();
        files.entry(host.to_string()).or_default().insert(
            relative_path.to_string(),
            FileRecord {
                path: relative_path.to_string(),
                checksum: checksum.to_string(),
                error: error.to_string(),
            },
        );
    }

    pub fn get_file_info(&self, host: &str, relative_path: &str) -> Option<FileRecord> {
        self.read()
            .get(host)
            .and_then(|files| files.get(relative_path))
            .cloned()
    }

    #[cfg(test)]
    fn hosts(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Snapshot of every record collected for `host`, sorted by path.
    #[cfg(test)]
    fn files_for(&self, host: &str) -> Vec<FileRecord> {
        self.read()
            .get(host)
            .map(|files| files.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Run `f` against the whole map under a single shared lock.
    pub(crate) fn with_files<T>(&self, f: impl FnOnce(&FilesByHost) -> T) -> T {
        f(&self.read())
    }

    pub(crate) fn total_records(&self) -> usize {
        self.read().values().map(BTreeMap::len).sum()
    }

    /// Atomically write the manifest under `output_dir`.
    ///
    /// The JSON is written to a temporary file in the target directory and
    /// renamed into place.
    pub fn save(&self, output_dir: &Path) -> Result<PathBuf> {
        let path = manifest_path(output_dir);
        let dir = path.parent().unwrap_or(output_dir);
        std::fs::create_dir_all(dir)?;

        let data = {
            let files = self.read();
            serde_json::to_vec_pretty(&ManifestDocumentRef {
                files_by_server: &files,
            })?
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        tracing::info!("Manifest saved to {}", path.display());
        Ok(path)
    }

    /// Load the manifest from `output_dir`.
    ///
    /// A missing file is a fresh environment and yields an empty manifest.
    pub fn load(output_dir: &Path) -> Result<Self> {
        let path = manifest_path(output_dir);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Manifest file {} not found, starting empty", path.display());
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };

        let doc: ManifestDocument = serde_json::from_slice(&data)?;
        tracing::info!("Manifest loaded from {}", path.display());
        Ok(Self {
            files: RwLock::new(doc.files_by_server),
        })
    }
}

#[derive(Serialize)]
struct ManifestDocumentRef<'a> {
    files_by_server: &'a FilesByHost,
}
