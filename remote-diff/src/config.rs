//! Run configuration and on-disk layout.
//!
//! Targets (hosts, files, directories) are persisted as `conf/config.json`
//! under the output directory. SSH credentials come from the environment and
//! are never written anywhere.

use crate::{RemoteDiffError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_DIR: &str = "conf";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const COLLECTED_FILES_DIR: &str = "collected-files";
pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;
pub const DEFAULT_DIFF_DIR: &str = "./diff_output";

/// Path of the persisted targets file.
pub fn config_path(output_dir: &Path) -> PathBuf {
    output_dir.join(CONFIG_DIR).join(CONFIG_FILE_NAME)
}

/// Path of the persisted manifest.
pub fn manifest_path(output_dir: &Path) -> PathBuf {
    output_dir.join(COLLECTED_FILES_DIR).join(MANIFEST_FILE_NAME)
}

/// Local extraction root for one host.
pub fn host_collection_dir(output_dir: &Path, host: &str) -> PathBuf {
    output_dir
        .join(COLLECTED_FILES_DIR)
        .join(format!("files-{}", host))
}

/// Strip trailing separators from a directory target. `/` stays `/`.
pub fn normalize_dir(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// What to collect and from where.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Targets {
    #[serde(rename = "servers", default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub files: Vec<String>,

    #[serde(default)]
    pub dirs: Vec<String>,
}

/// Comma-separated values supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct TargetOverrides {
    pub hosts: Option<String>,
    pub files: Option<String>,
    pub dirs: Option<String>,
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Targets {
    /// Load `conf/config.json`. Returns `None` when the file does not exist.
    pub fn load(output_dir: &Path) -> Result<Option<Self>> {
        let path = config_path(output_dir);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let targets: Targets = serde_json::from_str(&content)?;
        tracing::info!("Loaded existing configuration from {}", path.display());
        Ok(Some(targets))
    }

    /// Load the persisted targets (if readable) and apply command line overrides.
    ///
    /// A config file that fails to parse is ignored with a warning so that the
    /// command line can repair it.
    pub fn load_with_overrides(output_dir: &Path, overrides: &TargetOverrides) -> Result<Self> {
        let mut targets = match Self::load(output_dir) {
            Ok(existing) => existing.unwrap_or_default(),
            Err(RemoteDiffError::Serialization(e)) => {
                tracing::warn!(
                    "Failed to parse {}: {}. Proceeding with arguments.",
                    config_path(output_dir).display(),
                    e
                );
                Targets::default()
            }
            Err(e) => return Err(e),
        };

        if let Some(hosts) = &overrides.hosts {
            targets.hosts = split_list(hosts);
        }
        if let Some(files) = &overrides.files {
            targets.files = split_list(files);
        }
        if let Some(dirs) = &overrides.dirs {
            targets.dirs = split_list(dirs);
        }

        targets.validate()?;
        Ok(targets)
    }

    /// Check required fields and normalize directory targets in place.
    pub fn validate(&mut self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(RemoteDiffError::Config(
                "no servers specified (use --servers or a valid conf/config.json)".into(),
            ));
        }
        if self.files.is_empty() && self.dirs.is_empty() {
            return Err(RemoteDiffError::Config(
                "no files or directories specified (use --files/--dirs or a valid conf/config.json)"
                    .into(),
            ));
        }
        for path in self.files.iter().chain(self.dirs.iter()) {
            if !path.starts_with('/') {
                return Err(RemoteDiffError::Config(format!(
                    "target path {} is not absolute",
                    path
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for host in &self.hosts {
            if !seen.insert(host.as_str()) {
                return Err(RemoteDiffError::Config(format!("duplicate server {}", host)));
            }
        }
        self.dirs = self.dirs.iter().map(|d| normalize_dir(d)).collect();
        Ok(())
    }

    /// Write `conf/config.json`.
    pub fn save(&self, output_dir: &Path) -> Result<PathBuf> {
        let path = config_path(output_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        tracing::info!("Configuration saved to {}", path.display());
        Ok(path)
    }
}

/// SSH login material. Loaded from the environment, never serialized.
#[derive(Clone)]
pub struct SshCredentials {
    pub username: String,

    /// Private key contents (PEM / OpenSSH format)
    pub key_material: String,

    pub key_passphrase: Option<String>,
}

impl fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCredentials")
            .field("username", &self.username)
            .field("key_material", &"<redacted>")
            .field("key_passphrase", &self.key_passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl SshCredentials {
    /// Read `SSHUSER`, `SSHKEYPATH` and the optional `SSHKEYPIN`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let username = lookup("SSHUSER").filter(|v| !v.is_empty());
        let key_path = lookup("SSHKEYPATH").filter(|v| !v.is_empty());

        let mut missing = Vec::new();
        if username.is_none() {
            missing.push("SSHUSER");
        }
        if key_path.is_none() {
            missing.push("SSHKEYPATH");
        }
        let (Some(username), Some(key_path)) = (username, key_path) else {
            return Err(RemoteDiffError::Config(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )));
        };

        let key_path = expand_home(&key_path, lookup("HOME"))?;
        let key_material = std::fs::read_to_string(&key_path).map_err(|e| {
            RemoteDiffError::Config(format!(
                "ssh key file {} could not be read: {}",
                key_path.display(),
                e
            ))
        })?;

        Ok(Self {
            username,
            key_material,
            key_passphrase: lookup("SSHKEYPIN").filter(|v| !v.is_empty()),
        })
    }
}

fn expand_home(path: &str, home: Option<String>) -> Result<PathBuf> {
    match path.strip_prefix('~') {
        Some(rest) => {
            let home = home.ok_or_else(|| {
                RemoteDiffError::Config("HOME is not set, cannot expand key path".into())
            })?;
            Ok(PathBuf::from(home).join(rest.trim_start_matches('/')))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Transport tuning for SSH sessions.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub port: u16,
    pub connect_timeout: Duration,

    /// Upper bound for each blocking call on an established session.
    /// `None` waits indefinitely.
    pub session_timeout: Option<Duration>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            port: 22,
            connect_timeout: Duration::from_secs(15),
            session_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Immutable settings for one run, built once by the caller.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub targets: Targets,
    pub output_dir: PathBuf,
    pub max_concurrency: usize,

    /// Where to write pairwise `.diff` files. `None` disables persistence.
    pub diff_dir: Option<PathBuf>,
}

impl RunConfig {
    pub fn new(targets: Targets, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            targets,
            output_dir: output_dir.into(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            diff_dir: None,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_diff_dir(mut self, diff_dir: Option<PathBuf>) -> Self {
        self.diff_dir = diff_dir;
        self
    }

    pub fn hosts(&self) -> &[String] {
        &self.targets.hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn sample_targets() -> Targets {
        Targets {
            hosts: vec!["web-1".into(), "web-2".into()],
            files: vec!["/etc/hosts".into()],
            dirs: vec!["/etc/nginx/".into()],
        }
    }

    #[test]
    fn test_normalize_dir() {
        assert_eq!(normalize_dir("/etc/nginx/"), "/etc/nginx");
        assert_eq!(normalize_dir("/etc/nginx//"), "/etc/nginx");
        assert_eq!(normalize_dir("/etc"), "/etc");
        assert_eq!(normalize_dir("/"), "/");
    }

    #[test]
    fn test_validate_normalizes_dirs() {
        let mut targets = sample_targets();
        targets.validate().unwrap();
        assert_eq!(targets.dirs, vec!["/etc/nginx".to_string()]);
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut no_hosts = Targets {
            hosts: vec![],
            ..sample_targets()
        };
        assert!(matches!(no_hosts.validate(), Err(RemoteDiffError::Config(_))));

        let mut no_paths = Targets {
            files: vec![],
            dirs: vec![],
            ..sample_targets()
        };
        assert!(matches!(no_paths.validate(), Err(RemoteDiffError::Config(_))));

        let mut relative = Targets {
            files: vec!["etc/hosts".into()],
            ..sample_targets()
        };
        assert!(matches!(relative.validate(), Err(RemoteDiffError::Config(_))));
    }

    #[test]
    fn test_save_and_load_uses_servers_key() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut targets = sample_targets();
        targets.validate()?;
        let path = targets.save(temp_dir.path())?;

        let raw = std::fs::read_to_string(path)?;
        assert!(raw.contains("\"servers\""));

        let loaded = Targets::load(temp_dir.path())?.unwrap();
        assert_eq!(loaded, targets);
        Ok(())
    }

    #[test]
    fn test_overrides_replace_persisted_values() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut targets = sample_targets();
        targets.validate()?;
        targets.save(temp_dir.path())?;

        let overrides = TargetOverrides {
            hosts: Some("db-1, db-2,".into()),
            ..Default::default()
        };
        let merged = Targets::load_with_overrides(temp_dir.path(), &overrides)?;
        assert_eq!(merged.hosts, vec!["db-1".to_string(), "db-2".to_string()]);
        assert_eq!(merged.files, vec!["/etc/hosts".to_string()]);
        Ok(())
    }

    #[test]
    fn test_credentials_from_lookup() -> Result<()> {
        let temp_dir = TempDir::new()?;
        std::fs::create_dir_all(temp_dir.path().join(".ssh"))?;
        std::fs::write(temp_dir.path().join(".ssh/id_ed25519"), "KEY")?;

        let mut env = HashMap::new();
        env.insert("SSHUSER", "deploy".to_string());
        env.insert("SSHKEYPATH", "~/.ssh/id_ed25519".to_string());
        env.insert("HOME", temp_dir.path().display().to_string());

        let creds = SshCredentials::from_lookup(|k| env.get(k).cloned())?;
        assert_eq!(creds.username, "deploy");
        assert_eq!(creds.key_material, "KEY");
        assert!(creds.key_passphrase.is_none());
        assert!(!format!("{:?}", creds).contains("KEY"));
        Ok(())
    }

    #[test]
    fn test_credentials_report_missing_variables() {
        let err = SshCredentials::from_lookup(|_| None).unwrap_err();
        assert!(err.to_string().contains("SSHUSER, SSHKEYPATH"));
    }
}
