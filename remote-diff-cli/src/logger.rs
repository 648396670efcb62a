//! Logging configuration using tracing.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_DIR: &str = "logs";

/// `logs/remote_diff_<timestamp>.log`
pub fn default_log_path() -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    Path::new(LOG_DIR).join(format!("remote_diff_{}.log", stamp))
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    File::options().create(true).append(true).open(path)
}

/// Initialize logging with the specified level.
///
/// `RUST_LOG` takes precedence over `level`. Logs go to `log_file` (or the
/// default timestamped file); if it cannot be opened, to stderr. Returns the
/// file actually in use.
pub fn init(level: &str, log_file: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let path = log_file.map(Path::to_path_buf).unwrap_or_else(default_log_path);
    match open_log_file(&path) {
        Ok(file) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .try_init()?;
            Ok(Some(path))
        }
        Err(e) => {
            eprintln!(
                "Warning: could not open log file {}: {}. Logging to stderr.",
                path.display(),
                e
            );
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_path_shape() {
        let path = default_log_path();
        assert_eq!(path.parent(), Some(Path::new("logs")));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("remote_diff_"));
        assert!(name.ends_with(".log"));
        // remote_diff_YYYYmmdd_HHMMSS.log
        assert_eq!(name.len(), "remote_diff_".len() + 15 + ".log".len());
    }
}
