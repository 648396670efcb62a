//! Error types shared by the collection and analysis pipelines.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Stage of the per-host collection workflow where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    UploadScript,
    ExecuteScript,
    DownloadArchive,
    Extract,
    Fingerprint,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Connect => "connect",
            Stage::UploadScript => "upload script",
            Stage::ExecuteScript => "execute script",
            Stage::DownloadArchive => "download archive",
            Stage::Extract => "extract archive",
            Stage::Fingerprint => "fingerprint",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum RemoteDiffError {
    /// Dial or handshake failure, after the retry budget is spent.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Credential parsing or authentication failure. Never retried.
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Remote command `{command}` exited with status {status}: {stderr}")]
    RemoteExecution {
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Archive entry {entry:?} escapes destination {}", dest.display())]
    ExtractionSecurity { entry: String, dest: PathBuf },

    #[error("Failed to fingerprint {}: {source}", path.display())]
    Fingerprint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Comparison error: {0}")]
    Comparison(String),

    #[error("[{host}] {stage} failed: {source}")]
    Collect {
        host: String,
        stage: Stage,
        #[source]
        source: Box<RemoteDiffError>,
    },

    #[error("Collection directory {} for host {host} not found. Run 'collect' first", path.display())]
    MissingCollection { host: String, path: PathBuf },

    #[error("Concurrency limiter unavailable: {0}")]
    Limiter(String),

    #[error("Worker task failed: {0}")]
    Task(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RemoteDiffError {
    /// Wrap an error with the host and stage it happened in.
    pub fn at(self, host: &str, stage: Stage) -> Self {
        RemoteDiffError::Collect {
            host: host.to_string(),
            stage,
            source: Box::new(self),
        }
    }

    /// Stage of a collection failure, if this is one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RemoteDiffError::Collect { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RemoteDiffError>;
