//! Remote session capability.
//!
//! The pipelines only ever talk to hosts through [`Connector`] and
//! [`RemoteSession`]; [`ssh::SshConnector`] is the production implementation.

pub mod ssh;

use crate::Result;
use std::path::Path;

pub use ssh::SshConnector;

/// Captured output of a remote command that exited with status 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// An authenticated session to one host.
///
/// Implementations are blocking; async callers run them on the blocking pool.
pub trait RemoteSession: Send {
    /// Run `command`, prefixed with `sudo` when `elevate` is set.
    ///
    /// A non-zero exit status is reported as `RemoteExecution`, carrying both
    /// output streams; transport failures are reported as `Transport`.
    fn run_command(&self, command: &str, elevate: bool) -> Result<CommandOutput>;

    fn upload_file(&self, local: &Path, remote: &str) -> Result<()>;

    fn download_file(&self, remote: &str, local: &Path) -> Result<()>;

    /// Whether passwordless privilege escalation works. Advisory only.
    fn check_privilege_escalation(&self) -> bool;

    fn close(&mut self);
}

/// Opens sessions to hosts.
pub trait Connector: Send + Sync {
    fn connect(&self, host: &str) -> Result<Box<dyn RemoteSession>>;
}
