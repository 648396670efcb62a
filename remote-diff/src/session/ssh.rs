//! SSH/SFTP sessions backed by libssh2.

use super::{CommandOutput, Connector, RemoteSession};
use crate::config::{SshCredentials, SshOptions};
use crate::{RemoteDiffError, Result};
use ssh2::{Session, Sftp};
use std::fs::File;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

const MAX_CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);
const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Run `attempt` until it succeeds, up to `max_attempts` times.
///
/// Only `Transport` errors are retried; anything else (authentication in
/// particular) is returned immediately.
pub(crate) fn retry_transport<T, F>(
    host: &str,
    max_attempts: u32,
    delay: Duration,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let mut n = 1;
    loop {
        match attempt(n) {
            Ok(value) => return Ok(value),
            Err(RemoteDiffError::Transport(msg)) if n < max_attempts => {
                tracing::warn!(
                    host,
                    "Connection attempt {}/{} failed: {}. Retrying in {:?}...",
                    n,
                    max_attempts,
                    msg,
                    delay
                );
                std::thread::sleep(delay);
                n += 1;
            }
            Err(RemoteDiffError::Transport(msg)) => {
                return Err(RemoteDiffError::Transport(format!(
                    "failed to connect to {} after {} attempts: {}",
                    host, max_attempts, msg
                )));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Opens key-authenticated SSH sessions.
pub struct SshConnector {
    credentials: SshCredentials,
    options: SshOptions,
}

impl SshConnector {
    pub fn new(credentials: SshCredentials, options: SshOptions) -> Self {
        Self {
            credentials,
            options,
        }
    }

    fn dial(&self, host: &str) -> Result<TcpStream> {
        let addrs = (host, self.options.port)
            .to_socket_addrs()
            .map_err(|e| RemoteDiffError::Transport(format!("failed to resolve {}: {}", host, e)))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.options.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(RemoteDiffError::Transport(match last_err {
            Some(e) => format!("failed to dial {}:{}: {}", host, self.options.port, e),
            None => format!("no addresses found for {}", host),
        }))
    }

    fn open(&self, host: &str) -> Result<Session> {
        let tcp = self.dial(host)?;
        let mut session = Session::new()
            .map_err(|e| RemoteDiffError::Transport(format!("failed to create session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout_ms(Some(self.options.connect_timeout)));
        session.handshake().map_err(|e| {
            RemoteDiffError::Transport(format!("SSH handshake with {} failed: {}", host, e))
        })?;
        Ok(session)
    }

    fn authenticate(&self, host: &str, session: &Session) -> Result<()> {
        let creds = &self.credentials;
        session
            .userauth_pubkey_memory(
                &creds.username,
                None,
                &creds.key_material,
                creds.key_passphrase.as_deref(),
            )
            .map_err(|e| {
                let hint = if creds.key_passphrase.is_none() {
                    " (key may require a passphrase, check SSHKEYPIN)"
                } else {
                    ""
                };
                RemoteDiffError::Auth(format!(
                    "public key authentication as {} on {} failed: {}{}",
                    creds.username, host, e, hint
                ))
            })?;

        if !session.authenticated() {
            return Err(RemoteDiffError::Auth(format!(
                "server {} rejected key for {}",
                host, creds.username
            )));
        }
        Ok(())
    }
}

impl Connector for SshConnector {
    fn connect(&self, host: &str) -> Result<Box<dyn RemoteSession>> {
        let session = retry_transport(host, MAX_CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY, |attempt| {
            tracing::info!(
                host,
                "Connecting as {} (attempt {}/{})...",
                self.credentials.username,
                attempt,
                MAX_CONNECT_ATTEMPTS
            );
            self.open(host)
        })?;

        self.authenticate(host, &session)?;
        session.set_timeout(timeout_ms(self.options.session_timeout));

        let sftp = session
            .sftp()
            .map_err(|e| RemoteDiffError::Transport(format!("failed to create SFTP client: {}", e)))?;

        tracing::info!(host, "Successfully connected");
        Ok(Box::new(SshSession {
            host: host.to_string(),
            session,
            sftp: Some(sftp),
        }))
    }
}

/// libssh2 treats 0 as "no timeout".
fn timeout_ms(timeout: Option<Duration>) -> u32 {
    timeout
        .map(|t| t.as_millis().min(u32::MAX as u128) as u32)
        .unwrap_or(0)
}

pub struct SshSession {
    host: String,
    session: Session,
    sftp: Option<Sftp>,
}

impl SshSession {
    fn sftp(&self) -> Result<&Sftp> {
        self.sftp
            .as_ref()
            .ok_or_else(|| RemoteDiffError::Transfer(format!("session to {} is closed", self.host)))
    }

    fn transport_err(&self, what: &str, e: impl std::fmt::Display) -> RemoteDiffError {
        RemoteDiffError::Transport(format!("{} on {}: {}", what, self.host, e))
    }
}

/// Read one chunk from `reader` into `sink`. Returns whether anything
/// happened; end of stream sets `done`.
fn pump<R: Read>(reader: &mut R, buf: &mut [u8], sink: &mut Vec<u8>, done: &mut bool) -> io::Result<bool> {
    match reader.read(buf) {
        Ok(0) => {
            *done = true;
            Ok(true)
        }
        Ok(n) => {
            sink.extend_from_slice(&buf[..n]);
            Ok(true)
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Drain both output streams of a non-blocking channel in turns.
///
/// A command that floods stderr fills the channel window while stdout has
/// nothing to say, so the streams must not be read one after the other.
fn drain_interleaved<A: Read, B: Read>(
    mut stdout: A,
    mut stderr: B,
    deadline: Option<Instant>,
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = [0u8; 8192];
    let (mut out, mut err) = (Vec::new(), Vec::new());
    let (mut out_done, mut err_done) = (false, false);

    while !(out_done && err_done) {
        let mut progress = false;
        if !out_done {
            progress |= pump(&mut stdout, &mut buf, &mut out, &mut out_done)?;
        }
        if !err_done {
            progress |= pump(&mut stderr, &mut buf, &mut err, &mut err_done)?;
        }
        if !progress {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out waiting for command output",
                ));
            }
            std::thread::sleep(OUTPUT_POLL_INTERVAL);
        }
    }
    Ok((out, err))
}

impl RemoteSession for SshSession {
    fn run_command(&self, command: &str, elevate: bool) -> Result<CommandOutput> {
        let command = if elevate {
            format!("sudo {}", command)
        } else {
            command.to_string()
        };
        tracing::debug!(host = %self.host, %command, "Executing remote command");

        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| self.transport_err("failed to open channel", e))?;
        channel
            .exec(&command)
            .map_err(|e| self.transport_err("failed to exec", e))?;

        let deadline = match self.session.timeout() {
            0 => None,
            ms => Some(Instant::now() + Duration::from_millis(u64::from(ms))),
        };
        self.session.set_blocking(false);
        let drained = drain_interleaved(channel.stream(0), channel.stderr(), deadline);
        self.session.set_blocking(true);
        let (stdout, stderr) = drained.map_err(|e| self.transport_err("failed to read command output", e))?;
        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        channel
            .wait_close()
            .map_err(|e| self.transport_err("failed to close channel", e))?;
        let status = channel
            .exit_status()
            .map_err(|e| self.transport_err("failed to read exit status", e))?;

        if status != 0 {
            tracing::warn!(host = %self.host, status, %command, "Remote command exited with non-zero status");
            tracing::debug!(host = %self.host, %stderr, "Remote stderr");
            return Err(RemoteDiffError::RemoteExecution {
                command,
                status,
                stdout,
                stderr,
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }

    fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        tracing::debug!(host = %self.host, "Uploading {} to {}", local.display(), remote);
        let sftp = self.sftp()?;
        let mut local_file = File::open(local).map_err(|e| {
            RemoteDiffError::Transfer(format!("failed to open {} for upload: {}", local.display(), e))
        })?;

        let remote_path = Path::new(remote);
        if let Some(parent) = remote_path.parent() {
            if sftp.stat(parent).is_err() {
                if let Err(e) = sftp.mkdir(parent, 0o755) {
                    tracing::warn!(
                        host = %self.host,
                        "Could not ensure remote directory {} exists (maybe OK): {}",
                        parent.display(),
                        e
                    );
                }
            }
        }

        let mut remote_file = sftp.create(remote_path).map_err(|e| {
            RemoteDiffError::Transfer(format!("failed to create {}:{}: {}", self.host, remote, e))
        })?;
        let bytes = io::copy(&mut local_file, &mut remote_file).map_err(|e| {
            RemoteDiffError::Transfer(format!("failed to write {}:{}: {}", self.host, remote, e))
        })?;

        tracing::debug!(host = %self.host, "Uploaded {} bytes to {}", bytes, remote);
        Ok(())
    }

    fn download_file(&self, remote: &str, local: &Path) -> Result<()> {
        tracing::debug!(host = %self.host, "Downloading {} to {}", remote, local.display());
        let sftp = self.sftp()?;
        let mut remote_file = sftp.open(Path::new(remote)).map_err(|e| {
            RemoteDiffError::Transfer(format!("failed to open {}:{}: {}", self.host, remote, e))
        })?;

        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut local_file = File::create(local)?;
        match io::copy(&mut remote_file, &mut local_file) {
            Ok(bytes) => {
                tracing::debug!(host = %self.host, "Downloaded {} bytes from {}", bytes, remote);
                Ok(())
            }
            Err(e) => {
                drop(local_file);
                let _ = std::fs::remove_file(local);
                Err(RemoteDiffError::Transfer(format!(
                    "failed to copy {}:{}: {}",
                    self.host, remote, e
                )))
            }
        }
    }

    fn check_privilege_escalation(&self) -> bool {
        tracing::info!(host = %self.host, "Checking passwordless sudo access...");
        match self.run_command("-n true", true) {
            Ok(_) => {
                tracing::info!(host = %self.host, "Passwordless sudo available");
                true
            }
            Err(e) => {
                tracing::warn!(host = %self.host, "Passwordless sudo may not be available: {}", e);
                false
            }
        }
    }

    fn close(&mut self) {
        if self.sftp.take().is_some() {
            tracing::debug!(host = %self.host, "Closing SFTP client");
        }
        if let Err(e) = self.session.disconnect(None, "collection finished", None) {
            tracing::debug!(host = %self.host, "SSH disconnect failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_retry_transport_until_success() {
        let calls = Cell::new(0);
        let result = retry_transport("web-1", 3, Duration::ZERO, |attempt| {
            calls.set(calls.get() + 1);
            if attempt < 3 {
                Err(RemoteDiffError::Transport("handshake reset".into()))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_transport_gives_up_after_budget() {
        let calls = Cell::new(0);
        let result: Result<()> = retry_transport("web-1", 3, Duration::ZERO, |_| {
            calls.set(calls.get() + 1);
            Err(RemoteDiffError::Transport("connection refused".into()))
        });
        assert_eq!(calls.get(), 3);
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("after 3 attempts"));
    }

    #[test]
    fn test_auth_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<()> = retry_transport("web-1", 3, Duration::ZERO, |_| {
            calls.set(calls.get() + 1);
            Err(RemoteDiffError::Auth("bad key".into()))
        });
        assert_eq!(calls.get(), 1);
        assert!(matches!(result, Err(RemoteDiffError::Auth(_))));
    }

    /// Yields `total` bytes of stderr, then flips `drained`.
    struct StderrFlood {
        left: usize,
        drained: Rc<Cell<bool>>,
    }

    impl Read for StderrFlood {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.left == 0 {
                self.drained.set(true);
                return Ok(0);
            }
            let n = buf.len().min(self.left).min(1024);
            buf[..n].fill(b'e');
            self.left -= n;
            Ok(n)
        }
    }

    /// Would block until stderr has been read to the end.
    struct GatedStdout {
        data: io::Cursor<Vec<u8>>,
        open: Rc<Cell<bool>>,
    }

    impl Read for GatedStdout {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.open.get() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.data.read(buf)
        }
    }

    #[test]
    fn test_stderr_flood_does_not_stall_stdout() {
        let drained = Rc::new(Cell::new(false));
        let stdout = GatedStdout {
            data: io::Cursor::new(b"done\n".to_vec()),
            open: Rc::clone(&drained),
        };
        let stderr = StderrFlood {
            left: 256 * 1024,
            drained: Rc::clone(&drained),
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        let (out, err) = drain_interleaved(stdout, stderr, Some(deadline)).unwrap();
        assert_eq!(out, b"done\n");
        assert_eq!(err.len(), 256 * 1024);
    }

    #[test]
    fn test_silent_channel_times_out() {
        let stdout = GatedStdout {
            data: io::Cursor::new(Vec::new()),
            open: Rc::new(Cell::new(false)),
        };
        let err = drain_interleaved(stdout, io::empty(), Some(Instant::now())).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_timeout_ms() {
        assert_eq!(timeout_ms(None), 0);
        assert_eq!(timeout_ms(Some(Duration::from_secs(15))), 15_000);
    }
}
