//! Shared fixtures for unit tests: tarball builder and fake SSH sessions.

use crate::session::{CommandOutput, Connector, RemoteSession};
use crate::{RemoteDiffError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tar::{Builder, EntryType, Header};

pub(crate) enum TestEntry<'a> {
    File(&'a str, &'a [u8]),
    Dir(&'a str),
    Symlink(&'a str, &'a str),
    HardLink(&'a str, &'a str),
    /// Header-only entry of any other kind (fifo, device, ...)
    Special(&'a str, EntryType),
}

/// Header with the raw name copied in, bypassing the builder's own path
/// checks so hostile names can be produced.
fn raw_header(name: &str, kind: EntryType, size: u64, mode: u32) -> Header {
    let mut header = Header::new_old();
    header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(0);
    header
}

/// Build a gzip-compressed tarball from `entries`.
pub(crate) fn tar_gz(entries: &[TestEntry<'_>]) -> Vec<u8> {
    let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for entry in entries {
        match entry {
            TestEntry::File(name, data) => {
                let mut header = raw_header(name, EntryType::Regular, data.len() as u64, 0o644);
                header.set_cksum();
                builder.append(&header, *data).unwrap();
            }
            TestEntry::Dir(name) => {
                let mut header = raw_header(name, EntryType::Directory, 0, 0o755);
                header.set_cksum();
                builder.append(&header, std::io::empty()).unwrap();
            }
            TestEntry::Symlink(name, target) => {
                let mut header = raw_header(name, EntryType::Symlink, 0, 0o777);
                header.set_link_name(target).unwrap();
                header.set_cksum();
                builder.append(&header, std::io::empty()).unwrap();
            }
            TestEntry::HardLink(name, target) => {
                let mut header = raw_header(name, EntryType::Link, 0, 0o644);
                header.set_link_name(target).unwrap();
                header.set_cksum();
                builder.append(&header, std::io::empty()).unwrap();
            }
            TestEntry::Special(name, kind) => {
                let mut header = raw_header(name, kind.clone(), 0, 0o644);
                header.set_cksum();
                builder.append(&header, std::io::empty()).unwrap();
            }
        }
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Gzip stream holding a single regular-file header that claims `claimed`
/// bytes but is cut off after `data`.
pub(crate) fn truncated_tar_gz(name: &str, claimed: u64, data: &[u8]) -> Vec<u8> {
    let mut header = raw_header(name, EntryType::Regular, claimed, 0o644);
    header.set_cksum();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(header.as_bytes()).unwrap();
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Per-host behaviour of a [`FakeConnector`].
#[derive(Clone, Default)]
pub(crate) struct FakeHost {
    /// Tarball served when the pipeline downloads the archive
    pub archive: Vec<u8>,
    pub fail_connect: bool,
    pub fail_script: bool,
    pub fail_download: bool,
    pub fail_cleanup: bool,
    /// Time spent "running" the collection script
    pub script_delay: Duration,
}

/// Everything a fake session saw, for assertions.
#[derive(Default)]
pub(crate) struct SessionLog {
    pub commands: Vec<String>,
    pub uploads: Vec<(String, String)>,
    pub downloads: Vec<String>,
    pub closed: bool,
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    pub hosts: HashMap<String, FakeHost>,
    pub logs: Mutex<HashMap<String, Arc<Mutex<SessionLog>>>>,
    active: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn new(hosts: Vec<(&str, FakeHost)>) -> Self {
        Self {
            hosts: hosts
                .into_iter()
                .map(|(h, f)| (h.to_string(), f))
                .collect(),
            ..Default::default()
        }
    }

    pub fn log(&self, host: &str) -> Arc<Mutex<SessionLog>> {
        self.logs
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .unwrap_or_default()
    }
}

impl Connector for FakeConnector {
    fn connect(&self, host: &str) -> Result<Box<dyn RemoteSession>> {
        let behaviour = self
            .hosts
            .get(host)
            .cloned()
            .ok_or_else(|| RemoteDiffError::Transport(format!("unknown host {}", host)))?;
        if behaviour.fail_connect {
            return Err(RemoteDiffError::Transport(format!(
                "failed to dial {}: connection refused",
                host
            )));
        }
        let log = Arc::new(Mutex::new(SessionLog::default()));
        self.logs
            .lock()
            .unwrap()
            .insert(host.to_string(), Arc::clone(&log));
        Ok(Box::new(FakeSession {
            behaviour,
            log,
            active: Arc::clone(&self.active),
            peak: Arc::clone(&self.peak),
        }))
    }
}

struct FakeSession {
    behaviour: FakeHost,
    log: Arc<Mutex<SessionLog>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl RemoteSession for FakeSession {
    fn run_command(&self, command: &str, elevate: bool) -> Result<CommandOutput> {
        let command = if elevate {
            format!("sudo {}", command)
        } else {
            command.to_string()
        };
        self.log.lock().unwrap().commands.push(command.clone());

        let failure = |stderr: &str| RemoteDiffError::RemoteExecution {
            command: command.clone(),
            status: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        };

        if command.starts_with("/tmp/collect_files_") {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.behaviour.script_delay);
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.behaviour.fail_script {
                return Err(failure("tar: cannot open"));
            }
        }
        if command.starts_with("rm -f ") && self.behaviour.fail_cleanup {
            return Err(failure("rm: permission denied"));
        }
        Ok(CommandOutput::default())
    }

    fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        std::fs::metadata(local)?;
        self.log
            .lock()
            .unwrap()
            .uploads
            .push((local.display().to_string(), remote.to_string()));
        Ok(())
    }

    fn download_file(&self, remote: &str, local: &Path) -> Result<()> {
        self.log.lock().unwrap().downloads.push(remote.to_string());
        if self.behaviour.fail_download {
            return Err(RemoteDiffError::Transfer(format!("no such file {}", remote)));
        }
        std::fs::write(local, &self.behaviour.archive)?;
        Ok(())
    }

    fn check_privilege_escalation(&self) -> bool {
        true
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closed = true;
    }
}
