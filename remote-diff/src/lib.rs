//! remote-diff library
//!
//! Collects configuration files from a fleet of hosts over SSH, fingerprints
//! them, and reports which files differ between hosts with pairwise unified
//! diffs.

pub mod analyze;
pub mod archive;
pub mod collect;
pub mod config;
pub mod error;
pub mod manifest;
pub mod session;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::{RunConfig, SshCredentials, SshOptions, TargetOverrides, Targets};
pub use error::{RemoteDiffError, Result, Stage};
pub use manifest::{FileRecord, Manifest};
