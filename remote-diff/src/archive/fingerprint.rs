//! Content fingerprints.

use crate::{RemoteDiffError, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;

/// Stream `path` through SHA-256 and return the lowercase hex digest.
pub fn sha256_file(path: &Path) -> Result<String> {
    let fingerprint_err = |source: io::Error| RemoteDiffError::Fingerprint {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(fingerprint_err)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(fingerprint_err)?;
    Ok(format!("{:x}", hasher.finalize()))
}
