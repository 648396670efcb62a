//! Everything that turns remote paths into local, fingerprinted files:
//! the collection script run on each host, tarball extraction and SHA-256
//! fingerprints.

pub mod extract;
pub mod fingerprint;
pub mod script;

pub use extract::{extract_tar_gz, ExtractReport};
pub use fingerprint::sha256_file;
pub use script::{generate_collection_script, RemoteLayout};

use std::collections::HashSet;
use std::path::{Component, Path};

/// Marker suffix written next to a missing file target.
pub const MISSING_FILE_SUFFIX: &str = ".MISSING";

/// Marker suffix appended to a missing directory target.
pub const MISSING_DIR_SUFFIX: &str = "DIRECTORY.MISSING";

/// Forward-slash form of an absolute target as it appears under a host's
/// collection root (`/etc//hosts` becomes `etc/hosts`).
fn relative_target(path: &str) -> String {
    Path::new(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Recognizes the marker files the collection script leaves behind for
/// targets it could not find.
///
/// A name only counts as a marker when it stands for a configured target of
/// the matching kind, so a real file called `fooDIRECTORY` or `x.MISSING`
/// is never mistaken for one.
#[derive(Debug, Clone, Default)]
pub struct MissingMarkers {
    files: HashSet<String>,
    dirs: HashSet<String>,
}

impl MissingMarkers {
    pub fn new(files: &[String], dirs: &[String]) -> Self {
        Self {
            files: files.iter().map(|f| relative_target(f)).collect(),
            dirs: dirs.iter().map(|d| relative_target(d)).collect(),
        }
    }

    /// If `relative_path` is a marker, the target it stands for.
    pub fn original<'a>(&self, relative_path: &'a str) -> Option<&'a str> {
        if let Some(dir) = relative_path.strip_suffix(MISSING_DIR_SUFFIX) {
            if self.dirs.contains(dir) {
                return Some(dir);
            }
        }
        relative_path
            .strip_suffix(MISSING_FILE_SUFFIX)
            .filter(|file| self.files.contains(*file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> MissingMarkers {
        MissingMarkers::new(
            &["/etc/foo.conf".into(), "/etc/fooDIRECTORY".into()],
            &["/etc/nginx".into()],
        )
    }

    #[test]
    fn test_markers_map_to_configured_targets() {
        let markers = markers();
        assert_eq!(markers.original("etc/foo.conf.MISSING"), Some("etc/foo.conf"));
        assert_eq!(markers.original("etc/nginxDIRECTORY.MISSING"), Some("etc/nginx"));
        assert_eq!(markers.original("etc/foo.conf"), None);
    }

    #[test]
    fn test_file_named_like_directory_marker() {
        let markers = markers();
        assert_eq!(markers.original("etc/fooDIRECTORY.MISSING"), Some("etc/fooDIRECTORY"));
    }

    #[test]
    fn test_unconfigured_marker_names_are_plain_files() {
        let markers = markers();
        assert_eq!(markers.original("etc/nginx/backup.MISSING"), None);
        assert_eq!(markers.original("etc/otherDIRECTORY.MISSING"), None);
    }

    #[test]
    fn test_relative_target() {
        assert_eq!(relative_target("/etc//hosts"), "etc/hosts");
        assert_eq!(relative_target("/etc/./nginx"), "etc/nginx");
    }
}
