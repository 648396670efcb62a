//! Collection script generation.
//!
//! The generated bash script mirrors every requested file and directory into
//! a staging tree in the remote user's home, then tars that tree up as the
//! unprivileged user so it can be fetched over SFTP.

use super::{MISSING_DIR_SUFFIX, MISSING_FILE_SUFFIX};
use crate::config::normalize_dir;
use std::collections::HashSet;
use std::fmt::Write;
use std::path::Path;

/// Remote locations used by one collection run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLayout {
    pub staging_dir: String,
    pub tarball: String,
    pub script_path: String,
}

impl RemoteLayout {
    /// Staging tree and tarball live in the user's home (`~` does not expand
    /// reliably in non-interactive shells); the script name is unique per run.
    pub fn for_user(username: &str) -> Self {
        let home = format!("/home/{}", username);
        Self {
            staging_dir: format!("{}/remote_backup", home),
            tarball: format!("{}/remote_backup.tar.gz", home),
            script_path: format!("/tmp/collect_files_{}.sh", uuid::Uuid::new_v4().simple()),
        }
    }

    /// Command that removes everything this layout created on the remote host.
    /// The staging tree may contain root-owned entries, hence `sudo`.
    pub fn cleanup_command(&self) -> String {
        format!(
            "rm -f {} && sudo rm -rf {} && rm -f {}",
            quote(&self.script_path),
            quote(&self.staging_dir),
            quote(&self.tarball)
        )
    }
}

fn quote(value: &str) -> String {
    shell_words::quote(value).into_owned()
}

/// Build the script that stages `files` and `dirs` for `username`.
///
/// Missing targets leave a marker file (`<path>.MISSING` or
/// `<path>DIRECTORY.MISSING`) in the staging tree instead of failing the
/// script.
pub fn generate_collection_script(files: &[String], dirs: &[String], username: &str) -> String {
    let layout = RemoteLayout::for_user(username);
    render(files, dirs, &layout)
}

pub(crate) fn render(files: &[String], dirs: &[String], layout: &RemoteLayout) -> String {
    let base = layout.staging_dir.as_str();
    let dirs: Vec<String> = dirs.iter().map(|d| normalize_dir(d)).collect();
    let staged = |path: &str| format!("{}{}", base, path);

    let mut script = String::new();
    script.push_str("#!/bin/bash\nset -e\n\n");

    let _ = writeln!(script, "echo \"Cleaning up previous backup (if any)...\"");
    let _ = writeln!(
        script,
        "sudo rm -rf {} {}\n",
        quote(base),
        quote(&layout.tarball)
    );

    let _ = writeln!(script, "echo \"Creating backup directory structure...\"");
    let _ = writeln!(script, "mkdir -p {}", quote(base));

    let mut created = HashSet::new();
    let file_parents = files
        .iter()
        .filter_map(|f| Path::new(f).parent().and_then(|p| p.to_str()));
    for dir in file_parents.chain(dirs.iter().map(String::as_str)) {
        if dir == "/" || dir == "." || dir.is_empty() {
            continue;
        }
        if created.insert(dir.to_string()) {
            let _ = writeln!(script, "mkdir -p {}", quote(&staged(dir)));
        }
    }

    script.push_str("\n# Copy individual files\n");
    for file in files {
        let src = quote(file);
        let dst = quote(&staged(file));
        let marker = quote(&format!("{}{}", staged(file), MISSING_FILE_SUFFIX));
        let _ = write!(
            script,
            r#"echo "Copying file {src}"
if sudo test -f {src}; then
    sudo cp -p {src} {dst}
else
    echo "WARNING: File {src} not found"
    touch {marker}
fi
"#
        );
    }

    script.push_str("\n# Copy directory contents\n");
    for dir in &dirs {
        let src = quote(dir);
        let dst = quote(&staged(dir));
        let marker = quote(&format!("{}{}", staged(dir), MISSING_DIR_SUFFIX));
        let _ = write!(
            script,
            r#"echo "Copying directory contents {src}"
if sudo test -d {src}; then
    (cd {src} && sudo find . -mindepth 1 -print0 | sudo cpio -pdum0 {dst} 2>/dev/null) || echo "WARNING: cpio encountered errors in {src}"
else
    echo "WARNING: Directory {src} not found"
    touch {marker}
fi
"#
        );
    }

    let _ = write!(
        script,
        r#"
echo "Setting permissions for tarring..."
sudo chmod -R a+rX,go-w {base_q} || echo "WARNING: chmod failed on backup dir"

echo "Creating tar archive..."
cd {base_q}
tar czf {tar_q} .

echo "Collection script finished."
"#,
        base_q = quote(base),
        tar_q = quote(&layout.tarball),
    );

    script
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> RemoteLayout {
        RemoteLayout {
            staging_dir: "/home/deploy/remote_backup".into(),
            tarball: "/home/deploy/remote_backup.tar.gz".into(),
            script_path: "/tmp/collect_files_test.sh".into(),
        }
    }

    #[test]
    fn test_layout_for_user() {
        let a = RemoteLayout::for_user("deploy");
        let b = RemoteLayout::for_user("deploy");
        assert_eq!(a.staging_dir, "/home/deploy/remote_backup");
        assert_eq!(a.tarball, "/home/deploy/remote_backup.tar.gz");
        assert!(a.script_path.starts_with("/tmp/collect_files_"));
        assert_ne!(a.script_path, b.script_path);
    }

    #[test]
    fn test_script_cleans_before_staging() {
        let script = render(&["/etc/hosts".into()], &[], &layout());
        assert!(script.starts_with("#!/bin/bash\nset -e\n"));
        let rm = script
            .find("sudo rm -rf /home/deploy/remote_backup /home/deploy/remote_backup.tar.gz")
            .unwrap();
        let mkdir = script.find("mkdir -p /home/deploy/remote_backup\n").unwrap();
        assert!(rm < mkdir);
    }

    #[test]
    fn test_script_creates_parent_dirs_once() {
        let files = vec!["/etc/hosts".to_string(), "/etc/resolv.conf".to_string()];
        let dirs = vec!["/etc/nginx/".to_string()];
        let script = render(&files, &dirs, &layout());

        assert_eq!(
            script.matches("mkdir -p /home/deploy/remote_backup/etc\n").count(),
            1
        );
        assert!(script.contains("mkdir -p /home/deploy/remote_backup/etc/nginx\n"));
        assert!(!script.contains("/etc/nginx/"));
    }

    #[test]
    fn test_script_writes_missing_markers() {
        let script = render(
            &["/etc/foo.conf".into()],
            &["/etc/nginx".into()],
            &layout(),
        );
        assert!(script.contains("sudo cp -p /etc/foo.conf /home/deploy/remote_backup/etc/foo.conf"));
        assert!(script.contains("touch /home/deploy/remote_backup/etc/foo.conf.MISSING"));
        assert!(script.contains("touch /home/deploy/remote_backup/etc/nginxDIRECTORY.MISSING"));
        assert!(script.contains("sudo find . -mindepth 1 -print0 | sudo cpio -pdum0"));
    }

    #[test]
    fn test_script_tars_without_elevation() {
        let script = render(&["/etc/hosts".into()], &[], &layout());
        assert!(script.contains("\ntar czf /home/deploy/remote_backup.tar.gz .\n"));
        assert!(!script.contains("sudo tar"));
    }

    #[test]
    fn test_script_quotes_paths_with_spaces() {
        let script = render(&["/srv/my app/app.conf".into()], &[], &layout());
        assert!(script.contains("sudo cp -p '/srv/my app/app.conf'"));
        assert!(script.contains("mkdir -p '/home/deploy/remote_backup/srv/my app'"));
    }

    #[test]
    fn test_cleanup_command() {
        assert_eq!(
            layout().cleanup_command(),
            "rm -f /tmp/collect_files_test.sh && sudo rm -rf /home/deploy/remote_backup && rm -f /home/deploy/remote_backup.tar.gz"
        );
    }
}
