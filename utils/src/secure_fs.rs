//! Owner-only filesystem hardening for promise snapshots.
//!
//! Snapshots can carry resolution payloads (stanza ids, message bodies), so the
//! directories and files that hold them are tightened to the owning user. On
//! shared containers owned by another uid the permissions are left untouched.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Ensure a directory exists with secure permissions.
///
/// Creates the directory (and parents) if missing, then on Unix tightens
/// permissions to 0o700 if the directory is owned by the current user.
pub fn ensure_secure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to read directory metadata: {}", path.display()))?;

        let our_uid = unsafe { libc::getuid() };
        if metadata.uid() != our_uid {
            return Ok(());
        }

        let current_mode = metadata.permissions().mode() & 0o777;
        if current_mode & 0o077 != 0 {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).with_context(
                || format!("Failed to set directory permissions: {}", path.display()),
            )?;
        }
    }
    Ok(())
}

/// Ensure a file (and any of the given sidecars) exists with owner-only permissions.
///
/// A missing file is created empty with 0o600 on Unix; existing files and
/// sidecars are tightened unconditionally.
pub fn ensure_secure_file(path: &Path, sidecar_suffixes: &[&str]) -> Result<()> {
    if !path.exists() {
        let mut options = OpenOptions::new();
        options.create(true).truncate(false).read(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let _file = options
            .open(path)
            .with_context(|| format!("Failed to create file: {}", path.display()))?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set file permissions: {}", path.display()))?;
        for suffix in sidecar_suffixes {
            let sidecar = sidecar_path(path, suffix);
            if sidecar.exists() {
                let _ = std::fs::set_permissions(&sidecar, std::fs::Permissions::from_mode(0o600));
            }
        }
    }
    #[cfg(not(unix))]
    let _ = sidecar_suffixes;

    Ok(())
}

/// Compute the path to a sidecar file (e.g. SQLite `-wal`, `-shm`).
#[must_use]
pub fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let file_name = path.file_name().map(|name| name.to_string_lossy());
    match file_name {
        Some(name) => path.with_file_name(format!("{name}{suffix}")),
        None => PathBuf::from(format!("{}{suffix}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_path_appends_suffix_to_file_name() {
        let path = Path::new("/tmp/group/promises.db");
        assert_eq!(
            sidecar_path(path, "-wal"),
            PathBuf::from("/tmp/group/promises.db-wal")
        );
    }

    #[test]
    fn ensure_secure_file_creates_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("promises.db");
        ensure_secure_dir(path.parent().unwrap()).expect("dir");
        ensure_secure_file(&path, &["-wal", "-shm"]).expect("file");
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn ensure_secure_dir_tightens_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("container");
        std::fs::create_dir(&target).expect("mkdir");
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        ensure_secure_dir(&target).expect("secure");

        let mode = std::fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }
}
