use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tether_types::RegistrySnapshot;
use tether_utils::{
    AtomicWriteOptions, atomic_write_with_options, ensure_secure_dir, recover_bak_file,
    sidecar_path,
};

use crate::{MergeFn, SnapshotStore};

const LOCK_SUFFIX: &str = ".lock";

/// Snapshot stored as one file, typically inside an app-group container that
/// every cooperating process can read and write.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
    options: AtomicWriteOptions,
}

impl FileSnapshotStore {
    /// Open a file store at `path`, creating its directory if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, AtomicWriteOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: AtomicWriteOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            ensure_secure_dir(parent)?;
        }
        recover_bak_file(&path);
        Ok(Self { path, options })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the exclusive advisory lock shared by every writer of this path.
    /// Released when the returned handle drops.
    fn lock(&self) -> Result<File> {
        let lock_path = sidecar_path(&self.path, LOCK_SUFFIX);
        let mut options = OpenOptions::new();
        options.create(true).truncate(false).read(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;
        file.lock()
            .with_context(|| format!("Failed to lock {}", lock_path.display()))?;
        Ok(file)
    }

    fn write(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        let bytes = snapshot.encode().context("Failed to encode snapshot")?;
        atomic_write_with_options(&self.path, &bytes, self.options)
            .with_context(|| format!("Failed to write snapshot to {}", self.path.display()))?;

        tracing::debug!(path = %self.path.display(), records = snapshot.len(), "Saved snapshot");
        Ok(())
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Result<Option<RegistrySnapshot>> {
        recover_bak_file(&self.path);
        if !self.path.exists() {
            return Ok(None);
        }

        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("Failed to read snapshot at {}", self.path.display()))?;
        let snapshot = RegistrySnapshot::decode(&bytes)
            .with_context(|| format!("Failed to decode snapshot at {}", self.path.display()))?;

        tracing::debug!(path = %self.path.display(), records = snapshot.len(), "Loaded snapshot");
        Ok(Some(snapshot))
    }

    fn save(&mut self, snapshot: &RegistrySnapshot) -> Result<()> {
        let _lock = self.lock()?;
        self.write(snapshot)
    }

    fn update(&mut self, merge: &mut MergeFn<'_>) -> Result<()> {
        let _lock = self.lock()?;
        let next = merge(self.load()?)?;
        self.write(&next)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}
