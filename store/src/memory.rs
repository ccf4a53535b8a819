use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tether_types::RegistrySnapshot;

use crate::{MergeFn, SnapshotStore};

/// In-memory store holding encoded snapshot bytes.
///
/// Clones share the same slot, which lets tests stand up two hosts that play
/// the part of two processes writing to one container.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    bytes: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemorySnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the stored bytes directly (e.g. to simulate corruption).
    pub fn put_raw(&self, bytes: Vec<u8>) {
        *self.slot() = Some(bytes);
    }

    fn slot(&self) -> MutexGuard<'_, Option<Vec<u8>>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn decode(bytes: Option<&[u8]>) -> Result<Option<RegistrySnapshot>> {
    bytes
        .map(RegistrySnapshot::decode)
        .transpose()
        .context("Failed to decode in-memory snapshot")
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Option<RegistrySnapshot>> {
        decode(self.slot().as_deref())
    }

    fn save(&mut self, snapshot: &RegistrySnapshot) -> Result<()> {
        let bytes = snapshot.encode().context("Failed to encode snapshot")?;
        self.put_raw(bytes);
        Ok(())
    }

    /// Holds the slot's mutex across the merge, so `merge` must not touch
    /// a clone of this store.
    fn update(&mut self, merge: &mut MergeFn<'_>) -> Result<()> {
        let mut slot = self.slot();
        let next = merge(decode(slot.as_deref())?)?;
        *slot = Some(next.encode().context("Failed to encode snapshot")?);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
