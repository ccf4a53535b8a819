//! Persistence substrates for promise registry snapshots.
//!
//! The registry itself performs no IO. Hosts persist a [`RegistrySnapshot`]
//! through one of these stores around their `sync` calls:
//!
//! - **`FileSnapshotStore`**: a single file in a (shared) container directory,
//!   written atomically under an advisory lock file
//! - **`SqliteSnapshotStore`**: a row in a SQLite database, for hosts that
//!   already keep one
//! - **`MemorySnapshotStore`**: shared in-memory bytes, for tests and
//!   single-process hosts
//!
//! Every store goes through the versioned snapshot codec, so a decode failure
//! surfaces as a [`tether_types::SnapshotError`] inside the returned
//! `anyhow::Error`.

mod file;
mod memory;
mod sqlite;

use anyhow::Result;
use tether_types::RegistrySnapshot;

pub use file::FileSnapshotStore;
pub use memory::MemorySnapshotStore;
pub use sqlite::SqliteSnapshotStore;

/// Merge step run by [`SnapshotStore::update`]: receives the stored snapshot
/// and returns the one to write back.
pub type MergeFn<'a> = dyn FnMut(Option<RegistrySnapshot>) -> Result<RegistrySnapshot> + 'a;

/// Durable keyed storage for one registry snapshot.
pub trait SnapshotStore: Send {
    /// Load the last persisted snapshot, or `None` if nothing was written yet.
    fn load(&self) -> Result<Option<RegistrySnapshot>>;

    /// Persist `snapshot`, replacing whatever was stored before.
    fn save(&mut self, snapshot: &RegistrySnapshot) -> Result<()>;

    /// Read, merge and write back as one step.
    ///
    /// No other writer to the same store, in this process or another, can
    /// commit between the read handed to `merge` and the write of its result.
    /// If `merge` fails nothing is written.
    fn update(&mut self, merge: &mut MergeFn<'_>) -> Result<()>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

impl<S: SnapshotStore + ?Sized> SnapshotStore for Box<S> {
    fn load(&self) -> Result<Option<RegistrySnapshot>> {
        (**self).load()
    }

    fn save(&mut self, snapshot: &RegistrySnapshot) -> Result<()> {
        (**self).save(snapshot)
    }

    fn update(&mut self, merge: &mut MergeFn<'_>) -> Result<()> {
        (**self).update(merge)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
