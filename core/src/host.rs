//! Explicit owner of a process's registry and its store.
//!
//! All IO happens here, at three points the host chooses:
//! [`PromiseHost::init`], [`PromiseHost::flush`] and [`PromiseHost::refresh`].

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};
use tether_store::SnapshotStore;
use tether_types::{PromiseId, RegistrySnapshot};
use tracing::info;

use crate::registry::{PromiseRegistry, SyncReport};

/// What a [`PromiseHost::refresh`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub sync: SyncReport,
    /// Promises consumed by the sweep that followed the merge.
    pub consumed: usize,
}

pub struct PromiseHost<S> {
    registry: PromiseRegistry,
    store: S,
}

impl<S: SnapshotStore> PromiseHost<S> {
    /// Load the persisted snapshot (or start empty) and build the registry.
    pub fn init(store: S) -> Result<Self> {
        let snapshot = store
            .load()
            .with_context(|| format!("Failed to load promise registry from {}", store.describe()))?
            .unwrap_or_default();
        info!(
            store = %store.describe(),
            promises = snapshot.len(),
            "Promise registry loaded"
        );
        Ok(Self {
            registry: PromiseRegistry::from_snapshot(snapshot),
            store,
        })
    }

    #[must_use]
    pub fn registry(&self) -> &PromiseRegistry {
        &self.registry
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist the registry.
    ///
    /// The store's current contents are merged in first (without sweeping)
    /// under the store's write lock, so a resolution written by another
    /// process is carried forward instead of overwritten.
    pub fn flush(&mut self) -> Result<()> {
        let registry = &self.registry;
        let mut written = 0;
        self.store
            .update(&mut |latest| {
                if let Some(latest) = latest {
                    registry
                        .sync_snapshot(&latest)
                        .context("Failed to merge stored registry before saving")?;
                }
                let snapshot = registry.snapshot();
                written = snapshot.len();
                Ok(snapshot)
            })
            .with_context(|| format!("Failed to save promise registry to {}", self.store.describe()))?;
        info!(promises = written, "Promise registry flushed");
        Ok(())
    }

    /// Merge the store's current snapshot and consume whatever it resolved.
    pub fn refresh(&mut self) -> Result<RefreshReport> {
        let sync = match self.load_latest()? {
            Some(latest) => self
                .registry
                .sync_snapshot(&latest)
                .context("Failed to merge stored registry")?,
            None => SyncReport::default(),
        };
        let consumed = self.registry.attempt_consume_remaining_promises();
        Ok(RefreshReport { sync, consumed })
    }

    /// Drop every promise older than `max_age`. Call [`Self::flush`] to persist.
    pub fn prune_stale(&self, max_age: Duration) -> Result<Vec<PromiseId>> {
        let age = TimeDelta::from_std(max_age).context("Prune age out of range")?;
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .context("Prune age reaches before the supported time range")?;
        Ok(self.registry.prune_stale(cutoff))
    }

    fn load_latest(&self) -> Result<Option<RegistrySnapshot>> {
        self.store
            .load()
            .with_context(|| format!("Failed to load promise registry from {}", self.store.describe()))
    }
}

impl<S: SnapshotStore> std::fmt::Debug for PromiseHost<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromiseHost")
            .field("registry", &self.registry)
            .field("store", &self.store.describe())
            .finish()
    }
}
