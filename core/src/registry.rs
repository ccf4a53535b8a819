//! Process-local collection of durable promises.
//!
//! The registry is the only place that understands cross-instance merge
//! policy. [`PromiseRegistry::sync`] folds in a registry (or snapshot) written
//! by another process:
//!
//! | local      | remote           | result                         |
//! |------------|------------------|--------------------------------|
//! | absent     | any              | inserted (unless retired here) |
//! | any        | absent           | kept                           |
//! | pending    | resolved         | adopts the remote outcome      |
//! | resolved   | pending          | kept                           |
//! | resolved   | resolved, equal  | kept                           |
//! | resolved   | resolved, differ | `ConflictingResolution`        |
//! | pending    | pending          | kept                           |
//!
//! A merge is validated in full before anything is applied, so a conflict
//! leaves the registry exactly as it was.
//!
//! "Retired" ids are ones this registry consumed or removed. A stale remote
//! copy must not bring them back, otherwise every reload would resurrect
//! promises that were already delivered. Tombstones are dropped by
//! [`PromiseRegistry::prune_stale`]; from then on its cutoff alone keeps
//! older records out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tether_types::{
    Outcome, PromiseError, PromiseId, RegistrySnapshot, SerializablePromiseRecord, Settle,
};
use tracing::{debug, info, warn};

use crate::promise::Promise;

#[derive(Default)]
struct Entries {
    promises: HashMap<PromiseId, Arc<Promise>>,
    /// Retired id to the creation time of its promise.
    retired: HashMap<PromiseId, DateTime<Utc>>,
    /// Latest prune cutoff. Records created before it are never merged back in.
    pruned_before: Option<DateTime<Utc>>,
}

impl Entries {
    fn retire(&mut self, promise: &Promise) {
        self.retired.insert(promise.id(), promise.created_at());
    }

    fn is_retired(&self, record: &SerializablePromiseRecord) -> bool {
        self.retired.contains_key(&record.id())
            || self
                .pruned_before
                .is_some_and(|cutoff| record.created_at() < cutoff)
    }
}

#[derive(Default)]
pub(crate) struct RegistryInner {
    entries: Mutex<Entries>,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What a [`PromiseRegistry::sync`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Ids that only the remote side knew about.
    pub inserted: Vec<PromiseId>,
    /// Local pending promises that adopted a remote resolution.
    pub resolved: Vec<PromiseId>,
}

impl SyncReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.resolved.is_empty()
    }
}

/// Cheaply clonable handle to one process's registry.
///
/// Promises keep only a weak reference back to it, so dropping every handle
/// tears the registry down; its last flushed snapshot is its durable form.
#[derive(Clone, Default)]
pub struct PromiseRegistry {
    inner: Arc<RegistryInner>,
}

impl PromiseRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry holding one rehydrated promise per snapshot record.
    #[must_use]
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let registry = Self::new();
        {
            let mut entries = registry.inner.lock();
            for record in snapshot.into_records() {
                let promise = Promise::detached(record, None, registry.downgrade());
                entries.promises.insert(promise.id(), promise);
            }
        }
        registry
    }

    pub(crate) fn from_inner(inner: Arc<RegistryInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<RegistryInner> {
        Arc::downgrade(&self.inner)
    }

    /// Insert `promise` under its id and return the id.
    pub fn add_promise(&self, promise: Arc<Promise>) -> Result<PromiseId, PromiseError> {
        let id = promise.id();
        let mut entries = self.inner.lock();
        if entries.promises.contains_key(&id) {
            return Err(PromiseError::DuplicateIdentity { id });
        }
        entries.retired.remove(&id);
        entries.promises.insert(id, promise);
        Ok(id)
    }

    /// Remove `id` if present. Absent ids are not an error.
    pub fn remove_promise(&self, id: &PromiseId) -> Option<Arc<Promise>> {
        let mut entries = self.inner.lock();
        let removed = entries.promises.remove(id);
        if let Some(promise) = &removed {
            entries.retire(promise);
            debug!(id = %id, "Removed promise");
        }
        removed
    }

    #[must_use]
    pub fn get_promise(&self, id: &PromiseId) -> Option<Arc<Promise>> {
        self.inner.lock().promises.get(id).cloned()
    }

    /// Remove `promise` after consumption, unless its id now maps to a
    /// different promise object.
    pub(crate) fn retire(&self, promise: &Promise) {
        let mut entries = self.inner.lock();
        let id = promise.id();
        let same = entries
            .promises
            .get(&id)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), promise));
        if same {
            entries.promises.remove(&id);
            entries.retire(promise);
        }
    }

    /// Consume every resolved-but-unconsumed promise.
    ///
    /// Returns how many were consumed. Callbacks run without the registry lock
    /// held, in no particular order.
    pub fn attempt_consume_remaining_promises(&self) -> usize {
        let promises: Vec<Arc<Promise>> = self.inner.lock().promises.values().cloned().collect();
        let consumed = promises.iter().filter(|p| p.attempt_consume()).count();
        if consumed > 0 {
            info!(consumed, "Consumed promises resolved elsewhere");
        }
        consumed
    }

    /// Merge another registry's state into this one.
    pub fn sync(&self, other: &PromiseRegistry) -> Result<SyncReport, PromiseError> {
        self.sync_snapshot(&other.snapshot())
    }

    /// Merge a snapshot (typically freshly loaded from the store) into this registry.
    pub fn sync_snapshot(&self, snapshot: &RegistrySnapshot) -> Result<SyncReport, PromiseError> {
        let mut entries = self.inner.lock();

        let mut shared: Vec<(Arc<Promise>, &SerializablePromiseRecord)> = Vec::new();
        let mut incoming: Vec<&SerializablePromiseRecord> = Vec::new();
        for remote in snapshot.records() {
            match entries.promises.get(&remote.id()) {
                Some(local) => shared.push((Arc::clone(local), remote)),
                None if entries.is_retired(remote) => {}
                None => incoming.push(remote),
            }
        }

        // Snapshot order is sorted by id, so promise locks are always taken in
        // the same order.
        let mut states: Vec<_> = shared.iter().map(|(p, _)| p.lock_state()).collect();

        let mut adoptions: Vec<(usize, Outcome)> = Vec::new();
        for (index, (state, (_, remote))) in states.iter().zip(&shared).enumerate() {
            let Some(theirs) = remote.outcome() else {
                continue;
            };
            match state.record.outcome() {
                None => adoptions.push((index, theirs.clone())),
                Some(ours) if ours == theirs => {}
                Some(ours) => {
                    warn!(id = %remote.id(), "Refusing to merge conflicting resolutions");
                    return Err(PromiseError::ConflictingResolution {
                        id: remote.id(),
                        existing: ours.clone(),
                        attempted: theirs.clone(),
                    });
                }
            }
        }

        let mut report = SyncReport::default();
        for (index, outcome) in adoptions {
            if states[index].record.settle(outcome)? == Settle::Applied {
                report.resolved.push(states[index].record.id());
            }
        }
        drop(states);

        for record in incoming {
            let promise = Promise::detached(record.clone(), None, self.downgrade());
            report.inserted.push(promise.id());
            entries.promises.insert(promise.id(), promise);
        }

        if !report.is_empty() {
            info!(
                inserted = report.inserted.len(),
                resolved = report.resolved.len(),
                "Synced registry"
            );
        }
        Ok(report)
    }

    /// Durable form of every registered promise.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let records: Vec<SerializablePromiseRecord> = {
            let entries = self.inner.lock();
            entries.promises.values().map(|p| p.record()).collect()
        };
        // Keys of a map are unique, so the snapshot cannot see duplicates.
        RegistrySnapshot::from_records(records).unwrap_or_default()
    }

    /// Remove every promise created before `cutoff`, resolved or not.
    ///
    /// Tombstones older than `cutoff` are dropped too, and records created
    /// before it are no longer merged in by [`Self::sync`]. The registry never
    /// expires entries by itself; hosts call this explicitly.
    pub fn prune_stale(&self, cutoff: DateTime<Utc>) -> Vec<PromiseId> {
        let mut entries = self.inner.lock();
        let stale: Vec<PromiseId> = entries
            .promises
            .values()
            .filter(|p| p.created_at() < cutoff)
            .map(|p| p.id())
            .collect();
        for id in &stale {
            entries.promises.remove(id);
        }
        entries.retired.retain(|_, created_at| *created_at >= cutoff);
        entries.pruned_before = entries.pruned_before.max(Some(cutoff));
        if !stale.is_empty() {
            info!(removed = stale.len(), %cutoff, "Pruned stale promises");
        }
        stale
    }

    #[must_use]
    pub fn ids(&self) -> Vec<PromiseId> {
        self.inner.lock().promises.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().promises.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PromiseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.inner.lock();
        f.debug_struct("PromiseRegistry")
            .field("promises", &entries.promises.len())
            .field("retired", &entries.retired.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use chrono::Duration;
    use serde_json::json;

    use super::*;

    fn resolved_record(arg: serde_json::Value) -> SerializablePromiseRecord {
        let mut record = SerializablePromiseRecord::new();
        record.settle(Outcome::Fulfilled(arg)).unwrap();
        record
    }

    #[test]
    fn add_promise_rejects_duplicate_ids() {
        let registry = PromiseRegistry::new();
        let promise = Promise::create_empty(&registry).unwrap();

        let err = registry.add_promise(Arc::clone(&promise)).unwrap_err();
        assert_eq!(err, PromiseError::DuplicateIdentity { id: promise.id() });
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_and_get_treat_missing_ids_as_empty() {
        let registry = PromiseRegistry::new();
        let missing = PromiseId::generate();

        assert!(registry.get_promise(&missing).is_none());
        assert!(registry.remove_promise(&missing).is_none());
    }

    #[test]
    fn promise_reaches_registry_through_weak_handle() {
        let registry = PromiseRegistry::new();
        let promise = Promise::create_empty(&registry).unwrap();

        let owner = promise.registry().expect("registry alive");
        assert_eq!(owner.ids(), vec![promise.id()]);

        drop(owner);
        drop(registry);
        assert!(promise.registry().is_none());
    }

    #[test]
    fn sweep_consumes_resolved_and_keeps_pending() {
        let registry = PromiseRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        let pending = Promise::create(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            &registry,
        )
        .unwrap();
        let latent = Promise::create_empty(&registry).unwrap();
        latent.resolve(json!("latent")).unwrap();
        Promise::create_from_record(resolved_record(json!("remote")), &registry).unwrap();

        assert_eq!(registry.attempt_consume_remaining_promises(), 2);

        assert_eq!(registry.ids(), vec![pending.id()]);
        assert!(!pending.is_resolved());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(registry.attempt_consume_remaining_promises(), 0);
    }

    #[test]
    fn sweep_callbacks_may_reenter_registry() {
        let registry = PromiseRegistry::new();
        let handle = registry.clone();
        let promise = Promise::create(
            move |_| {
                let _ = Promise::create_empty(&handle);
            },
            &registry,
        )
        .unwrap();

        promise.resolve(json!(null)).unwrap();
        assert_eq!(registry.len(), 1);
        assert_ne!(registry.ids(), vec![promise.id()]);
    }

    #[test]
    fn sync_inserts_unknown_ids_and_keeps_local_only_ids() {
        let local = PromiseRegistry::new();
        let remote = PromiseRegistry::new();
        let ours = Promise::create_empty(&local).unwrap();
        let theirs = Promise::create_empty(&remote).unwrap();

        let report = local.sync(&remote).unwrap();

        assert_eq!(report.inserted, vec![theirs.id()]);
        assert!(local.get_promise(&ours.id()).is_some());
        assert!(local.get_promise(&theirs.id()).is_some());
    }

    #[test]
    fn sync_adopts_remote_resolution() {
        let local = PromiseRegistry::new();
        let promise = Promise::create_empty(&local).unwrap();

        let remote = PromiseRegistry::from_snapshot(local.snapshot());
        remote
            .get_promise(&promise.id())
            .unwrap()
            .resolve(json!("ok"))
            .unwrap();

        let report = local.sync(&remote).unwrap();
        assert_eq!(report.resolved, vec![promise.id()]);
        assert_eq!(promise.outcome(), Some(Outcome::Fulfilled(json!("ok"))));
        assert!(!promise.is_consumed());
    }

    #[test]
    fn sync_is_idempotent() {
        let local = PromiseRegistry::new();
        Promise::create_empty(&local).unwrap();
        let remote = PromiseRegistry::new();
        Promise::create_from_record(resolved_record(json!(1)), &remote).unwrap();
        Promise::create_empty(&remote).unwrap();

        local.sync(&remote).unwrap();
        let once = local.snapshot();
        let second = local.sync(&remote).unwrap();

        assert!(second.is_empty());
        assert_eq!(local.snapshot(), once);
    }

    #[test]
    fn sync_never_unresolves() {
        let local = PromiseRegistry::new();
        let promise = Promise::create_empty(&local).unwrap();
        let stale = local.snapshot();

        promise.resolve(json!("fresh")).unwrap();
        let report = local.sync_snapshot(&stale).unwrap();

        assert!(report.is_empty());
        assert_eq!(promise.outcome(), Some(Outcome::Fulfilled(json!("fresh"))));
    }

    #[test]
    fn sync_conflict_is_all_or_nothing() {
        let local = PromiseRegistry::new();
        let conflicted = Promise::create_empty(&local).unwrap();
        let adoptable = Promise::create_empty(&local).unwrap();

        let remote = PromiseRegistry::from_snapshot(local.snapshot());
        Promise::create_empty(&remote).unwrap();
        remote
            .get_promise(&conflicted.id())
            .unwrap()
            .resolve(json!("Y"))
            .unwrap();
        remote
            .get_promise(&adoptable.id())
            .unwrap()
            .resolve(json!("fine"))
            .unwrap();
        conflicted.resolve(json!("X")).unwrap();
        let before = local.snapshot();

        let err = local.sync(&remote).unwrap_err();

        assert!(matches!(err, PromiseError::ConflictingResolution { id, .. } if id == conflicted.id()));
        assert_eq!(local.snapshot(), before);
        assert!(!adoptable.is_resolved());
    }

    #[test]
    fn sync_does_not_resurrect_consumed_promises() {
        let local = PromiseRegistry::new();
        let promise = Promise::create(|_| {}, &local).unwrap();
        let mut stale_copy = promise.record();
        stale_copy.settle(Outcome::Fulfilled(json!("done"))).unwrap();
        promise.resolve(json!("done")).unwrap();
        assert!(local.is_empty());

        let remote = RegistrySnapshot::from_records([stale_copy]).unwrap();
        let report = local.sync_snapshot(&remote).unwrap();

        assert!(report.is_empty());
        assert!(local.is_empty());
    }

    #[test]
    fn sync_with_itself_is_a_noop() {
        let registry = PromiseRegistry::new();
        Promise::create_empty(&registry).unwrap();
        let report = registry.sync(&registry.clone()).unwrap();
        assert!(report.is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshot_roundtrips_through_from_snapshot() {
        let registry = PromiseRegistry::new();
        Promise::create_empty(&registry).unwrap();
        Promise::create_from_record(resolved_record(json!({"big": "x".repeat(2048)})), &registry)
            .unwrap();

        let snapshot = registry.snapshot();
        let rebuilt = PromiseRegistry::from_snapshot(snapshot.clone());
        assert_eq!(rebuilt.snapshot(), snapshot);
    }

    #[test]
    fn prune_stale_removes_only_old_entries() {
        let registry = PromiseRegistry::new();
        let old_record = SerializablePromiseRecord::pending(
            PromiseId::generate(),
            Utc::now() - Duration::days(30),
        );
        let old = Promise::create_from_record(old_record, &registry).unwrap();
        let fresh = Promise::create_empty(&registry).unwrap();

        let removed = registry.prune_stale(Utc::now() - Duration::days(7));

        assert_eq!(removed, vec![old.id()]);
        assert_eq!(registry.ids(), vec![fresh.id()]);
    }

    #[test]
    fn prune_stale_drops_old_tombstones_without_resurrection() {
        let registry = PromiseRegistry::new();
        let promise = Promise::create(|_| {}, &registry).unwrap();
        let mut stale_copy = promise.record();
        stale_copy.settle(Outcome::Fulfilled(json!("done"))).unwrap();
        promise.resolve(json!("done")).unwrap();
        assert_eq!(registry.inner.lock().retired.len(), 1);

        registry.prune_stale(Utc::now() + Duration::seconds(1));
        assert!(registry.inner.lock().retired.is_empty());

        let fresh = SerializablePromiseRecord::pending(
            PromiseId::generate(),
            Utc::now() + Duration::minutes(1),
        );
        let remote = RegistrySnapshot::from_records([stale_copy, fresh.clone()]).unwrap();
        let report = registry.sync_snapshot(&remote).unwrap();

        assert_eq!(report.inserted, vec![fresh.id()]);
        assert_eq!(registry.ids(), vec![fresh.id()]);
    }

    #[test]
    fn racing_consumers_deliver_exactly_once() {
        for _ in 0..64 {
            let registry = PromiseRegistry::new();
            let fired = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&fired);
            let promise = Promise::create(
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                &registry,
            )
            .unwrap();
            let bystander = Promise::create_empty(&registry).unwrap();
            let mut remote_copy = promise.record();
            remote_copy.settle(Outcome::Fulfilled(json!("ok"))).unwrap();
            let remote = RegistrySnapshot::from_records([remote_copy]).unwrap();

            let consumed = AtomicUsize::new(0);
            let barrier = Barrier::new(5);
            let bridge = thread::scope(|s| {
                for _ in 0..2 {
                    s.spawn(|| {
                        barrier.wait();
                        promise.resolve(json!("ok")).unwrap();
                    });
                }
                s.spawn(|| {
                    barrier.wait();
                    registry.sync_snapshot(&remote).unwrap();
                });
                s.spawn(|| {
                    barrier.wait();
                    consumed.fetch_add(registry.attempt_consume_remaining_promises(), Ordering::SeqCst);
                });
                let bridging = s.spawn(|| {
                    barrier.wait();
                    let bridge = promise.to_bridge();
                    if promise.attempt_consume() {
                        consumed.fetch_add(1, Ordering::SeqCst);
                    }
                    bridge
                });
                bridging.join().unwrap()
            });
            // A sync that adopted the outcome first leaves consumption to a sweep.
            consumed.fetch_add(registry.attempt_consume_remaining_promises(), Ordering::SeqCst);

            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert!(consumed.load(Ordering::SeqCst) <= 1);
            assert!(promise.is_consumed());
            assert_eq!(bridge.try_outcome(), Some(Outcome::Fulfilled(json!("ok"))));
            assert_eq!(registry.ids(), vec![bystander.id()]);
        }
    }
}
