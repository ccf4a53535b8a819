//! In-memory promise wrapping one durable record.
//!
//! Resolution and consumption are separate steps. Resolution mutates the
//! record (and is what other processes observe through the snapshot).
//! Consumption delivers the outcome to this process's callback and bridges,
//! then retires the promise from its registry. A promise resolved in another
//! process stays resolved-but-unconsumed here until a sweep finds it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tether_types::{
    Outcome, PromiseError, PromiseId, ResolveArg, SerializablePromiseRecord, Settle,
};
use tokio::sync::watch;
use tracing::debug;

use crate::bridge::PromiseBridge;
use crate::registry::{PromiseRegistry, RegistryInner};

/// Live resolution callback. Never persisted; lost when the process exits.
pub type ResolverCallback = Box<dyn FnOnce(Outcome) + Send + 'static>;

pub(crate) struct PromiseState {
    pub(crate) record: SerializablePromiseRecord,
    callback: Option<ResolverCallback>,
    bridge_requested: bool,
    consumed: bool,
}

impl PromiseState {
    fn has_consumer(&self) -> bool {
        self.callback.is_some() || self.bridge_requested
    }

    fn is_consumable(&self) -> bool {
        self.record.is_resolved() && !self.consumed
    }
}

pub struct Promise {
    id: PromiseId,
    created_at: DateTime<Utc>,
    registry: Weak<RegistryInner>,
    state: Mutex<PromiseState>,
    completion: watch::Sender<Option<Outcome>>,
}

impl Promise {
    /// Create an unresolved promise with a live callback and register it.
    pub fn create(
        callback: impl FnOnce(Outcome) + Send + 'static,
        registry: &PromiseRegistry,
    ) -> Result<Arc<Self>, PromiseError> {
        Self::register(
            SerializablePromiseRecord::new(),
            Some(Box::new(callback)),
            registry,
        )
    }

    /// Create an unresolved promise meant to be consumed through [`Self::to_bridge`].
    pub fn create_empty(registry: &PromiseRegistry) -> Result<Arc<Self>, PromiseError> {
        Self::register(SerializablePromiseRecord::new(), None, registry)
    }

    /// Rehydrate a persisted record into `registry`. No callback is attached.
    pub fn create_from_record(
        record: SerializablePromiseRecord,
        registry: &PromiseRegistry,
    ) -> Result<Arc<Self>, PromiseError> {
        Self::register(record, None, registry)
    }

    fn register(
        record: SerializablePromiseRecord,
        callback: Option<ResolverCallback>,
        registry: &PromiseRegistry,
    ) -> Result<Arc<Self>, PromiseError> {
        let promise = Self::detached(record, callback, registry.downgrade());
        if let Err(err) = registry.add_promise(Arc::clone(&promise)) {
            tracing::error!(id = %promise.id, "Promise id collided with a registered promise");
            return Err(err);
        }
        debug!(id = %promise.id, "Created promise");
        Ok(promise)
    }

    /// Build a promise bound to `registry` without inserting it.
    pub(crate) fn detached(
        record: SerializablePromiseRecord,
        callback: Option<ResolverCallback>,
        registry: Weak<RegistryInner>,
    ) -> Arc<Self> {
        let (completion, _) = watch::channel(None);
        Arc::new(Self {
            id: record.id(),
            created_at: record.created_at(),
            registry,
            state: Mutex::new(PromiseState {
                record,
                callback,
                bridge_requested: false,
                consumed: false,
            }),
            completion,
        })
    }

    #[must_use]
    pub fn id(&self) -> PromiseId {
        self.id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// A copy of the durable record.
    #[must_use]
    pub fn record(&self) -> SerializablePromiseRecord {
        self.lock_state().record.clone()
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.lock_state().record.is_resolved()
    }

    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.lock_state().consumed
    }

    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        self.lock_state().record.outcome().cloned()
    }

    /// The registry this promise belongs to, if it is still alive.
    #[must_use]
    pub fn registry(&self) -> Option<PromiseRegistry> {
        self.registry.upgrade().map(PromiseRegistry::from_inner)
    }

    /// Settle as fulfilled with `arg`.
    ///
    /// Resolving again with the same payload is a no-op; a different payload
    /// is [`PromiseError::ConflictingResolution`]. When a callback or bridge is
    /// attached the promise is consumed before this returns.
    pub fn resolve(&self, arg: ResolveArg) -> Result<(), PromiseError> {
        self.settle(Outcome::Fulfilled(arg))
    }

    /// Settle as rejected with `reason`. Same rules as [`Self::resolve`].
    pub fn reject(&self, reason: ResolveArg) -> Result<(), PromiseError> {
        self.settle(Outcome::Rejected(reason))
    }

    fn settle(&self, outcome: Outcome) -> Result<(), PromiseError> {
        let consume_now = {
            let mut state = self.lock_state();
            match state.record.settle(outcome)? {
                Settle::Applied => {
                    debug!(id = %self.id, "Promise settled");
                    state.has_consumer()
                }
                Settle::Unchanged => false,
            }
        };
        if consume_now {
            self.attempt_consume();
        }
        Ok(())
    }

    /// Attach (or replace) the live callback, e.g. after reloading a snapshot.
    ///
    /// Fires immediately if the promise is already resolved but unconsumed.
    /// Returns `false` (dropping `callback`) if the promise was already consumed.
    pub fn attach_callback(&self, callback: impl FnOnce(Outcome) + Send + 'static) -> bool {
        let consume_now = {
            let mut state = self.lock_state();
            if state.consumed {
                return false;
            }
            state.callback = Some(Box::new(callback));
            state.is_consumable()
        };
        if consume_now {
            self.attempt_consume();
        }
        true
    }

    /// Awaitable handle that completes when this promise is consumed.
    ///
    /// Requesting a bridge on a resolved promise consumes it, so the bridge
    /// completes immediately with the stored outcome.
    pub fn to_bridge(&self) -> PromiseBridge {
        let rx = self.completion.subscribe();
        let consume_now = {
            let mut state = self.lock_state();
            state.bridge_requested = true;
            state.is_consumable()
        };
        if consume_now {
            self.attempt_consume();
        }
        PromiseBridge::new(self.id, rx)
    }

    /// Deliver a resolved outcome exactly once and retire from the registry.
    ///
    /// Returns whether this call consumed the promise. Unresolved or already
    /// consumed promises are left untouched.
    pub fn attempt_consume(&self) -> bool {
        let (callback, outcome) = {
            let mut state = self.lock_state();
            if !state.is_consumable() {
                return false;
            }
            let Some(outcome) = state.record.outcome().cloned() else {
                return false;
            };
            state.consumed = true;
            (state.callback.take(), outcome)
        };

        self.completion.send_replace(Some(outcome.clone()));
        if let Some(callback) = callback {
            callback(outcome);
        }

        if let Some(registry) = self.registry() {
            registry.retire(self);
        }
        debug!(id = %self.id, "Promise consumed");
        true
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, PromiseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Promise")
            .field("id", &self.id)
            .field("record", &state.record)
            .field("has_callback", &state.callback.is_some())
            .field("bridge_requested", &state.bridge_requested)
            .field("consumed", &state.consumed)
            .finish_non_exhaustive()
    }
}
