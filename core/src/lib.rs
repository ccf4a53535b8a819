//! Durable promises shared between processes.
//!
//! A [`Promise`] wraps one [`SerializablePromiseRecord`]. The record is what
//! persists and crosses process boundaries; the callback and bridges are
//! process-local. Processes converge by loading each other's snapshots and
//! merging them with [`PromiseRegistry::sync`], then sweeping with
//! [`PromiseRegistry::attempt_consume_remaining_promises`].
//!
//! ```text
//! process A                         store                      process B
//! create(u1) ── flush ──────────▶ [u1 pending] ──── init ───▶ get(u1)
//!                                                             resolve("ok")
//! refresh ◀────────────────────── [u1 ok] ◀─────── flush ─────┘
//!   └─ sync + sweep: A's callback fires once, u1 retired
//! ```
//!
//! [`PromiseHost`] owns one registry and one [`tether_store::SnapshotStore`]
//! and is the only place that performs IO.
//!
//! Lock order is registry, then promise. No lock is held while a callback
//! runs, so callbacks may create, resolve or remove promises.

mod bridge;
mod host;
mod promise;
mod registry;

pub use bridge::{BridgeClosed, PromiseBridge};
pub use host::{PromiseHost, RefreshReport};
pub use promise::{Promise, ResolverCallback};
pub use registry::{PromiseRegistry, SyncReport};
pub use tether_types::{
    Outcome, PromiseError, PromiseId, RegistrySnapshot, ResolveArg, SerializablePromiseRecord,
    SnapshotError,
};
