//! Core domain types for Tether durable promises.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be shared by every process that touches a promise registry:
//! the process that creates a promise, the one that resolves it, and the one that
//! eventually consumes it.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod error;
mod ids;
mod record;
mod snapshot;

pub use error::{PromiseError, SnapshotError};
pub use ids::PromiseId;
pub use record::{
    InvalidRecordState, Outcome, RecordState, ResolveArg, SerializablePromiseRecord, Settle,
};
pub use snapshot::{RegistrySnapshot, SNAPSHOT_FORMAT, SNAPSHOT_FORMAT_VERSION};
