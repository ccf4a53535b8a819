//! The durable unit of promise state.
//!
//! A record is pure data. The in-memory representation makes "resolved but no
//! payload" unrepresentable; the persisted representation keeps the flat
//! `is_resolved` / `resolve_arg` layout that every process version reads.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{PromiseError, PromiseId};

/// Opaque resolution payload. `Value::Null` is a valid payload.
pub type ResolveArg = serde_json::Value;

/// How a promise was settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Fulfilled(ResolveArg),
    Rejected(ResolveArg),
}

impl Outcome {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Fulfilled(_) => "fulfilled",
            Self::Rejected(_) => "rejected",
        }
    }

    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    #[must_use]
    pub const fn arg(&self) -> &ResolveArg {
        match self {
            Self::Fulfilled(arg) | Self::Rejected(arg) => arg,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.arg())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState {
    Pending,
    Settled(Outcome),
}

/// Result of a successful [`SerializablePromiseRecord::settle`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    /// The record transitioned from pending to settled.
    Applied,
    /// The record was already settled with an identical outcome.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RecordWire", into = "RecordWire")]
pub struct SerializablePromiseRecord {
    id: PromiseId,
    created_at: DateTime<Utc>,
    state: RecordState,
}

impl SerializablePromiseRecord {
    /// A fresh pending record with a newly generated id.
    #[must_use]
    pub fn new() -> Self {
        Self::pending(PromiseId::generate(), Utc::now())
    }

    #[must_use]
    pub fn pending(id: PromiseId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at,
            state: RecordState::Pending,
        }
    }

    #[must_use]
    pub fn id(&self) -> PromiseId {
        self.id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn state(&self) -> &RecordState {
        &self.state
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self.state, RecordState::Settled(_))
    }

    #[must_use]
    pub fn outcome(&self) -> Option<&Outcome> {
        match &self.state {
            RecordState::Pending => None,
            RecordState::Settled(outcome) => Some(outcome),
        }
    }

    #[must_use]
    pub fn resolve_arg(&self) -> Option<&ResolveArg> {
        self.outcome().map(Outcome::arg)
    }

    /// Settle the record exactly once.
    ///
    /// Re-settling with an identical outcome is a no-op. Any other outcome is a
    /// [`PromiseError::ConflictingResolution`] and leaves the stored one intact.
    pub fn settle(&mut self, outcome: Outcome) -> Result<Settle, PromiseError> {
        match &self.state {
            RecordState::Pending => {
                self.state = RecordState::Settled(outcome);
                Ok(Settle::Applied)
            }
            RecordState::Settled(existing) if *existing == outcome => Ok(Settle::Unchanged),
            RecordState::Settled(existing) => Err(PromiseError::ConflictingResolution {
                id: self.id,
                existing: existing.clone(),
                attempted: outcome,
            }),
        }
    }
}

impl Default for SerializablePromiseRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
#[error("pending promise {id} must not carry a resolution payload")]
pub struct InvalidRecordState {
    id: PromiseId,
}

#[derive(Serialize, Deserialize)]
struct RecordWire {
    id: PromiseId,
    created_at: DateTime<Utc>,
    is_resolved: bool,
    #[serde(default)]
    resolve_arg: ResolveArg,
    #[serde(default)]
    is_rejected: bool,
}

impl TryFrom<RecordWire> for SerializablePromiseRecord {
    type Error = InvalidRecordState;

    fn try_from(wire: RecordWire) -> Result<Self, Self::Error> {
        let state = match (wire.is_resolved, wire.is_rejected) {
            (true, false) => RecordState::Settled(Outcome::Fulfilled(wire.resolve_arg)),
            (true, true) => RecordState::Settled(Outcome::Rejected(wire.resolve_arg)),
            (false, false) if wire.resolve_arg.is_null() => RecordState::Pending,
            (false, _) => return Err(InvalidRecordState { id: wire.id }),
        };
        Ok(Self {
            id: wire.id,
            created_at: wire.created_at,
            state,
        })
    }
}

impl From<SerializablePromiseRecord> for RecordWire {
    fn from(record: SerializablePromiseRecord) -> Self {
        let (is_resolved, is_rejected, resolve_arg) = match record.state {
            RecordState::Pending => (false, false, ResolveArg::Null),
            RecordState::Settled(Outcome::Fulfilled(arg)) => (true, false, arg),
            RecordState::Settled(Outcome::Rejected(arg)) => (true, true, arg),
        };
        Self {
            id: record.id,
            created_at: record.created_at,
            is_resolved,
            resolve_arg,
            is_rejected,
        }
    }
}
