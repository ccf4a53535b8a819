use thiserror::Error;

use crate::{Outcome, PromiseId};

/// Local-logic errors raised by promise and registry operations.
///
/// Both variants indicate a programmer or protocol error rather than a
/// transient condition, so nothing in the workspace retries them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromiseError {
    /// An id was inserted into a registry that already holds it.
    #[error("promise {id} is already registered")]
    DuplicateIdentity { id: PromiseId },
    /// Two resolvers settled the same promise with different outcomes.
    #[error("conflicting resolution for promise {id}: stored {existing}, attempted {attempted}")]
    ConflictingResolution {
        id: PromiseId,
        existing: Outcome,
        attempted: Outcome,
    },
}

impl PromiseError {
    #[must_use]
    pub fn id(&self) -> PromiseId {
        match self {
            Self::DuplicateIdentity { id } | Self::ConflictingResolution { id, .. } => *id,
        }
    }
}

/// Failure to decode (or, rarely, encode) a persisted registry snapshot.
///
/// Decoding never returns a partially recovered snapshot: any of these
/// errors means the bytes were rejected as a whole.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unrecognized snapshot format {found:?}")]
    UnsupportedFormat { found: String },
    #[error("unsupported snapshot format version {found} (supported: 1..={supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("snapshot checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },
    #[error("snapshot contains promise {id} more than once")]
    DuplicateRecord { id: PromiseId },
    #[error("snapshot contains an invalid record: {0}")]
    InvalidRecord(#[source] serde_json::Error),
    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),
}
