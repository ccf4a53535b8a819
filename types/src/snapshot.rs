//! Versioned, checksummed registry snapshot codec.
//!
//! The snapshot is what crosses process boundaries through the persistence
//! substrate. Encoding is deterministic (records sorted by id, canonical JSON
//! for the checksum). Decoding fails closed: a snapshot is either accepted as a
//! whole or rejected with a [`SnapshotError`].

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{PromiseId, SerializablePromiseRecord, SnapshotError};

pub const SNAPSHOT_FORMAT: &str = "tether.registry";
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope {
    format: String,
    format_version: u32,
    checksum: String,
    records: serde_json::Value,
}

/// The durable form of a registry: the id to record mapping and nothing else.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    records: BTreeMap<PromiseId, SerializablePromiseRecord>,
}

impl RegistrySnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot, rejecting duplicate ids.
    pub fn from_records(
        records: impl IntoIterator<Item = SerializablePromiseRecord>,
    ) -> Result<Self, SnapshotError> {
        let mut map = BTreeMap::new();
        for record in records {
            match map.entry(record.id()) {
                Entry::Occupied(entry) => {
                    return Err(SnapshotError::DuplicateRecord { id: *entry.key() });
                }
                Entry::Vacant(entry) => {
                    entry.insert(record);
                }
            }
        }
        Ok(Self { records: map })
    }

    #[must_use]
    pub fn get(&self, id: &PromiseId) -> Option<&SerializablePromiseRecord> {
        self.records.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &SerializablePromiseRecord> {
        self.records.values()
    }

    #[must_use]
    pub fn into_records(self) -> Vec<SerializablePromiseRecord> {
        self.records.into_values().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        let records: Vec<&SerializablePromiseRecord> = self.records.values().collect();
        let records = serde_json::to_value(records).map_err(SnapshotError::Encode)?;
        let envelope = Envelope {
            format: SNAPSHOT_FORMAT.to_string(),
            format_version: SNAPSHOT_FORMAT_VERSION,
            checksum: canonical_checksum(&records)?,
            records,
        };
        serde_json::to_vec(&envelope).map_err(SnapshotError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let envelope: Envelope = serde_json::from_slice(bytes).map_err(SnapshotError::Malformed)?;

        if envelope.format != SNAPSHOT_FORMAT {
            return Err(SnapshotError::UnsupportedFormat {
                found: envelope.format,
            });
        }
        if envelope.format_version == 0 || envelope.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                found: envelope.format_version,
                supported: SNAPSHOT_FORMAT_VERSION,
            });
        }

        let computed = canonical_checksum(&envelope.records)?;
        if !computed.eq_ignore_ascii_case(&envelope.checksum) {
            return Err(SnapshotError::ChecksumMismatch {
                expected: envelope.checksum,
                computed,
            });
        }

        let records: Vec<SerializablePromiseRecord> =
            serde_json::from_value(envelope.records).map_err(SnapshotError::InvalidRecord)?;
        Self::from_records(records)
    }
}

/// SHA-256 over the canonical (sorted-key, compact) JSON of the records array.
fn canonical_checksum(records: &serde_json::Value) -> Result<String, SnapshotError> {
    let canonical = serde_json::to_vec(records).map_err(SnapshotError::Encode)?;
    let hash = Sha256::digest(&canonical);
    // Manual hex encoding to avoid hex crate dependency
    let hex_chars: Vec<String> = hash.iter().map(|b| format!("{b:02x}")).collect();
    Ok(hex_chars.join(""))
}
