// SQLite snapshot store - registry snapshot kept as a database row
//
// One row per slot. Writers replace the row in a single statement, so a reader
// in another process sees either the previous snapshot or the new one.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tether_types::{RegistrySnapshot, SNAPSHOT_FORMAT_VERSION};
use tether_utils::{ensure_secure_dir, ensure_secure_file};

use crate::{MergeFn, SnapshotStore};

const DEFAULT_SLOT: &str = "default";

/// Another process may hold the write lock while it flushes its own snapshot.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteSnapshotStore {
    db: Connection,
    slot: String,
    location: String,
}

impl SqliteSnapshotStore {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS registry_snapshots (
            slot TEXT PRIMARY KEY,
            format_version INTEGER NOT NULL,
            payload BLOB NOT NULL,
            written_at TEXT NOT NULL
        );
    ";

    /// Open or create a snapshot database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_slot(path, DEFAULT_SLOT)
    }

    /// Open a database and address a named slot, so several registries can
    /// share one file.
    pub fn open_slot(path: impl AsRef<Path>, slot: &str) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            ensure_secure_dir(parent)?;
        }
        ensure_secure_file(path, &["-wal", "-shm"])?;

        let db = Connection::open(path)
            .with_context(|| format!("Failed to open snapshot database at {}", path.display()))?;
        Self::initialize(db, slot, format!("sqlite:{}#{slot}", path.display()))
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().context("Failed to open in-memory snapshot store")?;
        Self::initialize(db, DEFAULT_SLOT, "sqlite::memory:".to_string())
    }

    fn initialize(db: Connection, slot: &str, location: String) -> Result<Self> {
        db.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set snapshot store busy timeout")?;
        db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .context("Failed to set snapshot store pragmas")?;
        db.execute_batch(Self::SCHEMA)
            .context("Failed to create snapshot store schema")?;
        Ok(Self {
            db,
            slot: slot.to_string(),
            location,
        })
    }
}

fn load_slot(db: &Connection, slot: &str) -> Result<Option<RegistrySnapshot>> {
    let row: Option<(i64, Vec<u8>)> = db
        .query_row(
            "SELECT format_version, payload FROM registry_snapshots WHERE slot = ?1",
            params![slot],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .with_context(|| format!("Failed to load snapshot slot {slot}"))?;

    let Some((format_version, payload)) = row else {
        return Ok(None);
    };

    let snapshot = RegistrySnapshot::decode(&payload).with_context(|| {
        format!("Failed to decode snapshot slot {slot} (stored format version {format_version})")
    })?;

    tracing::debug!(slot = %slot, records = snapshot.len(), "Loaded snapshot");
    Ok(Some(snapshot))
}

fn save_slot(db: &Connection, slot: &str, snapshot: &RegistrySnapshot) -> Result<()> {
    let payload = snapshot.encode().context("Failed to encode snapshot")?;
    let written_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

    db.execute(
        "INSERT INTO registry_snapshots (slot, format_version, payload, written_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(slot) DO UPDATE SET
            format_version = excluded.format_version,
            payload = excluded.payload,
            written_at = excluded.written_at",
        params![slot, i64::from(SNAPSHOT_FORMAT_VERSION), payload, written_at],
    )
    .with_context(|| format!("Failed to save snapshot slot {slot}"))?;

    tracing::debug!(slot = %slot, records = snapshot.len(), "Saved snapshot");
    Ok(())
}

impl SnapshotStore for SqliteSnapshotStore {
    fn load(&self) -> Result<Option<RegistrySnapshot>> {
        load_slot(&self.db, &self.slot)
    }

    fn save(&mut self, snapshot: &RegistrySnapshot) -> Result<()> {
        save_slot(&self.db, &self.slot, snapshot)
    }

    fn update(&mut self, merge: &mut MergeFn<'_>) -> Result<()> {
        // IMMEDIATE takes the write lock up front, so no other connection can
        // commit between our read and our write.
        let tx = self
            .db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("Failed to lock snapshot slot {}", self.slot))?;
        let latest = load_slot(&tx, &self.slot)?;
        let next = merge(latest)?;
        save_slot(&tx, &self.slot, &next)?;
        tx.commit()
            .with_context(|| format!("Failed to commit snapshot slot {}", self.slot))
    }

    fn describe(&self) -> String {
        self.location.clone()
    }
}
