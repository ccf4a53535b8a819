use std::io::{self, Write};

use anyhow::{Context, Result, bail};
use tether_config::{ResolvedStore, StoreBackend, TetherConfig, default_store_path};
use tether_core::{Promise, PromiseError, PromiseHost, PromiseId, SerializablePromiseRecord};
use tether_store::{FileSnapshotStore, SnapshotStore, SqliteSnapshotStore};
use tether_types::RecordState;
use tracing::info;

use crate::args::{Cli, Command};

type Host = PromiseHost<Box<dyn SnapshotStore>>;

pub fn run(cli: Cli) -> Result<()> {
    let config = TetherConfig::load()?.unwrap_or_default();
    let resolved = resolve_store(&config, &cli)?;
    let mut host = PromiseHost::init(open_store(&resolved)?)?;
    let mut out = io::stdout().lock();

    match cli.command {
        Command::Create => {
            let promise = Promise::create_empty(host.registry())?;
            host.flush()?;
            writeln!(out, "{}", promise.id())?;
        }
        Command::Resolve { id, arg } => {
            settle(&mut host, id, |promise| promise.resolve(arg))?;
        }
        Command::Reject { id, reason } => {
            settle(&mut host, id, |promise| promise.reject(reason))?;
        }
        Command::Show => {
            let snapshot = host.registry().snapshot();
            for record in snapshot.records() {
                writeln!(out, "{}", describe(record))?;
            }
        }
        Command::Sweep => {
            let report = host.refresh()?;
            host.flush()?;
            writeln!(out, "{}", report.consumed)?;
        }
        Command::Prune { older_than } => {
            let Some(max_age) = older_than.or_else(|| config.stale_after()) else {
                bail!("prune needs --older-than-secs or [registry] stale_after_secs");
            };
            let removed = host.prune_stale(max_age)?;
            host.flush()?;
            writeln!(out, "{}", removed.len())?;
        }
    }
    Ok(())
}

fn resolve_store(config: &TetherConfig, cli: &Cli) -> Result<ResolvedStore> {
    let mut resolved = config.resolve_store()?;
    if let Some(backend) = cli.backend {
        if resolved.path == default_store_path(resolved.backend) {
            resolved.path = default_store_path(backend);
        }
        resolved.backend = backend;
    }
    if let Some(path) = &cli.store {
        resolved.path.clone_from(path);
    }
    Ok(resolved)
}

fn open_store(resolved: &ResolvedStore) -> Result<Box<dyn SnapshotStore>> {
    let store: Box<dyn SnapshotStore> = match resolved.backend {
        StoreBackend::File => Box::new(FileSnapshotStore::open(&resolved.path)?),
        StoreBackend::Sqlite => Box::new(SqliteSnapshotStore::open(&resolved.path)?),
    };
    info!(backend = %resolved.backend, store = %store.describe(), "Opened promise store");
    Ok(store)
}

fn settle(
    host: &mut Host,
    id: PromiseId,
    apply: impl FnOnce(&Promise) -> Result<(), PromiseError>,
) -> Result<()> {
    let Some(promise) = host.registry().get_promise(&id) else {
        bail!("no promise with id {id} in {}", host.store().describe());
    };
    apply(&promise).with_context(|| format!("Failed to settle promise {id}"))?;
    host.flush()
}

fn describe(record: &SerializablePromiseRecord) -> String {
    let created = record.created_at().to_rfc3339();
    match record.state() {
        RecordState::Pending => format!("{}  {created}  pending", record.id()),
        RecordState::Settled(outcome) => format!("{}  {created}  {outcome}", record.id()),
    }
}
