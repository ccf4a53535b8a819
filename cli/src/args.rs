use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tether_config::StoreBackend;
use tether_types::{PromiseId, ResolveArg};

#[derive(Debug, PartialEq, Parser)]
#[command(name = "tether", version)]
#[command(about = "Inspect and drive a shared durable promise store")]
pub struct Cli {
    /// Snapshot location (overrides config and TETHER_STORE_PATH)
    #[arg(long, global = true, value_name = "PATH")]
    pub store: Option<PathBuf>,
    /// Persistence backend: file or sqlite
    #[arg(long, global = true, value_name = "BACKEND")]
    pub backend: Option<StoreBackend>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, PartialEq, Subcommand)]
pub enum Command {
    /// Register a pending promise and print its id
    Create,
    /// Fulfill a promise with a JSON payload
    Resolve {
        #[arg(value_parser = parse_id)]
        id: PromiseId,
        #[arg(value_name = "JSON", value_parser = parse_payload)]
        arg: ResolveArg,
    },
    /// Reject a promise with a JSON reason
    Reject {
        #[arg(value_parser = parse_id)]
        id: PromiseId,
        #[arg(value_name = "JSON", value_parser = parse_payload)]
        reason: ResolveArg,
    },
    /// List every stored promise
    Show,
    /// Drop promises that are already settled
    Sweep,
    /// Drop promises older than an age (default: [registry] stale_after_secs)
    Prune {
        #[arg(long = "older-than-secs", value_name = "SECS", value_parser = parse_secs)]
        older_than: Option<Duration>,
    },
}

fn parse_id(raw: &str) -> Result<PromiseId, String> {
    raw.parse()
        .map_err(|err| format!("invalid promise id {raw:?}: {err}"))
}

fn parse_payload(raw: &str) -> Result<ResolveArg, String> {
    serde_json::from_str(raw).map_err(|err| format!("payload is not valid JSON: {err}"))
}

fn parse_secs(raw: &str) -> Result<Duration, String> {
    raw.parse()
        .map(Duration::from_secs)
        .map_err(|err| format!("invalid seconds {raw:?}: {err}"))
}
