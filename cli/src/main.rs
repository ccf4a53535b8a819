//! Tether CLI - inspect and drive a shared promise store from the shell.
//!
//! Each invocation is one short-lived "process" in the registry's sense: it
//! loads the store, applies one command and flushes. Resolving a promise here
//! lets the process that created it pick the result up on its next refresh.

mod args;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::args::Cli;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match commands::run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}
