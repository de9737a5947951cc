//! # labsync
//!
//! Declarative provisioning for cloud training labs.
//!
//! ## Run Sequence
//!
//! 1. **Tracing** - `RUST_LOG` if set, otherwise `info` (`debug` with `--verbose`)
//! 2. **Manifest** - parse `[[resource]]` tables in declaration order
//! 3. **Engine** - provider configuration, remote service, state store
//! 4. **Command** - apply, refresh, destroy or show
//!
//! ## Shutdown
//!
//! Ctrl+C fires the stop signal. Runstate waits in progress return a
//! cancellation error and no further resources are started. Records written
//! so far are kept, so the next run picks up where this one stopped.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;
mod commands;
mod manifest;

use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use labsync_reconciler::Stopper;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let start_time = Instant::now();
    let stopper = Stopper::new();
    spawn_stop_listener(stopper.clone());

    let outcome = commands::execute_command(cli, stopper.signal()).await;
    info!(elapsed = ?start_time.elapsed(), "Finished");
    outcome
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Stop in-flight waits on Ctrl+C.
fn spawn_stop_listener(stopper: Stopper) {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received Ctrl+C, stopping after the current call");
                stopper.stop();
            }
            Err(err) => error!("Failed to listen for shutdown signal: {}", err),
        }
    });
}
