//! CLI command handlers.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use labsync_core::{ProviderConfig, ResultExt};
use labsync_reconciler::{
    Engine, FileStateStore, InMemoryStateStore, ManualClock, ProviderContext, ReconcileResult,
    Registry, StateStore, StopSignal,
};
use labsync_remote::{HttpRemoteService, InMemoryRemoteService, RemoteService};
use tracing::{debug, error, info};

use crate::cli::{Cli, Commands};
use crate::manifest::Manifest;

/// Build the engine the command runs against.
///
/// A simulated run uses the in-memory remote service, keeps records in memory
/// and completes settle waits without sleeping. Credentials are not required.
fn build_engine(cli: &Cli, stop: StopSignal) -> Result<Engine> {
    let registry = Registry::standard();

    if cli.simulate {
        let config = match &cli.config {
            Some(path) => ProviderConfig::from_file(path)?,
            None => ProviderConfig::default(),
        };
        config.validate_timing()?;
        info!("Simulating against an in-memory remote service");
        let service: Arc<dyn RemoteService> = Arc::new(InMemoryRemoteService::new());
        let ctx = ProviderContext::from_config(service, &config)
            .with_clock(Arc::new(ManualClock::new()))
            .with_stop(stop);
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        return Ok(Engine::new(registry, store, ctx));
    }

    let config = ProviderConfig::load(cli.config.as_deref())
        .context("Provider configuration is incomplete")?;
    debug!(base_url = %config.base_url, "Loaded provider configuration");
    let service: Arc<dyn RemoteService> = Arc::new(
        HttpRemoteService::from_config(&config).context("Failed to build HTTP client")?,
    );
    let ctx = ProviderContext::from_config(service, &config).with_stop(stop);
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(&cli.state));
    Ok(Engine::new(registry, store, ctx))
}

/// Execute a CLI command.
pub async fn execute_command(cli: Cli, stop: StopSignal) -> Result<()> {
    let manifest = match cli.command.manifest() {
        Some(path) => Manifest::from_file(path)?,
        None => Manifest::default(),
    };
    let engine = build_engine(&cli, stop.clone())?;

    match &cli.command {
        Commands::Apply { .. } => cmd_apply(&engine, &manifest, &stop).await,
        Commands::Refresh { .. } => cmd_refresh(&engine, &manifest, &stop).await,
        Commands::Destroy { .. } => cmd_destroy(&engine, &manifest, &stop).await,
        Commands::Show { json, .. } => cmd_show(&engine, &manifest, *json).await,
        Commands::FindProject { name } => cmd_find_project(&engine, name).await,
    }
}

fn print_result(result: &ReconcileResult) {
    let id = result.id.as_deref().unwrap_or("-");
    if result.report.is_empty() {
        println!("{}: {} (id {id})", result.address, result.action.description());
        return;
    }
    let changes: Vec<String> = result
        .report
        .collections
        .iter()
        .map(|(collection, c)| format!("{collection} -{} +{}", c.removed, c.added))
        .collect();
    println!(
        "{}: {} (id {id}; {})",
        result.address,
        result.action.description(),
        changes.join(", ")
    );
}

/// Apply every declared resource in declaration order, stopping at the first failure.
async fn cmd_apply(engine: &Engine, manifest: &Manifest, stop: &StopSignal) -> Result<()> {
    info!(resources = manifest.resources.len(), "Applying manifest");
    for resource in &manifest.resources {
        if stop.is_stopped() {
            bail!("Stopped before {}", resource.address);
        }
        let result = engine
            .apply(&resource.address, resource.desired.clone())
            .await
            .inspect_error(|err| error!(address = %resource.address, error = %err, "Apply failed"))
            .with_context(|| format!("Failed to apply {}", resource.address))?;
        print_result(&result);
    }
    println!("Apply complete: {} resource(s)", manifest.resources.len());
    Ok(())
}

async fn cmd_refresh(engine: &Engine, manifest: &Manifest, stop: &StopSignal) -> Result<()> {
    for address in manifest.addresses() {
        if stop.is_stopped() {
            bail!("Stopped before {address}");
        }
        let result = engine
            .refresh(address)
            .await
            .with_context(|| format!("Failed to refresh {address}"))?;
        match &result.id {
            Some(_) => print_result(&result),
            None => println!("{address}: not present"),
        }
    }
    Ok(())
}

/// Destroy in reverse declaration order so dependents go first.
async fn cmd_destroy(engine: &Engine, manifest: &Manifest, stop: &StopSignal) -> Result<()> {
    info!(resources = manifest.resources.len(), "Destroying manifest");
    for address in manifest.addresses().rev() {
        if stop.is_stopped() {
            bail!("Stopped before {address}");
        }
        engine
            .destroy(address)
            .await
            .with_context(|| format!("Failed to destroy {address}"))?;
        println!("{address}: deleted");
    }
    Ok(())
}

async fn cmd_find_project(engine: &Engine, name: &str) -> Result<()> {
    let project = engine
        .find_project(name)
        .await
        .with_context(|| format!("Failed to find project '{name}'"))?;
    println!("{}", serde_json::to_string_pretty(&project)?);
    Ok(())
}

async fn cmd_show(engine: &Engine, manifest: &Manifest, json: bool) -> Result<()> {
    let records = engine.records().await?;
    for address in manifest.addresses() {
        let record = records
            .iter()
            .find(|(recorded, _)| recorded == address)
            .map(|(_, record)| record);
        match record {
            None => println!("{address}: not recorded"),
            Some(record) if json => {
                println!("{address}:");
                println!("{}", serde_json::to_string_pretty(record)?);
            }
            Some(record) => {
                let id = record.id.as_deref().unwrap_or("-");
                let status = if record.tainted { " (tainted)" } else { "" };
                println!(
                    "{address}: id {id}{status}, updated {}",
                    record.updated_at.to_rfc3339()
                );
            }
        }
    }
    Ok(())
}
