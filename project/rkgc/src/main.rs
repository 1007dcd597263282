use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use rkgc::{
    api::{ClusterClient, registry::skip_reason, xlinestore::XlineStore},
    cli::{Cli, Commands},
    controllers::GarbageCollector,
    protocol::config::{Config, config_ref, load_config},
};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::init();

    match &cli.command {
        Commands::Start { config, workers } => {
            load(config)?;
            handle_start_command(*workers).await?;
        }
        Commands::Resources { config } => {
            load(config)?;
            handle_resources_command().await?;
        }
    }

    Ok(())
}

fn load(path: &Path) -> anyhow::Result<()> {
    load_config(path).with_context(|| format!("Failed to load config {}", path.display()))?;
    Ok(())
}

async fn init_xline_store(cfg: &Config) -> anyhow::Result<Arc<XlineStore>> {
    let store = XlineStore::new(&cfg.xline_config, cfg.resources.clone())
        .await
        .with_context(|| "Failed to connect xline")?;
    Ok(Arc::new(store))
}

async fn handle_start_command(workers: Option<usize>) -> anyhow::Result<()> {
    let cfg = config_ref()?;
    let store = init_xline_store(cfg).await?;
    let workers = workers.unwrap_or(cfg.garbage_collector.workers);

    let gc = GarbageCollector::new(store.as_ref(), cfg.garbage_collector.clone()).await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(target: "rkgc::main", "received ctrl-c, shutting down"),
            Err(e) => error!(target: "rkgc::main", "failed to listen for ctrl-c: {e}"),
        }
        let _ = stop_tx.send(true);
    });

    info!(
        target: "rkgc::main",
        "starting garbage collector with {workers} workers against {:?}",
        cfg.xline_config.endpoints
    );
    gc.run(workers, stop_rx).await
}

async fn handle_resources_command() -> anyhow::Result<()> {
    let cfg = config_ref()?;
    let store = init_xline_store(cfg).await?;
    for resource in store.discover().await? {
        let status = skip_reason(&resource).unwrap_or_else(|| "monitored".to_string());
        println!("{}\t{}\t{status}", resource.gvr(), resource.kind);
    }
    Ok(())
}
