//! `apiary` — the coordination bus server.
//!
//! Loads the config (optional path as the first argument, otherwise
//! `~/.apiary/config.json`), initializes logging, spawns the gossip engine,
//! and serves the HTTP surface until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use apiary_core::config::ApiaryConfig;
use apiary_core::logging;
use apiary_hive::{HiveRegistry, HiveSettings, StoreBacking};
use apiary_net::{ApiState, GossipEngine, GossipSettings, router};

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = match std::env::args().nth(1) {
        Some(path) => ApiaryConfig::load_from_path(&PathBuf::from(path))?,
        None => ApiaryConfig::load()?,
    };
    config.validate().context("Invalid configuration")?;

    let logs_dir = config.logs_dir()?;
    let _log_guard = logging::init_logging(&logs_dir)?;

    let backing = match &config.db_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
            info!("message log: sqlite at {}", path.display());
            StoreBacking::Sqlite(path.clone())
        }
        None => {
            warn!("message log: in-memory (set db_path for durability)");
            StoreBacking::Memory
        }
    };

    let registry = Arc::new(HiveRegistry::new(
        HiveSettings::from_config(&config),
        backing,
    ));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let engine = GossipEngine::new(registry.clone(), GossipSettings::from_config(&config))?;
    info!(
        peers = config.gossip_peers.len(),
        interval_secs = config.gossip_interval_secs,
        "gossip engine starting"
    );
    let gossip_task = engine.spawn(shutdown_tx.subscribe());

    let state = ApiState::new(registry, config.gossip_secret.clone());
    let addr = config.listen_socket()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("could not install Ctrl-C handler: {err}");
            }
        })
        .await
        .context("HTTP server failed")?;

    info!("shutting down");
    let _ = shutdown_tx.send(());
    gossip_task.await.ok();
    Ok(())
}
