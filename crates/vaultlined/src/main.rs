//! vaultlined: Vaultline backup server.

use std::sync::Arc;

use anyhow::{Context, Result};

use vaultline_core::config::VaultlineConfig;
use vaultline_services::{ClientRegistry, DiskFileStore, TracingSink, TransferTable};
use vaultlined::{Dispatcher, Server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = VaultlineConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = VaultlineConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        VaultlineConfig::default()
    });

    // Shared state
    let registry = ClientRegistry::new(config.registry.unique_usernames);
    let store = DiskFileStore::new(&config.storage.root).context("failed to open backup store")?;
    tracing::info!(root = %config.storage.root.display(), "backup store ready");

    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        TransferTable::new(),
        Arc::new(store),
        Arc::new(TracingSink),
        config.storage.max_file_size,
    ));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Idle session sweep ───────────────────────────────────────────────────
    if let Some(ttl) = config.registry.session_ttl() {
        let registry = registry.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl.min(std::time::Duration::from_secs(60)));
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = interval.tick() => {
                        let swept = registry.sweep_idle(ttl);
                        if !swept.is_empty() {
                            tracing::info!(count = swept.len(), remaining = registry.len(), "swept idle sessions");
                        }
                    }
                }
            }
        });
    }

    let server = Server::bind(&config.server, dispatcher, shutdown_tx.subscribe()).await?;
    tracing::info!(
        max_connections = config.server.max_connections,
        idle_timeout_secs = config.server.idle_timeout_secs,
        unique_usernames = config.registry.unique_usernames,
        "vaultlined starting"
    );

    server.run().await
}
