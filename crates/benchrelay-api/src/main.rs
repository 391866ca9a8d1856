#![warn(missing_docs)]

use anyhow::Result;
use benchrelay_api::cli::Cli;
use benchrelay_api::config::RelayConfig;
use benchrelay_api::http::RelayApi;
use benchrelay_model::{results_template, RESULTS_TEMPLATE_NAME};
use benchrelay_repl::{FollowerSpec, ReconciliationAuditor, ReplicationCoordinator};
use benchrelay_store::{DocumentStore, HttpDocumentStore};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match &cli.command {
        benchrelay_api::cli::Command::Serve { config } => {
            let config_path = config.clone();
            serve_with_replication(config_path).await
        }
        _ => cli.run().await,
    }
}

async fn serve_with_replication(config_path: PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        RelayConfig::from_file(&config_path)?
    } else {
        tracing::warn!(
            "Config file not found, using defaults: {}",
            config_path.display()
        );
        RelayConfig::default()
    };
    let config = Arc::new(config);

    let leader: Arc<dyn DocumentStore> =
        Arc::new(HttpDocumentStore::new(config.store_config(&config.leader_url))?);

    let mut follower_stores: Vec<(String, Arc<dyn DocumentStore>)> = Vec::new();
    for url in &config.follower_urls {
        let store: Arc<dyn DocumentStore> =
            Arc::new(HttpDocumentStore::new(config.store_config(url))?);
        follower_stores.push((RelayConfig::follower_id(url), store));
    }

    // Stores that are down at startup pick the template up from the next
    // daemon restart; document writes do not wait for it.
    let template = results_template(&config.template_overrides())?;
    install_template(&leader, "leader", &template).await;
    for (id, store) in &follower_stores {
        install_template(store, id, &template).await;
    }

    let followers = follower_stores
        .into_iter()
        .map(|(id, store)| FollowerSpec { id, store })
        .collect();

    let coordinator = Arc::new(ReplicationCoordinator::start(
        leader,
        followers,
        config.coordinator_config(),
        &config.queue_dir,
    )?);
    let auditor = Arc::new(ReconciliationAuditor::new(
        coordinator.clone(),
        config.auditor_config(),
    ));

    let (audit_shutdown_tx, audit_shutdown_rx) = watch::channel(false);
    let audit_handle = tokio::spawn(auditor.clone().run_loop(audit_shutdown_rx));

    let api = RelayApi::new(coordinator.clone(), auditor, config);
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.serve().await {
            tracing::error!("API serve error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping workers");

    let _ = audit_shutdown_tx.send(true);
    coordinator.shutdown().await;
    let _ = audit_handle.await;
    api_handle.abort();

    Ok(())
}

async fn install_template(
    store: &Arc<dyn DocumentStore>,
    target: &str,
    template: &serde_json::Value,
) {
    match store.put_template(RESULTS_TEMPLATE_NAME, template).await {
        Ok(()) => tracing::info!(store = %target, "results index template installed"),
        Err(e) => {
            tracing::warn!(store = %target, error = %e, "results index template install failed, continuing")
        }
    }
}
