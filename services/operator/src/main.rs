//! tessera operator
//!
//! Watches declared clusters and drives their replica sets through scaling
//! and rolling upgrades one safe step at a time.

use std::sync::Arc;

use anyhow::Result;
use tessera_events::TracingEventSink;
use tessera_operator::{
    config,
    controller::ClusterController,
    driver::FileReplicaSetDriver,
    http_client::HttpHealthClient,
    worker::ReconcileWorker,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to TESSERA_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tessera operator");
    info!(
        placement_url = %config.placement_url,
        state_dir = %config.state_dir.display(),
        "Configuration loaded"
    );

    let client = match HttpHealthClient::new(config.placement_url.clone(), config.query_timeout) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "Failed to build placement client");
            return Err(e.into());
        }
    };

    let driver = Arc::new(FileReplicaSetDriver::new(config.state_dir.clone()));
    let controller = Arc::new(ClusterController::new(
        driver.clone(),
        client,
        Arc::new(TracingEventSink),
        config.query_timeout,
    ));
    let worker = ReconcileWorker::new(controller, driver, config.worker_config());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, worker_handle).await {
        warn!(error = %e, "Reconcile worker did not shut down in time");
    }

    info!("Operator shutdown complete");
    Ok(())
}
