mod bootstrap;
mod health;
mod inbound;

use std::time::Duration;

use anyhow::Result;
use pacer_core::config::{AppConfig, LoadOptions};
use tokio::sync::watch;

use crate::bootstrap::Application;
use crate::health::AppState;

fn init_logging(config: &AppConfig) {
    use pacer_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging needs the loaded config, so it comes up before bootstrap.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let Application { config, db_pool, buffer, batches, orchestrator, scheduler } =
        bootstrap::bootstrap_with_config(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http = health::spawn(
        &config.server.bind_address,
        config.server.port,
        AppState { db_pool: db_pool.clone(), buffer: buffer.clone() },
        shutdown_rx.clone(),
    )
    .await?;

    let scheduler_shutdown = shutdown_rx.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });
    let orchestrator_task = tokio::spawn(orchestrator.run(batches, shutdown_rx));

    tracing::info!(event_name = "system.server.started", "pacer-server started");
    wait_for_shutdown().await?;
    tracing::info!(event_name = "system.server.stopping", "pacer-server stopping");

    // Buffered fragments become batches before the orchestrator stops reading.
    match buffer.flush_all().await {
        Ok(flushed) => {
            tracing::info!(event_name = "system.server.buffer_flushed", flushed, "open batches flushed");
        }
        Err(error) => {
            tracing::warn!(
                event_name = "system.server.buffer_flush_failed",
                error = %error,
                "could not flush open batches"
            );
        }
    }
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(config.server.graceful_shutdown_secs);
    let drained = tokio::time::timeout(grace, async {
        let _ = http.await;
        let _ = scheduler_task.await;
        let _ = orchestrator_task.await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            grace_secs = grace.as_secs(),
            "workers still busy after the grace period"
        );
    }

    db_pool.close().await;
    tracing::info!(event_name = "system.server.stopped", "pacer-server stopped");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
