//! `orchd run` — the worker daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use orch_core::OrchConfig;
use orch_engine::{CommandEngine, launch};
use tokio::sync::watch;
use tracing::info;

use super::{blueprint_store, open_state};

pub async fn run(config: &OrchConfig) -> Result<()> {
    info!("orchd starting");

    let state = open_state(config)?;
    let blueprints = blueprint_store(config).await?;
    let engine = Arc::new(CommandEngine::new(&config.engine));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (_service, workers, report) = launch(state, blueprints, engine, &config.engine, shutdown_rx)
        .context("recovering the invocation log")?;
    info!(
        requeued = report.requeued,
        interrupted = report.interrupted,
        concurrency = config.engine.concurrency,
        engine = %config.engine.program,
        "workers running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("installing the Ctrl-C handler")?;
    info!("shutdown signal received, finishing running invocations");
    let _ = shutdown_tx.send(true);
    workers.await?;

    info!("orchd stopped");
    Ok(())
}
