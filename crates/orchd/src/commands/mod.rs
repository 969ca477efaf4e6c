pub mod blueprint;
pub mod invoke;
pub mod run;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use orch_blueprints::BlueprintStore;
use orch_connector::build_connector;
use orch_core::OrchConfig;
use orch_engine::{InvocationService, JobReceiver, job_queue};
use orch_state::StateStore;
use tracing::debug;

/// Load `path` (defaults when `None`) and apply environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<OrchConfig> {
    let mut config = match path {
        Some(path) => OrchConfig::from_file(path)?,
        None => OrchConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

pub fn open_state(config: &OrchConfig) -> Result<StateStore> {
    std::fs::create_dir_all(&config.server.data_dir)
        .with_context(|| format!("creating {}", config.server.data_dir.display()))?;
    let path = config.state_db_path();
    let state = StateStore::open(&path).with_context(|| format!("opening {}", path.display()))?;
    debug!(path = %path.display(), "state store opened");
    Ok(state)
}

pub async fn blueprint_store(config: &OrchConfig) -> Result<Arc<BlueprintStore>> {
    let connector = build_connector(&config.store)
        .await
        .context("connecting to the blueprint backend")?;
    Ok(Arc::new(BlueprintStore::new(connector, &config.store)))
}

/// Service whose queue nobody consumes in this process: submissions stay
/// `PENDING` until `orchd run` recovers them. Keep the receiver alive
/// while submitting.
pub async fn offline_service(config: &OrchConfig) -> Result<(InvocationService, JobReceiver)> {
    let state = open_state(config)?;
    let blueprints = blueprint_store(config).await?;
    let (queue, receiver) = job_queue();
    Ok((InvocationService::new(state, blueprints, queue), receiver))
}

/// Pretty JSON on stdout.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
