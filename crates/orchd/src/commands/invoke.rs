//! `orchd invoke`, `status`, `history` and `deployment`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use orch_core::{BlueprintId, DeploymentId, InvocationId, OrchConfig, Tag};
use orch_engine::{CommandEngine, InvocationService, InvokeRequest, launch};
use orch_state::{InvocationState, Operation};
use tokio::sync::watch;
use tracing::info;

use super::{blueprint_store, offline_service, open_state, print_json};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct InvokeArgs {
    pub operation: Operation,
    pub blueprint: Option<BlueprintId>,
    pub version: Option<Tag>,
    pub deployment: Option<DeploymentId>,
    pub inputs: Option<PathBuf>,
    pub workers: u32,
    pub clean_state: bool,
    pub wait: bool,
}

impl InvokeArgs {
    fn request(&self) -> Result<InvokeRequest> {
        let inputs = match &self.inputs {
            Some(path) => {
                let raw = std::fs::read(path)
                    .with_context(|| format!("reading inputs {}", path.display()))?;
                let value: serde_json::Value = serde_json::from_slice(&raw)
                    .with_context(|| format!("parsing inputs {}", path.display()))?;
                Some(value)
            }
            None => None,
        };
        Ok(InvokeRequest {
            operation: self.operation,
            blueprint_id: self.blueprint,
            version_id: self.version,
            deployment_id: self.deployment,
            inputs,
            workers: self.workers,
            clean_state: self.clean_state,
        })
    }
}

pub async fn invoke(config: &OrchConfig, args: InvokeArgs) -> Result<()> {
    let request = args.request()?;
    if !args.wait {
        let (service, _receiver) = offline_service(config).await?;
        let invocation = service.invoke(request).await?;
        info!(invocation_id = %invocation.invocation_id, "queued; `orchd run` will execute it");
        return print_json(&invocation);
    }

    let state = open_state(config)?;
    let blueprints = blueprint_store(config).await?;
    let engine = Arc::new(CommandEngine::new(&config.engine));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (service, workers, _report) = launch(state, blueprints, engine, &config.engine, shutdown_rx)?;

    let submitted = service.invoke(request).await?;
    info!(invocation_id = %submitted.invocation_id, "waiting for invocation");
    let finished = wait_for(&service, submitted.invocation_id).await?;

    let _ = shutdown_tx.send(true);
    workers.await?;

    print_json(&finished)?;
    if finished.state == InvocationState::Failed {
        bail!("invocation {} failed", finished.invocation_id);
    }
    Ok(())
}

async fn wait_for(
    service: &InvocationService,
    invocation_id: InvocationId,
) -> Result<orch_state::Invocation> {
    loop {
        let invocation = service.status(invocation_id)?;
        if invocation.state.is_terminal() {
            return Ok(invocation);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

pub fn status(config: &OrchConfig, invocation_id: InvocationId) -> Result<()> {
    let state = open_state(config)?;
    let invocation = state
        .get_invocation(invocation_id)?
        .with_context(|| format!("invocation {invocation_id} not found"))?;
    print_json(&invocation)
}

pub fn history(config: &OrchConfig, deployment_id: DeploymentId) -> Result<()> {
    let state = open_state(config)?;
    if state.get_deployment(deployment_id)?.is_none() {
        bail!("deployment {deployment_id} not found");
    }
    for invocation in state.invocations_for_deployment(deployment_id)? {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            invocation.invocation_id,
            invocation.timestamp_submission.to_rfc3339(),
            invocation.operation,
            invocation.version_id,
            invocation.state,
        );
    }
    Ok(())
}

pub fn show_deployment(config: &OrchConfig, deployment_id: DeploymentId) -> Result<()> {
    let state = open_state(config)?;
    let deployment = state
        .get_deployment(deployment_id)?
        .with_context(|| format!("deployment {deployment_id} not found"))?;
    print_json(&deployment)
}

pub async fn delete_deployment(config: &OrchConfig, deployment_id: DeploymentId, force: bool) -> Result<()> {
    let (service, _receiver) = offline_service(config).await?;
    let removed = service.delete_deployment(deployment_id, force)?;
    println!("deleted deployment {deployment_id} ({removed} invocations)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(inputs: Option<PathBuf>) -> InvokeArgs {
        InvokeArgs {
            operation: Operation::Validate,
            blueprint: None,
            version: None,
            deployment: None,
            inputs,
            workers: 2,
            clean_state: false,
            wait: false,
        }
    }

    #[test]
    fn inputs_file_becomes_request_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inputs.json");
        std::fs::write(&path, r#"{"replicas": 3}"#).unwrap();

        let request = args(Some(path)).request().unwrap();
        assert_eq!(request.inputs, Some(serde_json::json!({"replicas": 3})));
        assert_eq!(request.workers, 2);
        assert!(args(None).request().unwrap().inputs.is_none());
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inputs.json");
        std::fs::write(&path, "replicas: 3").unwrap();
        let err = args(Some(path)).request().unwrap_err();
        assert!(err.to_string().contains("parsing inputs"));
    }
}
