//! InvocationService — submit, query and delete.
//!
//! Callers never block on execution: `invoke` validates the request,
//! persists a `PENDING` record and enqueues it. Results are read back from
//! the invocation log with `status`/`history`.

use std::sync::Arc;

use orch_blueprints::BlueprintStore;
use orch_core::config::EngineConfig;
use orch_core::{BlueprintId, DeploymentId, InvocationId, Tag};
use orch_state::{
    Deployment, DeploymentStatus, ExceptionInfo, Invocation, InvocationState, Operation, StateStore,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::ToscaEngine;
use crate::error::{EngineError, EngineResult};
use crate::worker::{Executor, JobQueue, job_queue, spawn_workers};

/// Parameters of one `invoke` call.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub operation: Operation,
    /// Required for a fresh deploy; taken from the deployment otherwise.
    pub blueprint_id: Option<BlueprintId>,
    /// Latest tag for a fresh deploy when unset. Required for an update.
    pub version_id: Option<Tag>,
    /// Allocated for a fresh deploy when unset. Required otherwise.
    pub deployment_id: Option<DeploymentId>,
    pub inputs: Option<serde_json::Value>,
    pub workers: u32,
    pub clean_state: bool,
}

impl InvokeRequest {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            blueprint_id: None,
            version_id: None,
            deployment_id: None,
            inputs: None,
            workers: 1,
            clean_state: false,
        }
    }

    pub fn blueprint(mut self, blueprint_id: BlueprintId) -> Self {
        self.blueprint_id = Some(blueprint_id);
        self
    }

    pub fn version(mut self, version_id: Tag) -> Self {
        self.version_id = Some(version_id);
        self
    }

    pub fn deployment(mut self, deployment_id: DeploymentId) -> Self {
        self.deployment_id = Some(deployment_id);
        self
    }

    pub fn inputs(mut self, inputs: serde_json::Value) -> Self {
        self.inputs = Some(inputs);
        self
    }
}

/// What startup recovery did with the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `PENDING` invocations put back on the queue.
    pub requeued: usize,
    /// `IN_PROGRESS` invocations whose worker died, now `FAILED`.
    pub interrupted: usize,
}

#[derive(Clone)]
pub struct InvocationService {
    state: StateStore,
    blueprints: Arc<BlueprintStore>,
    queue: JobQueue,
}

impl InvocationService {
    pub fn new(state: StateStore, blueprints: Arc<BlueprintStore>, queue: JobQueue) -> Self {
        Self {
            state,
            blueprints,
            queue,
        }
    }

    pub fn blueprints(&self) -> &Arc<BlueprintStore> {
        &self.blueprints
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Validate and submit an invocation. Returns the `PENDING` record.
    ///
    /// Nothing is persisted or enqueued when validation fails.
    pub async fn invoke(&self, request: InvokeRequest) -> EngineResult<Invocation> {
        let (invocation, deployment) = if request.operation.creates_deployment() {
            self.prepare_fresh(&request).await?
        } else {
            self.prepare_existing(&request).await?
        };
        let invocation = invocation
            .with_inputs(request.inputs)
            .with_workers(request.workers)
            .with_clean_state(request.clean_state);

        if let Some(active) = self.state.active_invocation(invocation.deployment_id)? {
            return Err(EngineError::DeploymentBusy {
                deployment_id: invocation.deployment_id,
                invocation_id: active.invocation_id,
            });
        }

        match deployment {
            Some(deployment) => self.state.submit(&invocation, &deployment)?,
            None => self.state.put_invocation(&invocation)?,
        }
        self.queue.enqueue(invocation.clone())?;
        info!(
            invocation_id = %invocation.invocation_id,
            deployment_id = %invocation.deployment_id,
            operation = %invocation.operation,
            version = %invocation.version_id,
            "invocation submitted"
        );
        Ok(invocation)
    }

    async fn prepare_fresh(
        &self,
        request: &InvokeRequest,
    ) -> EngineResult<(Invocation, Option<Deployment>)> {
        let blueprint_id = request.blueprint_id.ok_or_else(|| {
            EngineError::InvalidRequest(format!("{} needs a blueprint id", request.operation))
        })?;
        let version_id = match request.version_id {
            Some(tag) => {
                if !self.blueprints.tag_exists(blueprint_id, tag).await? {
                    return Err(EngineError::VersionNotFound {
                        blueprint_id,
                        tag: tag.encode(),
                    });
                }
                tag
            }
            None => self
                .blueprints
                .last_tag(blueprint_id)
                .await?
                .ok_or_else(|| EngineError::VersionNotFound {
                    blueprint_id,
                    tag: "latest".to_string(),
                })?,
        };

        let deployment_id = request.deployment_id.unwrap_or_else(Uuid::new_v4);
        let deployment = match self.state.get_deployment(deployment_id)? {
            Some(existing) if existing.blueprint_id != blueprint_id => {
                return Err(EngineError::InvalidRequest(format!(
                    "deployment {deployment_id} belongs to blueprint {}",
                    existing.blueprint_id
                )));
            }
            Some(existing) => existing,
            None => Deployment::new(deployment_id, blueprint_id, version_id),
        };
        let invocation = Invocation::new(request.operation, blueprint_id, version_id, deployment_id);
        Ok((invocation, Some(deployment)))
    }

    async fn prepare_existing(
        &self,
        request: &InvokeRequest,
    ) -> EngineResult<(Invocation, Option<Deployment>)> {
        let deployment_id = request.deployment_id.ok_or_else(|| {
            EngineError::InvalidRequest(format!("{} needs a deployment id", request.operation))
        })?;
        let deployment = self
            .state
            .get_deployment(deployment_id)?
            .ok_or(EngineError::DeploymentNotFound(deployment_id))?;
        if let Some(blueprint_id) = request.blueprint_id {
            if blueprint_id != deployment.blueprint_id {
                return Err(EngineError::InvalidRequest(format!(
                    "deployment {deployment_id} belongs to blueprint {}",
                    deployment.blueprint_id
                )));
            }
        }

        let version_id = match (request.operation, request.version_id) {
            (Operation::Update, None) => {
                return Err(EngineError::InvalidRequest(
                    "update needs a target version".to_string(),
                ));
            }
            (_, Some(tag)) => {
                if !self.blueprints.tag_exists(deployment.blueprint_id, tag).await? {
                    return Err(EngineError::VersionNotFound {
                        blueprint_id: deployment.blueprint_id,
                        tag: tag.encode(),
                    });
                }
                tag
            }
            (_, None) => deployment.version_id,
        };
        let invocation = Invocation::new(
            request.operation,
            deployment.blueprint_id,
            version_id,
            deployment_id,
        );
        Ok((invocation, None))
    }

    pub fn status(&self, invocation_id: InvocationId) -> EngineResult<Invocation> {
        self.state
            .get_invocation(invocation_id)?
            .ok_or(EngineError::InvocationNotFound(invocation_id))
    }

    /// All invocations of a deployment, oldest first.
    pub fn history(&self, deployment_id: DeploymentId) -> EngineResult<Vec<Invocation>> {
        if self.state.get_deployment(deployment_id)?.is_none() {
            return Err(EngineError::DeploymentNotFound(deployment_id));
        }
        Ok(self.state.invocations_for_deployment(deployment_id)?)
    }

    pub fn deployment(&self, deployment_id: DeploymentId) -> EngineResult<Deployment> {
        self.state
            .get_deployment(deployment_id)?
            .ok_or(EngineError::DeploymentNotFound(deployment_id))
    }

    /// Remove a deployment and its invocation history.
    ///
    /// Refused while an invocation is queued or running, or while the
    /// deployment may still hold resources, unless `force` is set. A forced
    /// delete only edits records; a running invocation is not interrupted.
    pub fn delete_deployment(&self, deployment_id: DeploymentId, force: bool) -> EngineResult<usize> {
        let deployment = self.deployment(deployment_id)?;
        if !force {
            if let Some(active) = self.state.active_invocation(deployment_id)? {
                return Err(EngineError::DeploymentBusy {
                    deployment_id,
                    invocation_id: active.invocation_id,
                });
            }
            if deployment.status.may_hold_resources() {
                return Err(EngineError::DeploymentActive {
                    deployment_id,
                    status: deployment.status,
                });
            }
        }
        let removed = self
            .state
            .delete_deployment(deployment_id)?
            .ok_or(EngineError::DeploymentNotFound(deployment_id))?;
        info!(%deployment_id, removed, force, "deployment deleted");
        Ok(removed)
    }

    /// Delete a blueprint repository. Returns the number of tags it had.
    ///
    /// Refused while any deployment of the blueprint is not undeployed,
    /// unless `force` is set. Deployment records are left in place.
    pub async fn delete_blueprint(&self, blueprint_id: BlueprintId, force: bool) -> EngineResult<usize> {
        if !force {
            let live = self
                .state
                .deployments_for_blueprint(blueprint_id)?
                .into_iter()
                .find(|d| d.status != DeploymentStatus::Undeployed);
            if let Some(deployment) = live {
                return Err(EngineError::DeploymentActive {
                    deployment_id: deployment.deployment_id,
                    status: deployment.status,
                });
            }
        }
        let tags = self.blueprints.delete_repo(blueprint_id).await?;
        info!(%blueprint_id, tags, force, "blueprint deleted");
        Ok(tags)
    }

    /// Reconcile the log after a restart.
    ///
    /// Runs before any new submission is accepted. A record that cannot be
    /// decoded aborts recovery.
    pub fn recover(&self) -> EngineResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for mut invocation in self.state.invocations_in_state(InvocationState::InProgress)? {
            invocation.fail(ExceptionInfo::new(
                "WorkerInterrupted",
                "the worker stopped before the invocation finished",
            ))?;
            self.state.finish_invocation(&invocation)?;
            warn!(invocation_id = %invocation.invocation_id, "interrupted invocation marked failed");
            report.interrupted += 1;
        }
        for invocation in self.state.invocations_in_state(InvocationState::Pending)? {
            self.queue.enqueue(invocation)?;
            report.requeued += 1;
        }
        if report != RecoveryReport::default() {
            info!(
                requeued = report.requeued,
                interrupted = report.interrupted,
                "invocation log recovered"
            );
        }
        Ok(report)
    }
}

/// Build the service, recover the log and start the workers.
///
/// The worker task finishes once `shutdown` flips (or its sender is
/// dropped) and in-flight invocations are done.
pub fn launch(
    state: StateStore,
    blueprints: Arc<BlueprintStore>,
    engine: Arc<dyn ToscaEngine>,
    config: &EngineConfig,
    shutdown: watch::Receiver<bool>,
) -> EngineResult<(InvocationService, JoinHandle<()>, RecoveryReport)> {
    let (queue, receiver) = job_queue();
    let service = InvocationService::new(state.clone(), Arc::clone(&blueprints), queue);
    let report = service.recover()?;
    let executor = Arc::new(Executor::new(state, blueprints, engine));
    let workers = spawn_workers(executor, config, receiver, shutdown);
    Ok((service, workers, report))
}
