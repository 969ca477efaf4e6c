//! Invocation queue and workers.
//!
//! Submissions go onto an unbounded channel and never wait for execution.
//! With `concurrency == 1` a single worker drains the channel in FIFO order
//! across all deployments. With more, a dispatcher routes each invocation
//! to a per-deployment lane: lanes run in parallel (bounded by a semaphore)
//! while each lane stays FIFO, so one deployment never runs two invocations
//! at once.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use orch_blueprints::{BlueprintStore, copy_tree};
use orch_core::{DeploymentId, InvocationId};
use orch_core::config::EngineConfig;
use orch_state::{ExceptionInfo, Invocation, InvocationState, Operation, StateStore};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::{EngineJob, ToscaEngine, read_instance_state};
use crate::error::{EngineError, EngineResult};

/// Submission side of the invocation queue.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Invocation>,
}

/// Consumer side, handed to [`spawn_workers`].
pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<Invocation>,
}

pub fn job_queue() -> (JobQueue, JobReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (JobQueue { tx }, JobReceiver { rx })
}

impl JobQueue {
    pub fn enqueue(&self, invocation: Invocation) -> EngineResult<()> {
        self.tx.send(invocation).map_err(|_| EngineError::QueueClosed)
    }
}

impl JobReceiver {
    /// Next queued invocation; `None` once every queue handle is dropped.
    pub async fn recv(&mut self) -> Option<Invocation> {
        self.rx.recv().await
    }
}

/// Runs one invocation end to end and records the outcome.
pub struct Executor {
    state: StateStore,
    blueprints: Arc<BlueprintStore>,
    engine: Arc<dyn ToscaEngine>,
}

impl Executor {
    pub fn new(state: StateStore, blueprints: Arc<BlueprintStore>, engine: Arc<dyn ToscaEngine>) -> Self {
        Self {
            state,
            blueprints,
            engine,
        }
    }

    /// Execute and log; bookkeeping failures do not stop the worker.
    ///
    /// An invocation that could not run to completion is closed as
    /// `FAILED` so its deployment does not stay busy.
    pub async fn run(&self, invocation: Invocation) {
        let invocation_id = invocation.invocation_id;
        if let Err(e) = self.execute(invocation).await {
            error!(%invocation_id, error = %e, "invocation aborted");
            if let Err(e) = self.abandon(invocation_id, &e) {
                error!(%invocation_id, error = %e, "invocation could not be recorded");
            }
        }
    }

    fn abandon(&self, invocation_id: InvocationId, cause: &EngineError) -> EngineResult<()> {
        let Some(mut inv) = self.state.get_invocation(invocation_id)? else {
            return Ok(());
        };
        if inv.state.is_terminal() {
            return Ok(());
        }
        if inv.state == InvocationState::Pending {
            inv.start()?;
        }
        inv.fail(ExceptionInfo::new("WorkerError", cause.to_string()))?;
        self.state.finish_invocation(&inv)?;
        warn!(%invocation_id, deployment_id = %inv.deployment_id, "invocation marked failed");
        Ok(())
    }

    /// Execute one invocation and persist its final record.
    ///
    /// Engine failures are recorded as data (`FAILED` with an exception);
    /// only state-store and scratch-space faults are returned as errors.
    pub async fn execute(&self, invocation: Invocation) -> EngineResult<Invocation> {
        let scratch = self.blueprints.scratch_dir("run").await?;
        let result = self.execute_in(invocation, scratch.path()).await;
        drop(scratch);
        let invocation = result?;

        let deployment = self.state.finish_invocation(&invocation)?;
        info!(
            invocation_id = %invocation.invocation_id,
            deployment_id = %invocation.deployment_id,
            operation = %invocation.operation,
            state = %invocation.state,
            revision = ?invocation.revision,
            deployment_status = ?deployment.map(|d| d.status),
            "invocation finished"
        );
        Ok(invocation)
    }

    async fn execute_in(&self, mut inv: Invocation, scratch: &Path) -> EngineResult<Invocation> {
        let workdir = scratch.join("workdir");

        if let Err(e) = self.materialize(&inv, scratch, &workdir).await {
            warn!(invocation_id = %inv.invocation_id, error = %e, "blueprint fetch failed");
            inv.start()?;
            self.state.put_invocation(&inv)?;
            inv.fail(ExceptionInfo::new("BlueprintFetchError", e.to_string()))?;
            return Ok(inv);
        }

        inv.start()?;
        self.state.put_invocation(&inv)?;
        info!(
            invocation_id = %inv.invocation_id,
            operation = %inv.operation,
            version = %inv.version_id,
            "invocation started"
        );

        let job = EngineJob {
            workdir: workdir.clone(),
            operation: inv.operation,
            inputs: inv.inputs.clone(),
            workers: inv.workers,
            clean_state: inv.clean_state,
        };
        let mut failure = match self.engine.execute(&job).await {
            Ok(output) => {
                inv.stdout = Some(output.stdout);
                inv.stderr = Some(output.stderr);
                None
            }
            Err(failure) => {
                inv.stdout = Some(failure.output.stdout);
                inv.stderr = Some(failure.output.stderr);
                Some(ExceptionInfo::new(failure.kind, failure.message))
            }
        };

        let state_dir = workdir.join(self.engine.state_dir());
        inv.instance_state = match read_instance_state(&state_dir).await {
            Ok(state) => state,
            Err(e) => {
                warn!(invocation_id = %inv.invocation_id, error = %e, "instance state unreadable");
                None
            }
        };

        if inv.operation.mutates_deployment() {
            let message = format!("{} {}", inv.operation, inv.invocation_id);
            match self
                .blueprints
                .save(inv.blueprint_id, &workdir, Some(&message), Some(inv.version_id))
                .await
            {
                Ok(saved) => inv.revision = Some(saved.tag),
                Err(e) => {
                    warn!(invocation_id = %inv.invocation_id, error = %e, "revision push failed");
                    if failure.is_none() {
                        failure = Some(ExceptionInfo::new("RevisionSaveError", e.to_string()));
                    }
                }
            }
        }

        match failure {
            None => inv.succeed()?,
            Some(exception) => inv.fail(exception)?,
        }
        Ok(inv)
    }

    /// Fetch the revision to run against into `workdir`.
    ///
    /// An update runs the requested version with the engine state of the
    /// deployment's current revision laid over it.
    async fn materialize(&self, inv: &Invocation, scratch: &Path, workdir: &Path) -> EngineResult<()> {
        self.blueprints
            .fetch(inv.blueprint_id, Some(inv.version_id), workdir)
            .await?;
        if inv.operation != Operation::Update {
            return Ok(());
        }
        let Some(deployment) = self.state.get_deployment(inv.deployment_id)? else {
            return Ok(());
        };
        if deployment.version_id == inv.version_id {
            return Ok(());
        }
        let current = scratch.join("current");
        self.blueprints
            .fetch(inv.blueprint_id, Some(deployment.version_id), &current)
            .await?;
        let state_src = current.join(self.engine.state_dir());
        if tokio::fs::try_exists(&state_src).await? {
            let files = copy_tree(&state_src, &workdir.join(self.engine.state_dir())).await?;
            debug!(invocation_id = %inv.invocation_id, files, from = %deployment.version_id, "engine state carried over");
        }
        Ok(())
    }
}

/// Start the workers. The returned task ends after shutdown is signalled
/// and in-flight invocations have finished; queued ones stay `PENDING` in
/// the log and are picked up again at the next start.
pub fn spawn_workers(
    executor: Arc<Executor>,
    config: &EngineConfig,
    receiver: JobReceiver,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    if config.concurrency <= 1 {
        tokio::spawn(run_single(executor, receiver, shutdown))
    } else {
        let pool = KeyedPool {
            executor,
            permits: Arc::new(Semaphore::new(config.concurrency)),
            idle: Duration::from_secs(config.lane_idle_secs.max(1)),
            shutdown,
            lanes: HashMap::new(),
        };
        tokio::spawn(pool.run(receiver))
    }
}

async fn run_single(
    executor: Arc<Executor>,
    mut receiver: JobReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("invocation worker started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!("invocation worker shutting down");
                break;
            }
            next = receiver.recv() => match next {
                Some(invocation) => executor.run(invocation).await,
                None => break,
            },
        }
    }
}

struct Lane {
    tx: mpsc::UnboundedSender<Invocation>,
    handle: JoinHandle<()>,
}

struct KeyedPool {
    executor: Arc<Executor>,
    permits: Arc<Semaphore>,
    idle: Duration,
    shutdown: watch::Receiver<bool>,
    lanes: HashMap<DeploymentId, Lane>,
}

impl KeyedPool {
    async fn run(mut self, mut receiver: JobReceiver) {
        info!(
            concurrency = self.permits.available_permits(),
            "invocation dispatcher started"
        );
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = receiver.recv() => match next {
                    Some(invocation) => self.dispatch(invocation),
                    None => break,
                },
            }
        }

        info!(lanes = self.lanes.len(), "invocation dispatcher draining");
        for (_, lane) in self.lanes.drain() {
            drop(lane.tx);
            let _ = lane.handle.await;
        }
    }

    fn dispatch(&mut self, invocation: Invocation) {
        let key = invocation.deployment_id;
        let invocation = match self.lanes.get(&key) {
            Some(lane) => match lane.tx.send(invocation) {
                Ok(()) => return,
                // The lane idled out; hand over to a fresh one.
                Err(mpsc::error::SendError(invocation)) => invocation,
            },
            None => invocation,
        };
        let previous = self.lanes.remove(&key).map(|lane| lane.handle);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_lane(
            key,
            Arc::clone(&self.executor),
            Arc::clone(&self.permits),
            self.idle,
            rx,
            previous,
            self.shutdown.clone(),
        ));
        // A new channel's receiver is alive, so this cannot fail.
        let _ = tx.send(invocation);
        self.lanes.insert(key, Lane { tx, handle });
        self.lanes.retain(|_, lane| !lane.handle.is_finished());
    }
}

async fn run_lane(
    deployment_id: DeploymentId,
    executor: Arc<Executor>,
    permits: Arc<Semaphore>,
    idle: Duration,
    mut rx: mpsc::UnboundedReceiver<Invocation>,
    previous: Option<JoinHandle<()>>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Keep per-deployment exclusivity across lane hand-over.
    if let Some(previous) = previous {
        let _ = previous.await;
    }
    debug!(%deployment_id, "lane started");
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = tokio::time::timeout(idle, rx.recv()) => next,
        };
        match next {
            Ok(Some(invocation)) => {
                let Ok(_permit) = permits.acquire().await else {
                    break;
                };
                executor.run(invocation).await;
            }
            Ok(None) => break,
            Err(_) => {
                // Idle: refuse new work, then finish what already arrived.
                rx.close();
                while let Some(invocation) = rx.recv().await {
                    let Ok(_permit) = permits.acquire().await else {
                        break;
                    };
                    executor.run(invocation).await;
                }
                break;
            }
        }
    }
    debug!(%deployment_id, "lane stopped");
}
