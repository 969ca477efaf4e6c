//! End-to-end invocation behaviour with a scripted engine and local
//! bare repositories.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use orch_blueprints::{BlueprintStore, RetryPolicy};
use orch_connector::MockConnector;
use orch_connector::git::git_available;
use orch_core::config::{EngineConfig, StoreConfig};
use orch_core::{BlueprintId, CommitIdentity, Tag};
use orch_engine::{
    CapturedOutput, EngineError, EngineFailure, EngineJob, InvocationService, InvokeRequest,
    ToscaEngine, job_queue, launch,
};
use orch_state::{
    Deployment, DeploymentStatus, Invocation, InvocationState, Operation, StateStore,
};
use tempfile::TempDir;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

const STATE_FILE: &str = ".opera/instances/web.json";

/// Engine double: records each call and writes a node state file.
#[derive(Default)]
struct FakeEngine {
    /// (operation, whether engine state was already present)
    calls: Mutex<Vec<(Operation, bool)>>,
    fail_on: Option<Operation>,
    /// When set, each run waits for one permit.
    gate: Option<Arc<Semaphore>>,
}

#[async_trait]
impl ToscaEngine for FakeEngine {
    fn state_dir(&self) -> &str {
        ".opera"
    }

    async fn execute(&self, job: &EngineJob) -> Result<CapturedOutput, EngineFailure> {
        let had_state = job.workdir.join(STATE_FILE).exists();
        self.calls.lock().unwrap().push((job.operation, had_state));
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.fail_on == Some(job.operation) {
            return Err(EngineFailure {
                kind: "EngineError".to_string(),
                message: "node web failed to start".to_string(),
                output: CapturedOutput {
                    stdout: "creating web".to_string(),
                    stderr: "boom".to_string(),
                },
            });
        }
        let node_state = match job.operation {
            Operation::Undeploy => Some("deleted"),
            Operation::Diff | Operation::Validate => None,
            _ => Some("started"),
        };
        if let Some(node_state) = node_state {
            let path = job.workdir.join(STATE_FILE);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(
                &path,
                format!(r#"{{"tosca_name": {{"data": "web"}}, "state": {{"data": "{node_state}"}}}}"#),
            )
            .unwrap();
        }
        Ok(CapturedOutput {
            stdout: job.operation.to_string(),
            stderr: String::new(),
        })
    }
}

struct Harness {
    _root: TempDir,
    blueprints: Arc<BlueprintStore>,
    engine: Arc<FakeEngine>,
    service: InvocationService,
    workers: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

fn blueprint_store(root: &Path) -> Arc<BlueprintStore> {
    let config = StoreConfig {
        workdir: Some(root.join("work")),
        ..StoreConfig::default()
    };
    let connector = Arc::new(MockConnector::new(
        root.join("repos"),
        CommitIdentity::default(),
        "main",
    ));
    let store = BlueprintStore::new(connector, &config).with_retry(RetryPolicy {
        timeout: Duration::from_secs(60),
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(100),
    });
    Arc::new(store)
}

fn start(engine: FakeEngine, concurrency: usize) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let blueprints = blueprint_store(root.path());
    let state = StateStore::open(&root.path().join("orch.redb")).unwrap();
    let engine = Arc::new(engine);
    let config = EngineConfig {
        concurrency,
        ..EngineConfig::default()
    };
    let (shutdown, rx) = watch::channel(false);
    let (service, workers, report) = launch(
        state,
        Arc::clone(&blueprints),
        engine.clone(),
        &config,
        rx,
    )
    .unwrap();
    assert_eq!(report.requeued + report.interrupted, 0);
    Harness {
        _root: root,
        blueprints,
        engine,
        service,
        workers,
        shutdown,
    }
}

async fn push_blueprint(store: &BlueprintStore, id: BlueprintId, marker: &str) -> Tag {
    let src = tempfile::tempdir().unwrap();
    std::fs::write(
        src.path().join("service.yaml"),
        format!("tosca_definitions_version: tosca_simple_yaml_1_3\n# {marker}\n"),
    )
    .unwrap();
    store.save(id, src.path(), None, None).await.unwrap().tag
}

async fn wait_terminal(service: &InvocationService, invocation: &Invocation) -> Invocation {
    for _ in 0..600 {
        let current = service.status(invocation.invocation_id).unwrap();
        if current.state.is_terminal() {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("invocation {} did not finish", invocation.invocation_id);
}

async fn wait_state(service: &InvocationService, invocation: &Invocation, state: InvocationState) {
    for _ in 0..600 {
        if service.status(invocation.invocation_id).unwrap().state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("invocation {} never reached {state}", invocation.invocation_id);
}

macro_rules! require_git {
    () => {
        if !git_available().await {
            eprintln!("git not found, skipping");
            return;
        }
    };
}

#[tokio::test]
async fn submit_returns_pending_then_succeeds() {
    require_git!();
    let h = start(FakeEngine::default(), 1);
    let blueprint_id = Uuid::new_v4();
    push_blueprint(&h.blueprints, blueprint_id, "v1").await;

    let submitted = h
        .service
        .invoke(
            InvokeRequest::new(Operation::DeployFresh)
                .blueprint(blueprint_id)
                .inputs(serde_json::json!({"flavor": "small"})),
        )
        .await
        .unwrap();
    assert_eq!(submitted.state, InvocationState::Pending);
    assert_eq!(submitted.version_id, Tag::FIRST);

    let done = wait_terminal(&h.service, &submitted).await;
    assert_eq!(done.state, InvocationState::Success);
    assert_eq!(done.stdout.as_deref(), Some("DEPLOY_FRESH"));
    assert_eq!(done.inputs, Some(serde_json::json!({"flavor": "small"})));
    assert_eq!(
        done.instance_state.as_ref().and_then(|s| s.get("web")).map(String::as_str),
        Some("started")
    );
    assert_eq!(done.revision, Some(Tag::new(1, 1)));
    assert!(done.timestamp_start.is_some() && done.timestamp_end.is_some());
    assert!(done.exception.is_none());

    let deployment = h.service.deployment(done.deployment_id).unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Deployed);
    assert_eq!(deployment.version_id, Tag::new(1, 1));
    assert_eq!(deployment.last_invocation_id, Some(done.invocation_id));

    // The pushed revision carries the engine state.
    let out = tempfile::tempdir().unwrap();
    h.blueprints
        .fetch(blueprint_id, Some(Tag::new(1, 1)), out.path())
        .await
        .unwrap();
    assert!(out.path().join(STATE_FILE).exists());
    assert!(!out.path().join(orch_engine::engine::INPUTS_FILE).exists());

    h.shutdown.send(true).unwrap();
    h.workers.await.unwrap();
}

#[tokio::test]
async fn engine_failure_is_recorded_as_data() {
    require_git!();
    let h = start(
        FakeEngine {
            fail_on: Some(Operation::DeployFresh),
            ..FakeEngine::default()
        },
        1,
    );
    let blueprint_id = Uuid::new_v4();
    push_blueprint(&h.blueprints, blueprint_id, "v1").await;

    let submitted = h
        .service
        .invoke(InvokeRequest::new(Operation::DeployFresh).blueprint(blueprint_id))
        .await
        .unwrap();
    let done = wait_terminal(&h.service, &submitted).await;

    assert_eq!(done.state, InvocationState::Failed);
    assert_eq!(done.state.http_status(), 500);
    let exception = done.exception.as_ref().unwrap();
    assert_eq!(exception.kind, "EngineError");
    assert!(exception.message.contains("web"));
    assert_eq!(done.stdout.as_deref(), Some("creating web"));
    assert_eq!(done.stderr.as_deref(), Some("boom"));

    let deployment_id = done.deployment_id;
    assert_eq!(
        h.service.deployment(deployment_id).unwrap().status,
        DeploymentStatus::DeployFailed
    );
    assert!(matches!(
        h.service.delete_deployment(deployment_id, false),
        Err(EngineError::DeploymentActive { .. })
    ));
    assert_eq!(h.service.delete_deployment(deployment_id, true).unwrap(), 1);
    assert!(matches!(
        h.service.status(done.invocation_id),
        Err(EngineError::InvocationNotFound(_))
    ));
}

#[tokio::test]
async fn single_worker_runs_in_submission_order() {
    require_git!();
    let h = start(FakeEngine::default(), 1);
    let blueprint_id = Uuid::new_v4();
    push_blueprint(&h.blueprints, blueprint_id, "v1").await;

    let mut submitted = Vec::new();
    for _ in 0..3 {
        submitted.push(
            h.service
                .invoke(InvokeRequest::new(Operation::DeployFresh).blueprint(blueprint_id))
                .await
                .unwrap(),
        );
    }
    let mut done = Vec::new();
    for inv in &submitted {
        done.push(wait_terminal(&h.service, inv).await);
    }

    for pair in done.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(a.timestamp_start < b.timestamp_start);
        assert!(a.timestamp_end <= b.timestamp_start, "runs must not overlap");
    }
    // Three deployments of v1.0 each pushed their own minor revision.
    let mut revisions: Vec<Tag> = done.iter().filter_map(|inv| inv.revision).collect();
    revisions.sort();
    assert_eq!(revisions, vec![Tag::new(1, 1), Tag::new(1, 2), Tag::new(1, 3)]);
}

#[tokio::test]
async fn invalid_requests_persist_nothing() {
    require_git!();
    let h = start(FakeEngine::default(), 1);
    let blueprint_id = Uuid::new_v4();

    let err = h
        .service
        .invoke(
            InvokeRequest::new(Operation::DeployFresh)
                .blueprint(blueprint_id)
                .version(Tag::FIRST),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BlueprintNotFound(id) if id == blueprint_id));

    push_blueprint(&h.blueprints, blueprint_id, "v1").await;
    let err = h
        .service
        .invoke(
            InvokeRequest::new(Operation::DeployFresh)
                .blueprint(blueprint_id)
                .version(Tag::new(9, 0)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::VersionNotFound { ref tag, .. } if tag == "v9.0"));

    let err = h
        .service
        .invoke(InvokeRequest::new(Operation::Undeploy).deployment(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DeploymentNotFound(_)));

    let err = h
        .service
        .invoke(InvokeRequest::new(Operation::DeployFresh))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    assert!(h.service.state().list_invocations().unwrap().is_empty());
    assert!(h.service.state().list_deployments().unwrap().is_empty());
    assert!(h.engine.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn busy_deployment_rejects_new_submissions() {
    require_git!();
    let gate = Arc::new(Semaphore::new(0));
    let h = start(
        FakeEngine {
            gate: Some(Arc::clone(&gate)),
            ..FakeEngine::default()
        },
        1,
    );
    let blueprint_id = Uuid::new_v4();
    push_blueprint(&h.blueprints, blueprint_id, "v1").await;

    let first = h
        .service
        .invoke(InvokeRequest::new(Operation::DeployFresh).blueprint(blueprint_id))
        .await
        .unwrap();
    wait_state(&h.service, &first, InvocationState::InProgress).await;

    let err = h
        .service
        .invoke(InvokeRequest::new(Operation::Diff).deployment(first.deployment_id))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::DeploymentBusy { invocation_id, .. } if invocation_id == first.invocation_id
    ));
    assert!(matches!(
        h.service.delete_deployment(first.deployment_id, false),
        Err(EngineError::DeploymentBusy { .. })
    ));

    gate.add_permits(1);
    assert_eq!(wait_terminal(&h.service, &first).await.state, InvocationState::Success);

    gate.add_permits(1);
    let diff = h
        .service
        .invoke(InvokeRequest::new(Operation::Diff).deployment(first.deployment_id))
        .await
        .unwrap();
    let diff = wait_terminal(&h.service, &diff).await;
    assert_eq!(diff.state, InvocationState::Success);
    assert_eq!(diff.revision, None);
    assert_eq!(
        h.service.deployment(first.deployment_id).unwrap().version_id,
        Tag::new(1, 1)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keyed_pool_runs_deployments_in_parallel() {
    require_git!();
    let gate = Arc::new(Semaphore::new(0));
    let h = start(
        FakeEngine {
            gate: Some(Arc::clone(&gate)),
            ..FakeEngine::default()
        },
        2,
    );
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    push_blueprint(&h.blueprints, a, "a").await;
    push_blueprint(&h.blueprints, b, "b").await;

    let first = h
        .service
        .invoke(InvokeRequest::new(Operation::DeployFresh).blueprint(a))
        .await
        .unwrap();
    let second = h
        .service
        .invoke(InvokeRequest::new(Operation::DeployFresh).blueprint(b))
        .await
        .unwrap();

    // Both are running at once while the engine is held.
    wait_state(&h.service, &first, InvocationState::InProgress).await;
    wait_state(&h.service, &second, InvocationState::InProgress).await;

    gate.add_permits(2);
    assert_eq!(wait_terminal(&h.service, &first).await.state, InvocationState::Success);
    assert_eq!(wait_terminal(&h.service, &second).await.state, InvocationState::Success);

    h.shutdown.send(true).unwrap();
    h.workers.await.unwrap();
}

#[tokio::test]
async fn update_carries_engine_state_forward() {
    require_git!();
    let h = start(FakeEngine::default(), 1);
    let blueprint_id = Uuid::new_v4();
    push_blueprint(&h.blueprints, blueprint_id, "v1").await;

    let deploy = h
        .service
        .invoke(InvokeRequest::new(Operation::DeployFresh).blueprint(blueprint_id))
        .await
        .unwrap();
    let deploy = wait_terminal(&h.service, &deploy).await;
    let deployment_id = deploy.deployment_id;

    let v2 = push_blueprint(&h.blueprints, blueprint_id, "v2").await;
    assert_eq!(v2, Tag::new(2, 0));

    let err = h
        .service
        .invoke(InvokeRequest::new(Operation::Update).deployment(deployment_id))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let update = h
        .service
        .invoke(
            InvokeRequest::new(Operation::Update)
                .deployment(deployment_id)
                .version(v2),
        )
        .await
        .unwrap();
    let update = wait_terminal(&h.service, &update).await;
    assert_eq!(update.state, InvocationState::Success);
    assert_eq!(update.revision, Some(Tag::new(2, 1)));

    let calls = h.engine.calls.lock().unwrap().clone();
    assert_eq!(calls, vec![(Operation::DeployFresh, false), (Operation::Update, true)]);

    let out = tempfile::tempdir().unwrap();
    h.blueprints
        .fetch(blueprint_id, Some(Tag::new(2, 1)), out.path())
        .await
        .unwrap();
    let manifest = std::fs::read_to_string(out.path().join("service.yaml")).unwrap();
    assert!(manifest.contains("# v2"));

    let history = h.service.history(deployment_id).unwrap();
    let ids: Vec<_> = history.iter().map(|inv| inv.invocation_id).collect();
    assert_eq!(ids, vec![deploy.invocation_id, update.invocation_id]);
}

#[tokio::test]
async fn undeploy_unlocks_deletion() {
    require_git!();
    let h = start(FakeEngine::default(), 1);
    let blueprint_id = Uuid::new_v4();
    push_blueprint(&h.blueprints, blueprint_id, "v1").await;

    let deploy = h
        .service
        .invoke(InvokeRequest::new(Operation::DeployFresh).blueprint(blueprint_id))
        .await
        .unwrap();
    let deployment_id = wait_terminal(&h.service, &deploy).await.deployment_id;

    assert!(matches!(
        h.service.delete_blueprint(blueprint_id, false).await,
        Err(EngineError::DeploymentActive { status: DeploymentStatus::Deployed, .. })
    ));

    let undeploy = h
        .service
        .invoke(InvokeRequest::new(Operation::Undeploy).deployment(deployment_id))
        .await
        .unwrap();
    let undeploy = wait_terminal(&h.service, &undeploy).await;
    assert_eq!(undeploy.state, InvocationState::Success);
    assert_eq!(undeploy.version_id, Tag::new(1, 1));
    assert_eq!(
        undeploy.instance_state.as_ref().and_then(|s| s.get("web")).map(String::as_str),
        Some("deleted")
    );
    assert_eq!(
        h.service.deployment(deployment_id).unwrap().status,
        DeploymentStatus::Undeployed
    );

    // v1.0, v1.1 (deploy) and v1.2 (undeploy).
    assert_eq!(h.service.delete_blueprint(blueprint_id, false).await.unwrap(), 3);
    assert_eq!(h.service.delete_deployment(deployment_id, false).unwrap(), 2);
    assert!(matches!(
        h.service.history(deployment_id),
        Err(EngineError::DeploymentNotFound(_))
    ));
}

#[tokio::test]
async fn recovery_requeues_pending_and_fails_interrupted() {
    let root = tempfile::tempdir().unwrap();
    let state = StateStore::open_in_memory().unwrap();
    let blueprint_id = Uuid::new_v4();

    let running_deployment = Uuid::new_v4();
    let mut running = Invocation::new(Operation::DeployFresh, blueprint_id, Tag::FIRST, running_deployment);
    state
        .submit(&running, &Deployment::new(running_deployment, blueprint_id, Tag::FIRST))
        .unwrap();
    running.start().unwrap();
    state.put_invocation(&running).unwrap();

    let mut queued = Vec::new();
    for _ in 0..2 {
        let deployment_id = Uuid::new_v4();
        let inv = Invocation::new(Operation::DeployFresh, blueprint_id, Tag::FIRST, deployment_id);
        state
            .submit(&inv, &Deployment::new(deployment_id, blueprint_id, Tag::FIRST))
            .unwrap();
        queued.push(inv);
    }

    let (queue, mut receiver) = job_queue();
    let service = InvocationService::new(state, blueprint_store(root.path()), queue);
    let report = service.recover().unwrap();
    assert_eq!(report.requeued, 2);
    assert_eq!(report.interrupted, 1);

    for inv in &queued {
        assert_eq!(receiver.recv().await.unwrap().invocation_id, inv.invocation_id);
    }

    let failed = service.status(running.invocation_id).unwrap();
    assert_eq!(failed.state, InvocationState::Failed);
    assert_eq!(failed.exception.unwrap().kind, "WorkerInterrupted");
    assert_eq!(
        service.deployment(running_deployment).unwrap().status,
        DeploymentStatus::DeployFailed
    );

    // Nothing left to do the second time round.
    let again = service.recover().unwrap();
    assert_eq!(again.interrupted, 0);
    assert_eq!(again.requeued, 2);
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let root = tempfile::tempdir().unwrap();
    let (queue, _receiver) = job_queue();
    let service = InvocationService::new(
        StateStore::open_in_memory().unwrap(),
        blueprint_store(root.path()),
        queue,
    );
    let err = service.status(Uuid::new_v4()).unwrap_err();
    assert!(err.is_not_found());
    assert!(matches!(
        service.delete_deployment(Uuid::new_v4(), true),
        Err(EngineError::DeploymentNotFound(_))
    ));
}

#[tokio::test]
async fn worker_fault_fails_the_invocation_and_frees_the_deployment() {
    require_git!();
    let root = tempfile::tempdir().unwrap();
    let healthy = blueprint_store(root.path());
    let blueprint_id = Uuid::new_v4();
    push_blueprint(&healthy, blueprint_id, "v1").await;

    // Same repositories, but run scratch space cannot be created.
    let blocked = root.path().join("blocked");
    std::fs::write(&blocked, "").unwrap();
    let config = StoreConfig {
        workdir: Some(blocked),
        ..StoreConfig::default()
    };
    let connector = Arc::new(MockConnector::new(
        root.path().join("repos"),
        CommitIdentity::default(),
        "main",
    ));
    let broken = Arc::new(BlueprintStore::new(connector, &config));

    let engine = Arc::new(FakeEngine::default());
    let (shutdown, rx) = watch::channel(false);
    let (service, workers, _) = launch(
        StateStore::open_in_memory().unwrap(),
        broken,
        engine.clone(),
        &EngineConfig::default(),
        rx,
    )
    .unwrap();

    let submitted = service
        .invoke(InvokeRequest::new(Operation::DeployFresh).blueprint(blueprint_id))
        .await
        .unwrap();
    let failed = wait_terminal(&service, &submitted).await;
    assert_eq!(failed.state, InvocationState::Failed);
    assert_eq!(failed.exception.as_ref().unwrap().kind, "WorkerError");
    assert!(engine.calls.lock().unwrap().is_empty());
    assert_eq!(
        service.deployment(submitted.deployment_id).unwrap().status,
        DeploymentStatus::DeployFailed
    );

    // The deployment is not left busy.
    let next = service
        .invoke(InvokeRequest::new(Operation::Diff).deployment(submitted.deployment_id))
        .await
        .unwrap();
    assert_eq!(wait_terminal(&service, &next).await.state, InvocationState::Failed);

    shutdown.send(true).unwrap();
    workers.await.unwrap();
}

#[tokio::test]
async fn forced_delete_during_a_run_stays_deleted() {
    require_git!();
    let gate = Arc::new(Semaphore::new(0));
    let h = start(
        FakeEngine {
            gate: Some(Arc::clone(&gate)),
            ..FakeEngine::default()
        },
        1,
    );
    let blueprint_id = Uuid::new_v4();
    push_blueprint(&h.blueprints, blueprint_id, "v1").await;

    let running = h
        .service
        .invoke(InvokeRequest::new(Operation::DeployFresh).blueprint(blueprint_id))
        .await
        .unwrap();
    wait_state(&h.service, &running, InvocationState::InProgress).await;
    assert_eq!(h.service.delete_deployment(running.deployment_id, true).unwrap(), 1);

    // The single worker is FIFO: once this one is done, so is the first.
    let marker = h
        .service
        .invoke(InvokeRequest::new(Operation::DeployFresh).blueprint(blueprint_id))
        .await
        .unwrap();
    gate.add_permits(2);
    assert_eq!(wait_terminal(&h.service, &marker).await.state, InvocationState::Success);

    assert!(matches!(
        h.service.status(running.invocation_id),
        Err(EngineError::InvocationNotFound(id)) if id == running.invocation_id
    ));
    assert!(matches!(
        h.service.history(running.deployment_id),
        Err(EngineError::DeploymentNotFound(_))
    ));

    h.shutdown.send(true).unwrap();
    h.workers.await.unwrap();
}
