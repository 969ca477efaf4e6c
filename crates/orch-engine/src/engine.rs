//! Adapter to the external TOSCA orchestration engine.
//!
//! The engine is a black box that deploys, updates or undeploys the
//! blueprint in a working directory and keeps its own state in a reserved
//! subdirectory of it. [`CommandEngine`] runs it as a subprocess with
//! captured output, so concurrent invocations never share descriptors.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use orch_core::config::EngineConfig;
use orch_state::{InstanceState, Operation};
use tokio::process::Command;
use tracing::{debug, warn};

/// Transient inputs file written next to the blueprint for one run.
pub const INPUTS_FILE: &str = ".orch-inputs.json";

/// One engine run.
#[derive(Debug, Clone)]
pub struct EngineJob {
    pub workdir: PathBuf,
    pub operation: Operation,
    pub inputs: Option<serde_json::Value>,
    pub workers: u32,
    pub clean_state: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A failed run. The output captured up to the failure is kept.
#[derive(Debug, Clone)]
pub struct EngineFailure {
    pub kind: String,
    pub message: String,
    pub output: CapturedOutput,
}

impl EngineFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            output: CapturedOutput::default(),
        }
    }
}

#[async_trait]
pub trait ToscaEngine: Send + Sync {
    /// Subdirectory of the working directory the engine keeps state in.
    fn state_dir(&self) -> &str;

    async fn execute(&self, job: &EngineJob) -> Result<CapturedOutput, EngineFailure>;
}

/// Runs `{program} {extra_args} {subcommand} [flags]` in the working directory.
pub struct CommandEngine {
    program: String,
    extra_args: Vec<String>,
    state_dir: String,
}

impl CommandEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            program: config.program.clone(),
            extra_args: config.extra_args.clone(),
            state_dir: config.state_dir.clone(),
        }
    }

    /// Subcommand and flags for one job.
    fn arguments(&self, job: &EngineJob, inputs: Option<&Path>) -> Vec<String> {
        let mut args = self.extra_args.clone();
        let subcommand: &[&str] = match job.operation {
            Operation::DeployFresh => &["deploy"],
            Operation::DeployContinue => &["deploy", "--resume"],
            Operation::Update => &["update"],
            Operation::Undeploy => &["undeploy"],
            Operation::Diff => &["diff"],
            Operation::Validate => &["validate"],
        };
        args.extend(subcommand.iter().map(|s| s.to_string()));
        if job.operation.mutates_deployment() {
            args.push("--workers".to_string());
            args.push(job.workers.max(1).to_string());
        }
        if job.clean_state && job.operation == Operation::DeployFresh {
            args.push("--clean-state".to_string());
        }
        if let Some(path) = inputs {
            args.push("--inputs".to_string());
            args.push(path.to_string_lossy().into_owned());
        }
        args
    }

    async fn run(&self, job: &EngineJob, inputs: Option<&Path>) -> Result<CapturedOutput, EngineFailure> {
        let args = self.arguments(job, inputs);
        debug!(program = %self.program, ?args, workdir = %job.workdir.display(), "running engine");
        let output = Command::new(&self.program)
            .args(&args)
            .current_dir(&job.workdir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                EngineFailure::new("EngineUnavailable", format!("cannot run {}: {e}", self.program))
            })?;

        let captured = CapturedOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if output.status.success() {
            Ok(captured)
        } else {
            Err(EngineFailure {
                kind: "EngineError".to_string(),
                message: format!(
                    "{} {} exited with {}",
                    self.program,
                    job.operation.as_str().to_ascii_lowercase(),
                    output.status
                ),
                output: captured,
            })
        }
    }
}

#[async_trait]
impl ToscaEngine for CommandEngine {
    fn state_dir(&self) -> &str {
        &self.state_dir
    }

    async fn execute(&self, job: &EngineJob) -> Result<CapturedOutput, EngineFailure> {
        let inputs_path = job.workdir.join(INPUTS_FILE);
        let inputs = match &job.inputs {
            Some(value) => {
                let bytes = serde_json::to_vec_pretty(value)
                    .map_err(|e| EngineFailure::new("InvalidInputs", e.to_string()))?;
                tokio::fs::write(&inputs_path, bytes)
                    .await
                    .map_err(|e| EngineFailure::new("InvalidInputs", e.to_string()))?;
                Some(Path::new(INPUTS_FILE))
            }
            None => None,
        };

        let result = self.run(job, inputs).await;

        if inputs.is_some() {
            if let Err(e) = tokio::fs::remove_file(&inputs_path).await {
                warn!(path = %inputs_path.display(), error = %e, "failed to remove inputs file");
            }
        }
        result
    }
}

/// Read the engine's per-node state files under `<state_dir>/instances`.
///
/// Each file is JSON of the form
/// `{"tosca_name": {"data": "web"}, "state": {"data": "started"}}`.
/// Unreadable files are skipped. Returns `None` when there is no state.
pub async fn read_instance_state(state_dir: &Path) -> std::io::Result<Option<InstanceState>> {
    let instances = state_dir.join("instances");
    if !tokio::fs::try_exists(&instances).await? {
        return Ok(None);
    }
    let mut state = InstanceState::new();
    let mut entries = tokio::fs::read_dir(&instances).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = tokio::fs::read(&path).await?;
        let value: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable instance file");
                continue;
            }
        };
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = value["tosca_name"]["data"]
            .as_str()
            .map(str::to_string)
            .unwrap_or(stem);
        let node_state = value["state"]["data"].as_str().unwrap_or("unknown");
        state.insert(name, node_state.to_string());
    }
    Ok(Some(state))
}
