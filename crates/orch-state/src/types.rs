//! Persisted records: invocations and deployments.
//!
//! Both are JSON-serialized into redb value columns. The JSON shape of
//! [`Invocation`] is the external record format consumed by status pollers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use orch_core::{BlueprintId, DeploymentId, InvocationId, Tag};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StateError, StateResult};

// ── Invocation state machine ───────────────────────────────────────

/// Lifecycle of one invocation: `PENDING → IN_PROGRESS → SUCCESS | FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationState {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, InvocationState::Success | InvocationState::Failed)
    }

    /// Queued or running.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// The only valid edges are `PENDING → IN_PROGRESS` and
    /// `IN_PROGRESS → SUCCESS | FAILED`.
    pub fn can_transition_to(self, next: InvocationState) -> bool {
        use InvocationState::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (InProgress, Success) | (InProgress, Failed)
        )
    }

    /// Status code an HTTP front-end reports for this state.
    pub fn http_status(self) -> u16 {
        match self {
            InvocationState::Pending | InvocationState::InProgress => 202,
            InvocationState::Success => 200,
            InvocationState::Failed => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InvocationState::Pending => "PENDING",
            InvocationState::InProgress => "IN_PROGRESS",
            InvocationState::Success => "SUCCESS",
            InvocationState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Operations ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    DeployFresh,
    DeployContinue,
    Update,
    Undeploy,
    Diff,
    Validate,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::DeployFresh,
        Operation::DeployContinue,
        Operation::Update,
        Operation::Undeploy,
        Operation::Diff,
        Operation::Validate,
    ];

    /// Operations that change what is deployed and push a revision back.
    pub fn mutates_deployment(self) -> bool {
        matches!(
            self,
            Operation::DeployFresh
                | Operation::DeployContinue
                | Operation::Update
                | Operation::Undeploy
        )
    }

    /// Only a fresh deploy may run without an existing deployment record.
    pub fn creates_deployment(self) -> bool {
        self == Operation::DeployFresh
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::DeployFresh => "DEPLOY_FRESH",
            Operation::DeployContinue => "DEPLOY_CONTINUE",
            Operation::Update => "UPDATE",
            Operation::Undeploy => "UNDEPLOY",
            Operation::Diff => "DIFF",
            Operation::Validate => "VALIDATE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = StateError;

    /// Accepts `DEPLOY_FRESH`, `deploy_fresh` and `deploy-fresh`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == normalized)
            .ok_or_else(|| StateError::UnknownOperation(s.to_string()))
    }
}

// ── Invocation ─────────────────────────────────────────────────────

/// Failure detail recorded on a `FAILED` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

impl ExceptionInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Node name → lifecycle state, as reported by the engine.
pub type InstanceState = BTreeMap<String, String>;

/// One execution attempt of an operation against a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub invocation_id: InvocationId,
    pub deployment_id: DeploymentId,
    pub blueprint_id: BlueprintId,
    /// Revision the operation runs against.
    pub version_id: Tag,
    pub operation: Operation,
    pub state: InvocationState,
    pub timestamp_submission: DateTime<Utc>,
    #[serde(default)]
    pub timestamp_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timestamp_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub inputs: Option<serde_json::Value>,
    /// Parallelism hint passed to the engine.
    #[serde(default = "default_workers")]
    pub workers: u32,
    /// Ask the engine to discard its on-disk state before running.
    #[serde(default)]
    pub clean_state: bool,
    #[serde(default)]
    pub instance_state: Option<InstanceState>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub exception: Option<ExceptionInfo>,
    /// Revision pushed back to the blueprint store after the run.
    #[serde(default)]
    pub revision: Option<Tag>,
}

fn default_workers() -> u32 {
    1
}

impl Invocation {
    /// A fresh `PENDING` record with a new id, submitted now.
    pub fn new(
        operation: Operation,
        blueprint_id: BlueprintId,
        version_id: Tag,
        deployment_id: DeploymentId,
    ) -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            deployment_id,
            blueprint_id,
            version_id,
            operation,
            state: InvocationState::Pending,
            timestamp_submission: Utc::now(),
            timestamp_start: None,
            timestamp_end: None,
            inputs: None,
            workers: default_workers(),
            clean_state: false,
            instance_state: None,
            stdout: None,
            stderr: None,
            exception: None,
            revision: None,
        }
    }

    pub fn with_inputs(mut self, inputs: Option<serde_json::Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_workers(mut self, workers: u32) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_clean_state(mut self, clean_state: bool) -> Self {
        self.clean_state = clean_state;
        self
    }

    fn transition(&mut self, next: InvocationState) -> StateResult<()> {
        if self.state.is_terminal() {
            return Err(StateError::TerminalState {
                invocation_id: self.invocation_id,
                state: self.state,
            });
        }
        if !self.state.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                invocation_id: self.invocation_id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// `PENDING → IN_PROGRESS`, stamping the start time.
    pub fn start(&mut self) -> StateResult<()> {
        self.transition(InvocationState::InProgress)?;
        self.timestamp_start = Some(Utc::now());
        Ok(())
    }

    /// `IN_PROGRESS → SUCCESS`, stamping the end time.
    pub fn succeed(&mut self) -> StateResult<()> {
        self.transition(InvocationState::Success)?;
        self.timestamp_end = Some(Utc::now());
        Ok(())
    }

    /// `IN_PROGRESS → FAILED` with failure detail, stamping the end time.
    pub fn fail(&mut self, exception: ExceptionInfo) -> StateResult<()> {
        self.transition(InvocationState::Failed)?;
        self.timestamp_end = Some(Utc::now());
        self.exception = Some(exception);
        Ok(())
    }
}

// ── Deployment ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Created by a submitted deploy that has not finished yet.
    Pending,
    Deployed,
    Undeployed,
    DeployFailed,
    UndeployFailed,
}

impl DeploymentStatus {
    /// Whether the target environment may still hold resources of this
    /// deployment. A failed deploy may have created some of them.
    pub fn may_hold_resources(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Deployed
                | DeploymentStatus::DeployFailed
                | DeploymentStatus::UndeployFailed
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Deployed => "deployed",
            DeploymentStatus::Undeployed => "undeployed",
            DeploymentStatus::DeployFailed => "deploy_failed",
            DeploymentStatus::UndeployFailed => "undeploy_failed",
        };
        f.write_str(s)
    }
}

/// A logical running instance derived from one blueprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub deployment_id: DeploymentId,
    pub blueprint_id: BlueprintId,
    /// Revision the next continue/update/undeploy starts from.
    pub version_id: Tag,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub last_invocation_id: Option<InvocationId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(deployment_id: DeploymentId, blueprint_id: BlueprintId, version_id: Tag) -> Self {
        let now = Utc::now();
        Self {
            deployment_id,
            blueprint_id,
            version_id,
            status: DeploymentStatus::Pending,
            last_invocation_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fold a finished invocation into the deployment.
    ///
    /// Read-only operations leave the status alone. A pushed revision
    /// becomes the deployment's current version.
    pub fn record_outcome(&mut self, invocation: &Invocation) {
        let success = invocation.state == InvocationState::Success;
        self.status = match invocation.operation {
            Operation::DeployFresh | Operation::DeployContinue | Operation::Update => {
                if success {
                    DeploymentStatus::Deployed
                } else {
                    DeploymentStatus::DeployFailed
                }
            }
            Operation::Undeploy => {
                if success {
                    DeploymentStatus::Undeployed
                } else {
                    DeploymentStatus::UndeployFailed
                }
            }
            Operation::Diff | Operation::Validate => self.status,
        };
        if let Some(revision) = invocation.revision {
            self.version_id = revision;
        }
        self.last_invocation_id = Some(invocation.invocation_id);
        self.updated_at = Utc::now();
    }
}
