//! Error types for the invocation engine.

use orch_blueprints::StoreError;
use orch_core::{BlueprintId, DeploymentId, InvocationId};
use orch_state::{DeploymentStatus, StateError};
use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("blueprint {0} not found")]
    BlueprintNotFound(BlueprintId),

    #[error("version {tag} of blueprint {blueprint_id} not found")]
    VersionNotFound {
        blueprint_id: BlueprintId,
        tag: String,
    },

    #[error("deployment {0} not found")]
    DeploymentNotFound(DeploymentId),

    #[error("invocation {0} not found")]
    InvocationNotFound(InvocationId),

    /// Another invocation of the deployment is queued or running.
    #[error("deployment {deployment_id} is busy with invocation {invocation_id}")]
    DeploymentBusy {
        deployment_id: DeploymentId,
        invocation_id: InvocationId,
    },

    /// Deletion refused: the deployment may still hold resources.
    #[error("deployment {deployment_id} is {status}; undeploy it first or force")]
    DeploymentActive {
        deployment_id: DeploymentId,
        status: DeploymentStatus,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invocation queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::BlueprintNotFound(_)
                | EngineError::VersionNotFound { .. }
                | EngineError::DeploymentNotFound(_)
                | EngineError::InvocationNotFound(_)
        )
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::BlueprintNotFound(id) => EngineError::BlueprintNotFound(id),
            StoreError::VersionNotFound { blueprint_id, tag } => {
                EngineError::VersionNotFound { blueprint_id, tag }
            }
            other => EngineError::Store(other),
        }
    }
}
