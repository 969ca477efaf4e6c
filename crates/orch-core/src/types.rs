//! Identifier aliases shared across the orchestrator crates.

use uuid::Uuid;

/// One logical blueprint, backed 1:1 by a git repository.
pub type BlueprintId = Uuid;

/// A logical running instance derived from one blueprint revision.
pub type DeploymentId = Uuid;

/// One execution attempt of an operation against a deployment.
pub type InvocationId = Uuid;

/// Commit identity used for every revision the service writes.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for CommitIdentity {
    fn default() -> Self {
        Self {
            name: "orchd".to_string(),
            email: "orchd@localhost".to_string(),
        }
    }
}
