//! Error types for the invocation log.

use orch_core::InvocationId;
use thiserror::Error;

use crate::types::InvocationState;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Terminal records are write-once.
    #[error("invocation {invocation_id} is already {state}")]
    TerminalState {
        invocation_id: InvocationId,
        state: InvocationState,
    },

    #[error("invocation {invocation_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        invocation_id: InvocationId,
        from: InvocationState,
        to: InvocationState,
    },

    #[error("unknown operation {0:?}")]
    UnknownOperation(String),
}
