//! Error types for the blueprint store.

use std::time::Duration;

use orch_connector::ConnectorError;
use orch_core::{BlueprintId, TagError};
use thiserror::Error;

/// Result type alias for blueprint store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("blueprint {0} not found")]
    BlueprintNotFound(BlueprintId),

    #[error("version {tag} of blueprint {blueprint_id} not found")]
    VersionNotFound {
        blueprint_id: BlueprintId,
        tag: String,
    },

    /// No save attempt succeeded before the deadline.
    #[error("saving blueprint {blueprint_id} timed out after {elapsed:?} ({attempts} attempts)")]
    SaveTimeout {
        blueprint_id: BlueprintId,
        elapsed: Duration,
        attempts: u32,
    },

    #[error(transparent)]
    InvalidTag(#[from] TagError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::BlueprintNotFound(_) | StoreError::VersionNotFound { .. }
        )
    }
}
