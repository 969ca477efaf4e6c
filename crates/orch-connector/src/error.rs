//! Errors raised by git-hosting connectors.

use thiserror::Error;

/// Result type alias for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Errors that can occur while talking to a git-hosting backend.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("repository already exists: {0}")]
    RepoExists(String),

    #[error("git authentication failed: {0}")]
    GitAuthentication(String),

    #[error("repository not found: {0}")]
    RepoNotFound(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected api response {status}: {message}")]
    Api { status: u16, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("collaborator file error: {0}")]
    Sidecar(String),
}

impl ConnectorError {
    /// True for the "does not exist" family, which callers translate into
    /// their own not-found signal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RepoNotFound(_) | Self::UserNotFound(_))
    }
}

/// Map a non-success hosted API status onto the connector taxonomy.
pub(crate) fn status_error(status: u16, subject: &str, message: String) -> ConnectorError {
    match status {
        401 => ConnectorError::GitAuthentication(message),
        403 => ConnectorError::PermissionDenied(subject.to_string()),
        404 => ConnectorError::RepoNotFound(subject.to_string()),
        _ => ConnectorError::Api { status, message },
    }
}
