//! orch-connector — git-hosting backends for blueprint repositories.
//!
//! A [`Connector`] is the capability surface the blueprint store needs from
//! one git host: repository lifecycle, tags, clones, commit listing and
//! collaborator management. Three backends implement it:
//!
//! - **`mock`** — local bare repositories plus a collaborator sidecar file
//!   (offline/self-hosted mode and tests; no access control)
//! - **`gitlab`** — GitLab REST v4
//! - **`github`** — GitHub REST v3
//!
//! The backend is selected from configuration at startup by
//! [`build_connector`]; callers only ever see `Arc<dyn Connector>`.

pub mod error;
pub mod git;
pub mod github;
pub mod gitlab;
mod http;
pub mod mock;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use orch_core::config::{Backend, StoreConfig};
use tracing::info;

pub use error::{ConnectorError, ConnectorResult};
pub use git::WorkingCopy;
pub use github::GitHubConnector;
pub use gitlab::GitLabConnector;
pub use mock::MockConnector;

/// Capability interface for one git-hosting backend.
///
/// `name` is always the repository name, never a URL.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Short backend label for logs.
    fn backend(&self) -> &'static str;

    /// Create an empty repository. Returns false if it already exists.
    async fn init_repo(&self, name: &str) -> ConnectorResult<bool>;

    async fn repo_exists(&self, name: &str) -> ConnectorResult<bool>;

    async fn tag_exists(&self, name: &str, tag: &str) -> ConnectorResult<bool>;

    /// Clone into `dest`. `None` when the repository does not exist.
    async fn clone_repo(&self, name: &str, dest: &Path) -> ConnectorResult<Option<WorkingCopy>>;

    /// Tag `commit_sha`. Annotated when a message is given, lightweight otherwise.
    async fn add_tag(
        &self,
        name: &str,
        commit_sha: &str,
        tag: &str,
        message: Option<&str>,
    ) -> ConnectorResult<()>;

    /// Returns false if the tag did not exist.
    async fn delete_tag(&self, name: &str, tag: &str) -> ConnectorResult<bool>;

    /// Delete the repository and return how many tags it had.
    async fn delete_repo(&self, name: &str) -> ConnectorResult<usize>;

    async fn repo_url(&self, name: &str) -> ConnectorResult<String>;

    /// Commit SHAs on the default branch, newest first.
    async fn commits(&self, name: &str) -> ConnectorResult<Vec<String>>;

    /// All tag names in the repository, in no particular order.
    async fn list_tags(&self, name: &str) -> ConnectorResult<Vec<String>>;

    /// Message of `tag`, or of the most recent tag when `tag` is `None`.
    async fn tag_message(&self, name: &str, tag: Option<&str>) -> ConnectorResult<Option<String>>;

    /// Adding an existing collaborator succeeds without change.
    async fn add_collaborator(&self, name: &str, username: &str) -> ConnectorResult<()>;

    /// Returns false if `username` was not a collaborator.
    async fn delete_collaborator(&self, name: &str, username: &str) -> ConnectorResult<bool>;

    async fn collaborators(&self, name: &str) -> ConnectorResult<Vec<String>>;
}

/// Construct the connector named by `config.backend`.
///
/// Hosted backends verify their credential here and fail fast with
/// [`ConnectorError::GitAuthentication`].
pub async fn build_connector(config: &StoreConfig) -> ConnectorResult<Arc<dyn Connector>> {
    let connector: Arc<dyn Connector> = match config.backend {
        Backend::Mock => Arc::new(MockConnector::new(
            config.mock.root.clone(),
            config.identity(),
            config.branch.clone(),
        )),
        Backend::Gitlab => {
            let gitlab = config.gitlab.as_ref().ok_or_else(|| {
                ConnectorError::GitAuthentication("missing [store.gitlab] section".to_string())
            })?;
            Arc::new(GitLabConnector::connect(gitlab, &config.branch).await?)
        }
        Backend::Github => {
            let github = config.github.as_ref().ok_or_else(|| {
                ConnectorError::GitAuthentication("missing [store.github] section".to_string())
            })?;
            Arc::new(GitHubConnector::connect(github, &config.branch).await?)
        }
    };
    info!(backend = connector.backend(), "connector ready");
    Ok(connector)
}
