//! BlueprintStore — save, fetch and manage blueprint revisions.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use orch_connector::{Connector, ConnectorError, WorkingCopy};
use orch_core::config::StoreConfig;
use orch_core::tag::{next_major, next_minor, parse_tags};
use orch_core::{BlueprintId, CommitIdentity, Tag};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::retry::RetryPolicy;
use crate::tree::copy_tree;

/// Outcome of a successful save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedRevision {
    pub blueprint_id: BlueprintId,
    pub tag: Tag,
    pub commit_sha: String,
}

/// One revision and its tag message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub tag: Tag,
    pub message: Option<String>,
}

pub struct BlueprintStore {
    connector: Arc<dyn Connector>,
    prefix: String,
    branch: String,
    identity: CommitIdentity,
    workdir: PathBuf,
    retry: RetryPolicy,
}

impl BlueprintStore {
    pub fn new(connector: Arc<dyn Connector>, config: &StoreConfig) -> Self {
        Self {
            connector,
            prefix: config.repo_prefix.clone(),
            branch: config.branch.clone(),
            identity: config.identity(),
            workdir: config.workdir(),
            retry: RetryPolicy::from_config(config),
        }
    }

    /// Replace the retry policy (tests use short deadlines).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// Parent directory of every ephemeral clone this store makes.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn repo_name(&self, blueprint_id: BlueprintId) -> String {
        format!("{}{}", self.prefix, blueprint_id)
    }

    /// Inverse of [`repo_name`](Self::repo_name).
    pub fn blueprint_id_from_repo(&self, repo: &str) -> Option<BlueprintId> {
        repo.strip_prefix(&self.prefix)
            .and_then(|rest| Uuid::parse_str(rest).ok())
    }

    /// A fresh, uniquely named directory under the store's workdir.
    pub async fn scratch_dir(&self, purpose: &str) -> StoreResult<TempDir> {
        tokio::fs::create_dir_all(&self.workdir).await?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("orch-{purpose}-"))
            .tempdir_in(&self.workdir)?;
        Ok(dir)
    }

    /// Store `content` as a new revision of `blueprint_id`.
    ///
    /// The tag is `next_minor(reference)` when a reference is given and
    /// `next_major` otherwise, computed against the tags visible in the
    /// clone of each attempt. Fails with [`StoreError::SaveTimeout`] if no
    /// attempt wins before the deadline.
    pub async fn save(
        &self,
        blueprint_id: BlueprintId,
        content: &Path,
        message: Option<&str>,
        reference: Option<Tag>,
    ) -> StoreResult<SavedRevision> {
        if !tokio::fs::metadata(content).await?.is_dir() {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("{} is not a directory", content.display()),
            )));
        }
        let name = self.repo_name(blueprint_id);

        let mut backoff = self.retry.start();
        while backoff.begin_attempt() {
            match self.try_save(&name, content, message, reference).await {
                Ok((tag, commit_sha)) => {
                    info!(
                        %blueprint_id,
                        %tag,
                        commit = %commit_sha,
                        attempts = backoff.attempts(),
                        "revision saved"
                    );
                    return Ok(SavedRevision {
                        blueprint_id,
                        tag,
                        commit_sha,
                    });
                }
                // Retrying cannot produce a different successor tag.
                Err(e @ StoreError::InvalidTag(_)) => return Err(e),
                Err(e) => {
                    warn!(%blueprint_id, attempt = backoff.attempts(), error = %e, "save attempt failed");
                    match backoff.next_delay() {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => break,
                    }
                }
            }
        }

        Err(StoreError::SaveTimeout {
            blueprint_id,
            elapsed: backoff.elapsed(),
            attempts: backoff.attempts(),
        })
    }

    /// One save attempt in its own clone. The clone is removed on return.
    async fn try_save(
        &self,
        name: &str,
        content: &Path,
        message: Option<&str>,
        reference: Option<Tag>,
    ) -> StoreResult<(Tag, String)> {
        if self.connector.init_repo(name).await? {
            info!(repo = %name, "blueprint repository created");
        }
        let scratch = self.scratch_dir("save").await?;
        let wc = self.clone_into(name, scratch.path()).await?;
        wc.configure_identity(&self.identity).await?;
        wc.checkout_branch(&self.branch).await?;
        wc.clear_tree().await?;
        copy_tree(content, wc.path()).await?;
        wc.stage_all().await?;

        let tags = parse_tags(wc.tags().await?);
        let tag = match reference {
            Some(reference) => next_minor(&tags, reference)?,
            None => next_major(&tags)?,
        };
        let tag_name = tag.encode();
        let message = message.unwrap_or(&tag_name);

        let sha = wc.commit(message).await?;
        wc.push_branch(&self.branch).await?;
        wc.tag(&tag_name, message).await?;
        wc.push_tag(&tag_name).await?;
        debug!(repo = %name, tag = %tag_name, "tag pushed");
        Ok((tag, sha))
    }

    async fn clone_into(&self, name: &str, scratch: &Path) -> StoreResult<WorkingCopy> {
        let dest = scratch.join("repo");
        self.connector
            .clone_repo(name, &dest)
            .await?
            .ok_or_else(|| match self.blueprint_id_from_repo(name) {
                Some(id) => StoreError::BlueprintNotFound(id),
                None => StoreError::Connector(ConnectorError::RepoNotFound(name.to_string())),
            })
    }

    /// Materialize `tag` (latest when `None`) at `dest` without git
    /// metadata and return the tag that was fetched.
    pub async fn fetch(
        &self,
        blueprint_id: BlueprintId,
        tag: Option<Tag>,
        dest: &Path,
    ) -> StoreResult<Tag> {
        let name = self.repo_name(blueprint_id);
        let scratch = self.scratch_dir("fetch").await?;
        let wc = self.clone_into(&name, scratch.path()).await?;

        let tags = parse_tags(wc.tags().await?);
        let tag = match tag {
            Some(t) if tags.contains(&t) => t,
            Some(t) => {
                return Err(StoreError::VersionNotFound {
                    blueprint_id,
                    tag: t.encode(),
                });
            }
            None => *tags.last().ok_or_else(|| StoreError::VersionNotFound {
                blueprint_id,
                tag: "latest".to_string(),
            })?,
        };

        wc.checkout_tag(&tag.encode()).await?;
        wc.strip_metadata().await?;
        if wc.path() != dest {
            let files = copy_tree(wc.path(), dest).await?;
            debug!(%blueprint_id, %tag, files, dest = %dest.display(), "revision fetched");
        }
        Ok(tag)
    }

    pub async fn exists(&self, blueprint_id: BlueprintId) -> StoreResult<bool> {
        Ok(self.connector.repo_exists(&self.repo_name(blueprint_id)).await?)
    }

    pub async fn tag_exists(&self, blueprint_id: BlueprintId, tag: Tag) -> StoreResult<bool> {
        let name = self.repo_name(blueprint_id);
        self.connector
            .tag_exists(&name, &tag.encode())
            .await
            .map_err(not_found(blueprint_id))
    }

    /// All version tags, ascending by ordinal.
    pub async fn list_tags(&self, blueprint_id: BlueprintId) -> StoreResult<Vec<Tag>> {
        let name = self.repo_name(blueprint_id);
        let names = self
            .connector
            .list_tags(&name)
            .await
            .map_err(not_found(blueprint_id))?;
        Ok(parse_tags(names))
    }

    pub async fn last_tag(&self, blueprint_id: BlueprintId) -> StoreResult<Option<Tag>> {
        Ok(self.list_tags(blueprint_id).await?.last().copied())
    }

    /// Every revision with its tag message, ascending.
    pub async fn versions(&self, blueprint_id: BlueprintId) -> StoreResult<Vec<Version>> {
        let name = self.repo_name(blueprint_id);
        let mut versions = Vec::new();
        for tag in self.list_tags(blueprint_id).await? {
            let message = self
                .connector
                .tag_message(&name, Some(&tag.encode()))
                .await
                .map_err(not_found(blueprint_id))?;
            versions.push(Version { tag, message });
        }
        Ok(versions)
    }

    pub async fn commits(&self, blueprint_id: BlueprintId) -> StoreResult<Vec<String>> {
        let name = self.repo_name(blueprint_id);
        self.connector
            .commits(&name)
            .await
            .map_err(not_found(blueprint_id))
    }

    pub async fn delete_tag(&self, blueprint_id: BlueprintId, tag: Tag) -> StoreResult<bool> {
        let name = self.repo_name(blueprint_id);
        let deleted = self
            .connector
            .delete_tag(&name, &tag.encode())
            .await
            .map_err(not_found(blueprint_id))?;
        if deleted {
            info!(%blueprint_id, %tag, "revision deleted");
        }
        Ok(deleted)
    }

    /// Delete the blueprint repository. Returns how many revisions it had.
    pub async fn delete_repo(&self, blueprint_id: BlueprintId) -> StoreResult<usize> {
        let name = self.repo_name(blueprint_id);
        let count = self
            .connector
            .delete_repo(&name)
            .await
            .map_err(not_found(blueprint_id))?;
        info!(%blueprint_id, tags = count, "blueprint deleted");
        Ok(count)
    }

    pub async fn repo_url(&self, blueprint_id: BlueprintId) -> StoreResult<String> {
        let name = self.repo_name(blueprint_id);
        self.connector
            .repo_url(&name)
            .await
            .map_err(not_found(blueprint_id))
    }

    pub async fn add_user(&self, blueprint_id: BlueprintId, username: &str) -> StoreResult<()> {
        let name = self.repo_name(blueprint_id);
        self.connector
            .add_collaborator(&name, username)
            .await
            .map_err(not_found(blueprint_id))
    }

    pub async fn remove_user(&self, blueprint_id: BlueprintId, username: &str) -> StoreResult<bool> {
        let name = self.repo_name(blueprint_id);
        self.connector
            .delete_collaborator(&name, username)
            .await
            .map_err(not_found(blueprint_id))
    }

    pub async fn list_users(&self, blueprint_id: BlueprintId) -> StoreResult<Vec<String>> {
        let name = self.repo_name(blueprint_id);
        self.connector
            .collaborators(&name)
            .await
            .map_err(not_found(blueprint_id))
    }
}

/// Translate the connector's repository not-found into the store's own.
fn not_found(blueprint_id: BlueprintId) -> impl Fn(ConnectorError) -> StoreError {
    move |e| match e {
        ConnectorError::RepoNotFound(_) => StoreError::BlueprintNotFound(blueprint_id),
        other => StoreError::Connector(other),
    }
}
