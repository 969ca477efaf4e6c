//! Local connector backed by bare repositories on disk.
//!
//! Layout under `root`:
//!
//! ```text
//! <root>/<name>.git/                    bare repository
//! <root>/<name>.git/collaborators.json  sidecar: JSON array of usernames
//! ```
//!
//! There is no access control; collaborators are bookkeeping only.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use orch_core::{CommitIdentity, Tag};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::Connector;
use crate::error::{ConnectorError, ConnectorResult};
use crate::git::{self, WorkingCopy, git_succeeds, run_git};

const COLLABORATORS_FILE: &str = "collaborators.json";

pub struct MockConnector {
    root: PathBuf,
    identity: CommitIdentity,
    branch: String,
    /// Serializes sidecar read-modify-write cycles.
    sidecar_lock: Mutex<()>,
}

impl MockConnector {
    pub fn new(root: impl Into<PathBuf>, identity: CommitIdentity, branch: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            identity,
            branch: branch.into(),
            sidecar_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.git"))
    }

    async fn require_repo(&self, name: &str) -> ConnectorResult<PathBuf> {
        let path = self.repo_path(name);
        if tokio::fs::try_exists(path.join("HEAD")).await? {
            Ok(path)
        } else {
            Err(ConnectorError::RepoNotFound(name.to_string()))
        }
    }

    async fn bare_git(&self, repo: &Path, args: &[&str]) -> ConnectorResult<String> {
        let user_name = format!("user.name={}", self.identity.name);
        let user_email = format!("user.email={}", self.identity.email);
        let repo = repo.to_string_lossy().into_owned();
        let mut full: Vec<&str> = vec![
            "-c",
            user_name.as_str(),
            "-c",
            user_email.as_str(),
            "--git-dir",
            repo.as_str(),
        ];
        full.extend_from_slice(args);
        run_git(None, full).await
    }

    async fn read_collaborators(&self, repo: &Path) -> ConnectorResult<Vec<String>> {
        let path = repo.join(COLLABORATORS_FILE);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read(&path).await?;
        serde_json::from_slice(&raw).map_err(|e| ConnectorError::Sidecar(e.to_string()))
    }

    /// Write-to-temp-then-rename so readers never see a torn file.
    async fn write_collaborators(&self, repo: &Path, users: &[String]) -> ConnectorResult<()> {
        let body =
            serde_json::to_vec_pretty(users).map_err(|e| ConnectorError::Sidecar(e.to_string()))?;
        let tmp = repo.join(format!("{COLLABORATORS_FILE}.tmp"));
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, repo.join(COLLABORATORS_FILE)).await?;
        Ok(())
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn backend(&self) -> &'static str {
        "mock"
    }

    /// The repository is built in a scratch directory beside its final
    /// path and renamed into place, so concurrent inits of one name leave
    /// exactly one winner and readers never see a half-made repository.
    async fn init_repo(&self, name: &str) -> ConnectorResult<bool> {
        let path = self.repo_path(name);
        if tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }
        tokio::fs::create_dir_all(&self.root).await?;
        let staging = tempfile::Builder::new()
            .prefix(&format!(".init-{name}-"))
            .tempdir_in(&self.root)?;
        let building = staging.path().join("repo.git");
        run_git(
            None,
            [OsStr::new("init"), OsStr::new("-q"), OsStr::new("--bare"), building.as_os_str()],
        )
        .await?;
        let head = format!("refs/heads/{}", self.branch);
        self.bare_git(&building, &["symbolic-ref", "HEAD", head.as_str()]).await?;
        self.write_collaborators(&building, &[]).await?;

        if let Err(e) = tokio::fs::rename(&building, &path).await {
            if tokio::fs::try_exists(&path).await? {
                debug!(repo = %name, "repository created concurrently");
                return Ok(false);
            }
            return Err(e.into());
        }
        info!(repo = %name, "bare repository created");
        Ok(true)
    }

    async fn repo_exists(&self, name: &str) -> ConnectorResult<bool> {
        Ok(tokio::fs::try_exists(self.repo_path(name).join("HEAD")).await?)
    }

    async fn tag_exists(&self, name: &str, tag: &str) -> ConnectorResult<bool> {
        let repo = self.require_repo(name).await?;
        let refname = format!("refs/tags/{tag}");
        let repo = repo.to_string_lossy().into_owned();
        git_succeeds(
            None,
            ["--git-dir", repo.as_str(), "rev-parse", "-q", "--verify", refname.as_str()],
        )
        .await
    }

    async fn clone_repo(&self, name: &str, dest: &Path) -> ConnectorResult<Option<WorkingCopy>> {
        if !self.repo_exists(name).await? {
            return Ok(None);
        }
        let url = self.repo_path(name).to_string_lossy().into_owned();
        let wc = git::clone_into(&url, dest).await?;
        debug!(repo = %name, dest = %dest.display(), "cloned");
        Ok(Some(wc))
    }

    async fn add_tag(
        &self,
        name: &str,
        commit_sha: &str,
        tag: &str,
        message: Option<&str>,
    ) -> ConnectorResult<()> {
        let repo = self.require_repo(name).await?;
        match message {
            Some(msg) => self.bare_git(&repo, &["tag", "-a", tag, "-m", msg, commit_sha]).await?,
            None => self.bare_git(&repo, &["tag", tag, commit_sha]).await?,
        };
        Ok(())
    }

    async fn delete_tag(&self, name: &str, tag: &str) -> ConnectorResult<bool> {
        if !self.tag_exists(name, tag).await? {
            return Ok(false);
        }
        let repo = self.repo_path(name);
        self.bare_git(&repo, &["tag", "-d", tag]).await?;
        Ok(true)
    }

    async fn delete_repo(&self, name: &str) -> ConnectorResult<usize> {
        let repo = self.require_repo(name).await?;
        let count = self.list_tags(name).await?.len();
        tokio::fs::remove_dir_all(&repo).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => ConnectorError::PermissionDenied(name.to_string()),
            _ => ConnectorError::Io(e),
        })?;
        info!(repo = %name, tags = count, "bare repository deleted");
        Ok(count)
    }

    async fn repo_url(&self, name: &str) -> ConnectorResult<String> {
        let repo = self.require_repo(name).await?;
        Ok(format!("file://{}", repo.display()))
    }

    async fn commits(&self, name: &str) -> ConnectorResult<Vec<String>> {
        let repo = self.require_repo(name).await?;
        let head = format!("refs/heads/{}", self.branch);
        let repo_str = repo.to_string_lossy().into_owned();
        let verify = ["--git-dir", repo_str.as_str(), "rev-parse", "-q", "--verify", head.as_str()];
        if !git_succeeds(None, verify).await? {
            return Ok(Vec::new());
        }
        let out = self.bare_git(&repo, &["log", "--format=%H", head.as_str()]).await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    async fn list_tags(&self, name: &str) -> ConnectorResult<Vec<String>> {
        let repo = self.require_repo(name).await?;
        let out = self.bare_git(&repo, &["tag", "--list"]).await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    async fn tag_message(&self, name: &str, tag: Option<&str>) -> ConnectorResult<Option<String>> {
        let repo = self.require_repo(name).await?;
        let tag = match tag {
            Some(t) => t.to_string(),
            None => {
                let listing = self
                    .bare_git(
                        &repo,
                        &[
                            "for-each-ref",
                            "--format=%(creatordate:unix) %(refname:short)",
                            "refs/tags",
                        ],
                    )
                    .await?;
                match latest_tag(&listing) {
                    Some(latest) => latest,
                    None => return Ok(None),
                }
            }
        };
        let refname = format!("refs/tags/{tag}");
        let kind = self
            .bare_git(&repo, &["for-each-ref", "--format=%(objecttype)", refname.as_str()])
            .await?;
        if kind != "tag" {
            // Missing or lightweight: no message of its own.
            return Ok(None);
        }
        let body = self
            .bare_git(&repo, &["for-each-ref", "--format=%(contents)", refname.as_str()])
            .await?;
        Ok(Some(body))
    }

    async fn add_collaborator(&self, name: &str, username: &str) -> ConnectorResult<()> {
        if username.trim().is_empty() {
            return Err(ConnectorError::UserNotFound(username.to_string()));
        }
        let repo = self.require_repo(name).await?;
        let _guard = self.sidecar_lock.lock().await;
        let mut users = self.read_collaborators(&repo).await?;
        if !users.iter().any(|u| u == username) {
            users.push(username.to_string());
            self.write_collaborators(&repo, &users).await?;
        }
        Ok(())
    }

    async fn delete_collaborator(&self, name: &str, username: &str) -> ConnectorResult<bool> {
        let repo = self.require_repo(name).await?;
        let _guard = self.sidecar_lock.lock().await;
        let mut users = self.read_collaborators(&repo).await?;
        let before = users.len();
        users.retain(|u| u != username);
        if users.len() == before {
            return Ok(false);
        }
        self.write_collaborators(&repo, &users).await?;
        Ok(true)
    }

    async fn collaborators(&self, name: &str) -> ConnectorResult<Vec<String>> {
        let repo = self.require_repo(name).await?;
        self.read_collaborators(&repo).await
    }
}

/// Newest tag from `<unix-time> <name>` lines.
///
/// Creator dates have one-second resolution, so ties are broken by the
/// version ordinal; names that are not version tags lose ties.
fn latest_tag(listing: &str) -> Option<String> {
    listing
        .lines()
        .filter_map(|line| {
            let (time, name) = line.trim().split_once(' ')?;
            let time: i64 = time.parse().ok()?;
            Some((time, Tag::decode(name).ok(), name))
        })
        .max_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)))
        .map(|(_, _, name)| name.to_string())
}
