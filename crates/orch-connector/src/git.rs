//! git subprocess plumbing and the working-copy handle.
//!
//! Every backend materializes clones the same way: by running the `git`
//! executable with captured output. Remote URLs may carry credentials, so
//! error messages only name the git subcommand, never its arguments.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use orch_core::CommitIdentity;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ConnectorError, ConnectorResult};

/// Name of the metadata directory inside a working copy.
pub const GIT_DIR: &str = ".git";

fn command<I, S>(cwd: Option<&Path>, args: I) -> (Command, String)
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    let mut label = "git".to_string();
    let mut iter = args.iter().map(|a| a.to_string_lossy());
    while let Some(arg) = iter.next() {
        // Global options that take a separate value.
        if arg == "-c" || arg == "-C" || arg == "--git-dir" {
            iter.next();
            continue;
        }
        if !arg.starts_with('-') {
            label = format!("git {arg}");
            break;
        }
    }

    let mut cmd = Command::new("git");
    cmd.args(&args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    (cmd, label)
}

/// Run git and return its trimmed stdout. Non-zero exit is an error.
pub async fn run_git<I, S>(cwd: Option<&Path>, args: I) -> ConnectorResult<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let (mut cmd, label) = command(cwd, args);
    let output = cmd.output().await.map_err(|e| ConnectorError::Git {
        command: label.clone(),
        stderr: e.to_string(),
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!(command = %label, code = ?output.status.code(), %stderr, "git command failed");
        return Err(ConnectorError::Git {
            command: label,
            stderr,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run git and report only whether it exited successfully.
pub async fn git_succeeds<I, S>(cwd: Option<&Path>, args: I) -> ConnectorResult<bool>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let (mut cmd, label) = command(cwd, args);
    let output = cmd.output().await.map_err(|e| ConnectorError::Git {
        command: label,
        stderr: e.to_string(),
    })?;
    Ok(output.status.success())
}

/// Clone `url` into `dest`, which must not exist or be empty.
pub(crate) async fn clone_into(url: &str, dest: &Path) -> ConnectorResult<WorkingCopy> {
    run_git(None, [OsStr::new("clone"), OsStr::new("-q"), OsStr::new(url), dest.as_os_str()])
        .await?;
    Ok(WorkingCopy::new(dest))
}

/// A full working copy of a blueprint repository on local disk.
#[derive(Debug, Clone)]
pub struct WorkingCopy {
    path: PathBuf,
}

impl WorkingCopy {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn git<I, S>(&self, args: I) -> ConnectorResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        run_git(Some(&self.path), args).await
    }

    /// Set the commit identity for this clone only.
    pub async fn configure_identity(&self, identity: &CommitIdentity) -> ConnectorResult<()> {
        self.git(["config", "user.name", identity.name.as_str()]).await?;
        self.git(["config", "user.email", identity.email.as_str()]).await?;
        Ok(())
    }

    /// Put HEAD on `branch`, tracking the remote branch when it exists.
    ///
    /// A clone of an empty repository has no remote branch yet; HEAD is then
    /// pointed at the unborn branch so the first commit lands on it.
    pub async fn checkout_branch(&self, branch: &str) -> ConnectorResult<()> {
        let remote = format!("refs/remotes/origin/{branch}");
        if git_succeeds(Some(&self.path), ["rev-parse", "-q", "--verify", remote.as_str()]).await? {
            let upstream = format!("origin/{branch}");
            self.git(["checkout", "-q", "-B", branch, upstream.as_str()]).await?;
        } else {
            let head = format!("refs/heads/{branch}");
            self.git(["symbolic-ref", "HEAD", head.as_str()]).await?;
        }
        Ok(())
    }

    /// Delete every file in the tree except VCS metadata.
    pub async fn clear_tree(&self) -> ConnectorResult<()> {
        let mut entries = tokio::fs::read_dir(&self.path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name() == GIT_DIR {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await?;
            } else {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }

    /// Stage additions, modifications and deletions.
    pub async fn stage_all(&self) -> ConnectorResult<()> {
        self.git(["add", "-A"]).await?;
        Ok(())
    }

    /// Commit the index and return the new commit SHA.
    ///
    /// Empty commits are allowed: re-saving identical content is still a
    /// new revision.
    pub async fn commit(&self, message: &str) -> ConnectorResult<String> {
        self.git(["commit", "-q", "--allow-empty", "-m", message]).await?;
        self.head_sha().await
    }

    pub async fn head_sha(&self) -> ConnectorResult<String> {
        self.git(["rev-parse", "HEAD"]).await
    }

    /// Tag names visible in this clone.
    pub async fn tags(&self) -> ConnectorResult<Vec<String>> {
        let out = self.git(["tag", "--list"]).await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// Create an annotated tag on HEAD.
    pub async fn tag(&self, tag: &str, message: &str) -> ConnectorResult<()> {
        self.git(["tag", "-a", tag, "-m", message]).await?;
        Ok(())
    }

    /// Push HEAD to `branch`. Rejected when another writer got there first.
    pub async fn push_branch(&self, branch: &str) -> ConnectorResult<()> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        self.git(["push", "-q", "origin", refspec.as_str()]).await?;
        Ok(())
    }

    pub async fn push_tag(&self, tag: &str) -> ConnectorResult<()> {
        let refspec = format!("refs/tags/{tag}");
        self.git(["push", "-q", "origin", refspec.as_str()]).await?;
        Ok(())
    }

    /// Detach HEAD at `tag`, replacing the tree with that revision.
    pub async fn checkout_tag(&self, tag: &str) -> ConnectorResult<()> {
        let target = format!("refs/tags/{tag}");
        self.git(["checkout", "-q", "--detach", target.as_str()]).await?;
        Ok(())
    }

    /// Remove VCS metadata, leaving a plain directory tree.
    pub async fn strip_metadata(&self) -> ConnectorResult<()> {
        let git_dir = self.path.join(GIT_DIR);
        if tokio::fs::try_exists(&git_dir).await? {
            tokio::fs::remove_dir_all(git_dir).await?;
        }
        Ok(())
    }
}

/// True if the `git` executable can be run.
pub async fn git_available() -> bool {
    git_succeeds(None, ["--version"]).await.unwrap_or(false)
}
