//! orchd.toml configuration parser.
//!
//! Every field has a default, so an empty file is a valid configuration
//! for a single-node daemon using local bare repositories.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::types::CommitIdentity;

/// Environment variable that overrides the hosted backend token.
pub const TOKEN_ENV: &str = "ORCHD_GIT_TOKEN";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory holding the invocation log database.
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/orchd"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Mock,
    Gitlab,
    Github,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    /// Repository name prefix; the blueprint UUID follows it.
    pub repo_prefix: String,
    /// Branch every revision is committed to.
    pub branch: String,
    /// Parent directory for ephemeral clones. System temp dir when unset.
    pub workdir: Option<PathBuf>,
    pub save_timeout_secs: u64,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub commit_name: String,
    pub commit_email: String,
    pub mock: MockConfig,
    pub gitlab: Option<GitLabConfig>,
    pub github: Option<GitHubConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let identity = CommitIdentity::default();
        Self {
            backend: Backend::Mock,
            repo_prefix: "blueprint-".to_string(),
            branch: "main".to_string(),
            workdir: None,
            save_timeout_secs: 60,
            retry_initial_backoff_ms: 50,
            retry_max_backoff_ms: 2000,
            commit_name: identity.name,
            commit_email: identity.email,
            mock: MockConfig::default(),
            gitlab: None,
            github: None,
        }
    }
}

impl StoreConfig {
    pub fn save_timeout(&self) -> Duration {
        Duration::from_secs(self.save_timeout_secs)
    }

    pub fn identity(&self) -> CommitIdentity {
        CommitIdentity {
            name: self.commit_name.clone(),
            email: self.commit_email.clone(),
        }
    }

    pub fn workdir(&self) -> PathBuf {
        self.workdir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// Directory holding one bare repository per blueprint.
    pub root: PathBuf,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/orchd/repos"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitLabConfig {
    #[serde(default = "default_gitlab_url")]
    pub url: String,
    #[serde(default)]
    pub token: String,
    /// Group or user namespace the projects live under.
    pub namespace: String,
}

fn default_gitlab_url() -> String {
    "https://gitlab.com".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default = "default_github_url")]
    pub url: String,
    #[serde(default)]
    pub token: String,
    /// Organization to create repositories in. The token's user when unset.
    #[serde(default)]
    pub owner: Option<String>,
}

fn default_github_url() -> String {
    "https://api.github.com".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// External TOSCA engine executable.
    pub program: String,
    /// Arguments inserted before the operation subcommand.
    pub extra_args: Vec<String>,
    /// Subdirectory of the working directory the engine keeps state in.
    pub state_dir: String,
    /// 1 runs a single FIFO worker; more runs a pool keyed by deployment.
    pub concurrency: usize,
    /// Seconds a per-deployment lane waits for work before exiting.
    pub lane_idle_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "opera".to_string(),
            extra_args: Vec::new(),
            state_dir: ".opera".to_string(),
            concurrency: 1,
            lane_idle_secs: 300,
        }
    }
}

impl OrchConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: OrchConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply environment overrides (currently the hosted backend token).
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            self.apply_token(token);
        }
    }

    fn apply_token(&mut self, token: String) {
        if let Some(gitlab) = self.store.gitlab.as_mut() {
            gitlab.token = token.clone();
        }
        if let Some(github) = self.store.github.as_mut() {
            github.token = token;
        }
    }

    /// Path of the invocation log database inside `data_dir`.
    pub fn state_db_path(&self) -> PathBuf {
        self.server.data_dir.join("orch.redb")
    }
}
