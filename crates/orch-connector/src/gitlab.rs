//! GitLab connector (REST API v4).
//!
//! Projects are addressed by their url-encoded `namespace/name` path.
//! Clones authenticate with the `oauth2:<token>` URL convention.

use std::path::Path;

use async_trait::async_trait;
use orch_core::config::GitLabConfig;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::Connector;
use crate::error::{ConnectorError, ConnectorResult};
use crate::git::{self, WorkingCopy};
use crate::http::{authenticated_url, check, encode_segment, fetch_pages, send_json};

/// Developer access: may push branches and tags.
const DEVELOPER_ACCESS: u32 = 30;

#[derive(Debug, Deserialize)]
struct Project {
    http_url_to_repo: String,
    web_url: String,
}

#[derive(Debug, Deserialize)]
struct Namespace {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct TagInfo {
    name: String,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommitInfo {
    id: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    id: u64,
    username: String,
}

pub struct GitLabConnector {
    client: Client,
    api: String,
    token: String,
    namespace: String,
    branch: String,
}

impl GitLabConnector {
    /// Build a client and verify the token against `GET /user`.
    pub async fn connect(config: &GitLabConfig, branch: &str) -> ConnectorResult<Self> {
        let mut headers = HeaderMap::new();
        let token = HeaderValue::from_str(&config.token)
            .map_err(|_| ConnectorError::GitAuthentication("token is not a valid header".into()))?;
        headers.insert("PRIVATE-TOKEN", token);
        let client = Client::builder().default_headers(headers).build()?;

        let connector = Self {
            client,
            api: format!("{}/api/v4", config.url.trim_end_matches('/')),
            token: config.token.clone(),
            namespace: config.namespace.clone(),
            branch: branch.to_string(),
        };

        let resp = connector.client.get(format!("{}/user", connector.api)).send().await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(ConnectorError::GitAuthentication(format!(
                "gitlab at {} rejected the token",
                config.url
            )));
        }
        check(resp, "user").await?;
        info!(url = %config.url, namespace = %config.namespace, "gitlab connector authenticated");
        Ok(connector)
    }

    fn project_url(&self, name: &str) -> String {
        format!(
            "{}/projects/{}",
            self.api,
            encode_segment(&format!("{}/{}", self.namespace, name))
        )
    }

    async fn project(&self, name: &str) -> ConnectorResult<Project> {
        send_json(self.client.get(self.project_url(name)), name).await
    }

    async fn user_id(&self, username: &str) -> ConnectorResult<u64> {
        let users: Vec<UserInfo> = send_json(
            self.client
                .get(format!("{}/users", self.api))
                .query(&[("username", username)]),
            username,
        )
        .await?;
        users
            .into_iter()
            .find(|u| u.username == username)
            .map(|u| u.id)
            .ok_or_else(|| ConnectorError::UserNotFound(username.to_string()))
    }

    /// A 404 on a sub-resource means either the repo or the item is missing.
    async fn missing_item(&self, name: &str) -> ConnectorResult<()> {
        if self.repo_exists(name).await? {
            Ok(())
        } else {
            Err(ConnectorError::RepoNotFound(name.to_string()))
        }
    }
}

#[async_trait]
impl Connector for GitLabConnector {
    fn backend(&self) -> &'static str {
        "gitlab"
    }

    async fn init_repo(&self, name: &str) -> ConnectorResult<bool> {
        if self.repo_exists(name).await? {
            return Ok(false);
        }
        let ns: Namespace = send_json(
            self.client
                .get(format!("{}/namespaces/{}", self.api, encode_segment(&self.namespace))),
            &self.namespace,
        )
        .await?;
        let resp = self
            .client
            .post(format!("{}/projects", self.api))
            .json(&json!({
                "name": name,
                "path": name,
                "namespace_id": ns.id,
                "visibility": "private",
                "default_branch": self.branch,
            }))
            .send()
            .await?;
        if resp.status() == StatusCode::BAD_REQUEST {
            // "has already been taken": created concurrently or hidden from us.
            return if self.repo_exists(name).await? {
                Ok(false)
            } else {
                Err(ConnectorError::RepoExists(name.to_string()))
            };
        }
        check(resp, name).await?;
        info!(repo = %name, "gitlab project created");
        Ok(true)
    }

    async fn repo_exists(&self, name: &str) -> ConnectorResult<bool> {
        let resp = self.client.get(self.project_url(name)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(resp, name).await?;
        Ok(true)
    }

    async fn tag_exists(&self, name: &str, tag: &str) -> ConnectorResult<bool> {
        let url = format!("{}/repository/tags/{}", self.project_url(name), encode_segment(tag));
        let resp = self.client.get(url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            self.missing_item(name).await?;
            return Ok(false);
        }
        check(resp, name).await?;
        Ok(true)
    }

    async fn clone_repo(&self, name: &str, dest: &Path) -> ConnectorResult<Option<WorkingCopy>> {
        let project = match self.project(name).await {
            Ok(p) => p,
            Err(ConnectorError::RepoNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let url = authenticated_url(&project.http_url_to_repo, "oauth2", &self.token)?;
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
        let mut body = json!({ "tag_name": tag, "ref": commit_sha });
        if let Some(msg) = message {
            body["message"] = json!(msg);
        }
        let req = self
            .client
            .post(format!("{}/repository/tags", self.project_url(name)))
            .json(&body);
        check(req.send().await?, name).await?;
        Ok(())
    }

    async fn delete_tag(&self, name: &str, tag: &str) -> ConnectorResult<bool> {
        let url = format!("{}/repository/tags/{}", self.project_url(name), encode_segment(tag));
        let resp = self.client.delete(url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            self.missing_item(name).await?;
            return Ok(false);
        }
        check(resp, name).await?;
        Ok(true)
    }

    async fn delete_repo(&self, name: &str) -> ConnectorResult<usize> {
        let count = self.list_tags(name).await?.len();
        let resp = self.client.delete(self.project_url(name)).send().await?;
        check(resp, name).await?;
        info!(repo = %name, tags = count, "gitlab project deleted");
        Ok(count)
    }

    async fn repo_url(&self, name: &str) -> ConnectorResult<String> {
        Ok(self.project(name).await?.web_url)
    }

    async fn commits(&self, name: &str) -> ConnectorResult<Vec<String>> {
        let url = format!(
            "{}/repository/commits?ref_name={}",
            self.project_url(name),
            encode_segment(&self.branch)
        );
        match fetch_pages::<CommitInfo>(&self.client, &url, name, None).await {
            Ok(commits) => Ok(commits.into_iter().map(|c| c.id).collect()),
            // An empty project has no branch to list.
            Err(ConnectorError::RepoNotFound(_)) => {
                self.missing_item(name).await?;
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_tags(&self, name: &str) -> ConnectorResult<Vec<String>> {
        let url = format!("{}/repository/tags", self.project_url(name));
        let tags: Vec<TagInfo> = fetch_pages(&self.client, &url, name, None).await?;
        Ok(tags.into_iter().map(|t| t.name).collect())
    }

    async fn tag_message(&self, name: &str, tag: Option<&str>) -> ConnectorResult<Option<String>> {
        match tag {
            Some(tag) => {
                let url =
                    format!("{}/repository/tags/{}", self.project_url(name), encode_segment(tag));
                let resp = self.client.get(url).send().await?;
                if resp.status() == StatusCode::NOT_FOUND {
                    self.missing_item(name).await?;
                    return Ok(None);
                }
                let info: TagInfo = check(resp, name).await?.json().await?;
                Ok(info.message.filter(|m| !m.is_empty()))
            }
            None => {
                let req = self
                    .client
                    .get(format!("{}/repository/tags", self.project_url(name)))
                    .query(&[("order_by", "updated"), ("sort", "desc"), ("per_page", "1")]);
                let tags: Vec<TagInfo> = send_json(req, name).await?;
                Ok(tags
                    .into_iter()
                    .next()
                    .and_then(|t| t.message)
                    .filter(|m| !m.is_empty()))
            }
        }
    }

    async fn add_collaborator(&self, name: &str, username: &str) -> ConnectorResult<()> {
        let user_id = self.user_id(username).await?;
        let resp = self
            .client
            .post(format!("{}/members", self.project_url(name)))
            .json(&json!({ "user_id": user_id, "access_level": DEVELOPER_ACCESS }))
            .send()
            .await?;
        if resp.status() == StatusCode::CONFLICT {
            debug!(repo = %name, %username, "already a member");
            return Ok(());
        }
        check(resp, name).await?;
        Ok(())
    }

    async fn delete_collaborator(&self, name: &str, username: &str) -> ConnectorResult<bool> {
        let user_id = self.user_id(username).await?;
        let resp = self
            .client
            .delete(format!("{}/members/{user_id}", self.project_url(name)))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            self.missing_item(name).await?;
            return Ok(false);
        }
        check(resp, name).await?;
        Ok(true)
    }

    async fn collaborators(&self, name: &str) -> ConnectorResult<Vec<String>> {
        let url = format!("{}/members", self.project_url(name));
        let members: Vec<UserInfo> = fetch_pages(&self.client, &url, name, None).await?;
        Ok(members.into_iter().map(|m| m.username).collect())
    }
}
