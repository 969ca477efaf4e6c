//! GitHub connector (REST API v3).

use std::path::Path;

use async_trait::async_trait;
use orch_core::config::GitHubConfig;
use orch_core::tag::parse_tags;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::Connector;
use crate::error::{ConnectorError, ConnectorResult};
use crate::git::{self, WorkingCopy};
use crate::http::{authenticated_url, check, encode_segment, fetch_pages, send_json};

/// GitHub answers 409 for listings on a repository with no commits.
const EMPTY_REPO: u16 = 409;

#[derive(Debug, Deserialize)]
struct Login {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Repo {
    html_url: String,
    clone_url: String,
}

#[derive(Debug, Deserialize)]
struct GitObject {
    sha: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct Ref {
    object: GitObject,
}

#[derive(Debug, Deserialize)]
struct TagObject {
    sha: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct TagName {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CommitSha {
    sha: String,
}

pub struct GitHubConnector {
    client: Client,
    api: String,
    token: String,
    owner: String,
    /// Repositories are created under an organization when the owner is
    /// not the authenticated user.
    org: bool,
    branch: String,
}

impl GitHubConnector {
    /// Build a client, verify the token and resolve the owning account.
    pub async fn connect(config: &GitHubConfig, branch: &str) -> ConnectorResult<Self> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|_| ConnectorError::GitAuthentication("token is not a valid header".into()))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(USER_AGENT, HeaderValue::from_static("orchd"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        let client = Client::builder().default_headers(headers).build()?;
        let api = config.url.trim_end_matches('/').to_string();

        let resp = client.get(format!("{api}/user")).send().await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(ConnectorError::GitAuthentication(format!(
                "github at {} rejected the token",
                config.url
            )));
        }
        let me: Login = check(resp, "user").await?.json().await?;
        let owner = config.owner.clone().unwrap_or_else(|| me.login.clone());
        let org = owner != me.login;
        info!(login = %me.login, %owner, "github connector authenticated");

        Ok(Self {
            client,
            api,
            token: config.token.clone(),
            owner,
            org,
            branch: branch.to_string(),
        })
    }

    fn repo_api(&self, name: &str) -> String {
        format!("{}/repos/{}/{}", self.api, self.owner, name)
    }

    fn create_url(&self) -> String {
        if self.org {
            format!("{}/orgs/{}/repos", self.api, self.owner)
        } else {
            format!("{}/user/repos", self.api)
        }
    }

    async fn repo(&self, name: &str) -> ConnectorResult<Repo> {
        send_json(self.client.get(self.repo_api(name)), name).await
    }

    async fn tag_ref(&self, name: &str, tag: &str) -> ConnectorResult<Option<Ref>> {
        let url = format!("{}/git/ref/tags/{}", self.repo_api(name), encode_segment(tag));
        let resp = self.client.get(url).send().await?;
        match resp.status().as_u16() {
            EMPTY_REPO => Ok(None),
            404 => {
                if self.repo_exists(name).await? {
                    Ok(None)
                } else {
                    Err(ConnectorError::RepoNotFound(name.to_string()))
                }
            }
            _ => Ok(Some(check(resp, name).await?.json().await?)),
        }
    }

    async fn require_user(&self, username: &str) -> ConnectorResult<()> {
        let resp = self
            .client
            .get(format!("{}/users/{}", self.api, encode_segment(username)))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ConnectorError::UserNotFound(username.to_string()));
        }
        check(resp, username).await?;
        Ok(())
    }
}

#[async_trait]
impl Connector for GitHubConnector {
    fn backend(&self) -> &'static str {
        "github"
    }

    async fn init_repo(&self, name: &str) -> ConnectorResult<bool> {
        if self.repo_exists(name).await? {
            return Ok(false);
        }
        let resp = self
            .client
            .post(self.create_url())
            .json(&json!({ "name": name, "private": true }))
            .send()
            .await?;
        if resp.status() == StatusCode::UNPROCESSABLE_ENTITY {
            return if self.repo_exists(name).await? {
                Ok(false)
            } else {
                Err(ConnectorError::RepoExists(name.to_string()))
            };
        }
        check(resp, name).await?;
        info!(repo = %name, owner = %self.owner, "github repository created");
        Ok(true)
    }

    async fn repo_exists(&self, name: &str) -> ConnectorResult<bool> {
        let resp = self.client.get(self.repo_api(name)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(resp, name).await?;
        Ok(true)
    }

    async fn tag_exists(&self, name: &str, tag: &str) -> ConnectorResult<bool> {
        Ok(self.tag_ref(name, tag).await?.is_some())
    }

    async fn clone_repo(&self, name: &str, dest: &Path) -> ConnectorResult<Option<WorkingCopy>> {
        let repo = match self.repo(name).await {
            Ok(r) => r,
            Err(ConnectorError::RepoNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let url = authenticated_url(&repo.clone_url, "x-access-token", &self.token)?;
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
        let target = match message {
            Some(message) => {
                let created: TagObject = send_json(
                    self.client
                        .post(format!("{}/git/tags", self.repo_api(name)))
                        .json(&json!({
                            "tag": tag,
                            "message": message,
                            "object": commit_sha,
                            "type": "commit",
                        })),
                    name,
                )
                .await?;
                created.sha
            }
            None => commit_sha.to_string(),
        };
        let req = self
            .client
            .post(format!("{}/git/refs", self.repo_api(name)))
            .json(&json!({ "ref": format!("refs/tags/{tag}"), "sha": target }));
        check(req.send().await?, name).await?;
        Ok(())
    }

    async fn delete_tag(&self, name: &str, tag: &str) -> ConnectorResult<bool> {
        let url = format!("{}/git/refs/tags/{}", self.repo_api(name), encode_segment(tag));
        let resp = self.client.delete(url).send().await?;
        match resp.status().as_u16() {
            404 | 422 => {
                if self.repo_exists(name).await? {
                    Ok(false)
                } else {
                    Err(ConnectorError::RepoNotFound(name.to_string()))
                }
            }
            _ => {
                check(resp, name).await?;
                Ok(true)
            }
        }
    }

    async fn delete_repo(&self, name: &str) -> ConnectorResult<usize> {
        let count = self.list_tags(name).await?.len();
        let resp = self.client.delete(self.repo_api(name)).send().await?;
        check(resp, name).await?;
        info!(repo = %name, tags = count, "github repository deleted");
        Ok(count)
    }

    async fn repo_url(&self, name: &str) -> ConnectorResult<String> {
        Ok(self.repo(name).await?.html_url)
    }

    async fn commits(&self, name: &str) -> ConnectorResult<Vec<String>> {
        let url = format!("{}/commits?sha={}", self.repo_api(name), encode_segment(&self.branch));
        let commits: Vec<CommitSha> =
            fetch_pages(&self.client, &url, name, Some(EMPTY_REPO)).await?;
        Ok(commits.into_iter().map(|c| c.sha).collect())
    }

    async fn list_tags(&self, name: &str) -> ConnectorResult<Vec<String>> {
        let url = format!("{}/tags", self.repo_api(name));
        let tags: Vec<TagName> = fetch_pages(&self.client, &url, name, Some(EMPTY_REPO)).await?;
        Ok(tags.into_iter().map(|t| t.name).collect())
    }

    async fn tag_message(&self, name: &str, tag: Option<&str>) -> ConnectorResult<Option<String>> {
        let tag = match tag {
            Some(tag) => tag.to_string(),
            // The tags listing carries no dates; the highest version is the newest.
            None => match parse_tags(self.list_tags(name).await?).last() {
                Some(latest) => latest.to_string(),
                None => return Ok(None),
            },
        };
        let Some(reference) = self.tag_ref(name, &tag).await? else {
            return Ok(None);
        };
        if reference.object.kind != "tag" {
            return Ok(None);
        }
        let object: TagObject = send_json(
            self.client
                .get(format!("{}/git/tags/{}", self.repo_api(name), reference.object.sha)),
            name,
        )
        .await?;
        let message = object.message.trim_end().to_string();
        Ok((!message.is_empty()).then_some(message))
    }

    async fn add_collaborator(&self, name: &str, username: &str) -> ConnectorResult<()> {
        self.require_user(username).await?;
        let req = self
            .client
            .put(format!("{}/collaborators/{}", self.repo_api(name), encode_segment(username)))
            .json(&json!({ "permission": "push" }));
        check(req.send().await?, name).await?;
        Ok(())
    }

    async fn delete_collaborator(&self, name: &str, username: &str) -> ConnectorResult<bool> {
        self.require_user(username).await?;
        let url = format!("{}/collaborators/{}", self.repo_api(name), encode_segment(username));
        let resp = self.client.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            if !self.repo_exists(name).await? {
                return Err(ConnectorError::RepoNotFound(name.to_string()));
            }
            return Ok(false);
        }
        check(resp, name).await?;
        check(self.client.delete(&url).send().await?, name).await?;
        Ok(true)
    }

    async fn collaborators(&self, name: &str) -> ConnectorResult<Vec<String>> {
        let url = format!("{}/collaborators", self.repo_api(name));
        let users: Vec<Login> = fetch_pages(&self.client, &url, name, None).await?;
        Ok(users.into_iter().map(|u| u.login).collect())
    }
}
