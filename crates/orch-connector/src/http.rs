//! Helpers shared by the hosted (GitLab/GitHub) connectors.

use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;

use crate::error::{ConnectorError, ConnectorResult, status_error};

pub(crate) const PER_PAGE: usize = 100;

/// Pass a successful response through, map anything else.
pub(crate) async fn check(resp: Response, subject: &str) -> ConnectorResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(status.as_u16(), subject, body))
}

/// Send and decode JSON, mapping error statuses.
pub(crate) async fn send_json<T: DeserializeOwned>(
    req: RequestBuilder,
    subject: &str,
) -> ConnectorResult<T> {
    let resp = check(req.send().await?, subject).await?;
    Ok(resp.json().await?)
}

/// Follow `page`/`per_page` pagination until a short page comes back.
///
/// `empty_status` is a status the API uses for "repository has no content
/// yet" (GitHub answers 409); it yields an empty list.
pub(crate) async fn fetch_pages<T: DeserializeOwned>(
    client: &Client,
    url: &str,
    subject: &str,
    empty_status: Option<u16>,
) -> ConnectorResult<Vec<T>> {
    let mut all = Vec::new();
    let mut page = 1usize;
    loop {
        let resp = client
            .get(url)
            .query(&[("per_page", PER_PAGE), ("page", page)])
            .send()
            .await?;
        if Some(resp.status().as_u16()) == empty_status {
            return Ok(all);
        }
        let items: Vec<T> = check(resp, subject).await?.json().await?;
        let short = items.len() < PER_PAGE;
        all.extend(items);
        if short {
            return Ok(all);
        }
        page += 1;
    }
}

/// Percent-encode one path segment (GitLab project paths contain `/`).
pub(crate) fn encode_segment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Embed credentials in an https clone URL.
pub(crate) fn authenticated_url(clone_url: &str, user: &str, token: &str) -> ConnectorResult<String> {
    let mut url = Url::parse(clone_url).map_err(|e| ConnectorError::Api {
        status: 0,
        message: format!("invalid clone url {clone_url}: {e}"),
    })?;
    if url.set_username(user).is_err() || url.set_password(Some(token)).is_err() {
        return Err(ConnectorError::Api {
            status: 0,
            message: format!("clone url {clone_url} cannot carry credentials"),
        });
    }
    Ok(url.to_string())
}
