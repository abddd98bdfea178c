//! Versioned GitLab API client.
//!
//! A client is constructed per request from the caller's token. Construction
//! probes the upstream to find out which API generation it speaks: `HEAD
//! /api/v4/user` first, then `/api/v3/user`. An `Unauthorized` answer (or a
//! redirect towards a sign-in page) on either probe is a bad credential;
//! if neither prefix answers `200` the endpoint itself is considered bad.
//!
//! The selected [`Dialect`] backs the session afterwards; the only
//! behavioural differences between the two generations are the URL prefix
//! and the shape of the repository-file endpoint.

use crate::error::{AppError, AppResult};
use crate::gitlab::types::{Project, RepoFile, Tag};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Header carrying the caller's token on every upstream request.
const PRIVATE_TOKEN_HEADER: &str = "PRIVATE-TOKEN";

/// Page size requested from list endpoints.
const PER_PAGE: u32 = 30;

/// In-flight limit for the page fan-out of a paginated listing.
const PAGE_CONCURRENCY: usize = 2;

/// One upstream API generation. The probe in [`GitlabClient::connect`]
/// decides which implementation backs the session.
trait Dialect: Send + Sync {
    fn prefix(&self) -> &'static str;

    /// Relative URI of the repository-file endpoint plus an alternate form.
    /// When an alternate is present the client probes the first form with
    /// `HEAD` and switches to the alternate on any non-200 answer.
    fn file_uris(&self, project_id: u64, path: &str, reference: &str) -> (String, Option<String>);
}

struct V3Dialect;
struct V4Dialect;

static V3: V3Dialect = V3Dialect;
static V4: V4Dialect = V4Dialect;

fn file_query_form(project_id: u64, path: &str, reference: &str) -> String {
    format!(
        "projects/{project_id}/repository/files?file_path={}&ref={}",
        urlencode(path),
        urlencode(reference)
    )
}

impl Dialect for V3Dialect {
    fn prefix(&self) -> &'static str {
        "/api/v3"
    }

    fn file_uris(&self, project_id: u64, path: &str, reference: &str) -> (String, Option<String>) {
        (file_query_form(project_id, path, reference), None)
    }
}

impl Dialect for V4Dialect {
    fn prefix(&self) -> &'static str {
        "/api/v4"
    }

    fn file_uris(&self, project_id: u64, path: &str, reference: &str) -> (String, Option<String>) {
        // v4 moved the file endpoint to a path-segment form; older minor
        // releases still serve the query-string form, so that one is probed
        // first and the path-segment form is the fallback.
        let segment_form = format!(
            "projects/{project_id}/repository/files/{}?ref={}",
            urlencode(path),
            urlencode(reference)
        );
        (
            file_query_form(project_id, path, reference),
            Some(segment_form),
        )
    }
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Authenticated client bound to one API generation.
pub struct GitlabClient {
    http: Client,
    endpoint: String,
    token: String,
    dialect: &'static dyn Dialect,
}

/// Build the HTTP client shared by all sessions. Redirects are not
/// followed: GitLab answers API calls directly, and a redirect means a
/// sign-in page or a misconfigured endpoint. No client-side timeout; the
/// HTTP entry layer owns timeout policy.
pub fn build_http_client() -> AppResult<Client> {
    Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(concat!("pavlik/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| AppError::Transport(format!("failed to build http client: {e}")))
}

impl GitlabClient {
    /// Probe the endpoint and bind the session to an API generation.
    pub async fn connect(http: Client, endpoint: &str, token: &str) -> AppResult<Self> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        for dialect in [&V4 as &'static dyn Dialect, &V3 as &'static dyn Dialect] {
            let url = format!("{}{}/user", endpoint, dialect.prefix());
            let status = match http
                .head(&url)
                .header(PRIVATE_TOKEN_HEADER, token)
                .send()
                .await
            {
                Ok(resp) => resp.status(),
                Err(err) => {
                    debug!(url = %url, error = %err, "api probe failed");
                    continue;
                }
            };

            if status == StatusCode::UNAUTHORIZED || status.is_redirection() {
                return Err(AppError::BadCredential);
            }
            if status == StatusCode::OK {
                debug!(prefix = dialect.prefix(), "bound gitlab api prefix");
                return Ok(Self {
                    http,
                    endpoint,
                    token: token.to_string(),
                    dialect,
                });
            }
        }

        Err(AppError::BadEndpoint(endpoint))
    }

    pub fn api_prefix(&self) -> &'static str {
        self.dialect.prefix()
    }

    /// Every project visible to the token.
    pub async fn project_list(&self) -> AppResult<Vec<Project>> {
        self.get_paginated("projects").await
    }

    pub async fn project_by_id(&self, project_id: u64) -> AppResult<Project> {
        self.get_json(&format!("projects/{project_id}")).await
    }

    /// Tags of a project. Always a fresh fetch; tag lists are never cached
    /// so new tags appear immediately.
    pub async fn tag_list(&self, project: &Project) -> AppResult<Vec<Tag>> {
        self.get_paginated(&format!("projects/{}/repository/tags", project.id))
            .await
    }

    /// Raw `tar.gz` of the repository tree at the given ref.
    pub async fn archive(&self, project: &Project, reference: &str) -> AppResult<Vec<u8>> {
        let uri = format!(
            "projects/{}/repository/archive.tar.gz?ref={}",
            project.id,
            urlencode(reference)
        );
        let resp = self.get(&uri).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Decoded bytes of a file inside the repository at the given ref.
    /// Only the base64 transfer encoding is accepted.
    pub async fn file(&self, project: &Project, path: &str, reference: &str) -> AppResult<Vec<u8>> {
        let (primary, fallback) = self.dialect.file_uris(project.id, path, reference);
        let uri = match fallback {
            Some(fallback) => match self.head_status(&primary).await {
                Some(status) if status.is_success() => primary,
                _ => fallback,
            },
            None => primary,
        };

        let file: RepoFile = self.get_json(&uri).await?;
        if file.encoding != "base64" {
            return Err(AppError::UnsupportedEncoding(file.encoding));
        }
        BASE64
            .decode(file.content.as_bytes())
            .map_err(|e| AppError::Transport(format!("invalid base64 file content: {e}")))
    }

    /// Fetch a list endpoint across all its pages. Page 1 decides whether
    /// pagination applies; remaining pages are fetched concurrently, bounded
    /// and in page order. A single failed page fails the whole call.
    async fn get_paginated<T: DeserializeOwned>(&self, path: &str) -> AppResult<Vec<T>> {
        let sep = if path.contains('?') { '&' } else { '?' };
        let first = self.get(&format!("{path}{sep}per_page={PER_PAGE}")).await?;

        let next_page = header_number(&first, "X-Next-Page");
        let total_pages = header_number(&first, "X-Total-Pages");
        let mut items: Vec<T> = first.json().await?;

        let Some(next_page) = next_page else {
            return Ok(items);
        };
        let total_pages = total_pages.ok_or_else(|| {
            AppError::Transport(format!("missing X-Total-Pages header on {path}"))
        })?;

        let pages: Vec<AppResult<Vec<T>>> = futures::stream::iter(next_page..=total_pages)
            .map(|page| {
                let uri = format!("{path}{sep}per_page={PER_PAGE}&page={page}");
                async move { self.get_json::<Vec<T>>(&uri).await }
            })
            .buffered(PAGE_CONCURRENCY)
            .collect()
            .await;

        for page in pages {
            match page {
                Ok(page_items) => items.extend(page_items),
                Err(err) => {
                    warn!(path = %path, error = %err, "page fetch failed");
                    return Err(AppError::PartialPaginationFailure(path.to_string()));
                }
            }
        }

        Ok(items)
    }

    async fn get_json<T: DeserializeOwned>(&self, uri: &str) -> AppResult<T> {
        let resp = self.get(uri).await?;
        Ok(resp.json().await?)
    }

    async fn get(&self, uri: &str) -> AppResult<reqwest::Response> {
        let url = self.api_url(uri);
        let resp = self
            .http
            .get(&url)
            .header(PRIVATE_TOKEN_HEADER, &self.token)
            .send()
            .await?;
        check_status(&url, resp)
    }

    async fn head_status(&self, uri: &str) -> Option<StatusCode> {
        let url = self.api_url(uri);
        match self
            .http
            .head(&url)
            .header(PRIVATE_TOKEN_HEADER, &self.token)
            .send()
            .await
        {
            Ok(resp) => Some(resp.status()),
            Err(err) => {
                debug!(url = %url, error = %err, "head probe failed");
                None
            }
        }
    }

    fn api_url(&self, uri: &str) -> String {
        format!(
            "{}{}/{}",
            self.endpoint,
            self.dialect.prefix(),
            uri.trim_start_matches('/')
        )
    }
}

fn check_status(url: &str, resp: reqwest::Response) -> AppResult<reqwest::Response> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(AppError::BadCredential);
    }
    if status.is_redirection() {
        return Err(AppError::Transport(format!("unexpected redirect on {url}")));
    }
    if !status.is_success() {
        return Err(AppError::Transport(format!(
            "unexpected status {status} on {url}"
        )));
    }
    Ok(resp)
}

fn header_number(resp: &reqwest::Response, name: &str) -> Option<u32> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse().ok())
}
