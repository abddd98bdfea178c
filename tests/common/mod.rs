//! Shared test harness: an in-process fake GitLab instance and an
//! application server wired against it.

// Not every test binary uses every helper.
#![allow(dead_code)]

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use flate2::{write::GzEncoder, Compression};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

/// The canonical valid token used by most tests.
pub const TOKEN: &str = "gl-token-T";

/// Configurable fake GitLab state.
#[derive(Default)]
pub struct GitlabFixture {
    /// token -> ids of the projects that token can see
    tokens: Mutex<HashMap<String, Vec<u64>>>,
    projects: Mutex<HashMap<u64, Value>>,
    tags: Mutex<HashMap<u64, Vec<Value>>>,
    /// (project, ref, path) -> raw file bytes
    files: Mutex<HashMap<(u64, String, String), Vec<u8>>>,
    /// (project, ref) -> upstream tar.gz bytes
    archives: Mutex<HashMap<(u64, String), Vec<u8>>>,
    /// number of archive downloads served, across all projects
    pub archive_requests: AtomicUsize,
}

impl GitlabFixture {
    pub fn add_token(&self, token: &str, visible_projects: &[u64]) {
        self.tokens
            .lock()
            .unwrap()
            .insert(token.to_string(), visible_projects.to_vec());
    }

    /// Register a project; clone URLs are derived from its namespace path.
    pub fn add_project(&self, id: u64, path_with_namespace: &str) {
        let name = path_with_namespace
            .rsplit('/')
            .next()
            .unwrap_or(path_with_namespace);
        self.projects.lock().unwrap().insert(
            id,
            json!({
                "id": id,
                "name": name,
                "path_with_namespace": path_with_namespace,
                "ssh_url_to_repo": format!("git@git.example.com:{path_with_namespace}.git"),
                "http_url_to_repo": http_clone_url(path_with_namespace),
                "web_url": format!("https://git.example.com/{path_with_namespace}"),
                "tag_list": [],
            }),
        );
    }

    pub fn add_tag(&self, project: u64, name: &str, commit: &str) {
        self.tags
            .lock()
            .unwrap()
            .entry(project)
            .or_default()
            .push(json!({ "name": name, "commit": { "id": commit } }));
    }

    pub fn add_file(&self, project: u64, reference: &str, path: &str, bytes: &[u8]) {
        self.files.lock().unwrap().insert(
            (project, reference.to_string(), path.to_string()),
            bytes.to_vec(),
        );
    }

    pub fn add_archive(&self, project: u64, reference: &str, bytes: &[u8]) {
        self.archives
            .lock()
            .unwrap()
            .insert((project, reference.to_string()), bytes.to_vec());
    }

    pub fn archive_request_count(&self) -> usize {
        self.archive_requests.load(Ordering::SeqCst)
    }

    fn visible_projects(&self, headers: &HeaderMap) -> Option<Vec<u64>> {
        let token = headers.get("PRIVATE-TOKEN")?.to_str().ok()?;
        self.tokens.lock().unwrap().get(token).cloned()
    }
}

/// HTTP clone URL the catalogue entries should use for a project
/// registered via [`GitlabFixture::add_project`].
pub fn http_clone_url(path_with_namespace: &str) -> String {
    format!("https://git.example.com/{path_with_namespace}.git")
}

#[derive(Deserialize)]
struct FileQuery {
    file_path: String,
    #[serde(rename = "ref")]
    reference: String,
}

#[derive(Deserialize)]
struct RefQuery {
    #[serde(rename = "ref")]
    reference: String,
}

async fn user_probe(State(fixture): State<Arc<GitlabFixture>>, headers: HeaderMap) -> StatusCode {
    if fixture.visible_projects(&headers).is_some() {
        StatusCode::OK
    } else {
        StatusCode::UNAUTHORIZED
    }
}

async fn project_list(
    State(fixture): State<Arc<GitlabFixture>>,
    headers: HeaderMap,
) -> Response {
    let Some(visible) = fixture.visible_projects(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let projects = fixture.projects.lock().unwrap();
    let list: Vec<Value> = visible
        .iter()
        .filter_map(|id| projects.get(id).cloned())
        .collect();
    Json(Value::Array(list)).into_response()
}

async fn tag_list(
    State(fixture): State<Arc<GitlabFixture>>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Response {
    if fixture.visible_projects(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let tags = fixture.tags.lock().unwrap().get(&id).cloned().unwrap_or_default();
    Json(Value::Array(tags)).into_response()
}

async fn repository_file(
    State(fixture): State<Arc<GitlabFixture>>,
    Path(id): Path<u64>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> Response {
    if fixture.visible_projects(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let files = fixture.files.lock().unwrap();
    match files.get(&(id, query.reference.clone(), query.file_path.clone())) {
        Some(bytes) => Json(json!({
            "file_name": query.file_path,
            "content": BASE64.encode(bytes),
            "encoding": "base64",
        }))
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn repository_archive(
    State(fixture): State<Arc<GitlabFixture>>,
    Path(id): Path<u64>,
    Query(query): Query<RefQuery>,
    headers: HeaderMap,
) -> Response {
    if fixture.visible_projects(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    fixture.archive_requests.fetch_add(1, Ordering::SeqCst);
    let archives = fixture.archives.lock().unwrap();
    match archives.get(&(id, query.reference.clone())) {
        Some(bytes) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Serve the fixture on an ephemeral port, returning its base URL.
pub async fn spawn_gitlab(fixture: Arc<GitlabFixture>) -> String {
    let router = Router::new()
        .route("/api/v4/user", get(user_probe))
        .route("/api/v4/projects", get(project_list))
        .route("/api/v4/projects/{id}/repository/tags", get(tag_list))
        .route("/api/v4/projects/{id}/repository/files", get(repository_file))
        .route(
            "/api/v4/projects/{id}/repository/archive.tar.gz",
            get(repository_archive),
        )
        .with_state(fixture);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Build the application against a fake upstream. Returns the test server
/// and the state, whose cache the tests inspect directly.
pub async fn spawn_app(gitlab_base: &str) -> (axum_test::TestServer, pavlik::AppState) {
    let gitlab_base = gitlab_base.to_string();
    let config = pavlik::Config::from_lookup(|name| match name {
        "GITLAB_URL" => Some(gitlab_base.clone()),
        "GITLAB_REPO_NAME" => Some("infra/catalogue".to_string()),
        "GITLAB_REPO_FILE" => Some("repo.json".to_string()),
        "GITLAB_FILE_NAMESPACE" => Some("source".to_string()),
        "PAVLIK_PUBLIC_HOST" => Some("http://pavlik.test".to_string()),
        _ => None,
    })
    .unwrap();

    let state = pavlik::AppState::new(config).unwrap();
    let server = axum_test::TestServer::new(pavlik::build_router(state.clone())).unwrap();
    (server, state)
}

pub fn basic_auth(token: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("anything:{token}")))
}

/// Build an upstream-style `tar.gz`: one wrapping directory, messy
/// timestamps, optionally a `pax_global_header` entry.
pub fn make_upstream_archive(
    top_dir: &str,
    files: &[(&str, &[u8])],
    include_pax_header: bool,
) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    if include_pax_header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::XGlobalHeader);
        header.set_size(0);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        builder
            .append_data(&mut header, "pax_global_header", std::io::empty())
            .unwrap();
    }

    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_size(0);
    dir.set_mode(0o755);
    dir.set_mtime(1_700_000_000);
    builder
        .append_data(&mut dir, format!("{top_dir}/"), std::io::empty())
        .unwrap();

    for (index, (name, content)) in files.iter().enumerate() {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        // Distinct, non-canonical mtimes: the repacker must erase these.
        header.set_mtime(1_700_000_000 + index as u64);
        builder
            .append_data(&mut header, format!("{top_dir}/{name}"), *content)
            .unwrap();
    }

    let tar_bytes = builder.into_inner().unwrap();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes).unwrap();
    encoder.finish().unwrap()
}
