//! The composer-form registry view.
//!
//! Serves the aggregate `/packages.json` document and the repacked zip
//! archives its `dist.url` fields point at. Unlike the npm form, version
//! records carry no digest, so document assembly never touches archives.

use crate::auth::AuthToken;
use crate::catalogue::Kind;
use crate::error::{AppError, AppResult};
use crate::registry::{manifest_list, manifest_map, normalize_release, public_base_url};
use crate::repack::ArchiveFormat;
use crate::session::{RepoData, Session, TagData};
use crate::state::AppState;
use crate::JsonMap;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// In-flight limit for per-repository assembly of the aggregate document.
const REPO_CONCURRENCY: usize = 2;

#[derive(Debug, Serialize)]
pub struct ComposerDocument {
    pub packages: BTreeMap<String, BTreeMap<String, ComposerVersion>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComposerVersion {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub package_type: Option<String>,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require: Option<JsonMap>,
    #[serde(rename = "require-dev", skip_serializing_if = "Option::is_none")]
    pub require_dev: Option<JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoload: Option<JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bin: Option<Vec<Value>>,
    pub dist: ComposerDist,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComposerDist {
    pub url: String,
    #[serde(rename = "type")]
    pub dist_type: &'static str,
    pub reference: String,
}

/// `GET /packages.json` — every package visible to the caller's token.
pub async fn aggregate_document(
    State(state): State<AppState>,
    AuthToken(token): AuthToken,
    headers: HeaderMap,
) -> AppResult<Json<ComposerDocument>> {
    let session = Session::open(&state, &token).await?;
    let repos = session.package_repos(Kind::Composer).await?;
    let base_url = public_base_url(&state.config, &headers);

    let semaphore = Arc::new(Semaphore::new(REPO_CONCURRENCY));
    let mut handles = Vec::with_capacity(repos.len());
    for repo in repos {
        let session = session.clone();
        let semaphore = semaphore.clone();
        let base_url = base_url.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            let data = session.repo_data(Kind::Composer, &repo).await?;
            Ok::<_, AppError>(version_records(&data, &base_url).await)
        }));
    }

    // A repository that fails to assemble fails the whole aggregate.
    let mut packages: BTreeMap<String, BTreeMap<String, ComposerVersion>> = BTreeMap::new();
    for handle in handles {
        let records = handle
            .await
            .map_err(|e| AppError::Io(std::io::Error::other(e)))??;
        for record in records {
            packages
                .entry(record.name.clone())
                .or_default()
                .insert(record.version.clone(), record);
        }
    }

    Ok(Json(ComposerDocument { packages }))
}

/// `GET /composer/{uuid}/{ref}.zip` — the repacked zip.
pub async fn archive(
    State(state): State<AppState>,
    AuthToken(token): AuthToken,
    Path((uuid, file)): Path<(String, String)>,
) -> AppResult<Response> {
    let Some(reference) = file.strip_suffix(".zip") else {
        return Err(AppError::PackageNotFound(file));
    };
    let session = Session::open(&state, &token).await?;
    let (bytes, _sha1) = session
        .repacked_archive(Kind::Composer, &uuid, reference, ArchiveFormat::Zip)
        .await?;
    Ok((
        [(header::CONTENT_TYPE, ArchiveFormat::Zip.content_type())],
        bytes.as_ref().clone(),
    )
        .into_response())
}

/// Version records of one repository, one bounded worker per tag. The
/// manifest `name` field is mandatory; tags without it are dropped, as are
/// tags that do not parse as releases.
async fn version_records(data: &RepoData, base_url: &str) -> Vec<ComposerVersion> {
    info!(project = %data.project.name, "processing tags");
    let semaphore = Arc::new(Semaphore::new(num_cpus::get()));
    let mut handles = Vec::with_capacity(data.tags.len());

    for tag in data.tags.clone() {
        let semaphore = semaphore.clone();
        let uuid = data.uuid.clone();
        let base_url = base_url.to_string();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            build_version(&uuid, &base_url, tag)
        }));
    }

    let mut records = Vec::with_capacity(handles.len());
    for handle in handles {
        if let Ok(Some(record)) = handle.await {
            records.push(record);
        }
    }
    records
}

fn build_version(uuid: &str, base_url: &str, tag: TagData) -> Option<ComposerVersion> {
    // Composer accepts a leading "v"; the semver parser does not, so the
    // normalised version is re-prefixed.
    let release = normalize_release(&tag.name)?;

    // The name field is mandatory; a tag whose manifest lacks it (or has it
    // as something other than a string) carries no package.
    let Some(name) = tag.manifest.get("name").and_then(Value::as_str) else {
        debug!(tag = %tag.name, "dropping tag: manifest has no name");
        return None;
    };

    Some(ComposerVersion {
        name: name.to_string(),
        package_type: tag
            .manifest
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string),
        version: format!("v{release}"),
        extra: manifest_map(&tag.manifest, "extra"),
        require: manifest_map(&tag.manifest, "require"),
        require_dev: manifest_map(&tag.manifest, "require-dev"),
        autoload: manifest_map(&tag.manifest, "autoload"),
        config: manifest_map(&tag.manifest, "config"),
        bin: manifest_list(&tag.manifest, "bin"),
        dist: ComposerDist {
            url: format!("{base_url}/composer/{uuid}/{}.zip", tag.reference),
            dist_type: "zip",
            reference: tag.reference,
        },
    })
}
