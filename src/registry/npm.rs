//! The npm-form registry view.
//!
//! Serves the package document consumed by `npm install` and the repacked
//! tarballs its `dist.tarball` URLs point at. Version records are built by
//! a bounded per-tag fan-out; each worker repacks (or finds cached) the tag
//! archive to publish its shasum.

use crate::auth::AuthToken;
use crate::catalogue::Kind;
use crate::error::{AppError, AppResult};
use crate::registry::{manifest_map, manifest_str, normalize_release, public_base_url};
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
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
pub struct NpmPackage {
    pub name: String,
    pub description: String,
    #[serde(rename = "dist-tags")]
    pub dist_tags: BTreeMap<String, String>,
    /// Always `proprietary`; nothing served here is publicly licensed.
    pub license: &'static str,
    /// Always `true`.
    pub private: bool,
    pub versions: BTreeMap<String, NpmVersion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NpmVersion {
    pub version: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub main: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<JsonMap>,
    #[serde(rename = "devDependencies", skip_serializing_if = "Option::is_none")]
    pub dev_dependencies: Option<JsonMap>,
    pub dist: NpmDist,
}

#[derive(Debug, Clone, Serialize)]
pub struct NpmDist {
    pub shasum: String,
    pub tarball: String,
}

/// `GET /{*name}` — the package document.
pub async fn package_document(
    State(state): State<AppState>,
    AuthToken(token): AuthToken,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> AppResult<Json<NpmPackage>> {
    debug!(package = %name, "npm package document requested");
    let session = Session::open(&state, &token).await?;
    let data = find_package(&session, &name).await?;
    let base_url = public_base_url(&state.config, &headers);

    let versions = build_versions(&session, &data, &base_url).await;
    let dist_tags = versions
        .keys()
        .map(|v| (v.clone(), v.clone()))
        .collect::<BTreeMap<_, _>>();

    Ok(Json(NpmPackage {
        name: manifest_str(&data.master_manifest, "name"),
        description: manifest_str(&data.master_manifest, "description"),
        dist_tags,
        license: "proprietary",
        private: true,
        versions,
    }))
}

/// `GET /npm/{uuid}/{ref}.tgz` — the repacked tarball.
pub async fn archive(
    State(state): State<AppState>,
    AuthToken(token): AuthToken,
    Path((uuid, file)): Path<(String, String)>,
) -> AppResult<Response> {
    let Some(reference) = file.strip_suffix(".tgz") else {
        return Err(AppError::PackageNotFound(file));
    };
    let session = Session::open(&state, &token).await?;
    let (bytes, _sha1) = session
        .repacked_archive(Kind::Npm, &uuid, reference, ArchiveFormat::TarGz)
        .await?;
    Ok((
        [(header::CONTENT_TYPE, ArchiveFormat::TarGz.content_type())],
        bytes.as_ref().clone(),
    )
        .into_response())
}

/// Find the package repository whose master manifest `name` matches. For
/// backwards compatibility a second pass retries with the `@scope/` prefix
/// stripped from the requested name.
async fn find_package(session: &Arc<Session>, name: &str) -> AppResult<RepoData> {
    let repos = session.package_repos(Kind::Npm).await?;
    let mut datas = Vec::with_capacity(repos.len());
    for repo in &repos {
        datas.push(session.repo_data(Kind::Npm, repo).await?);
    }

    let by_name = |wanted: &str| {
        datas
            .iter()
            .position(|d| manifest_str(&d.master_manifest, "name") == wanted)
    };

    let index = by_name(name).or_else(|| {
        let stripped = name.split_once('/').map(|(_, rest)| rest)?;
        by_name(stripped)
    });

    match index {
        Some(index) => Ok(datas.swap_remove(index)),
        None => Err(AppError::PackageNotFound(name.to_string())),
    }
}

/// Build the version mapping with one bounded worker per tag. Workers
/// whose tag does not parse as a release, or whose archive cannot be
/// repacked, drop their tag.
async fn build_versions(
    session: &Arc<Session>,
    data: &RepoData,
    base_url: &str,
) -> BTreeMap<String, NpmVersion> {
    info!(project = %data.project.name, "processing tags");
    let semaphore = Arc::new(Semaphore::new(num_cpus::get()));
    let mut handles = Vec::with_capacity(data.tags.len());

    for tag in data.tags.clone() {
        let session = session.clone();
        let semaphore = semaphore.clone();
        let uuid = data.uuid.clone();
        let base_url = base_url.to_string();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            build_version(&session, &uuid, &base_url, tag).await
        }));
    }

    let mut versions = BTreeMap::new();
    for handle in handles {
        if let Ok(Some(version)) = handle.await {
            versions.insert(version.version.clone(), version);
        }
    }
    versions
}

async fn build_version(
    session: &Arc<Session>,
    uuid: &str,
    base_url: &str,
    tag: TagData,
) -> Option<NpmVersion> {
    // npm itself does not accept a leading "v" in version strings.
    let release = normalize_release(&tag.name)?;

    let shasum = match session
        .repacked_archive(Kind::Npm, uuid, &tag.reference, ArchiveFormat::TarGz)
        .await
    {
        Ok((_bytes, sha1)) => sha1,
        Err(err) => {
            debug!(tag = %tag.name, error = %err, "dropping tag: archive repack failed");
            return None;
        }
    };

    Some(NpmVersion {
        version: release.to_string(),
        name: manifest_str(&tag.manifest, "name"),
        description: manifest_str(&tag.manifest, "description"),
        main: manifest_str(&tag.manifest, "main"),
        dependencies: manifest_map(&tag.manifest, "dependencies"),
        dev_dependencies: manifest_map(&tag.manifest, "devDependencies"),
        dist: NpmDist {
            shasum,
            tarball: format!("{base_url}/npm/{uuid}/{}.tgz", tag.reference),
        },
    })
}
