//! Per-request orchestration against the upstream.
//!
//! A [`Session`] is created from the caller's token (which probes the API
//! version), then walks the same steps for every view: visible project list
//! (cached per token), designated catalogue project, index files, kind
//! filtering, binding, and per-repository data assembly. Tag workers return
//! completed immutable records through their join handles; the assembly
//! phase is the sole reader.

use crate::cache::{Cache, MASTER_REF};
use crate::catalogue::{self, Kind, PackageRepo};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::gitlab::{GitlabClient, Project};
use crate::repack::{repack, ArchiveFormat};
use crate::state::AppState;
use crate::JsonMap;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// In-flight limit for fetching the configured catalogue index files.
const INDEX_FILE_CONCURRENCY: usize = 2;

/// Per-tag metadata record, built by one worker.
#[derive(Debug, Clone)]
pub struct TagData {
    pub name: String,
    pub reference: String,
    pub manifest: JsonMap,
}

/// Everything a view needs about one package repository.
#[derive(Debug, Clone)]
pub struct RepoData {
    pub uuid: String,
    pub project: Project,
    pub master_manifest: JsonMap,
    pub tags: Vec<TagData>,
}

/// One request's bound connection to the upstream.
pub struct Session {
    client: GitlabClient,
    cache: Arc<Cache>,
    config: Arc<Config>,
    token_key: String,
}

impl Session {
    /// Probe the upstream with the caller's token and open a session.
    pub async fn open(state: &AppState, token: &str) -> AppResult<Arc<Self>> {
        let client = GitlabClient::connect(state.http.clone(), &state.config.gitlab_url, token)
            .await?;
        Ok(Arc::new(Self {
            client,
            cache: state.cache.clone(),
            config: state.config.clone(),
            token_key: Cache::project_list_key(token),
        }))
    }

    /// Visible project list, cached per token for thirty minutes.
    pub async fn project_list(&self) -> AppResult<Arc<Vec<Project>>> {
        if let Some(entry) = self.cache.get_project_list(&self.token_key) {
            return Ok(entry.projects);
        }

        info!("fetching list of visible projects");
        let projects = Arc::new(self.client.project_list().await?);
        self.cache.put_project_list(&self.token_key, projects.clone());
        Ok(projects)
    }

    /// The kind-filtered package repository list for this request.
    pub async fn package_repos(self: &Arc<Self>, kind: Kind) -> AppResult<Vec<PackageRepo>> {
        let projects = self.project_list().await?;
        let catalogue_project = self.locate_catalogue_project(&projects)?;
        let records = self.catalogue_records(&catalogue_project).await?;
        let entries = catalogue::parse_entries(records, &self.config.clone_url_field);
        let entries = catalogue::filter_kind(entries, kind);
        Ok(catalogue::bind_projects(entries, projects).await)
    }

    /// Resolve a package repository by its public uuid.
    pub async fn repo_by_uuid(self: &Arc<Self>, kind: Kind, uuid: &str) -> AppResult<PackageRepo> {
        self.package_repos(kind)
            .await?
            .into_iter()
            .find(|repo| repo.entry.uuid == uuid)
            .ok_or_else(|| AppError::PackageNotFound(uuid.to_string()))
    }

    /// Assemble the data of one repository: a fresh tag list, the master
    /// manifest (mandatory) and per-tag manifests fetched by a bounded
    /// worker fan-out. A tag whose manifest cannot be fetched is dropped;
    /// failures of the tag list or the master manifest fail the repository.
    pub async fn repo_data(self: &Arc<Self>, kind: Kind, repo: &PackageRepo) -> AppResult<RepoData> {
        info!(project = %repo.project.name, "fetching repository data");
        let tags = self.client.tag_list(&repo.project).await?;
        let manifest_file = kind.manifest_file();
        let master_manifest: JsonMap = self
            .fetch_json(&repo.project, MASTER_REF, manifest_file)
            .await?;

        let semaphore = Arc::new(Semaphore::new(num_cpus::get()));
        let mut handles = Vec::with_capacity(tags.len());
        for tag in tags {
            let session = self.clone();
            let project = repo.project.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                match session
                    .fetch_json::<JsonMap>(&project, &tag.commit.id, manifest_file)
                    .await
                {
                    Ok(manifest) => Some(TagData {
                        name: tag.name,
                        reference: tag.commit.id,
                        manifest,
                    }),
                    Err(err) => {
                        debug!(tag = %tag.name, error = %err, "dropping tag without manifest");
                        None
                    }
                }
            }));
        }

        let mut tag_data = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(Some(tag)) = handle.await {
                tag_data.push(tag);
            }
        }

        Ok(RepoData {
            uuid: repo.entry.uuid.clone(),
            project: repo.project.clone(),
            master_manifest,
            tags: tag_data,
        })
    }

    /// Repacked archive bytes and SHA-1 for `(uuid, ref)`. Served from the
    /// cache when possible; the ref `master` is never admitted.
    pub async fn repacked_archive(
        self: &Arc<Self>,
        kind: Kind,
        uuid: &str,
        reference: &str,
        format: ArchiveFormat,
    ) -> AppResult<(Arc<Vec<u8>>, String)> {
        let key = Cache::archive_key(uuid, reference);

        // WARNING: never serve or admit a cached master ref.
        if reference != MASTER_REF {
            if let Some(bytes) = self.cache.get_bytes(&key) {
                info!(uuid = %uuid, reference = %reference, "cache hit: archive");
                let sha1 = crate::sha1_hex(&bytes);
                return Ok((bytes, sha1));
            }
        }
        info!(uuid = %uuid, reference = %reference, "cache miss: archive");

        let repo = self.repo_by_uuid(kind, uuid).await?;
        let upstream = self.client.archive(&repo.project, reference).await?;

        let uuid_owned = uuid.to_string();
        let reference_owned = reference.to_string();
        let repacked = tokio::task::spawn_blocking(move || {
            repack(&upstream, &uuid_owned, &reference_owned, format)
        })
        .await
        .map_err(|e| AppError::Io(std::io::Error::other(e)))??;

        let bytes = Arc::new(repacked.bytes);
        if reference != MASTER_REF {
            self.cache.put_bytes(&key, bytes.clone());
        }
        Ok((bytes, repacked.sha1))
    }

    /// Web URLs of the cached project list for this token, with the cache
    /// entry's expiry. Powers the status page.
    pub fn cached_project_urls(&self) -> (Vec<String>, Option<DateTime<Utc>>) {
        let (projects, expires_at) = self.cache.project_list_status(&self.token_key);
        let urls = projects.iter().map(|p| p.web_url.clone()).collect();
        (urls, expires_at)
    }

    /// Drop the cached project list for this token.
    pub fn clear_project_cache(&self) {
        self.cache.remove(&self.token_key);
    }

    /// Refresh the project list in the background. A no-op when the cache
    /// is still fresh.
    pub fn warm_up(self: Arc<Self>) {
        tokio::spawn(async move {
            if let Err(err) = self.project_list().await {
                warn!(error = %err, "background project list warm-up failed");
            }
        });
    }

    fn locate_catalogue_project(&self, projects: &[Project]) -> AppResult<Project> {
        projects
            .iter()
            .find(|p| p.path_with_namespace == self.config.catalogue_project)
            .cloned()
            .ok_or_else(|| {
                AppError::CatalogueProjectNotVisible(self.config.catalogue_project.clone())
            })
    }

    /// Fetch every configured index file from the designated project on
    /// master, two at a time. The primary file must load; extras degrade
    /// silently.
    async fn catalogue_records(
        self: &Arc<Self>,
        catalogue_project: &Project,
    ) -> AppResult<Vec<JsonMap>> {
        let semaphore = Arc::new(Semaphore::new(INDEX_FILE_CONCURRENCY));
        let mut handles = Vec::with_capacity(self.config.index_files.len());

        for file in self.config.index_files.clone() {
            let session = self.clone();
            let project = catalogue_project.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                let result = session
                    .fetch_json::<Vec<JsonMap>>(&project, MASTER_REF, &file)
                    .await;
                (file, result)
            }));
        }

        let mut records = Vec::new();
        for (index, handle) in handles.into_iter().enumerate() {
            let (file, result) = handle
                .await
                .map_err(|e| AppError::Io(std::io::Error::other(e)))?;
            match result {
                Ok(mut page) => records.append(&mut page),
                // The primary index file is mandatory; extras are not.
                Err(err) if index == 0 => return Err(err),
                Err(err) => {
                    warn!(file = %file, error = %err, "skipping optional index file");
                }
            }
        }
        Ok(records)
    }

    /// Fetch and decode a JSON file from a repository at a ref, caching the
    /// raw bytes per `(project, ref)`. The ref `master` is never admitted.
    async fn fetch_json<T: DeserializeOwned>(
        &self,
        project: &Project,
        reference: &str,
        path: &str,
    ) -> AppResult<T> {
        let key = Cache::metadata_key(project.id, reference);

        // WARNING: never serve or admit a cached master ref.
        if reference != MASTER_REF {
            if let Some(bytes) = self.cache.get_bytes(&key) {
                debug!(key = %key, "cache hit: metadata file");
                return Ok(serde_json::from_slice(&bytes)?);
            }
        }

        let bytes = self.client.file(project, path, reference).await?;
        let decoded = serde_json::from_slice(&bytes)?;
        if reference != MASTER_REF {
            self.cache.put_bytes(&key, Arc::new(bytes));
        }
        Ok(decoded)
    }
}
