//! Repository catalogue: the curated index that declares which of the
//! caller-visible repositories are packages.
//!
//! The designated project holds one or more JSON index files, each an array
//! of entries. An entry names a clone URL (under a configurable field), a
//! stable `uuid` used in public URLs and cache keys, and a list of kind
//! labels. Entries are narrowed to the requested kind and then bound to a
//! visible project by matching the clone URL against the project's HTTP and
//! SSH clone URLs; entries the caller cannot see are dropped silently.

use crate::gitlab::Project;
use crate::JsonMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Registry kind: selects the view, the manifest filename and the
/// catalogue label an entry must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Composer,
    Npm,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Composer => "composer",
            Kind::Npm => "npm",
        }
    }

    /// Package-manager manifest file looked up inside each repository.
    pub fn manifest_file(self) -> &'static str {
        match self {
            Kind::Composer => "composer.json",
            Kind::Npm => "package.json",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record of the designated index file.
#[derive(Debug, Clone)]
pub struct CatalogueEntry {
    pub uuid: String,
    pub clone_url: String,
    pub labels: Vec<String>,
}

impl CatalogueEntry {
    pub fn has_kind(&self, kind: Kind) -> bool {
        self.labels.iter().any(|label| label == kind.as_str())
    }
}

/// A catalogue entry bound to a visible project.
#[derive(Debug, Clone)]
pub struct PackageRepo {
    pub entry: CatalogueEntry,
    pub project: Project,
}

/// Decode raw index records into entries. Records missing the `uuid`, the
/// configured clone-url field or the label list are dropped. Older
/// catalogues spell the label list `tag` instead of `tags`; both are
/// accepted, `tags` winning when both are present. Duplicate uuids are kept
/// (first occurrence wins downstream) but logged.
pub fn parse_entries(records: Vec<JsonMap>, clone_url_field: &str) -> Vec<CatalogueEntry> {
    let mut seen_uuids = HashSet::new();
    let mut entries = Vec::with_capacity(records.len());

    for record in records {
        let uuid = record.get("uuid").and_then(Value::as_str);
        let clone_url = record.get(clone_url_field).and_then(Value::as_str);
        let labels = record
            .get("tags")
            .or_else(|| record.get("tag"))
            .and_then(Value::as_array);

        let (Some(uuid), Some(clone_url), Some(labels)) = (uuid, clone_url, labels) else {
            debug!("dropping malformed catalogue entry");
            continue;
        };

        if !seen_uuids.insert(uuid.to_string()) {
            warn!(uuid = %uuid, "duplicate uuid in catalogue");
        }

        entries.push(CatalogueEntry {
            uuid: uuid.to_string(),
            clone_url: clone_url.to_string(),
            labels: labels
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        });
    }

    entries
}

/// Narrow entries to those declaring the requested kind.
pub fn filter_kind(entries: Vec<CatalogueEntry>, kind: Kind) -> Vec<CatalogueEntry> {
    entries
        .into_iter()
        .filter(|entry| entry.has_kind(kind))
        .collect()
}

/// Bind entries to visible projects by clone URL, concurrently across
/// entries. Entries with no matching visible project are dropped with a
/// notice; the caller simply lacks visibility.
pub async fn bind_projects(
    entries: Vec<CatalogueEntry>,
    projects: Arc<Vec<Project>>,
) -> Vec<PackageRepo> {
    let semaphore = Arc::new(Semaphore::new(num_cpus::get()));
    let mut handles = Vec::with_capacity(entries.len());

    for entry in entries {
        let projects = projects.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            let matched = projects
                .iter()
                .find(|p| p.http_url == entry.clone_url || p.ssh_url == entry.clone_url)
                .cloned();
            match matched {
                Some(project) => Some(PackageRepo { entry, project }),
                None => {
                    debug!(source = %entry.clone_url, "no visible project for catalogue entry");
                    None
                }
            }
        }));
    }

    let mut repos = Vec::with_capacity(handles.len());
    for handle in handles {
        if let Ok(Some(repo)) = handle.await {
            repos.push(repo);
        }
    }
    repos
}
