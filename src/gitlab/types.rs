//! Wire structures of the GitLab REST API, shared by the v3 and v4 dialects.

use serde::{Deserialize, Serialize};

/// A repository visible to the caller's token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: u64,
    pub name: String,
    pub path_with_namespace: String,
    #[serde(rename = "ssh_url_to_repo")]
    pub ssh_url: String,
    #[serde(rename = "http_url_to_repo")]
    pub http_url: String,
    pub web_url: String,
    #[serde(default)]
    pub tag_list: Vec<String>,
}

/// A named release on a project. The commit id, not the tag name, is the
/// canonical ref for caching; tag names are mutable upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub commit: Commit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
}

/// Response of the repository-file endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoFile {
    pub content: String,
    pub encoding: String,
}
