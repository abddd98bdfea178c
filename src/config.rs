//! Configuration loaded from the environment at startup.
//!
//! All knobs are read once in [`Config::from_env`] and threaded through
//! constructors; nothing reads the environment after startup. A missing
//! mandatory variable is a [`AppError::ConfigurationMissing`] startup
//! failure.

use crate::error::{AppError, AppResult};
use url::Url;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the GitLab instance (no trailing slash).
    pub gitlab_url: String,
    /// `namespace/path` of the project holding the catalogue index files.
    pub catalogue_project: String,
    /// Catalogue index file names; the first entry is the primary file and
    /// must be fetchable, the rest are optional extras.
    pub index_files: Vec<String>,
    /// Name of the JSON field inside each catalogue entry that holds the
    /// clone URL. Historically called a "namespace" in the environment.
    pub clone_url_field: String,
    /// Optional public host override used when generating download URLs.
    pub public_host: Option<String>,
    /// Listen address for the HTTP server.
    pub listen_addr: String,
}

impl Config {
    /// Read configuration from process environment variables.
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through an injectable lookup function.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let gitlab_url = require(&lookup, "GITLAB_URL")?;
        let catalogue_project = require(&lookup, "GITLAB_REPO_NAME")?;
        let primary_file = require(&lookup, "GITLAB_REPO_FILE")?;
        let clone_url_field = require(&lookup, "GITLAB_FILE_NAMESPACE")?;

        Url::parse(&gitlab_url)
            .map_err(|e| AppError::Transport(format!("invalid GITLAB_URL {gitlab_url}: {e}")))?;

        let mut index_files = vec![primary_file];
        if let Some(extra) = lookup("GITLAB_REPO_FILE_EXTRA_LIST") {
            for name in extra.split(',') {
                let name = name.trim();
                if !name.is_empty() {
                    index_files.push(name.to_string());
                }
            }
        }

        let public_host = lookup("PAVLIK_PUBLIC_HOST")
            .map(|host| host.trim_end_matches('/').to_string())
            .filter(|host| !host.is_empty());

        let listen_addr = lookup("PAVLIK_LISTEN")
            .filter(|addr| !addr.is_empty())
            .unwrap_or_else(|| "0.0.0.0:4000".to_string());

        Ok(Self {
            gitlab_url: gitlab_url.trim_end_matches('/').to_string(),
            catalogue_project,
            index_files,
            clone_url_field,
            public_host,
            listen_addr,
        })
    }
}

fn require<F>(lookup: &F, name: &'static str) -> AppResult<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .filter(|value| !value.is_empty())
        .ok_or(AppError::ConfigurationMissing(name))
}
