//! Shared application state.

use crate::cache::Cache;
use crate::config::Config;
use crate::error::AppResult;
use crate::gitlab::client::build_http_client;
use std::sync::Arc;

/// State shared by every request handler. The cache is the only shared
/// mutable structure in the process; everything else is read-only after
/// startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<Cache>,
    /// Connection pool shared by all upstream sessions.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config) -> AppResult<Self> {
        Ok(Self {
            config: Arc::new(config),
            cache: Arc::new(Cache::default()),
            http: build_http_client()?,
        })
    }
}
