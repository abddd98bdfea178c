//! Private package registry backed by a GitLab instance.
//!
//! Presents the caller-visible slice of a GitLab instance as an npm
//! registry and a composer registry. The caller's token is the only
//! authorization mechanism: every request reaches through to GitLab with
//! it, so the visible package set always matches the repositories the
//! caller can read.
//!
//! ## Key modules
//!
//! - [`gitlab`]: versioned upstream API client
//! - [`catalogue`]: the curated index declaring which repositories are packages
//! - [`repack`]: deterministic archive normalisation
//! - [`cache`]: the process-wide assembly cache
//! - [`registry`]: the npm and composer views
//! - [`server`]: HTTP surface

pub mod auth;
pub mod cache;
pub mod catalogue;
pub mod config;
pub mod error;
pub mod gitlab;
pub mod registry;
pub mod repack;
pub mod server;
pub mod session;
pub mod state;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use server::{build_router, run};
pub use state::AppState;

/// Untyped JSON object; manifests and catalogue records are handled as
/// these, with recognised fields extracted and the rest preserved opaquely.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// SHA-1 of `data` as lowercase hex. npm publishes this digest in the
/// `dist.shasum` field and clients verify downloads against it.
pub fn sha1_hex(data: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
