//! Registry views: shared helpers for the npm and composer forms.

pub mod composer;
pub mod npm;

use crate::config::Config;
use crate::JsonMap;
use axum::http::{header, HeaderMap};
use semver::Version;
use serde_json::Value;

/// Parse a tag name as a release version, stripping one leading `v`.
/// Tags that do not parse as semantic versions carry no release.
pub fn normalize_release(tag_name: &str) -> Option<Version> {
    let trimmed = tag_name.strip_prefix('v').unwrap_or(tag_name);
    Version::parse(trimmed).ok()
}

/// Base URL that download links point back at. A configured public host
/// wins; otherwise the URL is derived from the incoming request, with
/// `http` and `localhost` as the fallbacks.
pub fn public_base_url(config: &Config, headers: &HeaderMap) -> String {
    if let Some(host) = &config.public_host {
        return host.clone();
    }

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.trim_end_matches('/'))
        .filter(|h| !h.is_empty())
        .unwrap_or("localhost");
    format!("http://{host}")
}

/// String field of a manifest, empty when absent or of another type.
pub(crate) fn manifest_str(manifest: &JsonMap, key: &str) -> String {
    manifest
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Object field of a manifest, preserved opaquely.
pub(crate) fn manifest_map(manifest: &JsonMap, key: &str) -> Option<JsonMap> {
    manifest.get(key).and_then(Value::as_object).cloned()
}

/// Array field of a manifest, preserved opaquely.
pub(crate) fn manifest_list(manifest: &JsonMap, key: &str) -> Option<Vec<Value>> {
    manifest.get(key).and_then(Value::as_array).cloned()
}
