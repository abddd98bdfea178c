//! Process-wide assembly cache.
//!
//! A single bounded LRU shared by every request handler. Three value kinds
//! live in it, distinguished by their key prefix:
//!
//! | kind | key | policy |
//! |---|---|---|
//! | visible project list | `project_list_<sha256(token)>` | 30-minute TTL |
//! | metadata file bytes | `json_<project_id>_<ref>` | until LRU eviction |
//! | repackaged archive | `archive_<uuid>_<ref>` | until LRU eviction |
//!
//! The ref `master` must never be cached; admission sites guard with an
//! explicit `reference != MASTER_REF` check before calling `put_*`. A value
//! that fails its kind check on retrieval is treated as corruption: the
//! entry is evicted and the lookup reported as a miss.
//!
//! Tokens are hashed before becoming key material so raw credentials are
//! not retained in memory.

use crate::error::AppError;
use crate::gitlab::Project;
use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// The symbolic ref that is never admitted into the cache.
pub const MASTER_REF: &str = "master";

/// Lifetime of a cached per-token project list.
pub const PROJECT_LIST_TTL_MINUTES: i64 = 30;

const CAPACITY: usize = 2048;

/// Cached per-token project list with its expiry instant.
#[derive(Clone)]
pub struct ProjectListEntry {
    pub expires_at: DateTime<Utc>,
    pub projects: Arc<Vec<Project>>,
}

enum Entry {
    Projects(ProjectListEntry),
    Bytes(Arc<Vec<u8>>),
}

/// Bounded LRU over all cacheable value kinds.
pub struct Cache {
    inner: Mutex<LruCache<String, Entry>>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(CAPACITY)
    }
}

impl Cache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn project_list_key(token: &str) -> String {
        format!("project_list_{:x}", Sha256::digest(token.as_bytes()))
    }

    pub fn metadata_key(project_id: u64, reference: &str) -> String {
        format!("json_{project_id}_{reference}")
    }

    pub fn archive_key(uuid: &str, reference: &str) -> String {
        format!("archive_{uuid}_{reference}")
    }

    /// Fresh project list for the key, if any. Stale and corrupt entries
    /// are evicted and reported as misses.
    pub fn get_project_list(&self, key: &str) -> Option<ProjectListEntry> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(key) {
            Some(Entry::Projects(entry)) => {
                if entry.expires_at <= Utc::now() {
                    inner.pop(key);
                    return None;
                }
                Some(entry.clone())
            }
            Some(Entry::Bytes(_)) => {
                let err = AppError::CacheCorruption(key.to_string());
                warn!(error = %err, "evicting entry, expected project list");
                inner.pop(key);
                None
            }
            None => None,
        }
    }

    /// Project list entry regardless of freshness; stale entries are
    /// evicted but their expiry is still returned for display.
    pub fn project_list_status(&self, key: &str) -> (Arc<Vec<Project>>, Option<DateTime<Utc>>) {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(key) {
            Some(Entry::Projects(entry)) => {
                let expires_at = entry.expires_at;
                if expires_at <= Utc::now() {
                    inner.pop(key);
                    (Arc::new(Vec::new()), Some(expires_at))
                } else {
                    (entry.projects.clone(), Some(expires_at))
                }
            }
            _ => (Arc::new(Vec::new()), None),
        }
    }

    pub fn put_project_list(&self, key: &str, projects: Arc<Vec<Project>>) {
        let entry = ProjectListEntry {
            expires_at: Utc::now() + Duration::minutes(PROJECT_LIST_TTL_MINUTES),
            projects,
        };
        self.inner
            .lock()
            .unwrap()
            .put(key.to_string(), Entry::Projects(entry));
    }

    /// Byte value for the key, if present and of the right kind.
    pub fn get_bytes(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(key) {
            Some(Entry::Bytes(bytes)) => Some(bytes.clone()),
            Some(Entry::Projects(_)) => {
                let err = AppError::CacheCorruption(key.to_string());
                warn!(error = %err, "evicting entry, expected bytes");
                inner.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put_bytes(&self, key: &str, bytes: Arc<Vec<u8>>) {
        self.inner
            .lock()
            .unwrap()
            .put(key.to_string(), Entry::Bytes(bytes));
    }

    pub fn remove(&self, key: &str) {
        self.inner.lock().unwrap().pop(key);
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    /// Presence check that does not touch recency. Used by tests and the
    /// status view.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().unwrap().peek(key).is_some()
    }
}
