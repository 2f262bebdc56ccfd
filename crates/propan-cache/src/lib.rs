//! # Propan Cache
//!
//! Named cache namespaces mapping request keys to response snapshots.
//!
//! ## Architecture
//!
//! ```text
//! CacheStore (caches)
//!     ├── "propan-static-v1"   (precache, versioned)
//!     │       └── CacheKey → CacheEntry
//!     └── "propan-runtime"     (runtime, trimmed by EvictionPolicy)
//!             └── CacheKey → CacheEntry
//! ```
//!
//! Two backends implement [`CacheStore`]: [`MemoryCacheStore`] and the durable
//! [`SqliteCacheStore`]. Both guarantee per-key atomicity; only
//! [`CacheStore::put_all`] spans several keys.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use http::Method;
use propan_net::{Request, ResponseSnapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryCacheStore;
pub use sqlite::SqliteCacheStore;

// ==================== Errors ====================

/// Errors raised by a cache store.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache storage unavailable: {0}")]
    Unavailable(String),

    #[error("Quota exceeded: needed {needed} bytes, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    #[error("Cache namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// ==================== Keys & Entries ====================

/// Normalized request identity: upper-cased method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    method: String,
    url: String,
}

impl CacheKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_ascii_uppercase(),
            url: url.to_string(),
        }
    }

    /// Key for a plain GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    pub fn for_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Single-string form used as the storage key (`"GET https://…"`).
    pub fn storage_key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }

    pub fn parse_storage_key(raw: &str) -> Option<Self> {
        let (method, url) = raw.split_once(' ')?;
        if method.is_empty() || url.is_empty() {
            return None;
        }
        Some(Self {
            method: method.to_string(),
            url: url.to_string(),
        })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub response: ResponseSnapshot,
    pub cached_at: DateTime<Utc>,
}

/// Handle to an opened namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheHandle {
    name: String,
}

impl CacheHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// ==================== Eviction ====================

/// Bounds applied to a namespace by [`CacheStore::trim`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionPolicy {
    /// Keep at most this many entries, dropping the oldest first.
    pub max_entries: Option<usize>,
    /// Drop entries stored longer ago than this.
    pub max_age_secs: Option<u64>,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            max_entries: Some(200),
            max_age_secs: Some(7 * 24 * 60 * 60),
        }
    }
}

impl EvictionPolicy {
    /// A policy that never evicts anything.
    pub fn unbounded() -> Self {
        Self {
            max_entries: None,
            max_age_secs: None,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_entries.is_none() && self.max_age_secs.is_none()
    }

    /// Pick the keys to evict.
    ///
    /// `entries` holds `(key, cached_at, insertion_seq)`; the sequence breaks
    /// ties between entries stored within the same millisecond.
    pub fn select_evictions(
        &self,
        entries: &[(CacheKey, DateTime<Utc>, u64)],
        now: DateTime<Utc>,
    ) -> Vec<CacheKey> {
        let mut ordered: Vec<&(CacheKey, DateTime<Utc>, u64)> = entries.iter().collect();
        ordered.sort_by(|a, b| (a.1, a.2).cmp(&(b.1, b.2)));

        let cutoff = self
            .max_age_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| now - ChronoDuration::seconds(secs));

        let (expired, live): (Vec<_>, Vec<_>) = ordered
            .into_iter()
            .partition(|(_, cached_at, _)| cutoff.is_some_and(|c| *cached_at < c));

        let overflow = self
            .max_entries
            .map(|max| live.len().saturating_sub(max))
            .unwrap_or(0);

        expired
            .into_iter()
            .chain(live.into_iter().take(overflow))
            .map(|(key, _, _)| key.clone())
            .collect()
    }
}

// ==================== Store Contract ====================

/// Asynchronous, concurrency-safe cache storage.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Open a namespace, creating it if it does not exist.
    async fn open(&self, name: &str) -> CacheResult<CacheHandle>;

    /// Look up a key in one namespace.
    async fn match_entry(
        &self,
        handle: &CacheHandle,
        key: &CacheKey,
    ) -> CacheResult<Option<CacheEntry>>;

    /// Look up a key across all namespaces, oldest namespace first.
    async fn match_any(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>>;

    /// Store a snapshot, replacing any entry with the same key.
    async fn put(
        &self,
        handle: &CacheHandle,
        key: CacheKey,
        response: ResponseSnapshot,
    ) -> CacheResult<()>;

    /// Store several snapshots; either all are written or none are.
    async fn put_all(
        &self,
        handle: &CacheHandle,
        entries: Vec<(CacheKey, ResponseSnapshot)>,
    ) -> CacheResult<()>;

    async fn delete(&self, handle: &CacheHandle, key: &CacheKey) -> CacheResult<bool>;

    /// Keys in insertion order.
    async fn keys(&self, handle: &CacheHandle) -> CacheResult<Vec<CacheKey>>;

    async fn list_namespaces(&self) -> CacheResult<BTreeSet<String>>;

    async fn has_namespace(&self, name: &str) -> CacheResult<bool>;

    async fn delete_namespace(&self, name: &str) -> CacheResult<bool>;

    /// Apply an eviction policy to one namespace, returning how many entries went.
    async fn trim(&self, handle: &CacheHandle, policy: &EvictionPolicy) -> CacheResult<usize>;

    /// Delete every namespace. Returns the names that were removed.
    async fn clear_all(&self) -> CacheResult<Vec<String>> {
        let mut deleted = Vec::new();
        for name in self.list_namespaces().await? {
            if self.delete_namespace(&name).await? {
                deleted.push(name);
            }
        }
        Ok(deleted)
    }
}
