//! Durable cache store on SQLite.
//!
//! Every operation runs on the blocking pool so the async contract of
//! [`CacheStore`] holds even though `rusqlite` is synchronous.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use propan_net::{ResponseSnapshot, ResponseType};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::{
    CacheEntry, CacheError, CacheHandle, CacheKey, CacheResult, CacheStore, EvictionPolicy,
};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version INTEGER NOT NULL,
    applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS namespaces (
    name TEXT PRIMARY KEY,
    created_seq INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    namespace TEXT NOT NULL REFERENCES namespaces(name) ON DELETE CASCADE,
    cache_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    response TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at INTEGER NOT NULL,
    UNIQUE (namespace, cache_key)
);

CREATE INDEX IF NOT EXISTS idx_entries_key ON entries(cache_key);
CREATE INDEX IF NOT EXISTS idx_entries_cached ON entries(namespace, cached_at);
"#;

/// Response metadata stored as JSON next to the body blob.
#[derive(Debug, Serialize, Deserialize)]
struct StoredMeta {
    url: Url,
    status: u16,
    status_text: String,
    headers: Vec<(String, String)>,
    response_type: ResponseType,
    redirected: bool,
}

impl StoredMeta {
    fn split(snapshot: ResponseSnapshot) -> (Self, Bytes) {
        let ResponseSnapshot {
            url,
            status,
            status_text,
            headers,
            body,
            response_type,
            redirected,
        } = snapshot;
        (
            Self {
                url,
                status,
                status_text,
                headers,
                response_type,
                redirected,
            },
            body,
        )
    }

    fn join(self, body: Vec<u8>) -> ResponseSnapshot {
        ResponseSnapshot {
            url: self.url,
            status: self.status,
            status_text: self.status_text,
            headers: self.headers,
            body: Bytes::from(body),
            response_type: self.response_type,
            redirected: self.redirected,
        }
    }
}

/// SQLite-backed [`CacheStore`].
#[derive(Clone)]
pub struct SqliteCacheStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCacheStore {
    /// Open (or create) the cache database at `path`.
    pub fn open(path: &Path) -> CacheResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CacheError::Unavailable(format!(
                        "failed to create cache directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened cache database");
        Self::init(conn)
    }

    /// A private, non-durable database. Useful for hosts without a data dir.
    pub fn open_in_memory() -> CacheResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> CacheResult<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> CacheResult<T>
    where
        F: FnOnce(&mut Connection) -> CacheResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| CacheError::LockPoisoned)?;
            op(&mut guard)
        })
        .await
        .map_err(|e| CacheError::Unavailable(e.to_string()))?
    }
}

/// Run database migrations
fn migrate(conn: &Connection) -> CacheResult<()> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i32>(0).map(|count| count > 0),
        )
        .unwrap_or(false);

    let version: i32 = if table_exists {
        conn.query_row(
            "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0)
    } else {
        0
    };

    if version < SCHEMA_VERSION {
        conn.execute_batch(SCHEMA_V1)?;
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
            params![SCHEMA_VERSION, Utc::now().timestamp()],
        )?;
        debug!(from = version, to = SCHEMA_VERSION, "Migrated cache schema");
    }

    Ok(())
}

fn namespace_exists(conn: &Connection, name: &str) -> CacheResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM namespaces WHERE name = ?",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn row_to_entry(
    cache_key: String,
    response: String,
    body: Vec<u8>,
    cached_at: i64,
) -> CacheResult<CacheEntry> {
    let key = CacheKey::parse_storage_key(&cache_key)
        .ok_or_else(|| CacheError::Unavailable(format!("corrupt cache key `{cache_key}`")))?;
    let meta: StoredMeta = serde_json::from_str(&response)?;
    let cached_at = DateTime::<Utc>::from_timestamp_millis(cached_at).unwrap_or_default();
    Ok(CacheEntry {
        key,
        response: meta.join(body),
        cached_at,
    })
}

fn insert_entry(
    conn: &Connection,
    namespace: &str,
    key: &CacheKey,
    snapshot: ResponseSnapshot,
    cached_at: i64,
) -> CacheResult<()> {
    let (meta, body) = StoredMeta::split(snapshot);
    let response = serde_json::to_string(&meta)?;
    conn.execute(
        "INSERT OR REPLACE INTO entries (namespace, cache_key, method, url, response, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
            namespace,
            key.storage_key(),
            key.method(),
            key.url(),
            response,
            body.as_ref(),
            cached_at
        ],
    )?;
    Ok(())
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn open(&self, name: &str) -> CacheResult<CacheHandle> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO namespaces (name, created_seq)
                 VALUES (?, (SELECT COALESCE(MAX(created_seq), 0) + 1 FROM namespaces))",
                params![name],
            )?;
            if inserted > 0 {
                debug!(namespace = %name, "Created cache namespace");
            }
            Ok(CacheHandle::new(name))
        })
        .await
    }

    async fn match_entry(
        &self,
        handle: &CacheHandle,
        key: &CacheKey,
    ) -> CacheResult<Option<CacheEntry>> {
        let namespace = handle.name().to_string();
        let storage_key = key.storage_key();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT cache_key, response, body, cached_at FROM entries
                     WHERE namespace = ? AND cache_key = ?",
                    params![namespace, storage_key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(k, r, b, c)| row_to_entry(k, r, b, c)).transpose()
        })
        .await
    }

    async fn match_any(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        let storage_key = key.storage_key();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT e.cache_key, e.response, e.body, e.cached_at
                     FROM entries e JOIN namespaces n ON n.name = e.namespace
                     WHERE e.cache_key = ?
                     ORDER BY n.created_seq ASC
                     LIMIT 1",
                    params![storage_key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(k, r, b, c)| row_to_entry(k, r, b, c)).transpose()
        })
        .await
    }

    async fn put(
        &self,
        handle: &CacheHandle,
        key: CacheKey,
        response: ResponseSnapshot,
    ) -> CacheResult<()> {
        self.put_all(handle, vec![(key, response)]).await
    }

    async fn put_all(
        &self,
        handle: &CacheHandle,
        entries: Vec<(CacheKey, ResponseSnapshot)>,
    ) -> CacheResult<()> {
        let namespace = handle.name().to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            if !namespace_exists(&tx, &namespace)? {
                return Err(CacheError::NamespaceNotFound(namespace));
            }
            let cached_at = Utc::now().timestamp_millis();
            for (key, snapshot) in entries {
                insert_entry(&tx, &namespace, &key, snapshot, cached_at)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, handle: &CacheHandle, key: &CacheKey) -> CacheResult<bool> {
        let namespace = handle.name().to_string();
        let storage_key = key.storage_key();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM entries WHERE namespace = ? AND cache_key = ?",
                params![namespace, storage_key],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn keys(&self, handle: &CacheHandle) -> CacheResult<Vec<CacheKey>> {
        let namespace = handle.name().to_string();
        self.with_conn(move |conn| {
            if !namespace_exists(conn, &namespace)? {
                return Err(CacheError::NamespaceNotFound(namespace));
            }
            let mut stmt =
                conn.prepare("SELECT cache_key FROM entries WHERE namespace = ? ORDER BY id ASC")?;
            let raw = stmt
                .query_map(params![namespace], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(raw
                .iter()
                .filter_map(|k| CacheKey::parse_storage_key(k))
                .collect())
        })
        .await
    }

    async fn list_namespaces(&self) -> CacheResult<BTreeSet<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM namespaces")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<BTreeSet<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn has_namespace(&self, name: &str) -> CacheResult<bool> {
        let name = name.to_string();
        self.with_conn(move |conn| namespace_exists(conn, &name)).await
    }

    async fn delete_namespace(&self, name: &str) -> CacheResult<bool> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM namespaces WHERE name = ?", params![name])?;
            if removed > 0 {
                debug!(namespace = %name, "Deleted cache namespace");
            }
            Ok(removed > 0)
        })
        .await
    }

    async fn trim(&self, handle: &CacheHandle, policy: &EvictionPolicy) -> CacheResult<usize> {
        if policy.is_unbounded() {
            return Ok(0);
        }

        let namespace = handle.name().to_string();
        let policy = policy.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let candidates = {
                let mut stmt = tx.prepare(
                    "SELECT cache_key, cached_at, id FROM entries WHERE namespace = ?",
                )?;
                let rows = stmt
                    .query_map(params![namespace], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .filter_map(|(k, cached_at, id)| {
                        let key = CacheKey::parse_storage_key(&k)?;
                        let cached_at = DateTime::<Utc>::from_timestamp_millis(cached_at)?;
                        Some((key, cached_at, u64::try_from(id).ok()?))
                    })
                    .collect::<Vec<_>>()
            };

            let evicted = policy.select_evictions(&candidates, Utc::now());
            for key in &evicted {
                tx.execute(
                    "DELETE FROM entries WHERE namespace = ? AND cache_key = ?",
                    params![namespace, key.storage_key()],
                )?;
            }
            tx.commit()?;

            if !evicted.is_empty() {
                debug!(namespace = %namespace, evicted = evicted.len(), "Trimmed namespace");
            }
            Ok(evicted.len())
        })
        .await
    }
}
