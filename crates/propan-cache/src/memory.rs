//! In-process cache store.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use hashbrown::HashMap;
use propan_net::ResponseSnapshot;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::{
    CacheEntry, CacheError, CacheHandle, CacheKey, CacheResult, CacheStore, EvictionPolicy,
};

#[derive(Debug)]
struct StoredEntry {
    entry: CacheEntry,
    seq: u64,
}

#[derive(Debug)]
struct Namespace {
    created_seq: u64,
    entries: HashMap<CacheKey, StoredEntry>,
}

impl Namespace {
    fn used_bytes(&self) -> usize {
        self.entries
            .values()
            .map(|e| e.entry.response.size_hint())
            .sum()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    namespaces: HashMap<String, Namespace>,
    next_seq: u64,
    used_bytes: usize,
}

impl MemoryState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Cache store kept in memory, optionally bounded by a byte quota.
///
/// Cloning shares the same underlying storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStore {
    state: Arc<RwLock<MemoryState>>,
    quota_bytes: Option<usize>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that rejects writes once `quota_bytes` would be exceeded.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// Bytes currently accounted against the quota.
    pub async fn used_bytes(&self) -> usize {
        self.state.read().await.used_bytes
    }

    fn check_quota(&self, used: usize, freed: usize, added: usize) -> CacheResult<()> {
        if let Some(quota) = self.quota_bytes {
            let after = used.saturating_sub(freed) + added;
            if after > quota {
                return Err(CacheError::QuotaExceeded {
                    needed: added,
                    available: quota.saturating_sub(used.saturating_sub(freed)),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn open(&self, name: &str) -> CacheResult<CacheHandle> {
        let mut state = self.state.write().await;
        if !state.namespaces.contains_key(name) {
            let created_seq = state.next_seq();
            state.namespaces.insert(
                name.to_string(),
                Namespace {
                    created_seq,
                    entries: HashMap::new(),
                },
            );
            debug!(namespace = name, "Created cache namespace");
        }
        Ok(CacheHandle::new(name))
    }

    async fn match_entry(
        &self,
        handle: &CacheHandle,
        key: &CacheKey,
    ) -> CacheResult<Option<CacheEntry>> {
        let state = self.state.read().await;
        Ok(state
            .namespaces
            .get(handle.name())
            .and_then(|ns| ns.entries.get(key))
            .map(|stored| stored.entry.clone()))
    }

    async fn match_any(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        let state = self.state.read().await;
        let mut namespaces: Vec<&Namespace> = state.namespaces.values().collect();
        namespaces.sort_by_key(|ns| ns.created_seq);

        Ok(namespaces
            .into_iter()
            .find_map(|ns| ns.entries.get(key))
            .map(|stored| stored.entry.clone()))
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
        let mut state = self.state.write().await;
        let used = state.used_bytes;

        let namespace = state
            .namespaces
            .get(handle.name())
            .ok_or_else(|| CacheError::NamespaceNotFound(handle.name().to_string()))?;

        let freed: usize = entries
            .iter()
            .filter_map(|(key, _)| namespace.entries.get(key))
            .map(|stored| stored.entry.response.size_hint())
            .sum();
        let added: usize = entries.iter().map(|(_, r)| r.size_hint()).sum();
        self.check_quota(used, freed, added)?;

        let now = Utc::now();
        let mut stored = Vec::with_capacity(entries.len());
        for (key, response) in entries {
            let seq = state.next_seq();
            stored.push(StoredEntry {
                entry: CacheEntry {
                    key,
                    response,
                    cached_at: now,
                },
                seq,
            });
        }

        let namespace = state
            .namespaces
            .get_mut(handle.name())
            .ok_or_else(|| CacheError::NamespaceNotFound(handle.name().to_string()))?;
        for item in stored {
            trace!(namespace = handle.name(), key = %item.entry.key, "Cache put");
            namespace.entries.insert(item.entry.key.clone(), item);
        }

        state.used_bytes = used.saturating_sub(freed) + added;
        Ok(())
    }

    async fn delete(&self, handle: &CacheHandle, key: &CacheKey) -> CacheResult<bool> {
        let mut state = self.state.write().await;
        let removed = state
            .namespaces
            .get_mut(handle.name())
            .and_then(|ns| ns.entries.remove(key));

        match removed {
            Some(stored) => {
                state.used_bytes = state
                    .used_bytes
                    .saturating_sub(stored.entry.response.size_hint());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self, handle: &CacheHandle) -> CacheResult<Vec<CacheKey>> {
        let state = self.state.read().await;
        let namespace = state
            .namespaces
            .get(handle.name())
            .ok_or_else(|| CacheError::NamespaceNotFound(handle.name().to_string()))?;

        let mut stored: Vec<&StoredEntry> = namespace.entries.values().collect();
        stored.sort_by_key(|s| s.seq);
        Ok(stored.into_iter().map(|s| s.entry.key.clone()).collect())
    }

    async fn list_namespaces(&self) -> CacheResult<BTreeSet<String>> {
        let state = self.state.read().await;
        Ok(state.namespaces.keys().cloned().collect())
    }

    async fn has_namespace(&self, name: &str) -> CacheResult<bool> {
        Ok(self.state.read().await.namespaces.contains_key(name))
    }

    async fn delete_namespace(&self, name: &str) -> CacheResult<bool> {
        let mut state = self.state.write().await;
        match state.namespaces.remove(name) {
            Some(namespace) => {
                state.used_bytes = state.used_bytes.saturating_sub(namespace.used_bytes());
                debug!(namespace = name, "Deleted cache namespace");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn trim(&self, handle: &CacheHandle, policy: &EvictionPolicy) -> CacheResult<usize> {
        if policy.is_unbounded() {
            return Ok(0);
        }

        let mut state = self.state.write().await;
        let Some(namespace) = state.namespaces.get_mut(handle.name()) else {
            return Ok(0);
        };

        let candidates: Vec<_> = namespace
            .entries
            .values()
            .map(|s| (s.entry.key.clone(), s.entry.cached_at, s.seq))
            .collect();
        let evicted = policy.select_evictions(&candidates, Utc::now());

        let mut freed = 0;
        for key in &evicted {
            if let Some(stored) = namespace.entries.remove(key) {
                freed += stored.entry.response.size_hint();
            }
        }
        state.used_bytes = state.used_bytes.saturating_sub(freed);

        if !evicted.is_empty() {
            debug!(namespace = handle.name(), evicted = evicted.len(), "Trimmed namespace");
        }
        Ok(evicted.len())
    }
}
