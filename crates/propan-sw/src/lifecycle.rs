//! Lifecycle Manager: install populates the precache, activate prunes stale
//! generations and claims open clients.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::try_join_all;
use propan_cache::{CacheError, CacheKey, CacheStore};
use propan_net::{Fetcher, Request};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::clients::ClientRegistry;
use crate::config::WorkerConfig;
use crate::registration::{Registration, RegistrationEvent};

/// Errors raised by install and activate.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Precache asset {path} unavailable: {reason}")]
    PrecacheAssetMissing { path: String, reason: String },

    #[error("Invalid lifecycle state: expected {expected}, found {actual}")]
    InvalidState {
        expected: LifecycleState,
        actual: LifecycleState,
    },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Invalid manifest path {path}: {reason}")]
    InvalidManifestPath { path: String, reason: String },
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Registered, nothing run yet.
    #[default]
    Parsed,
    Installing,
    /// Precache committed; waiting to activate.
    Installed,
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Install failed or replaced.
    Redundant,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Parsed => "parsed",
            LifecycleState::Installing => "installing",
            LifecycleState::Installed => "installed",
            LifecycleState::Activating => "activating",
            LifecycleState::Activated => "activated",
            LifecycleState::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

/// How an install call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The precache was committed and the worker is `Installed`.
    Installed,
    /// The worker was already active. The precache was rewritten in place and
    /// the worker stays `Activated`.
    Refreshed,
}

/// What an activation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
    /// Stale namespaces that were deleted.
    pub deleted_namespaces: Vec<String>,
    /// Clients newly controlled by this worker.
    pub claimed_clients: usize,
}

/// Runs install and activate for one worker version.
pub struct LifecycleManager {
    config: Arc<WorkerConfig>,
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<ClientRegistry>,
    registration: Registration,
    state: RwLock<LifecycleState>,
    skip_waiting: AtomicBool,
    navigation_preload: AtomicBool,
}

impl LifecycleManager {
    pub fn new(
        config: Arc<WorkerConfig>,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        clients: Arc<ClientRegistry>,
        registration: Registration,
    ) -> Self {
        Self {
            config,
            store,
            fetcher,
            clients,
            registration,
            state: RwLock::new(LifecycleState::Parsed),
            skip_waiting: AtomicBool::new(false),
            navigation_preload: AtomicBool::new(false),
        }
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.read().await
    }

    /// Request activation without waiting for old clients to close.
    pub fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    pub fn is_skipping_waiting(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    pub fn navigation_preload_enabled(&self) -> bool {
        self.navigation_preload.load(Ordering::SeqCst)
    }

    async fn set_state(&self, state: LifecycleState) {
        *self.state.write().await = state;
        info!(state = %state, version = %self.config.version, "Lifecycle state changed");
        self.registration
            .publish(RegistrationEvent::StateChange { state });
    }

    /// Move from any of `allowed` to `next` under one write lock.
    async fn transition(
        &self,
        allowed: &[LifecycleState],
        expected: LifecycleState,
        next: LifecycleState,
    ) -> Result<(), LifecycleError> {
        {
            let mut state = self.state.write().await;
            if !allowed.contains(&*state) {
                return Err(LifecycleError::InvalidState {
                    expected,
                    actual: *state,
                });
            }
            *state = next;
        }
        info!(state = %next, version = %self.config.version, "Lifecycle state changed");
        self.registration
            .publish(RegistrationEvent::StateChange { state: next });
        Ok(())
    }

    /// Fetch every manifest asset and commit them to the precache in one batch.
    ///
    /// A failed asset leaves the worker `Redundant` and the precache untouched.
    /// Install may be retried. Installing an active worker again rewrites the
    /// same precache keys and leaves it active.
    pub async fn install(&self) -> Result<InstallOutcome, LifecycleError> {
        if self.state().await == LifecycleState::Activated {
            let count = self.precache().await.map_err(|e| {
                warn!(error = %e, "Precache refresh failed, keeping active precache");
                e
            })?;
            info!(namespace = %self.config.precache_name(), assets = count, "Precache refreshed");
            return Ok(InstallOutcome::Refreshed);
        }

        self.transition(
            &[
                LifecycleState::Parsed,
                LifecycleState::Installed,
                LifecycleState::Redundant,
            ],
            LifecycleState::Parsed,
            LifecycleState::Installing,
        )
        .await?;

        match self.precache().await {
            Ok(count) => {
                info!(namespace = %self.config.precache_name(), assets = count, "Precache populated");
                if self.config.skip_waiting_on_install {
                    self.skip_waiting();
                }
                self.set_state(LifecycleState::Installed).await;
                Ok(InstallOutcome::Installed)
            }
            Err(e) => {
                warn!(error = %e, "Install failed");
                self.set_state(LifecycleState::Redundant).await;
                Err(e)
            }
        }
    }

    async fn precache(&self) -> Result<usize, LifecycleError> {
        let requests = self
            .config
            .precache_manifest
            .iter()
            .map(|path| {
                self.config
                    .resolve(path)
                    .map(|url| (path.as_str(), Request::get(url)))
                    .map_err(|e| LifecycleError::InvalidManifestPath {
                        path: path.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let fetcher = &self.fetcher;
        let entries = try_join_all(requests.into_iter().map(|(path, request)| async move {
            let missing = |reason: String| LifecycleError::PrecacheAssetMissing {
                path: path.to_string(),
                reason,
            };

            let response = fetcher
                .fetch(&request)
                .await
                .map_err(|e| missing(e.to_string()))?;
            if !response.ok() {
                return Err(missing(format!("status {}", response.status)));
            }
            let snapshot = response
                .into_snapshot()
                .await
                .map_err(|e| missing(e.to_string()))?;

            debug!(path, bytes = snapshot.body.len(), "Fetched precache asset");
            Ok::<_, LifecycleError>((CacheKey::for_request(&request), snapshot))
        }))
        .await?;

        let count = entries.len();
        let handle = self.store.open(&self.config.precache_name()).await?;
        self.store.put_all(&handle, entries).await?;
        Ok(count)
    }

    /// Delete stale generations and claim open clients.
    pub async fn activate(&self) -> Result<ActivateReport, LifecycleError> {
        self.transition(
            &[LifecycleState::Installed],
            LifecycleState::Installed,
            LifecycleState::Activating,
        )
        .await?;

        let deleted_namespaces = match self.prune_namespaces().await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(error = %e, "Activation failed, staying installed");
                self.set_state(LifecycleState::Installed).await;
                return Err(e);
            }
        };

        if self.config.navigation_preload {
            self.navigation_preload.store(true, Ordering::SeqCst);
            debug!("Navigation preload enabled");
        }

        let claimed = self
            .clients
            .claim(|url| self.registration.in_scope(url))
            .await;
        for client_id in &claimed {
            self.registration.publish(RegistrationEvent::ControllerChange {
                client_id: client_id.clone(),
            });
        }

        self.set_state(LifecycleState::Activated).await;

        Ok(ActivateReport {
            deleted_namespaces,
            claimed_clients: claimed.len(),
        })
    }

    async fn prune_namespaces(&self) -> Result<Vec<String>, LifecycleError> {
        let keep: BTreeSet<String> = [self.config.precache_name(), self.config.runtime_name()]
            .into_iter()
            .collect();

        let mut deleted = Vec::new();
        for name in self.store.list_namespaces().await? {
            if keep.contains(&name) {
                continue;
            }
            if self.store.delete_namespace(&name).await? {
                info!(namespace = %name, "Deleted stale cache");
                deleted.push(name);
            }
        }
        Ok(deleted)
    }
}
