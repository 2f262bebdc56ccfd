//! The worker: one entry point for every host event.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use propan_cache::CacheStore;
use propan_net::{Fetcher, Response};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::channel::{ControlChannel, ControlOutcome, MessageEvent};
use crate::clients::{ClientRegistry, ClientType};
use crate::config::{ConfigError, WorkerConfig};
use crate::lifecycle::{
    ActivateReport, InstallOutcome, LifecycleError, LifecycleManager, LifecycleState,
};
use crate::notify::{
    LogNotificationSink, Notification, NotificationPermission, NotificationSink, NotifyError,
    PushDispatcher, PushEvent,
};
use crate::policy::{FetchEvent, PolicyEngine};
use crate::registration::{Registration, RegistrationEvent};
use crate::sync::{SyncDispatcher, SyncEvent, SyncOutcome};

/// Top-level worker errors.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Event aborted")]
    Aborted,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),
}

/// Events the host delivers to the worker.
#[derive(Debug)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(FetchEvent),
    Message(MessageEvent),
    Push(PushEvent),
    Sync(SyncEvent),
}

impl WorkerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::Install => "install",
            WorkerEvent::Activate => "activate",
            WorkerEvent::Fetch(_) => "fetch",
            WorkerEvent::Message(_) => "message",
            WorkerEvent::Push(_) => "push",
            WorkerEvent::Sync(_) => "sync",
        }
    }
}

/// Result of a dispatched event.
#[derive(Debug)]
pub enum EventOutcome {
    /// Install finished. Carries the activation when the worker did not wait.
    Installed { activation: Option<ActivateReport> },
    Activated(ActivateReport),
    Response(Response),
    Message(ControlOutcome),
    Push(Option<Notification>),
    Sync(SyncOutcome),
}

/// Shared in-flight counter behind [`LifetimeGuard`].
#[derive(Debug, Default)]
struct Lifetimes {
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Keeps the worker busy until dropped.
#[derive(Debug)]
pub struct LifetimeGuard {
    lifetimes: Arc<Lifetimes>,
}

impl Drop for LifetimeGuard {
    fn drop(&mut self) {
        if self.lifetimes.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.lifetimes.idle.notify_waiters();
        }
    }
}

/// A dispatched event still running on the runtime.
#[derive(Debug)]
pub struct PendingEvent {
    kind: &'static str,
    handle: JoinHandle<Result<EventOutcome, WorkerError>>,
}

impl PendingEvent {
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Abort the event, as when the originating request is dropped.
    pub fn abort(&self) {
        debug!(kind = self.kind, "Aborting event");
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the event's outcome.
    pub async fn wait(self) -> Result<EventOutcome, WorkerError> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_panic() {
                    error!(kind = self.kind, "Event handler panicked");
                }
                Err(WorkerError::Aborted)
            }
        }
    }
}

struct Inner {
    config: Arc<WorkerConfig>,
    store: Arc<dyn CacheStore>,
    registration: Registration,
    clients: Arc<ClientRegistry>,
    lifecycle: LifecycleManager,
    policy: PolicyEngine,
    control: ControlChannel,
    push: PushDispatcher,
    sync: SyncDispatcher,
    lifetimes: Arc<Lifetimes>,
}

/// A registered offline worker. Cheap to clone.
#[derive(Clone)]
pub struct ServiceWorker {
    inner: Arc<Inner>,
}

impl ServiceWorker {
    /// Register a worker. Notifications go to the log.
    pub fn register(
        config: WorkerConfig,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RegistrationEvent>), WorkerError> {
        Self::register_with_sink(config, store, fetcher, Arc::new(LogNotificationSink))
    }

    /// Register a worker that shows notifications through `sink`.
    pub fn register_with_sink(
        config: WorkerConfig,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RegistrationEvent>), WorkerError> {
        config.validate()?;
        let config = Arc::new(config);
        let (registration, events) = Registration::new(&config)?;
        let clients = Arc::new(ClientRegistry::new());

        let lifecycle = LifecycleManager::new(
            config.clone(),
            store.clone(),
            fetcher.clone(),
            clients.clone(),
            registration.clone(),
        );
        let policy = PolicyEngine::new(config.clone(), store.clone(), fetcher);
        let control = ControlChannel::new(config.clone(), clients.clone());
        let push = PushDispatcher::new(config.clone(), sink);
        let sync = SyncDispatcher::new(Duration::from_millis(config.sync_delay_ms));

        registration.publish(RegistrationEvent::UpdateFound {
            scope: registration.scope().clone(),
        });

        let worker = Self {
            inner: Arc::new(Inner {
                config,
                store,
                registration,
                clients,
                lifecycle,
                policy,
                control,
                push,
                sync,
                lifetimes: Arc::new(Lifetimes::default()),
            }),
        };
        Ok((worker, events))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.inner.store
    }

    pub fn registration(&self) -> &Registration {
        &self.inner.registration
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.inner.clients
    }

    pub async fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state().await
    }

    pub fn navigation_preload_enabled(&self) -> bool {
        self.inner.lifecycle.navigation_preload_enabled()
    }

    /// Open a window client. In-scope pages opened under an active worker
    /// start controlled.
    pub async fn connect_client(&self, url: Url) -> (String, mpsc::UnboundedReceiver<serde_json::Value>) {
        let controlled = self.state().await == LifecycleState::Activated
            && self.inner.registration.in_scope(&url);
        self.inner
            .clients
            .connect(url, ClientType::Window, controlled)
            .await
    }

    pub async fn set_notification_permission(&self, permission: NotificationPermission) {
        self.inner.push.set_permission(permission).await;
    }

    // ==================== Event Handlers ====================

    /// Install, then activate straight away if waiting was skipped.
    ///
    /// Returns the activation this call performed, if any. Installing an
    /// already active worker refreshes its precache and returns `None`.
    pub async fn install(&self) -> Result<Option<ActivateReport>, WorkerError> {
        if self.inner.lifecycle.install().await? == InstallOutcome::Refreshed {
            return Ok(None);
        }

        if self.inner.lifecycle.is_skipping_waiting() {
            return Ok(Some(self.activate().await?));
        }

        info!("Installed worker waiting to activate");
        self.inner.registration.publish(RegistrationEvent::Waiting);
        Ok(None)
    }

    pub async fn activate(&self) -> Result<ActivateReport, WorkerError> {
        Ok(self.inner.lifecycle.activate().await?)
    }

    /// Stop waiting. Activates now if the worker is installed.
    pub async fn skip_waiting(&self) -> Result<Option<ActivateReport>, WorkerError> {
        self.inner.lifecycle.skip_waiting();
        if self.state().await == LifecycleState::Installed {
            return Ok(Some(self.activate().await?));
        }
        Ok(None)
    }

    /// Answer an intercepted request. Never fails.
    pub async fn handle_fetch(&self, mut event: FetchEvent) -> Response {
        if event.preload.is_some() && !self.navigation_preload_enabled() {
            debug!(url = %event.request.url, "Navigation preload disabled, ignoring preload");
            event.preload = None;
        }
        self.inner.policy.handle(event).await
    }

    pub async fn post_message(&self, event: MessageEvent) -> ControlOutcome {
        let outcome = self.inner.control.handle(event).await;
        if outcome == ControlOutcome::SkipWaiting {
            if let Err(e) = self.skip_waiting().await {
                warn!(error = %e, "Skip waiting could not activate");
            }
        }
        outcome
    }

    pub async fn push(&self, event: PushEvent) -> Result<Option<Notification>, WorkerError> {
        Ok(self.inner.push.handle(event).await?)
    }

    pub async fn sync(&self, event: SyncEvent) -> SyncOutcome {
        self.inner.sync.handle(event).await
    }

    async fn handle_event(&self, event: WorkerEvent) -> Result<EventOutcome, WorkerError> {
        match event {
            WorkerEvent::Install => Ok(EventOutcome::Installed {
                activation: self.install().await?,
            }),
            WorkerEvent::Activate => Ok(EventOutcome::Activated(self.activate().await?)),
            WorkerEvent::Fetch(fetch) => Ok(EventOutcome::Response(self.handle_fetch(fetch).await)),
            WorkerEvent::Message(message) => {
                Ok(EventOutcome::Message(self.post_message(message).await))
            }
            WorkerEvent::Push(push) => Ok(EventOutcome::Push(self.push(push).await?)),
            WorkerEvent::Sync(sync) => Ok(EventOutcome::Sync(self.sync(sync).await)),
        }
    }

    // ==================== Dispatch & Lifetime ====================

    /// Run an event on the runtime, keeping the worker alive until it resolves.
    pub fn dispatch(&self, event: WorkerEvent) -> PendingEvent {
        let kind = event.kind();
        let guard = self.extend_lifetime();
        let worker = self.clone();
        debug!(kind, "Dispatching event");

        let handle = tokio::spawn(async move {
            let _guard = guard;
            worker.handle_event(event).await
        });

        PendingEvent { kind, handle }
    }

    /// Mark the worker busy until the returned guard drops.
    pub fn extend_lifetime(&self) -> LifetimeGuard {
        self.inner.lifetimes.in_flight.fetch_add(1, Ordering::SeqCst);
        LifetimeGuard {
            lifetimes: self.inner.lifetimes.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lifetimes.in_flight.load(Ordering::SeqCst)
    }

    /// Resolve once no event is in flight.
    pub async fn wait_until_idle(&self) {
        let lifetimes = &self.inner.lifetimes;
        loop {
            let notified = lifetimes.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if lifetimes.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}
