//! Worker scenarios: a registered worker over a store and a scripted network.

use std::sync::Arc;
use std::time::Duration;

use propan_cache::{CacheStore, MemoryCacheStore};
use propan_net::{Destination, Request, Response};
use propan_sw::{
    ChannelNotificationSink, FetchEvent, Notification, RegistrationEvent, ServiceWorker,
    WorkerConfig,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::fetcher::{ScriptedFetcher, ScriptedResponse};
use crate::{fixtures, TestError};

/// Builder for a [`Harness`].
pub struct Scenario {
    config: WorkerConfig,
    routes: Vec<(String, ScriptedResponse)>,
    store: Option<Arc<dyn CacheStore>>,
    latency: Option<Duration>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self::new()
    }
}

impl Scenario {
    /// The bakery on the test origin, backed by an in-memory store.
    pub fn new() -> Self {
        Self {
            config: fixtures::config(),
            routes: Vec::new(),
            store: None,
            latency: None,
        }
    }

    /// Adjust the worker config before registration.
    pub fn config(mut self, edit: impl FnOnce(&mut WorkerConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    /// Serve `response` at `path` in addition to the precache assets.
    pub fn route(mut self, path: &str, response: ScriptedResponse) -> Self {
        self.routes.push((path.to_string(), response));
        self
    }

    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Register the worker without installing it.
    pub async fn build(self) -> Result<Harness, TestError> {
        let mut fetcher = fixtures::bakery_fetcher(&self.config)?;
        for (path, response) in self.routes {
            fetcher = fetcher.with_route(&path, response)?;
        }
        let fetcher = Arc::new(fetcher);
        if self.latency.is_some() {
            fetcher.set_latency(self.latency).await;
        }

        let store: Arc<dyn CacheStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryCacheStore::new()),
        };
        let (sink, notifications) = ChannelNotificationSink::channel();
        let (worker, events) = ServiceWorker::register_with_sink(
            self.config,
            store.clone(),
            fetcher.clone(),
            Arc::new(sink),
        )?;

        debug!(scope = %worker.registration().scope(), "Scenario worker registered");
        Ok(Harness {
            worker,
            fetcher,
            store,
            events,
            notifications,
        })
    }

    /// Register and install. Activation follows when the config skips waiting.
    pub async fn installed(self) -> Result<Harness, TestError> {
        let harness = self.build().await?;
        harness.worker.install().await?;
        harness.fetcher.clear_calls().await;
        Ok(harness)
    }
}

/// A live worker plus everything a test needs to observe it.
pub struct Harness {
    pub worker: ServiceWorker,
    pub fetcher: Arc<ScriptedFetcher>,
    pub store: Arc<dyn CacheStore>,
    pub events: mpsc::UnboundedReceiver<RegistrationEvent>,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
}

impl Harness {
    /// Request a subresource at `path`.
    pub async fn fetch(&self, path: &str) -> Result<Response, TestError> {
        let request = Request::get(fixtures::url(path)?);
        Ok(self.worker.handle_fetch(FetchEvent::new(request)).await)
    }

    /// Request `path` with a destination hint.
    pub async fn fetch_as(&self, path: &str, destination: Destination) -> Result<Response, TestError> {
        let request = Request::get(fixtures::url(path)?).destination(destination);
        Ok(self.worker.handle_fetch(FetchEvent::new(request)).await)
    }

    /// Navigate a page to `path`.
    pub async fn navigate(&self, path: &str) -> Result<Response, TestError> {
        let request = Request::navigate(fixtures::url(path)?);
        Ok(self.worker.handle_fetch(FetchEvent::new(request)).await)
    }

    /// Registration events published so far.
    pub fn drain_events(&mut self) -> Vec<RegistrationEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    /// Notifications shown so far.
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut drained = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            drained.push(notification);
        }
        drained
    }
}
