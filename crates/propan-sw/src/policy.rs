//! Cache Policy Engine.
//!
//! Every intercepted request is classified and run through one strategy:
//!
//! | class        | strategy                                  |
//! |--------------|-------------------------------------------|
//! | Navigation   | network (or preload), persist to runtime  |
//! | StaticAsset  | cache first, then network + persist       |
//! | Api, Default | network first, persist to runtime         |
//!
//! Any failure drops into the fallback chain, which always ends in a
//! synthesized 503. [`PolicyEngine::handle`] therefore never fails.

use std::sync::Arc;

use propan_cache::{CacheError, CacheHandle, CacheKey, CacheStore};
use propan_net::{Destination, Fetcher, NetError, Request, Response, ResponseSource};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::WorkerConfig;
use crate::routing::{classify, RoutingClass};

/// Failures that send a request into the fallback chain.
#[derive(Error, Debug)]
pub(crate) enum PolicyError {
    #[error("network: {0}")]
    Network(#[from] NetError),

    #[error("cache: {0}")]
    Cache(#[from] CacheError),
}

/// An intercepted request as delivered by the host.
#[derive(Debug)]
pub struct FetchEvent {
    pub request: Request,
    /// Preloaded navigation response, when the host started one.
    pub preload: Option<Result<Response, NetError>>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            preload: None,
        }
    }

    pub fn with_preload(mut self, preload: Result<Response, NetError>) -> Self {
        self.preload = Some(preload);
        self
    }
}

/// Routes requests between the network and the cache store.
pub struct PolicyEngine {
    config: Arc<WorkerConfig>,
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
}

impl PolicyEngine {
    pub fn new(
        config: Arc<WorkerConfig>,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config,
            store,
            fetcher,
        }
    }

    /// Produce a response for an intercepted request.
    pub async fn handle(&self, event: FetchEvent) -> Response {
        let FetchEvent { request, preload } = event;
        let class = classify(&request, &self.config);
        debug!(
            request_id = request.id.raw(),
            url = %request.url,
            method = %request.method,
            class = ?class,
            "Handling fetch"
        );

        let result = match class {
            RoutingClass::Navigation => self.navigate(&request, preload).await,
            RoutingClass::StaticAsset => self.cache_first(&request).await,
            RoutingClass::Api | RoutingClass::Default => self.network_first(&request).await,
        };

        match result {
            Ok(response) => response,
            Err(error) => {
                warn!(
                    request_id = request.id.raw(),
                    url = %request.url,
                    class = ?class,
                    error = %error,
                    "Fetch failed, using fallback"
                );
                self.fallback(&request).await
            }
        }
    }

    async fn navigate(
        &self,
        request: &Request,
        preload: Option<Result<Response, NetError>>,
    ) -> Result<Response, PolicyError> {
        let response = match preload {
            Some(preloaded) => {
                trace!(url = %request.url, "Using navigation preload");
                preloaded?
            }
            None => self.fetcher.fetch(request).await?,
        };
        self.persist(request, response).await
    }

    async fn cache_first(&self, request: &Request) -> Result<Response, PolicyError> {
        let key = CacheKey::for_request(request);
        if let Some(entry) = self.store.match_any(&key).await? {
            trace!(key = %key, "Cache hit");
            return Ok(Response::from_snapshot(&entry.response, ResponseSource::Cache));
        }

        let response = self.fetcher.fetch(request).await?;
        self.persist(request, response).await
    }

    async fn network_first(&self, request: &Request) -> Result<Response, PolicyError> {
        let response = self.fetcher.fetch(request).await?;
        self.persist(request, response).await
    }

    fn is_cacheable(&self, request: &Request, response: &Response) -> bool {
        !response.is_opaque_redirect()
            && self.config.is_cacheable_method(&request.method)
            && (self.config.cache_error_responses || response.ok())
    }

    /// Store a copy of a network response in the runtime namespace and hand
    /// back the other copy.
    async fn persist(&self, request: &Request, response: Response) -> Result<Response, PolicyError> {
        if !self.is_cacheable(request, &response) {
            trace!(
                url = %request.url,
                status = %response.status,
                response_type = ?response.response_type,
                "Response not cacheable"
            );
            return Ok(response);
        }

        let snapshot = response.into_snapshot().await?;
        let handle = self.store.open(&self.config.runtime_name()).await?;
        let key = CacheKey::for_request(request);
        self.store.put(&handle, key.clone(), snapshot.clone()).await?;
        trace!(key = %key, status = snapshot.status, "Stored runtime entry");

        self.trim_runtime(&handle).await;
        Ok(Response::from_snapshot(&snapshot, ResponseSource::Network))
    }

    async fn trim_runtime(&self, handle: &CacheHandle) {
        match self.store.trim(handle, &self.config.runtime_eviction).await {
            Ok(0) => {}
            Ok(evicted) => debug!(namespace = handle.name(), evicted, "Evicted runtime entries"),
            Err(e) => warn!(namespace = handle.name(), error = %e, "Runtime eviction failed"),
        }
    }

    async fn fallback(&self, request: &Request) -> Response {
        if request.destination == Destination::Document {
            if let Some(response) = self.cached_asset(&self.config.offline_document).await {
                return response;
            }
        }

        if request.destination == Destination::Image {
            if let Some(response) = self.cached_asset(&self.config.fallback_image).await {
                return response;
            }
        }

        match self.store.match_any(&CacheKey::for_request(request)).await {
            Ok(Some(entry)) => return Response::from_snapshot(&entry.response, ResponseSource::Fallback),
            Ok(None) => {}
            Err(e) => warn!(url = %request.url, error = %e, "Fallback cache lookup failed"),
        }

        debug!(url = %request.url, "Nothing cached, synthesizing unavailable response");
        Response::unavailable(request.url.clone())
    }

    async fn cached_asset(&self, path: &str) -> Option<Response> {
        let url = match self.config.resolve(path) {
            Ok(url) => url,
            Err(e) => {
                warn!(path, error = %e, "Cannot resolve fallback asset");
                return None;
            }
        };

        match self.store.match_any(&CacheKey::get(&url)).await {
            Ok(entry) => entry.map(|e| Response::from_snapshot(&e.response, ResponseSource::Fallback)),
            Err(e) => {
                warn!(path, error = %e, "Fallback asset lookup failed");
                None
            }
        }
    }
}
