//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hashbrown::HashMap;
use http::StatusCode;
use propan_cache::MemoryCacheStore;
use propan_net::{Fetcher, NetError, Request, Response, ResponseType};
use url::Url;

use crate::config::WorkerConfig;

pub const ORIGIN: &str = "https://propan.test";

pub fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn config() -> WorkerConfig {
    WorkerConfig {
        origin: ORIGIN.to_string(),
        sync_delay_ms: 10,
        ..Default::default()
    }
}

#[derive(Clone)]
struct Route {
    status: u16,
    body: String,
    response_type: ResponseType,
}

/// In-process network serving every manifest path plus whatever a test adds.
#[derive(Default)]
pub struct StubFetcher {
    routes: Mutex<HashMap<String, Route>>,
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl StubFetcher {
    pub fn bakery() -> Arc<Self> {
        let fetcher = Self::default();
        for path in config().precache_manifest {
            let body = format!("precached {path}");
            fetcher.route(&path, 200, &body);
        }
        Arc::new(fetcher)
    }

    pub fn route(&self, path: &str, status: u16, body: &str) {
        self.insert(path, status, body, ResponseType::Basic);
    }

    pub fn redirect(&self, path: &str) {
        self.insert(path, 302, "", ResponseType::OpaqueRedirect);
    }

    fn insert(&self, path: &str, status: u16, body: &str, response_type: ResponseType) {
        self.routes.lock().unwrap().insert(
            url(path).to_string(),
            Route {
                status,
                body: body.to_string(),
                response_type,
            },
        );
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(request.url.to_string()));
        }

        let route = self.routes.lock().unwrap().get(request.url.as_str()).cloned();
        let response = match route {
            Some(route) => Response::new(
                request.url.clone(),
                StatusCode::from_u16(route.status).unwrap(),
                route.body,
            )
            .with_type(route.response_type),
            None => Response::new(request.url.clone(), StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }
}

pub fn memory_store() -> Arc<MemoryCacheStore> {
    Arc::new(MemoryCacheStore::new())
}
