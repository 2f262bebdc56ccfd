//! Scripted network for deterministic worker tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use http::{HeaderName, HeaderValue, StatusCode};
use propan_net::{Fetcher, NetError, Request, Response, ResponseType};
use tokio::sync::{Mutex, RwLock};
use tracing::trace;
use url::Url;

use crate::TestError;

/// A canned response for one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub response_type: ResponseType,
}

impl ScriptedResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            response_type: ResponseType::Basic,
        }
    }

    /// An unfollowed redirect to `location`.
    pub fn redirect(location: &str) -> Self {
        Self {
            status: 302,
            headers: vec![("location".to_string(), location.to_string())],
            body: Bytes::new(),
            response_type: ResponseType::OpaqueRedirect,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn build(&self, url: Url) -> Result<Response, NetError> {
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;
        let mut response = Response::new(url, status, self.body.clone()).with_type(self.response_type);
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| NetError::RequestFailed(e.to_string()))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| NetError::RequestFailed(e.to_string()))?;
            response = response.with_header(name, value);
        }
        Ok(response)
    }
}

/// In-process origin. Unknown URLs answer 404 like a real server.
#[derive(Debug)]
pub struct ScriptedFetcher {
    origin: Url,
    routes: RwLock<HashMap<String, ScriptedResponse>>,
    failing: RwLock<HashSet<String>>,
    offline: AtomicBool,
    latency: RwLock<Option<Duration>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            routes: RwLock::new(HashMap::new()),
            failing: RwLock::new(HashSet::new()),
            offline: AtomicBool::new(false),
            latency: RwLock::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Resolve a root-relative path against the origin.
    pub fn url(&self, path: &str) -> Result<Url, TestError> {
        self.origin.join(path).map_err(|e| TestError::InvalidRoute {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    /// Builder form of [`ScriptedFetcher::set_route`].
    pub fn with_route(mut self, path: &str, response: ScriptedResponse) -> Result<Self, TestError> {
        let url = self.url(path)?;
        self.routes.get_mut().insert(url.to_string(), response);
        Ok(self)
    }

    pub async fn set_route(&self, path: &str, response: ScriptedResponse) -> Result<(), TestError> {
        let url = self.url(path)?;
        self.routes.write().await.insert(url.to_string(), response);
        Ok(())
    }

    /// Simulate losing (or regaining) connectivity.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make one path reject at the transport level.
    pub async fn fail(&self, path: &str) -> Result<(), TestError> {
        let url = self.url(path)?;
        self.failing.write().await.insert(url.to_string());
        Ok(())
    }

    pub async fn recover(&self, path: &str) -> Result<(), TestError> {
        let url = self.url(path)?;
        self.failing.write().await.remove(url.as_str());
        Ok(())
    }

    /// Delay every response.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().await = latency;
    }

    /// URLs requested so far, in order.
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    /// How many times `path` was requested.
    pub async fn calls_to(&self, path: &str) -> usize {
        let Ok(url) = self.url(path) else {
            return 0;
        };
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.as_str() == url.as_str())
            .count()
    }

    pub async fn clear_calls(&self) {
        self.calls.lock().await.clear();
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let mut url = request.url.clone();
        url.set_fragment(None);
        self.calls.lock().await.push(url.to_string());

        let latency = *self.latency.read().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            trace!(url = %url, "Scripted network offline");
            return Err(NetError::Offline(url.to_string()));
        }

        if self.failing.read().await.contains(url.as_str()) {
            return Err(NetError::RequestFailed(format!("scripted failure for {url}")));
        }

        let route = self.routes.read().await.get(url.as_str()).cloned();
        match route {
            Some(route) => route.build(url),
            None => Ok(Response::new(url, StatusCode::NOT_FOUND, "Not Found")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher() -> ScriptedFetcher {
        ScriptedFetcher::new(Url::parse("https://propan.test").unwrap())
            .with_route(
                "/styles.css",
                ScriptedResponse::ok("body{}").with_header("content-type", "text/css"),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_scripted_route() {
        let fetcher = fetcher();
        let request = Request::get(fetcher.url("/styles.css#x").unwrap());
        let snapshot = fetcher
            .fetch(&request)
            .await
            .unwrap()
            .into_snapshot()
            .await
            .unwrap();

        assert_eq!(snapshot.status, 200);
        assert_eq!(snapshot.header("content-type"), Some("text/css"));
        assert_eq!(fetcher.calls_to("/styles.css").await, 1);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let fetcher = fetcher();
        let response = fetcher
            .fetch(&Request::get(fetcher.url("/nope").unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_offline_and_failures() {
        let fetcher = fetcher();
        let request = Request::get(fetcher.url("/styles.css").unwrap());

        fetcher.set_offline(true);
        assert!(matches!(fetcher.fetch(&request).await, Err(NetError::Offline(_))));
        fetcher.set_offline(false);

        fetcher.fail("/styles.css").await.unwrap();
        assert!(matches!(
            fetcher.fetch(&request).await,
            Err(NetError::RequestFailed(_))
        ));
        fetcher.recover("/styles.css").await.unwrap();
        assert!(fetcher.fetch(&request).await.is_ok());
        assert_eq!(fetcher.call_count().await, 3);
    }

    #[tokio::test]
    async fn test_redirect_is_opaque() {
        let fetcher = fetcher();
        fetcher
            .set_route("/old", ScriptedResponse::redirect("/new"))
            .await
            .unwrap();
        let response = fetcher
            .fetch(&Request::get(fetcher.url("/old").unwrap()))
            .await
            .unwrap();
        assert!(response.is_opaque_redirect());
    }
}
