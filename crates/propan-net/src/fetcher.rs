//! Network fetchers used by the worker.

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::{NetError, Request, Response, ResponseType};

/// Chunks buffered between the socket reader and the body consumer.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Anything that can turn a request into a network response.
///
/// A rejected fetch (`Err`) is a transport failure. HTTP error statuses
/// resolve normally with `Ok`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// HTTP fetcher configuration.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// User agent string.
    pub user_agent: String,
    /// Maximum redirects followed when `follow_redirects` is set.
    pub max_redirects: usize,
    /// When false, 3xx responses come back as opaque redirects.
    pub follow_redirects: bool,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("propan-worker/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 10,
            follow_redirects: true,
        }
    }
}

/// Fetcher backed by `reqwest`, streaming bodies to the consumer.
pub struct HttpFetcher {
    client: Client,
    config: FetcherConfig,
}

impl HttpFetcher {
    /// Create a new HTTP fetcher.
    pub fn new(config: FetcherConfig) -> Result<Self, NetError> {
        let redirect = if config.follow_redirects {
            reqwest::redirect::Policy::limited(config.max_redirects)
        } else {
            reqwest::redirect::Policy::none()
        };

        let client = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(redirect)
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(follow_redirects = config.follow_redirects, "HttpFetcher initialized");

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        let mut response = req_builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let final_url = response.url().clone();
        let redirected = final_url != request.url;

        trace!(url = %final_url, status = %status, redirected, "Response headers received");

        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                match response.chunk().await {
                    Ok(Some(chunk)) => {
                        // Receiver gone means the consumer aborted; stop reading.
                        if tx.send(Ok(chunk)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(NetError::Body(e.to_string()))).await;
                        break;
                    }
                }
            }
        });

        let response_type = if status.is_redirection() && !self.config.follow_redirects {
            ResponseType::OpaqueRedirect
        } else {
            ResponseType::Basic
        };

        Ok(Response::streaming(final_url, status, headers, rx)
            .with_type(response_type)
            .with_redirected(redirected))
    }
}

/// Fetcher that behaves like a host with no connectivity.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineFetcher;

#[async_trait]
impl Fetcher for OfflineFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        trace!(url = %request.url, "Offline fetcher rejecting request");
        Err(NetError::Offline(request.url.to_string()))
    }
}
