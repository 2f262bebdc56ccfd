//! The bakery app as the worker sees it: config and precache assets.

use propan_sw::WorkerConfig;
use url::Url;

use crate::fetcher::{ScriptedFetcher, ScriptedResponse};
use crate::TestError;

pub const ORIGIN: &str = "https://propan.test";

pub fn origin() -> Result<Url, TestError> {
    Url::parse(ORIGIN).map_err(|e| TestError::InvalidRoute {
        path: ORIGIN.to_string(),
        reason: e.to_string(),
    })
}

pub fn url(path: &str) -> Result<Url, TestError> {
    origin()?.join(path).map_err(|e| TestError::InvalidRoute {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// Default bakery config on the test origin with a short sync delay.
pub fn config() -> WorkerConfig {
    WorkerConfig {
        origin: ORIGIN.to_string(),
        sync_delay_ms: 20,
        ..Default::default()
    }
}

/// Body served for a precached asset.
pub fn precache_body(path: &str) -> String {
    match path {
        "/" | "/index.html" => "<html><body>proPAN</body></html>".to_string(),
        "/offline.html" => "<html><body>Sin conexión</body></html>".to_string(),
        other => format!("asset {other}"),
    }
}

fn content_type(path: &str) -> &'static str {
    match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        _ => "text/html",
    }
}

/// Routes for every manifest path of `config`.
pub fn precache_routes(config: &WorkerConfig) -> Vec<(String, ScriptedResponse)> {
    config
        .precache_manifest
        .iter()
        .map(|path| {
            let response = ScriptedResponse::ok(precache_body(path))
                .with_header("content-type", content_type(path));
            (path.clone(), response)
        })
        .collect()
}

/// A network serving the whole precache manifest.
pub fn bakery_fetcher(config: &WorkerConfig) -> Result<ScriptedFetcher, TestError> {
    let mut fetcher = ScriptedFetcher::new(config.origin_url().map_err(|e| {
        TestError::InvalidRoute {
            path: config.origin.clone(),
            reason: e.to_string(),
        }
    })?);
    for (path, response) in precache_routes(config) {
        fetcher = fetcher.with_route(&path, response)?;
    }
    Ok(fetcher)
}
