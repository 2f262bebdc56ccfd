//! Worker configuration

use std::path::Path;

use http::Method;
use propan_cache::EvictionPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use url::Url;

/// Errors raised while loading or validating a [`WorkerConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid origin: {0}")]
    InvalidOrigin(#[from] url::ParseError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Immutable worker configuration, built once and shared as `Arc<WorkerConfig>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin every root-relative path resolves against
    pub origin: String,

    /// Prefix shared by both namespace names
    pub cache_prefix: String,

    /// Version of the precache generation
    pub version: String,

    /// Suffix of the unversioned runtime namespace
    pub runtime_suffix: String,

    /// Paths fetched and stored during install, in order
    pub precache_manifest: Vec<String>,

    /// Path prefix reserved for backend calls
    pub api_prefix: String,

    /// Served to failed document requests
    pub offline_document: String,

    /// Served to failed image requests
    pub fallback_image: String,

    pub notification_icon: String,
    pub notification_badge: String,
    pub default_push_title: String,
    pub default_push_body: String,

    /// Upper bound used when a GENERATE_NUMBER limit is missing or invalid
    pub default_random_limit: u32,

    /// Persist 4xx/5xx network responses like successful ones
    pub cache_error_responses: bool,

    /// Request methods whose responses are persisted
    pub cacheable_methods: Vec<String>,

    /// Enable navigation preload on activation
    pub navigation_preload: bool,

    /// Activate right after install instead of waiting for old clients
    pub skip_waiting_on_install: bool,

    /// Bounds for the runtime namespace
    pub runtime_eviction: EvictionPolicy,

    /// Simulated duration of the `sync-orders` task
    pub sync_delay_ms: u64,

    /// Where the worker script is served; its directory is the scope
    pub script_path: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:8080/".to_string(),
            cache_prefix: "propan".to_string(),
            version: "v1".to_string(),
            runtime_suffix: "runtime".to_string(),
            precache_manifest: [
                "/",
                "/index.html",
                "/styles.css",
                "/app.js",
                "/offline.html",
                "/manifest.json",
                "/images/pan1.png",
                "/images/pan2.png",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            api_prefix: "/api/".to_string(),
            offline_document: "/offline.html".to_string(),
            fallback_image: "/images/pan1.png".to_string(),
            notification_icon: "/images/pan1.png".to_string(),
            notification_badge: "/images/pan1.png".to_string(),
            default_push_title: "proPAN".to_string(),
            default_push_body: "¡Tienes una notificación de la panadería!".to_string(),
            default_random_limit: 100,
            cache_error_responses: true,
            cacheable_methods: vec!["GET".to_string()],
            navigation_preload: false,
            skip_waiting_on_install: true,
            runtime_eviction: EvictionPolicy::default(),
            sync_delay_ms: 2000,
            script_path: "/service-worker.js".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&raw)?;
        info!(path = %path.display(), version = %config.version, "Loaded worker config");
        Ok(config)
    }

    /// Precache namespace, e.g. `propan-static-v1`.
    pub fn precache_name(&self) -> String {
        format!("{}-static-{}", self.cache_prefix, self.version)
    }

    /// Runtime namespace, e.g. `propan-runtime`.
    pub fn runtime_name(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.runtime_suffix)
    }

    pub fn origin_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.origin)
    }

    /// Resolve a root-relative path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url, url::ParseError> {
        self.origin_url()?.join(path)
    }

    pub fn script_url(&self) -> Result<Url, url::ParseError> {
        self.resolve(&self.script_path)
    }

    /// Directory of the worker script.
    pub fn scope_url(&self) -> Result<Url, url::ParseError> {
        let dir = self
            .script_path
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .unwrap_or("");
        self.resolve(&format!("{dir}/"))
    }

    pub fn is_precached_path(&self, path: &str) -> bool {
        self.precache_manifest.iter().any(|p| p == path)
    }

    pub fn is_cacheable_method(&self, method: &Method) -> bool {
        self.cacheable_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    /// Check the invariants the worker relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let origin = self.origin_url()?;
        if !matches!(origin.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "origin must be http or https, got `{}`",
                origin.scheme()
            )));
        }

        if self.precache_manifest.is_empty() {
            return Err(ConfigError::Invalid("precache manifest is empty".into()));
        }

        if let Some(bad) = self.precache_manifest.iter().find(|p| !p.starts_with('/')) {
            return Err(ConfigError::Invalid(format!(
                "manifest path `{bad}` is not root-relative"
            )));
        }

        for (field, path) in [
            ("offline_document", &self.offline_document),
            ("fallback_image", &self.fallback_image),
        ] {
            if !self.is_precached_path(path) {
                return Err(ConfigError::Invalid(format!(
                    "{field} `{path}` must be part of the precache manifest"
                )));
            }
        }

        if self.precache_name() == self.runtime_name() {
            return Err(ConfigError::Invalid(format!(
                "precache and runtime namespaces are both `{}`",
                self.runtime_name()
            )));
        }

        if !self.api_prefix.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "api_prefix `{}` must start with `/`",
                self.api_prefix
            )));
        }

        if !self.script_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "script_path `{}` must start with `/`",
                self.script_path
            )));
        }

        if self.default_random_limit == 0 {
            return Err(ConfigError::Invalid(
                "default_random_limit must be positive".into(),
            ));
        }

        Ok(())
    }
}
