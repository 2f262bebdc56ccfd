//! # Propan Test
//!
//! Harness for exercising the offline worker without a real network.
//!
//! ## Pieces
//!
//! 1. **[`ScriptedFetcher`]**: an in-process origin with an offline switch,
//!    per-path failures, latency and a call log
//! 2. **[`fixtures`]**: the bakery's config and precache assets
//! 3. **[`Scenario`]**: wires a worker over a store and a scripted network
//!
//! ## Usage
//!
//! ```rust,ignore
//! use propan_test::Scenario;
//!
//! let harness = Scenario::new().installed().await?;
//! harness.fetcher.set_offline(true);
//! let response = harness.navigate("/").await;
//! ```

use propan_common::{try_init_logging, LogConfig};
use thiserror::Error;

pub mod fetcher;
pub mod fixtures;
pub mod scenario;

pub use fetcher::{ScriptedFetcher, ScriptedResponse};
pub use scenario::{Harness, Scenario};

/// Errors raised by the harness itself.
#[derive(Error, Debug)]
pub enum TestError {
    #[error("Invalid route {path}: {reason}")]
    InvalidRoute { path: String, reason: String },

    #[error("Worker error: {0}")]
    Worker(#[from] propan_sw::WorkerError),
}

/// Install a debug subscriber once per test binary. Later calls are no-ops.
pub fn init_test_logging() {
    let _ = try_init_logging(LogConfig::debug().with_filter("propan=debug"));
}
