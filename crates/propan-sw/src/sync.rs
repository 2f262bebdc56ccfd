//! Background sync dispatch.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Tag of the deferred order submission task.
pub const SYNC_ORDERS: &str = "sync-orders";

/// Identifies a deferred task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncTag(String);

impl SyncTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SyncTag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl fmt::Display for SyncTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A sync as delivered by the host once connectivity is back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub tag: SyncTag,
}

impl SyncEvent {
    pub fn new(tag: impl Into<SyncTag>) -> Self {
        Self { tag: tag.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOutcome {
    Completed,
    /// No task registered for the tag.
    Ignored,
}

/// Runs deferred tasks. Retries are the host's business.
#[derive(Debug, Clone)]
pub struct SyncDispatcher {
    delay: Duration,
}

impl SyncDispatcher {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub async fn handle(&self, event: SyncEvent) -> SyncOutcome {
        if event.tag.as_str() != SYNC_ORDERS {
            debug!(tag = %event.tag, "No handler for sync tag");
            return SyncOutcome::Ignored;
        }

        info!(tag = %event.tag, "Syncing pending orders");
        tokio::time::sleep(self.delay).await;
        info!(tag = %event.tag, "Pending orders synced");
        SyncOutcome::Completed
    }
}
