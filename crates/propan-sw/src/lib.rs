//! # Propan Worker
//!
//! Offline-first request caching for the proPAN bakery app.
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorker::dispatch(WorkerEvent)
//!     ├── Install / Activate ── LifecycleManager ──┐
//!     ├── Fetch ─────────────── PolicyEngine ──────┼── CacheStore
//!     ├── Message ───────────── ControlChannel ── ClientRegistry
//!     ├── Push ──────────────── PushDispatcher ── NotificationSink
//!     └── Sync ──────────────── SyncDispatcher
//! ```
//!
//! Responses that are both returned and stored are split through
//! [`propan_net::ResponseSnapshot`]; no body is ever read twice.

pub mod channel;
pub mod clients;
pub mod config;
pub mod lifecycle;
pub mod notify;
pub mod policy;
pub mod registration;
pub mod routing;
pub mod sync;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use channel::{ControlMessage, ControlOutcome, MessageEvent, ReplyPort};
pub use clients::{ClientInfo, ClientRegistry, ClientType};
pub use config::{ConfigError, WorkerConfig};
pub use lifecycle::{
    ActivateReport, InstallOutcome, LifecycleError, LifecycleManager, LifecycleState,
};
pub use notify::{
    ChannelNotificationSink, LogNotificationSink, Notification, NotificationPermission,
    NotificationSink, NotifyError, PushDispatcher, PushEvent, PushPayload,
};
pub use policy::{FetchEvent, PolicyEngine};
pub use registration::{Registration, RegistrationEvent};
pub use routing::{classify, RoutingClass};
pub use sync::{SyncDispatcher, SyncEvent, SyncOutcome, SyncTag, SYNC_ORDERS};
pub use worker::{EventOutcome, LifetimeGuard, PendingEvent, ServiceWorker, WorkerError, WorkerEvent};
