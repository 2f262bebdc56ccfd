//! Registration events observed by the page that registered the worker.

use tokio::sync::mpsc;
use tracing::{info, trace};
use url::Url;

use crate::config::{ConfigError, WorkerConfig};
use crate::lifecycle::LifecycleState;

/// Events published to the registering page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// A new worker version started installing.
    UpdateFound { scope: Url },
    /// The worker moved to a new lifecycle state.
    StateChange { state: LifecycleState },
    /// A client is now controlled by this worker.
    ControllerChange { client_id: String },
    /// Installed and waiting for the previous version's clients to close.
    Waiting,
}

/// Where the worker is registered, plus the event sink for its page.
#[derive(Debug, Clone)]
pub struct Registration {
    scope: Url,
    script_url: Url,
    events: mpsc::UnboundedSender<RegistrationEvent>,
}

impl Registration {
    pub fn new(
        config: &WorkerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RegistrationEvent>), ConfigError> {
        let script_url = config.script_url()?;
        let scope = config.scope_url()?;
        let (events, rx) = mpsc::unbounded_channel();

        info!(script = %script_url, scope = %scope, "Worker registered");

        Ok((
            Self {
                scope,
                script_url,
                events,
            },
            rx,
        ))
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn script_url(&self) -> &Url {
        &self.script_url
    }

    /// Whether `url` falls under this registration's scope.
    pub fn in_scope(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    pub fn publish(&self, event: RegistrationEvent) {
        if self.events.send(event).is_err() {
            trace!("Registration listener dropped");
        }
    }
}
