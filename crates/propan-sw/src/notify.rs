//! Push handling and notification display.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::config::WorkerConfig;

/// Errors raised while displaying a notification.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification sink closed")]
    SinkClosed,
}

/// Notification permission granted by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPermission {
    Granted,
    Denied,
    /// Never asked.
    #[default]
    Default,
}

/// Optional structured push payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
}

impl PushPayload {
    /// Decode push bytes. Absent data and malformed JSON both yield an empty
    /// payload, so every field falls back to its default.
    pub fn decode(data: Option<&Bytes>) -> Self {
        let Some(raw) = data else {
            return Self::default();
        };
        match serde_json::from_slice(raw) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, bytes = raw.len(), "Malformed push payload, using defaults");
                Self::default()
            }
        }
    }
}

/// A push as delivered by the host.
#[derive(Debug, Clone, Default)]
pub struct PushEvent {
    pub data: Option<Bytes>,
}

impl PushEvent {
    pub fn new(data: Option<Bytes>) -> Self {
        Self { data }
    }
}

/// A notification ready for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
}

/// Where notifications are shown.
pub trait NotificationSink: Send + Sync {
    fn show(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Sink that forwards notifications to a host channel.
#[derive(Debug, Clone)]
pub struct ChannelNotificationSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotificationSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelNotificationSink {
    fn show(&self, notification: Notification) -> Result<(), NotifyError> {
        self.tx.send(notification).map_err(|_| NotifyError::SinkClosed)
    }
}

/// Sink for hosts without a display: notifications are only logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn show(&self, notification: Notification) -> Result<(), NotifyError> {
        info!(title = %notification.title, body = %notification.body, "Notification");
        Ok(())
    }
}

pub struct PushDispatcher {
    config: Arc<WorkerConfig>,
    permission: RwLock<NotificationPermission>,
    sink: Arc<dyn NotificationSink>,
}

impl PushDispatcher {
    pub fn new(config: Arc<WorkerConfig>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            config,
            permission: RwLock::new(NotificationPermission::Default),
            sink,
        }
    }

    pub async fn permission(&self) -> NotificationPermission {
        *self.permission.read().await
    }

    pub async fn set_permission(&self, permission: NotificationPermission) {
        *self.permission.write().await = permission;
    }

    /// Show a notification for a push. `None` when permission is missing.
    pub async fn handle(&self, event: PushEvent) -> Result<Option<Notification>, NotifyError> {
        let permission = self.permission().await;
        if permission != NotificationPermission::Granted {
            warn!(permission = ?permission, "No permission for notifications");
            return Ok(None);
        }

        let payload = PushPayload::decode(event.data.as_ref());
        let notification = Notification {
            title: payload
                .title
                .unwrap_or_else(|| self.config.default_push_title.clone()),
            body: payload
                .body
                .unwrap_or_else(|| self.config.default_push_body.clone()),
            icon: self.config.notification_icon.clone(),
            badge: self.config.notification_badge.clone(),
        };

        self.sink.show(notification.clone())?;
        Ok(Some(notification))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::config;

    fn dispatcher() -> (PushDispatcher, mpsc::UnboundedReceiver<Notification>) {
        let (sink, rx) = ChannelNotificationSink::channel();
        (PushDispatcher::new(Arc::new(config()), Arc::new(sink)), rx)
    }

    #[tokio::test]
    async fn test_no_permission_no_notification() {
        let (push, mut rx) = dispatcher();
        for permission in [NotificationPermission::Default, NotificationPermission::Denied] {
            push.set_permission(permission).await;
            let shown = push
                .handle(PushEvent::new(Some(Bytes::from_static(b"{\"title\":\"x\"}"))))
                .await
                .unwrap();
            assert!(shown.is_none());
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_payload_fields() {
        let (push, mut rx) = dispatcher();
        push.set_permission(NotificationPermission::Granted).await;

        let data = Bytes::from_static(
            r#"{"title":"Pan recién hecho","body":"Ya salió la hornada"}"#.as_bytes(),
        );
        push.handle(PushEvent::new(Some(data))).await.unwrap();

        let shown = rx.recv().await.unwrap();
        assert_eq!(shown.title, "Pan recién hecho");
        assert_eq!(shown.body, "Ya salió la hornada");
        assert_eq!(shown.icon, "/images/pan1.png");
        assert_eq!(shown.badge, "/images/pan1.png");
    }

    #[tokio::test]
    async fn test_missing_field_takes_default() {
        let (push, _rx) = dispatcher();
        push.set_permission(NotificationPermission::Granted).await;

        let data = Bytes::from_static(br#"{"title":"Oferta"}"#);
        let shown = push.handle(PushEvent::new(Some(data))).await.unwrap().unwrap();
        assert_eq!(shown.title, "Oferta");
        assert_eq!(shown.body, "¡Tienes una notificación de la panadería!");
    }

    #[tokio::test]
    async fn test_absent_and_malformed_payloads_use_defaults() {
        let (push, _rx) = dispatcher();
        push.set_permission(NotificationPermission::Granted).await;

        for data in [None, Some(Bytes::from_static(b"not json {"))] {
            let shown = push.handle(PushEvent::new(data)).await.unwrap().unwrap();
            assert_eq!(shown.title, "proPAN");
            assert_eq!(shown.body, "¡Tienes una notificación de la panadería!");
        }
    }

    #[tokio::test]
    async fn test_closed_sink_is_an_error() {
        let (push, rx) = dispatcher();
        drop(rx);
        push.set_permission(NotificationPermission::Granted).await;
        assert!(matches!(
            push.handle(PushEvent::default()).await,
            Err(NotifyError::SinkClosed)
        ));
    }
}
