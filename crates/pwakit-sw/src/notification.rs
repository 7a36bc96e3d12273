//! System notifications shown on behalf of the page.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ServiceWorkerError;

/// Options for `registration.showNotification()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationOptions {
    /// Body text.
    pub body: String,
    /// Icon path, relative to the scope.
    pub icon: Option<String>,
    /// Vibration pattern in milliseconds (on, off, on, ...).
    pub vibrate: Vec<u32>,
}

impl Default for NotificationOptions {
    fn default() -> Self {
        Self {
            body: String::new(),
            icon: Some("icons/icon-192.png".to_string()),
            vibrate: vec![200, 100, 200],
        }
    }
}

impl NotificationOptions {
    /// Default options with the given body.
    pub fn with_body(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }
}

/// A notification ready for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    #[serde(flatten)]
    pub options: NotificationOptions,
}

/// Platform notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Display a notification. One-shot, no state kept.
    async fn show(&self, notification: &Notification) -> Result<(), ServiceWorkerError>;
}

/// Notifier that writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn show(&self, notification: &Notification) -> Result<(), ServiceWorkerError> {
        info!(
            title = %notification.title,
            body = %notification.options.body,
            icon = ?notification.options.icon,
            vibrate = ?notification.options.vibrate,
            "Notification"
        );
        Ok(())
    }
}
