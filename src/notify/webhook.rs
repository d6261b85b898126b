// rythm-backup/src/notify/webhook.rs
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::info;

use super::{BackupNotification, Notifier};
use crate::errors::Result;

/// Body posted to the mail relay.
#[derive(Debug, Serialize)]
struct WebhookMessage<'a> {
    to: &'a str,
    subject: &'a str,
    text: String,
    payload: &'a BackupNotification,
}

/// Posts each notification as JSON to an HTTP relay that owns actual delivery.
pub struct WebhookNotifier {
    client: Client,
    url: String,
    token: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: String, token: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        WebhookNotifier { client, url, token }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &BackupNotification) -> Result<()> {
        let message = WebhookMessage {
            to: &notification.recipient,
            subject: notification.subject(),
            text: notification.render_text(Utc::now()),
            payload: notification,
        };

        let mut request = self.client.post(&self.url).json(&message);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        request.send().await?.error_for_status()?;
        Ok(())
    }
}

/// Used when no relay is configured: the notification only reaches the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &BackupNotification) -> Result<()> {
        info!(
            recipient = %notification.recipient,
            subject = notification.subject(),
            backup_id = %notification.backup_id,
            error = notification.error_message.as_deref().unwrap_or(""),
            "Backup notification (no webhook configured)"
        );
        Ok(())
    }
}
