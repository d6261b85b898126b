// rythm-backup/src/notify/mod.rs
pub(crate) mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audit::AdminDirectory;
use crate::backup::service::BackupArtifact;
use crate::config::NotificationConfig;
use crate::errors::{BackupError, Result};
use crate::utils::format_bytes;

pub use webhook::{LogNotifier, WebhookNotifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Success,
    Failure,
}

/// What is handed to the notification sender, one per recipient.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupNotification {
    pub recipient: String,
    pub backup_id: String,
    pub status: NotificationStatus,
    pub size_bytes: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub context_label: Option<String>,
}

impl BackupNotification {
    pub fn subject(&self) -> &'static str {
        match self.status {
            NotificationStatus::Success => "Database Backup Completed Successfully",
            NotificationStatus::Failure => "Database Backup Failed",
        }
    }

    pub fn render_text(&self, timestamp: DateTime<Utc>) -> String {
        let size = self
            .size_bytes
            .filter(|bytes| *bytes > 0)
            .map(format_bytes)
            .unwrap_or_else(|| "N/A".to_string());
        let duration = self
            .duration_ms
            .filter(|ms| *ms > 0)
            .map(|ms| format!("{:.2}s", ms as f64 / 1000.0))
            .unwrap_or_else(|| "N/A".to_string());
        let status = match self.status {
            NotificationStatus::Success => "SUCCESS",
            NotificationStatus::Failure => "FAILURE",
        };

        let mut text = String::new();
        let _ = writeln!(text, "RYTHM Database Backup Notification");
        let _ = writeln!(text);
        let _ = writeln!(text, "Backup ID: {}", self.backup_id);
        if let Some(label) = &self.context_label {
            let _ = writeln!(text, "Context: {}", label);
        }
        let _ = writeln!(text, "Status: {}", status);
        let _ = writeln!(text, "Size: {}", size);
        let _ = writeln!(text, "Duration: {}", duration);
        let _ = writeln!(
            text,
            "Timestamp: {}",
            timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        if let Some(error) = &self.error_message {
            let _ = writeln!(text);
            let _ = writeln!(text, "Error Details:");
            let _ = writeln!(text, "{}", error);
        }
        let _ = writeln!(text);
        match self.status {
            NotificationStatus::Success => {
                let _ = writeln!(text, "The database backup was created and stored in object storage.");
            }
            NotificationStatus::Failure => {
                let _ = writeln!(
                    text,
                    "The backup process encountered an error. Check the service logs for details."
                );
            }
        }
        text
    }
}

/// The result of one backup attempt, before it is addressed to anyone.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupOutcome {
    pub backup_id: String,
    pub status: NotificationStatus,
    pub size_bytes: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
}

impl BackupOutcome {
    pub fn from_result(result: &Result<BackupArtifact>, elapsed: Duration) -> Self {
        let duration_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        match result {
            Ok(artifact) => BackupOutcome {
                backup_id: artifact.filename.clone(),
                status: NotificationStatus::Success,
                size_bytes: Some(artifact.size_bytes),
                duration_ms,
                error_message: None,
            },
            Err(BackupError::BackupFailed { filename, message }) => BackupOutcome {
                backup_id: filename.clone(),
                status: NotificationStatus::Failure,
                size_bytes: None,
                duration_ms,
                error_message: Some(message.clone()),
            },
            Err(other) => BackupOutcome {
                backup_id: "unknown".to_string(),
                status: NotificationStatus::Failure,
                size_bytes: None,
                duration_ms,
                error_message: Some(other.to_string()),
            },
        }
    }

    fn addressed_to(&self, recipient: String, context_label: Option<String>) -> BackupNotification {
        BackupNotification {
            recipient,
            backup_id: self.backup_id.clone(),
            status: self.status,
            size_bytes: self.size_bytes,
            duration_ms: self.duration_ms,
            error_message: self.error_message.clone(),
            context_label,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &BackupNotification) -> Result<()>;
}

/// Webhook relay when a URL is configured, otherwise log only.
pub fn notifier_from_config(config: &NotificationConfig) -> Arc<dyn Notifier> {
    match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone(), config.webhook_token.clone())),
        None => Arc::new(LogNotifier),
    }
}

/// Fans backup outcomes out to recipients without blocking the caller.
/// Delivery failures are logged and never retried.
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    directory: Arc<dyn AdminDirectory>,
    context_label: Option<String>,
}

impl NotificationDispatcher {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        directory: Arc<dyn AdminDirectory>,
        context_label: Option<String>,
    ) -> Self {
        NotificationDispatcher {
            notifier,
            directory,
            context_label,
        }
    }

    /// One notification per system administrator with an email address.
    pub fn notify_admins(&self, outcome: BackupOutcome) -> JoinHandle<()> {
        let notifier = self.notifier.clone();
        let directory = self.directory.clone();
        let context_label = self.context_label.clone();

        tokio::spawn(async move {
            let recipients = match directory.admin_emails().await {
                Ok(recipients) => recipients,
                Err(e) => {
                    warn!(backup_id = %outcome.backup_id, error = %e, "Could not look up administrators to notify");
                    return;
                }
            };
            if recipients.is_empty() {
                warn!(backup_id = %outcome.backup_id, "No system administrators with an email address to notify");
                return;
            }
            for recipient in recipients {
                deliver(notifier.as_ref(), outcome.addressed_to(recipient, context_label.clone())).await;
            }
        })
    }

    pub fn notify_recipient(&self, recipient: String, outcome: BackupOutcome) -> JoinHandle<()> {
        let notifier = self.notifier.clone();
        let notification = outcome.addressed_to(recipient, self.context_label.clone());
        tokio::spawn(async move {
            deliver(notifier.as_ref(), notification).await;
        })
    }
}

async fn deliver(notifier: &dyn Notifier, notification: BackupNotification) {
    match notifier.send(&notification).await {
        Ok(()) => info!(
            recipient = %notification.recipient,
            backup_id = %notification.backup_id,
            "Backup notification sent"
        ),
        Err(e) => warn!(
            recipient = %notification.recipient,
            backup_id = %notification.backup_id,
            error = %e,
            "Failed to send backup notification"
        ),
    }
}
