// rythm-backup/src/admin/mod.rs
use chrono::Utc;
use regex::Regex;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{
    next_occurrence, parse_schedule_time, BackupHistoryEntry, BackupScheduleConfig, HistoryStore, ScheduleStore,
    ScheduleUpdate, MAX_RETENTION_DAYS,
};
use crate::backup::object_store::BlobReader;
use crate::backup::service::{BackupArtifact, BackupService, CreateBackupOptions};
use crate::errors::{BackupError, Result};
use crate::notify::{BackupOutcome, NotificationDispatcher};

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 500;

/// Identity of the operator issuing a command. Authentication happens upstream.
#[derive(Debug, Clone, Default)]
pub struct AdminCaller {
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
}

/// Requested schedule change, as typed by the operator.
#[derive(Debug, Clone, Default)]
pub struct ScheduleChange {
    pub enabled: Option<bool>,
    pub schedule_time: Option<String>,
    pub retention_days: Option<i32>,
}

fn filename_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*\.sql$").expect("filename pattern compiles"))
}

/// Rejects names that could escape the bucket's flat namespace.
pub fn validate_backup_filename(filename: &str) -> Result<()> {
    if filename.contains("..") || !filename_pattern().is_match(filename) {
        return Err(BackupError::InvalidInput(format!(
            "'{}' is not a valid backup filename",
            filename
        )));
    }
    Ok(())
}

/// Administrative operations, each one validated before it reaches the service.
pub struct AdminConsole {
    service: Arc<BackupService>,
    schedules: Arc<dyn ScheduleStore>,
    history: Arc<dyn HistoryStore>,
    dispatcher: Arc<NotificationDispatcher>,
    pending_notifications: Mutex<Vec<JoinHandle<()>>>,
}

impl AdminConsole {
    pub fn new(
        service: Arc<BackupService>,
        schedules: Arc<dyn ScheduleStore>,
        history: Arc<dyn HistoryStore>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        AdminConsole {
            service,
            schedules,
            history,
            dispatcher,
            pending_notifications: Mutex::new(Vec::new()),
        }
    }

    /// Manual backup. The caller is notified when their address is known.
    pub async fn create_backup(&self, caller: &AdminCaller) -> Result<BackupArtifact> {
        let clock = Instant::now();
        let result = self
            .service
            .create_backup(CreateBackupOptions::manual(caller.user_id))
            .await;

        // Busy means nothing was attempted, so there is nothing to report.
        if !matches!(result, Err(BackupError::Busy)) {
            if let Some(email) = &caller.email {
                let delivery = self
                    .dispatcher
                    .notify_recipient(email.clone(), BackupOutcome::from_result(&result, clock.elapsed()));
                if let Ok(mut pending) = self.pending_notifications.lock() {
                    pending.push(delivery);
                }
            }
        }
        result
    }

    /// Waits up to `limit` for notifications spawned by this console. A
    /// short-lived process calls this before its runtime shuts down.
    pub async fn flush_notifications(&self, limit: Duration) {
        let pending = match self.pending_notifications.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return,
        };
        if pending.is_empty() {
            return;
        }

        let count = pending.len();
        let drained = tokio::time::timeout(limit, async {
            for delivery in pending {
                let _ = delivery.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(count, timeout_secs = limit.as_secs(), "Gave up waiting for backup notifications");
        }
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupArtifact>> {
        self.service.list_backups().await
    }

    /// Overwrites the live database. Refused unless `confirmed`.
    pub async fn restore_backup(&self, caller: &AdminCaller, filename: &str, confirmed: bool) -> Result<()> {
        validate_backup_filename(filename)?;
        if !confirmed {
            return Err(BackupError::ConfirmationRequired);
        }
        info!(filename, user_id = ?caller.user_id, "Restore requested");
        self.service.restore_backup(filename).await
    }

    pub async fn delete_backup(&self, caller: &AdminCaller, filename: &str) -> Result<()> {
        validate_backup_filename(filename)?;
        info!(filename, user_id = ?caller.user_id, "Delete requested");
        self.service.delete_backup(filename).await
    }

    pub async fn download_backup(&self, filename: &str) -> Result<BlobReader> {
        validate_backup_filename(filename)?;
        self.service.download_backup(filename).await
    }

    pub async fn schedule(&self) -> Result<BackupScheduleConfig> {
        self.schedules.load_or_create_default().await
    }

    /// Applies `change`. Enabling (re)computes the next run; disabling clears it.
    pub async fn update_schedule(&self, change: &ScheduleChange) -> Result<BackupScheduleConfig> {
        let schedule_time = change
            .schedule_time
            .as_deref()
            .map(parse_schedule_time)
            .transpose()?;
        if let Some(days) = change.retention_days {
            if !(1..=MAX_RETENTION_DAYS).contains(&days) {
                return Err(BackupError::InvalidInput(format!(
                    "retention_days must be between 1 and {}, got {}",
                    MAX_RETENTION_DAYS, days
                )));
            }
        }

        let current = self.schedules.load_or_create_default().await?;
        let enabled = change.enabled.unwrap_or(current.enabled);
        let effective_time = schedule_time.unwrap_or(current.schedule_time);
        let next_run_at = if enabled {
            Some(next_occurrence(Utc::now(), effective_time))
        } else {
            None
        };

        let update = ScheduleUpdate {
            enabled: change.enabled,
            schedule_time,
            retention_days: change.retention_days,
            next_run_at: Some(next_run_at),
        };
        let updated = self.schedules.update(current.schedule_id, &update).await?;
        info!(
            enabled = updated.enabled,
            schedule_time = %updated.schedule_time,
            retention_days = updated.retention_days,
            "Backup schedule updated"
        );
        Ok(updated)
    }

    pub async fn history(&self, limit: Option<i64>) -> Result<Vec<BackupHistoryEntry>> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
        self.history.recent(limit).await
    }
}
