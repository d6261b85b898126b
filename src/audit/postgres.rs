// rythm-backup/src/audit/postgres.rs
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{
    AdminDirectory, BackupHistoryEntry, BackupScheduleConfig, BackupStatus, BackupType, HistoryStore,
    ScheduleStore, ScheduleUpdate,
};
use crate::errors::{BackupError, Result};

const HISTORY_COLUMNS: &str = "history_id, backup_filename, backup_type, status, initiated_by_user_id, \
     file_size_bytes, duration_seconds, error_message, started_at, completed_at";

const SCHEDULE_COLUMNS: &str = "schedule_id, enabled, schedule_time, retention_days, last_run_at, next_run_at";

/// Audit tables and admin lookup on the platform database.
#[derive(Clone)]
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        PgAuditStore { pool }
    }
}

#[derive(Debug, FromRow)]
struct HistoryRow {
    history_id: Uuid,
    backup_filename: String,
    backup_type: String,
    status: String,
    initiated_by_user_id: Option<Uuid>,
    file_size_bytes: Option<i64>,
    duration_seconds: Option<i32>,
    error_message: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<HistoryRow> for BackupHistoryEntry {
    type Error = BackupError;

    fn try_from(row: HistoryRow) -> Result<Self> {
        Ok(BackupHistoryEntry {
            history_id: row.history_id,
            backup_filename: row.backup_filename,
            backup_type: row.backup_type.parse::<BackupType>()?,
            status: row.status.parse::<BackupStatus>()?,
            initiated_by_user_id: row.initiated_by_user_id,
            file_size_bytes: row.file_size_bytes,
            duration_seconds: row.duration_seconds,
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ScheduleRow {
    schedule_id: Uuid,
    enabled: bool,
    schedule_time: NaiveTime,
    retention_days: i32,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
}

impl From<ScheduleRow> for BackupScheduleConfig {
    fn from(row: ScheduleRow) -> Self {
        BackupScheduleConfig {
            schedule_id: row.schedule_id,
            enabled: row.enabled,
            schedule_time: row.schedule_time,
            retention_days: row.retention_days,
            last_run_at: row.last_run_at,
            next_run_at: row.next_run_at,
        }
    }
}

#[async_trait]
impl HistoryStore for PgAuditStore {
    async fn record_started(
        &self,
        filename: &str,
        backup_type: BackupType,
        initiated_by: Option<Uuid>,
        started_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let history_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO backup_history \
             (history_id, backup_filename, backup_type, status, initiated_by_user_id, started_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(history_id)
        .bind(filename)
        .bind(backup_type.as_str())
        .bind(BackupStatus::Started.as_str())
        .bind(initiated_by)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(history_id)
    }

    async fn record_completed(&self, history_id: Uuid, size_bytes: u64, duration_seconds: i32) -> Result<()> {
        let result = sqlx::query(
            "UPDATE backup_history \
             SET status = $2, file_size_bytes = $3, duration_seconds = $4, completed_at = NOW() \
             WHERE history_id = $1 AND status = 'started'",
        )
        .bind(history_id)
        .bind(BackupStatus::Completed.as_str())
        .bind(i64::try_from(size_bytes).unwrap_or(i64::MAX))
        .bind(duration_seconds)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BackupError::InvalidTransition(history_id));
        }
        Ok(())
    }

    async fn record_failed(&self, history_id: Uuid, duration_seconds: i32, error_message: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE backup_history \
             SET status = $2, duration_seconds = $3, error_message = $4, completed_at = NOW() \
             WHERE history_id = $1 AND status = 'started'",
        )
        .bind(history_id)
        .bind(BackupStatus::Failed.as_str())
        .bind(duration_seconds)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BackupError::InvalidTransition(history_id));
        }
        Ok(())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<BackupHistoryEntry>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM backup_history ORDER BY started_at DESC LIMIT $1",
            HISTORY_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BackupHistoryEntry::try_from).collect()
    }
}

#[async_trait]
impl ScheduleStore for PgAuditStore {
    async fn load(&self) -> Result<Option<BackupScheduleConfig>> {
        let row: Option<ScheduleRow> = sqlx::query_as(&format!(
            "SELECT {} FROM backup_schedule ORDER BY created_at ASC LIMIT 1",
            SCHEDULE_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(BackupScheduleConfig::from))
    }

    async fn load_or_create_default(&self) -> Result<BackupScheduleConfig> {
        if let Some(existing) = self.load().await? {
            return Ok(existing);
        }

        let default = BackupScheduleConfig::disabled_default();
        let row: ScheduleRow = sqlx::query_as(&format!(
            "INSERT INTO backup_schedule (schedule_id, enabled, schedule_time, retention_days) \
             VALUES ($1, $2, $3, $4) RETURNING {}",
            SCHEDULE_COLUMNS
        ))
        .bind(default.schedule_id)
        .bind(default.enabled)
        .bind(default.schedule_time)
        .bind(default.retention_days)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn record_run(
        &self,
        schedule_id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE backup_schedule SET last_run_at = $2, next_run_at = $3, updated_at = NOW() \
             WHERE schedule_id = $1",
        )
        .bind(schedule_id)
        .bind(last_run_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, schedule_id: Uuid, update: &ScheduleUpdate) -> Result<BackupScheduleConfig> {
        let row: Option<ScheduleRow> = sqlx::query_as(&format!(
            "UPDATE backup_schedule SET \
               enabled = COALESCE($2, enabled), \
               schedule_time = COALESCE($3, schedule_time), \
               retention_days = COALESCE($4, retention_days), \
               next_run_at = CASE WHEN $5 THEN $6 ELSE next_run_at END, \
               updated_at = NOW() \
             WHERE schedule_id = $1 RETURNING {}",
            SCHEDULE_COLUMNS
        ))
        .bind(schedule_id)
        .bind(update.enabled)
        .bind(update.schedule_time)
        .bind(update.retention_days)
        .bind(update.next_run_at.is_some())
        .bind(update.next_run_at.flatten())
        .fetch_optional(&self.pool)
        .await?;

        row.map(BackupScheduleConfig::from)
            .ok_or_else(|| BackupError::InvalidInput(format!("schedule {} does not exist", schedule_id)))
    }
}

#[async_trait]
impl AdminDirectory for PgAuditStore {
    async fn admin_emails(&self) -> Result<Vec<String>> {
        let emails: Vec<String> = sqlx::query_scalar(
            "SELECT email FROM users WHERE role = 'system_admin' AND email IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(emails)
    }
}
