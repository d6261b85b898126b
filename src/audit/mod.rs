// rythm-backup/src/audit/mod.rs
pub(crate) mod postgres;
pub(crate) mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::{BackupError, Result};

pub use postgres::PgAuditStore;

pub const DEFAULT_SCHEDULE_TIME: (u32, u32) = (2, 0);
pub const DEFAULT_RETENTION_DAYS: i32 = 30;
pub const MAX_RETENTION_DAYS: i32 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Manual,
    Scheduled,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Manual => "manual",
            BackupType::Scheduled => "scheduled",
        }
    }
}

impl FromStr for BackupType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(BackupType::Manual),
            "scheduled" => Ok(BackupType::Scheduled),
            other => Err(BackupError::InvalidInput(format!("unknown backup type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Started,
    Completed,
    Failed,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Started => "started",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupStatus {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "started" => Ok(BackupStatus::Started),
            "completed" => Ok(BackupStatus::Completed),
            "failed" => Ok(BackupStatus::Failed),
            other => Err(BackupError::InvalidInput(format!("unknown backup status '{}'", other))),
        }
    }
}

/// One row of `backup_history`. Advisory only: the object store decides
/// whether an artifact exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupHistoryEntry {
    pub history_id: Uuid,
    pub backup_filename: String,
    pub backup_type: BackupType,
    pub status: BackupStatus,
    pub initiated_by_user_id: Option<Uuid>,
    pub file_size_bytes: Option<i64>,
    pub duration_seconds: Option<i32>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The singleton `backup_schedule` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupScheduleConfig {
    pub schedule_id: Uuid,
    pub enabled: bool,
    #[serde(with = "schedule_time_format")]
    pub schedule_time: NaiveTime,
    pub retention_days: i32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl BackupScheduleConfig {
    pub fn disabled_default() -> Self {
        BackupScheduleConfig {
            schedule_id: Uuid::new_v4(),
            enabled: false,
            schedule_time: default_schedule_time(),
            retention_days: DEFAULT_RETENTION_DAYS,
            last_run_at: None,
            next_run_at: None,
        }
    }
}

pub fn default_schedule_time() -> NaiveTime {
    NaiveTime::from_hms_opt(DEFAULT_SCHEDULE_TIME.0, DEFAULT_SCHEDULE_TIME.1, 0).unwrap_or(NaiveTime::MIN)
}

/// `HH:MM` or `HH:MM:SS`, 24h.
pub fn parse_schedule_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|_| {
            BackupError::InvalidInput(format!(
                "invalid schedule time '{}': expected HH:MM or HH:MM:SS",
                value
            ))
        })
}

/// Next occurrence of `schedule_time` on the calendar day after `now` (UTC), seconds zeroed.
pub fn next_run_after(now: DateTime<Utc>, schedule_time: NaiveTime) -> DateTime<Utc> {
    let tomorrow = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .unwrap_or(now.date_naive());
    let at = NaiveTime::from_hms_opt(schedule_time.hour(), schedule_time.minute(), 0).unwrap_or(schedule_time);
    tomorrow.and_time(at).and_utc()
}

/// Next occurrence of `schedule_time` strictly after `now`, today if still ahead.
pub fn next_occurrence(now: DateTime<Utc>, schedule_time: NaiveTime) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(schedule_time.hour(), schedule_time.minute(), 0).unwrap_or(schedule_time);
    let today = now.date_naive().and_time(at).and_utc();
    if today > now { today } else { next_run_after(now, schedule_time) }
}

mod schedule_time_format {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M:%S").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_schedule_time(&raw).map_err(serde::de::Error::custom)
    }
}

/// Partial update of the schedule row; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleUpdate {
    pub enabled: Option<bool>,
    pub schedule_time: Option<NaiveTime>,
    pub retention_days: Option<i32>,
    pub next_run_at: Option<Option<DateTime<Utc>>>,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn record_started(
        &self,
        filename: &str,
        backup_type: BackupType,
        initiated_by: Option<Uuid>,
        started_at: DateTime<Utc>,
    ) -> Result<Uuid>;

    /// Fails with `InvalidTransition` when the row is no longer `started`.
    async fn record_completed(&self, history_id: Uuid, size_bytes: u64, duration_seconds: i32) -> Result<()>;

    async fn record_failed(&self, history_id: Uuid, duration_seconds: i32, error_message: &str) -> Result<()>;

    /// Newest first.
    async fn recent(&self, limit: i64) -> Result<Vec<BackupHistoryEntry>>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn load(&self) -> Result<Option<BackupScheduleConfig>>;

    /// Inserts the disabled default row when none exists.
    async fn load_or_create_default(&self) -> Result<BackupScheduleConfig>;

    async fn record_run(
        &self,
        schedule_id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn update(&self, schedule_id: Uuid, update: &ScheduleUpdate) -> Result<BackupScheduleConfig>;
}

/// Who receives scheduled-run notifications.
#[async_trait]
pub trait AdminDirectory: Send + Sync {
    async fn admin_emails(&self) -> Result<Vec<String>>;
}
