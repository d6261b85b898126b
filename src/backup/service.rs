// rythm-backup/src/backup/service.rs
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempPath;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::db_dump::DumpInvoker;
use super::naming::{artifact_filename, is_artifact_key};
use super::object_store::{BlobReader, ObjectStore, StoredObject};
use super::run_lock::RunLock;
use crate::audit::{BackupStatus, BackupType, HistoryStore, ScheduleStore, DEFAULT_RETENTION_DAYS};
use crate::config::{BackupSettings, DatabaseConfig, RetentionPolicy};
use crate::errors::{BackupError, Result};
use crate::restore::db_restore::RestoreInvoker;

#[derive(Debug, Clone, Copy)]
pub struct CreateBackupOptions {
    pub user_id: Option<Uuid>,
    pub backup_type: BackupType,
}

impl CreateBackupOptions {
    pub fn manual(user_id: Option<Uuid>) -> Self {
        CreateBackupOptions {
            user_id,
            backup_type: BackupType::Manual,
        }
    }

    pub fn scheduled() -> Self {
        CreateBackupOptions {
            user_id: None,
            backup_type: BackupType::Scheduled,
        }
    }
}

/// A backup file as it exists in object storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupArtifact {
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub database_name: String,
    pub status: BackupStatus,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub deleted: Vec<String>,
    pub failed: usize,
}

/// Creates, lists, restores and prunes full database backups.
pub struct BackupService {
    settings: BackupSettings,
    database: DatabaseConfig,
    store: Arc<dyn ObjectStore>,
    dumper: Arc<dyn DumpInvoker>,
    restorer: Arc<dyn RestoreInvoker>,
    history: Arc<dyn HistoryStore>,
    schedules: Arc<dyn ScheduleStore>,
    // Shared by backups and restores so two never touch the database at once.
    run_lock: Arc<dyn RunLock>,
}

impl BackupService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: BackupSettings,
        database: DatabaseConfig,
        store: Arc<dyn ObjectStore>,
        dumper: Arc<dyn DumpInvoker>,
        restorer: Arc<dyn RestoreInvoker>,
        history: Arc<dyn HistoryStore>,
        schedules: Arc<dyn ScheduleStore>,
        run_lock: Arc<dyn RunLock>,
    ) -> Self {
        BackupService {
            settings,
            database,
            store,
            dumper,
            restorer,
            history,
            schedules,
            run_lock,
        }
    }

    /// Dumps the database, uploads the file and prunes expired artifacts.
    ///
    /// Manual runs fail with `Busy` while another backup or restore holds the
    /// run lock; scheduled runs wait for it.
    pub async fn create_backup(&self, options: CreateBackupOptions) -> Result<BackupArtifact> {
        let _guard = self
            .run_lock
            .acquire(options.backup_type == BackupType::Scheduled)
            .await?;

        let started_at = Utc::now();
        let clock = Instant::now();
        let filename = artifact_filename(&self.settings.file_prefix, started_at);
        info!(filename = %filename, backup_type = options.backup_type.as_str(), "Starting database backup");

        let history_id = match self
            .history
            .record_started(&filename, options.backup_type, options.user_id, started_at)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(filename = %filename, error = %e, "Could not record backup start in history");
                None
            }
        };

        match self.produce_artifact(&filename).await {
            Ok(size_bytes) => {
                match self.sweep_retention_at(Utc::now()).await {
                    Ok(report) if !report.deleted.is_empty() || report.failed > 0 => info!(
                        deleted = report.deleted.len(),
                        failed = report.failed,
                        "Retention sweep finished"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Retention sweep failed"),
                }

                let duration_seconds = elapsed_seconds(clock);
                if let Some(id) = history_id {
                    if let Err(e) = self.history.record_completed(id, size_bytes, duration_seconds).await {
                        warn!(history_id = %id, error = %e, "Could not mark backup as completed in history");
                    }
                }

                info!(filename = %filename, size_bytes, duration_seconds, "Backup completed");
                Ok(BackupArtifact {
                    filename,
                    created_at: started_at,
                    size_bytes,
                    database_name: self.database.database.clone(),
                    status: BackupStatus::Completed,
                })
            }
            Err(err) => {
                let message = err.to_string();
                let duration_seconds = elapsed_seconds(clock);
                error!(filename = %filename, error = %message, "Backup failed");

                if let Some(id) = history_id {
                    if let Err(e) = self.history.record_failed(id, duration_seconds, &message).await {
                        warn!(history_id = %id, error = %e, "Could not mark backup as failed in history");
                    }
                }

                Err(BackupError::BackupFailed { filename, message })
            }
        }
    }

    /// Dump into a scratch file and upload it. The scratch file is removed
    /// when `scratch` drops, whatever the outcome.
    async fn produce_artifact(&self, filename: &str) -> Result<u64> {
        let scratch = self.scratch_file(filename).await?;

        self.dumper
            .dump(&self.database, &scratch)
            .await?
            .into_result("pg_dump")?;

        let size_bytes = tokio::fs::metadata(&scratch).await?.len();

        self.store.ensure_container().await?;
        self.store.put_file(filename, &scratch).await?;
        info!(bucket = self.store.container(), filename, size_bytes, "Uploaded backup");
        Ok(size_bytes)
    }

    async fn scratch_file(&self, filename: &str) -> Result<TempPath> {
        tokio::fs::create_dir_all(&self.settings.temp_dir).await?;
        let stem = filename.trim_end_matches(".sql");
        let file = tempfile::Builder::new()
            .prefix(stem)
            .suffix(".sql")
            .tempfile_in(&self.settings.temp_dir)?;
        Ok(file.into_temp_path())
    }

    /// All `.sql` artifacts, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupArtifact>> {
        self.collect_artifacts()
            .await
            .map_err(|e| BackupError::List(e.to_string()))
    }

    async fn collect_artifacts(&self) -> Result<Vec<BackupArtifact>> {
        self.store.ensure_container().await?;
        let mut artifacts: Vec<BackupArtifact> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|object| is_artifact_key(&object.key))
            .map(|object| self.to_artifact(object))
            .collect();

        artifacts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.filename.cmp(&a.filename))
        });
        Ok(artifacts)
    }

    fn to_artifact(&self, object: StoredObject) -> BackupArtifact {
        BackupArtifact {
            filename: object.key,
            created_at: object.created_at,
            size_bytes: object.size_bytes,
            database_name: self.database.database.clone(),
            status: BackupStatus::Completed,
        }
    }

    /// Replays `filename` over the live database. Statements that ran before a
    /// failure stay applied.
    pub async fn restore_backup(&self, filename: &str) -> Result<()> {
        let _guard = self.run_lock.acquire(false).await?;
        info!(filename, "Starting database restore");

        self.restore_from_store(filename)
            .await
            .map_err(|e| BackupError::Restore(e.to_string()))?;

        info!(filename, "Database restore completed");
        Ok(())
    }

    async fn restore_from_store(&self, filename: &str) -> Result<()> {
        let scratch = self.scratch_file(filename).await?;
        let bytes = self.store.download_to_file(filename, &scratch).await?;
        info!(filename, size_bytes = bytes, "Downloaded backup for restore");

        self.restore_file(&scratch).await
    }

    async fn restore_file(&self, source: &Path) -> Result<()> {
        self.restorer
            .restore(&self.database, source)
            .await?
            .into_result("psql")
    }

    /// Removes the blob. History rows that mention it are left alone.
    pub async fn delete_backup(&self, filename: &str) -> Result<()> {
        self.store
            .delete(filename)
            .await
            .map_err(|e| BackupError::Delete(e.to_string()))?;
        info!(filename, "Backup deleted");
        Ok(())
    }

    pub async fn download_backup(&self, filename: &str) -> Result<BlobReader> {
        self.store
            .open(filename)
            .await
            .map_err(|e| BackupError::Download(e.to_string()))
    }

    async fn retention_days(&self) -> u32 {
        match self.settings.retention {
            RetentionPolicy::Fixed { days } => days,
            RetentionPolicy::ScheduleConfigured => match self.schedules.load().await {
                Ok(Some(schedule)) if schedule.retention_days > 0 => schedule.retention_days as u32,
                Ok(_) => DEFAULT_RETENTION_DAYS as u32,
                Err(e) => {
                    warn!(error = %e, "Could not read schedule retention, using the default");
                    DEFAULT_RETENTION_DAYS as u32
                }
            },
        }
    }

    /// Deletes every artifact created strictly before `now - retention`.
    /// Individual delete failures are counted and skipped.
    pub async fn sweep_retention_at(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let days = self.retention_days().await;
        let cutoff = now - ChronoDuration::days(i64::from(days));

        let mut report = RetentionReport::default();
        for artifact in self.collect_artifacts().await? {
            if artifact.created_at >= cutoff {
                continue;
            }
            match self.store.delete(&artifact.filename).await {
                Ok(()) => {
                    info!(filename = %artifact.filename, retention_days = days, "Deleted expired backup");
                    report.deleted.push(artifact.filename);
                }
                Err(e) => {
                    warn!(filename = %artifact.filename, error = %e, "Failed to delete expired backup");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

/// Whole seconds, rounded to the nearest.
fn elapsed_seconds(clock: Instant) -> i32 {
    round_seconds(clock.elapsed())
}

fn round_seconds(elapsed: std::time::Duration) -> i32 {
    // `as` saturates at i32::MAX.
    elapsed.as_secs_f64().round() as i32
}
