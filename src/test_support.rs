// In-memory collaborators for driving the service, scheduler and console in tests.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::audit::{
    AdminDirectory, BackupHistoryEntry, BackupScheduleConfig, BackupStatus, BackupType, HistoryStore,
    ScheduleStore, ScheduleUpdate,
};
use crate::backup::db_dump::DumpInvoker;
use crate::backup::object_store::{BlobReader, ObjectStore, StoredObject};
use crate::backup::run_lock::LocalRunLock;
use crate::backup::service::BackupService;
use crate::config::{BackupSettings, DatabaseConfig, RetentionPolicy};
use crate::errors::{BackupError, Result};
use crate::notify::{BackupNotification, NotificationDispatcher, Notifier};
use crate::restore::db_restore::RestoreInvoker;
use crate::utils::CommandOutcome;

pub fn test_database() -> DatabaseConfig {
    DatabaseConfig {
        host: "localhost".to_string(),
        port: 5432,
        database: "rythm".to_string(),
        user: "rythm_api".to_string(),
        password: Some("test".to_string()),
    }
}

#[derive(Default)]
pub struct FakeObjectStore {
    objects: Mutex<BTreeMap<String, (Vec<u8>, DateTime<Utc>)>>,
    fail_puts: AtomicBool,
    failing_deletes: Mutex<HashSet<String>>,
}

impl FakeObjectStore {
    pub fn insert(&self, key: &str, body: &[u8], created_at: DateTime<Utc>) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (body.to_vec(), created_at));
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn size_of(&self, key: &str) -> Option<u64> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(body, _)| body.len() as u64)
    }

    pub fn fail_puts(&self) {
        self.fail_puts.store(true, Ordering::SeqCst);
    }

    pub fn fail_delete_of(&self, key: &str) {
        self.failing_deletes.lock().unwrap().insert(key.to_string());
    }

    fn body_of(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(body, _)| body.clone())
            .ok_or_else(|| BackupError::Storage(format!("NoSuchKey: {}", key)))
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    fn container(&self) -> &str {
        "test-bucket"
    }

    async fn ensure_container(&self) -> Result<()> {
        Ok(())
    }

    async fn put_file(&self, key: &str, source: &Path) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(BackupError::Storage("upload rejected".to_string()));
        }
        let body = tokio::fs::read(source).await?;
        self.insert(key, &body, Utc::now());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StoredObject>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .map(|(key, (body, created_at))| StoredObject {
                key: key.clone(),
                size_bytes: body.len() as u64,
                created_at: *created_at,
            })
            .collect())
    }

    async fn download_to_file(&self, key: &str, destination: &Path) -> Result<u64> {
        let body = self.body_of(key)?;
        tokio::fs::write(destination, &body).await?;
        Ok(body.len() as u64)
    }

    async fn open(&self, key: &str) -> Result<BlobReader> {
        let body = self.body_of(key)?;
        Ok(Box::pin(Cursor::new(body)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.failing_deletes.lock().unwrap().contains(key) {
            return Err(BackupError::Storage(format!("AccessDenied: {}", key)));
        }
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

#[derive(Clone)]
pub enum DumpBehaviour {
    Write(Vec<u8>),
    Fail { exit_code: i32, stderr: String },
    /// Blocks until the gate is notified, then writes.
    Gated(Arc<Notify>, Vec<u8>),
}

pub struct FakeDumpInvoker {
    behaviour: Mutex<DumpBehaviour>,
    calls: AtomicUsize,
}

impl Default for FakeDumpInvoker {
    fn default() -> Self {
        FakeDumpInvoker {
            behaviour: Mutex::new(DumpBehaviour::Write(b"-- PostgreSQL database dump\nSELECT 1;\n".to_vec())),
            calls: AtomicUsize::new(0),
        }
    }
}

impl FakeDumpInvoker {
    pub fn set_behaviour(&self, behaviour: DumpBehaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    /// Makes subsequent dumps block until the returned gate is notified.
    pub fn gate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.set_behaviour(DumpBehaviour::Gated(gate.clone(), b"-- gated dump\n".to_vec()));
        gate
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn wait_for_calls(&self, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.calls() < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dump was never invoked");
    }
}

#[async_trait]
impl DumpInvoker for FakeDumpInvoker {
    async fn dump(&self, _database: &DatabaseConfig, destination: &Path) -> Result<CommandOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let behaviour = self.behaviour.lock().unwrap().clone();
        match behaviour {
            DumpBehaviour::Write(body) => {
                tokio::fs::write(destination, body).await?;
                Ok(CommandOutcome::success())
            }
            DumpBehaviour::Fail { exit_code, stderr } => Ok(CommandOutcome {
                exit_code: Some(exit_code),
                stderr,
            }),
            DumpBehaviour::Gated(gate, body) => {
                gate.notified().await;
                tokio::fs::write(destination, body).await?;
                Ok(CommandOutcome::success())
            }
        }
    }
}

pub struct FakeRestoreInvoker {
    outcome: Mutex<CommandOutcome>,
    restored: Mutex<Vec<Vec<u8>>>,
}

impl Default for FakeRestoreInvoker {
    fn default() -> Self {
        FakeRestoreInvoker {
            outcome: Mutex::new(CommandOutcome::success()),
            restored: Mutex::new(Vec::new()),
        }
    }
}

impl FakeRestoreInvoker {
    pub fn fail_with(&self, exit_code: i32, stderr: &str) {
        *self.outcome.lock().unwrap() = CommandOutcome {
            exit_code: Some(exit_code),
            stderr: stderr.to_string(),
        };
    }

    pub fn restored(&self) -> Vec<Vec<u8>> {
        self.restored.lock().unwrap().clone()
    }
}

#[async_trait]
impl RestoreInvoker for FakeRestoreInvoker {
    async fn restore(&self, _database: &DatabaseConfig, source: &Path) -> Result<CommandOutcome> {
        let body = tokio::fs::read(source).await?;
        self.restored.lock().unwrap().push(body);
        Ok(self.outcome.lock().unwrap().clone())
    }
}

/// History, schedule and admin directory in one place.
#[derive(Default)]
pub struct InMemoryAudit {
    history: Mutex<Vec<BackupHistoryEntry>>,
    schedule: Mutex<Option<BackupScheduleConfig>>,
    admins: Mutex<Vec<String>>,
    fail_history_writes: AtomicBool,
    fail_schedule_reads: AtomicBool,
    run_records: AtomicUsize,
}

impl InMemoryAudit {
    pub fn history(&self) -> Vec<BackupHistoryEntry> {
        self.history.lock().unwrap().clone()
    }

    pub fn schedule(&self) -> Option<BackupScheduleConfig> {
        self.schedule.lock().unwrap().clone()
    }

    pub fn set_schedule(&self, schedule: BackupScheduleConfig) {
        *self.schedule.lock().unwrap() = Some(schedule);
    }

    pub fn set_admins(&self, emails: &[&str]) {
        *self.admins.lock().unwrap() = emails.iter().map(|e| e.to_string()).collect();
    }

    pub fn fail_history_writes(&self) {
        self.fail_history_writes.store(true, Ordering::SeqCst);
    }

    pub fn fail_schedule_reads(&self) {
        self.fail_schedule_reads.store(true, Ordering::SeqCst);
    }

    pub fn run_records(&self) -> usize {
        self.run_records.load(Ordering::SeqCst)
    }

    fn finish(&self, history_id: Uuid, apply: impl FnOnce(&mut BackupHistoryEntry)) -> Result<()> {
        if self.fail_history_writes.load(Ordering::SeqCst) {
            return Err(BackupError::Config("history unavailable".to_string()));
        }
        let mut history = self.history.lock().unwrap();
        let entry = history
            .iter_mut()
            .find(|e| e.history_id == history_id && e.status == BackupStatus::Started)
            .ok_or(BackupError::InvalidTransition(history_id))?;
        apply(entry);
        entry.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for InMemoryAudit {
    async fn record_started(
        &self,
        filename: &str,
        backup_type: BackupType,
        initiated_by: Option<Uuid>,
        started_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        if self.fail_history_writes.load(Ordering::SeqCst) {
            return Err(BackupError::Config("history unavailable".to_string()));
        }
        let history_id = Uuid::new_v4();
        self.history.lock().unwrap().push(BackupHistoryEntry {
            history_id,
            backup_filename: filename.to_string(),
            backup_type,
            status: BackupStatus::Started,
            initiated_by_user_id: initiated_by,
            file_size_bytes: None,
            duration_seconds: None,
            error_message: None,
            started_at,
            completed_at: None,
        });
        Ok(history_id)
    }

    async fn record_completed(&self, history_id: Uuid, size_bytes: u64, duration_seconds: i32) -> Result<()> {
        self.finish(history_id, |entry| {
            entry.status = BackupStatus::Completed;
            entry.file_size_bytes = Some(size_bytes as i64);
            entry.duration_seconds = Some(duration_seconds);
        })
    }

    async fn record_failed(&self, history_id: Uuid, duration_seconds: i32, error_message: &str) -> Result<()> {
        self.finish(history_id, |entry| {
            entry.status = BackupStatus::Failed;
            entry.duration_seconds = Some(duration_seconds);
            entry.error_message = Some(error_message.to_string());
        })
    }

    async fn recent(&self, limit: i64) -> Result<Vec<BackupHistoryEntry>> {
        let mut entries = self.history();
        entries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        entries.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(entries)
    }
}

#[async_trait]
impl ScheduleStore for InMemoryAudit {
    async fn load(&self) -> Result<Option<BackupScheduleConfig>> {
        if self.fail_schedule_reads.load(Ordering::SeqCst) {
            return Err(BackupError::Config("schedule table unavailable".to_string()));
        }
        Ok(self.schedule())
    }

    async fn load_or_create_default(&self) -> Result<BackupScheduleConfig> {
        if let Some(existing) = self.load().await? {
            return Ok(existing);
        }
        let created = BackupScheduleConfig::disabled_default();
        self.set_schedule(created.clone());
        Ok(created)
    }

    async fn record_run(
        &self,
        schedule_id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut schedule = self.schedule.lock().unwrap();
        if let Some(row) = schedule.as_mut().filter(|row| row.schedule_id == schedule_id) {
            row.last_run_at = Some(last_run_at);
            row.next_run_at = Some(next_run_at);
            self.run_records.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn update(&self, schedule_id: Uuid, update: &ScheduleUpdate) -> Result<BackupScheduleConfig> {
        let mut schedule = self.schedule.lock().unwrap();
        let row = schedule
            .as_mut()
            .filter(|row| row.schedule_id == schedule_id)
            .ok_or_else(|| BackupError::InvalidInput(format!("schedule {} does not exist", schedule_id)))?;
        if let Some(enabled) = update.enabled {
            row.enabled = enabled;
        }
        if let Some(time) = update.schedule_time {
            row.schedule_time = time;
        }
        if let Some(days) = update.retention_days {
            row.retention_days = days;
        }
        if let Some(next) = update.next_run_at {
            row.next_run_at = next;
        }
        Ok(row.clone())
    }
}

#[async_trait]
impl AdminDirectory for InMemoryAudit {
    async fn admin_emails(&self) -> Result<Vec<String>> {
        Ok(self.admins.lock().unwrap().clone())
    }
}

/// Captures every notification the dispatcher sends.
pub struct RecordingNotifier {
    tx: mpsc::UnboundedSender<BackupNotification>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<BackupNotification>>,
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        RecordingNotifier {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

impl RecordingNotifier {
    /// Next delivered notification, or `None` if nothing arrives within a second.
    pub async fn next(&self) -> Option<BackupNotification> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// True when nothing is delivered within a short window.
    pub async fn is_quiet(&self) -> bool {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &BackupNotification) -> Result<()> {
        self.tx
            .send(notification.clone())
            .map_err(|e| BackupError::Notification(e.to_string()))
    }
}

pub struct Harness {
    pub service: Arc<BackupService>,
    pub store: Arc<FakeObjectStore>,
    pub dumper: Arc<FakeDumpInvoker>,
    pub restorer: Arc<FakeRestoreInvoker>,
    pub audit: Arc<InMemoryAudit>,
    pub notifier: Arc<RecordingNotifier>,
    pub dispatcher: Arc<NotificationDispatcher>,
    run_lock: Arc<LocalRunLock>,
    settings: BackupSettings,
    scratch: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_retention(RetentionPolicy::default())
    }

    pub fn with_retention(retention: RetentionPolicy) -> Self {
        let scratch = tempfile::tempdir().expect("create scratch dir");
        let settings = BackupSettings {
            file_prefix: "rythm".to_string(),
            temp_dir: scratch.path().join("work"),
            retention,
            tool_timeout: None,
            restore_stop_on_error: true,
        };

        let store = Arc::new(FakeObjectStore::default());
        let dumper = Arc::new(FakeDumpInvoker::default());
        let restorer = Arc::new(FakeRestoreInvoker::default());
        let audit = Arc::new(InMemoryAudit::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let run_lock = Arc::new(LocalRunLock::default());

        let service = Arc::new(BackupService::new(
            settings.clone(),
            test_database(),
            store.clone(),
            dumper.clone(),
            restorer.clone(),
            audit.clone(),
            audit.clone(),
            run_lock.clone(),
        ));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            notifier.clone(),
            audit.clone(),
            Some("RYTHM System".to_string()),
        ));

        Harness {
            service,
            store,
            dumper,
            restorer,
            audit,
            notifier,
            dispatcher,
            run_lock,
            settings,
            scratch,
        }
    }

    /// Another service over the same storage, audit tables and run lock, as a
    /// second process on the same database would see them.
    pub fn sibling_service(&self) -> BackupService {
        BackupService::new(
            self.settings.clone(),
            test_database(),
            self.store.clone(),
            Arc::new(FakeDumpInvoker::default()),
            Arc::new(FakeRestoreInvoker::default()),
            self.audit.clone(),
            self.audit.clone(),
            self.run_lock.clone(),
        )
    }

    /// Files left behind in the backup scratch directory.
    pub fn scratch_files(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.scratch.path().join("work")) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}
