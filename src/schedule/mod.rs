// rythm-backup/src/schedule/mod.rs
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::{next_run_after, ScheduleStore};
use crate::backup::service::{BackupService, CreateBackupOptions};
use crate::errors::Result;
use crate::notify::{BackupOutcome, NotificationDispatcher};

/// A run recorded this close to the trigger minute counts as already done.
const DEDUPE_WINDOW_MINUTES: i64 = 2;
const DISABLED_NOTICE_INTERVAL_MINUTES: i64 = 60;

/// What a single evaluation decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    AlreadyRunning,
    NoSchedule,
    Disabled,
    NotDue,
    RecentlyRan,
    Completed { filename: String },
    Failed { error: String },
}

/// Process-local scheduler state. Does not coordinate across replicas.
#[derive(Default)]
pub struct SchedulerState {
    in_flight: AtomicBool,
    last_disabled_notice: Mutex<Option<DateTime<Utc>>>,
}

impl SchedulerState {
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn try_begin(&self) -> Option<InFlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InFlightGuard { state: self })
    }

    /// True at most once per hour while the schedule stays disabled.
    fn should_report_disabled(&self, now: DateTime<Utc>) -> bool {
        let Ok(mut last) = self.last_disabled_notice.lock() else {
            return false;
        };
        let due = match *last {
            Some(previous) => now - previous >= ChronoDuration::minutes(DISABLED_NOTICE_INTERVAL_MINUTES),
            None => true,
        };
        if due {
            *last = Some(now);
        }
        due
    }
}

struct InFlightGuard<'a> {
    state: &'a SchedulerState,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.state.in_flight.store(false, Ordering::SeqCst);
    }
}

/// Runs the daily backup at the configured UTC minute.
pub struct BackupScheduler {
    service: Arc<BackupService>,
    schedules: Arc<dyn ScheduleStore>,
    dispatcher: Arc<NotificationDispatcher>,
    state: SchedulerState,
    tick_interval: Duration,
}

impl BackupScheduler {
    pub fn new(
        service: Arc<BackupService>,
        schedules: Arc<dyn ScheduleStore>,
        dispatcher: Arc<NotificationDispatcher>,
        tick_interval: Duration,
    ) -> Self {
        BackupScheduler {
            service,
            schedules,
            dispatcher,
            state: SchedulerState::default(),
            tick_interval,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// Evaluates the schedule once at `now` and runs the backup if it is due.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        if self.state.is_running() {
            debug!("Scheduled backup still running, skipping evaluation");
            return Ok(TickOutcome::AlreadyRunning);
        }

        let Some(schedule) = self.schedules.load().await? else {
            debug!("No backup schedule configured");
            return Ok(TickOutcome::NoSchedule);
        };

        if !schedule.enabled {
            if self.state.should_report_disabled(now) {
                info!("Scheduled backups are disabled");
            }
            return Ok(TickOutcome::Disabled);
        }

        if now.hour() != schedule.schedule_time.hour() || now.minute() != schedule.schedule_time.minute() {
            return Ok(TickOutcome::NotDue);
        }

        if let Some(last_run) = schedule.last_run_at {
            // A future-dated last run (clock skew) also counts as recent.
            if now - last_run < ChronoDuration::minutes(DEDUPE_WINDOW_MINUTES) {
                debug!(last_run = %last_run, "Scheduled backup already ran this minute");
                return Ok(TickOutcome::RecentlyRan);
            }
        }

        let Some(_guard) = self.state.try_begin() else {
            return Ok(TickOutcome::AlreadyRunning);
        };

        info!(schedule_time = %schedule.schedule_time, "Running scheduled backup");
        let clock = Instant::now();
        let result = self.service.create_backup(CreateBackupOptions::scheduled()).await;
        let outcome = BackupOutcome::from_result(&result, clock.elapsed());

        let next_run = next_run_after(now, schedule.schedule_time);
        if let Err(e) = self.schedules.record_run(schedule.schedule_id, now, next_run).await {
            warn!(error = %e, "Could not record scheduled run time");
        }

        self.dispatcher.notify_admins(outcome);

        Ok(match result {
            Ok(artifact) => {
                info!(filename = %artifact.filename, next_run = %next_run, "Scheduled backup completed");
                TickOutcome::Completed {
                    filename: artifact.filename,
                }
            }
            Err(e) => {
                error!(error = %e, next_run = %next_run, "Scheduled backup failed");
                TickOutcome::Failed { error: e.to_string() }
            }
        })
    }

    /// Evaluates the schedule every tick until `shutdown` is cancelled. Each
    /// evaluation runs in its own task so a long backup never delays the clock.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(tick_seconds = self.tick_interval.as_secs(), "Backup scheduler started");
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let scheduler = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = scheduler.tick(Utc::now()).await {
                            error!(error = %e, "Backup schedule evaluation failed");
                        }
                    });
                }
                _ = shutdown.cancelled() => {
                    info!("Backup scheduler received cancellation signal");
                    break;
                }
            }
        }
    }
}
