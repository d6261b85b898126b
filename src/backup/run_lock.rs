// rythm-backup/src/backup/run_lock.rs
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tracing::{debug, warn};

use crate::errors::{BackupError, Result};

/// Advisory lock key shared by every process working on the same database.
pub const RUN_LOCK_KEY: i64 = 0x7279_7468_6d62_6b70;

/// Held for the duration of a backup or restore; dropping it releases the lock.
pub struct RunGuard {
    _held: Box<dyn Send>,
}

impl RunGuard {
    fn holding<T: Send + 'static>(value: T) -> Self {
        RunGuard { _held: Box::new(value) }
    }
}

/// Mutual exclusion between backups and restores.
#[async_trait]
pub trait RunLock: Send + Sync {
    /// With `wait` the call blocks until the lock is free, otherwise it fails
    /// with `Busy` straight away.
    async fn acquire(&self, wait: bool) -> Result<RunGuard>;
}

/// Session-level PostgreSQL advisory lock, so a CLI invocation and a running
/// `serve` exclude each other.
pub struct PgAdvisoryLock {
    pool: PgPool,
    key: i64,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        PgAdvisoryLock {
            pool,
            key: RUN_LOCK_KEY,
        }
    }
}

#[async_trait]
impl RunLock for PgAdvisoryLock {
    async fn acquire(&self, wait: bool) -> Result<RunGuard> {
        let mut conn = self.pool.acquire().await?;
        if wait {
            sqlx::query("SELECT pg_advisory_lock($1)")
                .bind(self.key)
                .execute(&mut *conn)
                .await?;
        } else {
            let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                .bind(self.key)
                .fetch_one(&mut *conn)
                .await?;
            if !acquired {
                return Err(BackupError::Busy);
            }
        }
        debug!(key = self.key, "Acquired backup run lock");
        Ok(RunGuard::holding(AdvisoryHold {
            conn: Some(conn),
            key: self.key,
        }))
    }
}

struct AdvisoryHold {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
}

impl Drop for AdvisoryHold {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else { return };
        let key = self.key;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
                        .bind(key)
                        .fetch_one(&mut *conn)
                        .await;
                    if !matches!(unlocked, Ok(true)) {
                        warn!(key, "Could not release backup run lock, closing its session");
                        drop(conn.detach());
                    }
                });
            }
            // The server drops session locks when the connection goes away.
            Err(_) => drop(conn.detach()),
        }
    }
}

/// In-process lock; every holder must share one instance.
#[cfg(test)]
#[derive(Default)]
pub struct LocalRunLock {
    inner: std::sync::Arc<tokio::sync::Mutex<()>>,
}

#[cfg(test)]
#[async_trait]
impl RunLock for LocalRunLock {
    async fn acquire(&self, wait: bool) -> Result<RunGuard> {
        let guard = if wait {
            self.inner.clone().lock_owned().await
        } else {
            self.inner.clone().try_lock_owned().map_err(|_| BackupError::Busy)?
        };
        Ok(RunGuard::holding(guard))
    }
}
