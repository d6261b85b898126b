// rythm-backup/src/audit/schema.rs
use sqlx::PgPool;
use tracing::debug;

use crate::errors::Result;

// Executed one at a time; the extended query protocol rejects multi-statement strings.
const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS backup_history (
        history_id UUID PRIMARY KEY,
        backup_filename TEXT NOT NULL,
        backup_type TEXT NOT NULL CHECK (backup_type IN ('manual', 'scheduled')),
        status TEXT NOT NULL CHECK (status IN ('started', 'completed', 'failed')),
        initiated_by_user_id UUID,
        file_size_bytes BIGINT,
        duration_seconds INTEGER,
        error_message TEXT,
        started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        completed_at TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS idx_backup_history_started_at ON backup_history (started_at DESC)",
    "CREATE TABLE IF NOT EXISTS backup_schedule (
        schedule_id UUID PRIMARY KEY,
        enabled BOOLEAN NOT NULL DEFAULT FALSE,
        schedule_time TIME NOT NULL DEFAULT '02:00:00',
        retention_days INTEGER NOT NULL DEFAULT 30 CHECK (retention_days BETWEEN 1 AND 90),
        last_run_at TIMESTAMPTZ,
        next_run_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
];

/// Creates the audit tables when missing. Never alters existing ones.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!("Audit schema is in place");
    Ok(())
}
