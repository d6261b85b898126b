// rythm-backup/src/restore/db_restore.rs
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::errors::Result;
use crate::utils::{self, CommandOutcome};

/// Replays a plain-SQL dump into the live database.
#[async_trait]
pub trait RestoreInvoker: Send + Sync {
    async fn restore(&self, database: &DatabaseConfig, source: &Path) -> Result<CommandOutcome>;
}

/// Shells out to `psql`.
#[derive(Debug, Clone)]
pub struct PsqlRestoreInvoker {
    pub timeout: Option<Duration>,
    /// Abort on the first failing statement instead of continuing past it.
    pub stop_on_error: bool,
}

impl PsqlRestoreInvoker {
    pub fn new(timeout: Option<Duration>, stop_on_error: bool) -> Self {
        PsqlRestoreInvoker { timeout, stop_on_error }
    }
}

pub fn psql_args(database: &DatabaseConfig, source: &Path, stop_on_error: bool) -> Vec<String> {
    let mut args = vec![
        "-X".to_string(), // Do not read psqlrc
        "-q".to_string(),
    ];
    if stop_on_error {
        args.push("-v".to_string());
        args.push("ON_ERROR_STOP=1".to_string());
    }
    args.extend([
        "-h".to_string(),
        database.host.clone(),
        "-p".to_string(),
        database.port.to_string(),
        "-U".to_string(),
        database.user.clone(),
        "-d".to_string(),
        database.database.clone(),
        "-f".to_string(),
        source.display().to_string(),
    ]);
    args
}

#[async_trait]
impl RestoreInvoker for PsqlRestoreInvoker {
    async fn restore(&self, database: &DatabaseConfig, source: &Path) -> Result<CommandOutcome> {
        let psql_path = utils::find_executable("psql")?;
        debug!(
            executable = %psql_path.display(),
            database = %database.database,
            source = %source.display(),
            stop_on_error = self.stop_on_error,
            "Running psql restore"
        );

        let mut command = Command::new(psql_path);
        command.args(psql_args(database, source, self.stop_on_error));
        if let Some(password) = &database.password {
            command.env("PGPASSWORD", password);
        }

        utils::run_tool(command, "psql", self.timeout).await
    }
}
