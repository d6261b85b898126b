// rythm-backup/src/backup/db_dump.rs
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::errors::Result;
use crate::utils::{self, CommandOutcome};

/// Produces a full plain-SQL dump of one database into a local file.
#[async_trait]
pub trait DumpInvoker: Send + Sync {
    async fn dump(&self, database: &DatabaseConfig, destination: &Path) -> Result<CommandOutcome>;
}

/// Shells out to `pg_dump`.
#[derive(Debug, Clone, Default)]
pub struct PgDumpInvoker {
    pub timeout: Option<Duration>,
}

impl PgDumpInvoker {
    pub fn new(timeout: Option<Duration>) -> Self {
        PgDumpInvoker { timeout }
    }
}

/// Schema and data, with `DROP ... IF EXISTS` preambles so the file can be
/// replayed over an existing database, and no ownership or privilege statements.
pub fn pg_dump_args(database: &DatabaseConfig, destination: &Path) -> Vec<String> {
    vec![
        "-h".to_string(),
        database.host.clone(),
        "-p".to_string(),
        database.port.to_string(),
        "-U".to_string(),
        database.user.clone(),
        "-d".to_string(),
        database.database.clone(),
        "-F".to_string(),
        "p".to_string(),
        "--no-owner".to_string(),
        "--no-acl".to_string(),
        "--clean".to_string(),
        "--if-exists".to_string(),
        "-f".to_string(),
        destination.display().to_string(),
    ]
}

#[async_trait]
impl DumpInvoker for PgDumpInvoker {
    async fn dump(&self, database: &DatabaseConfig, destination: &Path) -> Result<CommandOutcome> {
        let pg_dump_path = utils::find_executable("pg_dump")?;
        debug!(
            executable = %pg_dump_path.display(),
            database = %database.database,
            destination = %destination.display(),
            "Running pg_dump"
        );

        let mut command = Command::new(pg_dump_path);
        command.args(pg_dump_args(database, destination));
        if let Some(password) = &database.password {
            command.env("PGPASSWORD", password);
        }

        utils::run_tool(command, "pg_dump", self.timeout).await
    }
}
