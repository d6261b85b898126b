use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Object storage error: {0}")]
    Storage(String),

    /// External tool ran but exited unsuccessfully.
    #[error("{tool} exited with {}: {stderr}", describe_exit(.exit_code))]
    Command {
        tool: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{tool} did not finish within {}s", .timeout.as_secs())]
    Timeout { tool: String, timeout: Duration },

    #[error("Backup failed: {message}")]
    BackupFailed { filename: String, message: String },

    #[error("Restore failed: {0}")]
    Restore(String),

    #[error("Failed to list backups: {0}")]
    List(String),

    #[error("Failed to delete backup: {0}")]
    Delete(String),

    #[error("Failed to download backup: {0}")]
    Download(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Restore overwrites the live database and requires explicit confirmation")]
    ConfirmationRequired,

    #[error("Another backup or restore is already in progress")]
    Busy,

    #[error("History entry {0} is no longer in the started state")]
    InvalidTransition(uuid::Uuid),

    #[error("Notification delivery failed: {0}")]
    Notification(String),
}

impl From<reqwest::Error> for BackupError {
    fn from(err: reqwest::Error) -> Self {
        BackupError::Notification(err.to_string())
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
