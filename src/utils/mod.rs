pub mod setting;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use which::which;

use crate::errors::{BackupError, Result};

/// Exit status and captured stderr of an external tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl CommandOutcome {
    pub fn success() -> Self {
        CommandOutcome {
            exit_code: Some(0),
            stderr: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turns a non-zero exit into a `Command` error carrying the stderr text.
    pub fn into_result(self, tool: &str) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }
        Err(BackupError::Command {
            tool: tool.to_string(),
            exit_code: self.exit_code,
            stderr: self.stderr.trim().to_string(),
        })
    }
}

/// Finds a PostgreSQL client executable in the system PATH.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).map_err(|_| {
        BackupError::Config(format!(
            "{} executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH.",
            name
        ))
    })
}

/// Runs `command` to completion, capturing stderr. With a timeout the child is
/// killed when the deadline passes.
pub async fn run_tool(mut command: Command, tool: &str, timeout: Option<Duration>) -> Result<CommandOutcome> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, command.output()).await {
            Ok(output) => output,
            Err(_) => {
                return Err(BackupError::Timeout {
                    tool: tool.to_string(),
                    timeout: limit,
                });
            }
        },
        None => command.output().await,
    }
    .map_err(|e| BackupError::Config(format!("Failed to execute {}: {}", tool, e)))?;

    Ok(CommandOutcome {
        exit_code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Human-readable size, e.g. `1.5 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        let rounded = (value * 100.0).round() / 100.0;
        format!("{} {}", rounded, UNITS[unit])
    }
}
