// rythm-backup/src/backup/naming.rs
use chrono::{DateTime, Utc};

pub const ARTIFACT_EXTENSION: &str = ".sql";

/// Builds the object key for a backup taken at `taken_at`.
///
/// The timestamp is ISO-8601 UTC with `:` and `.` replaced by `-`, millisecond
/// precision and fixed width, e.g. `rythm-backup-2025-06-01T02-00-00-000Z.sql`.
pub fn artifact_filename(prefix: &str, taken_at: DateTime<Utc>) -> String {
    format!(
        "{}-backup-{}{}",
        prefix,
        taken_at.format("%Y-%m-%dT%H-%M-%S-%3fZ"),
        ARTIFACT_EXTENSION
    )
}

pub fn is_artifact_key(key: &str) -> bool {
    key.ends_with(ARTIFACT_EXTENSION)
}
