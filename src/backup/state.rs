//! Persistent record of the last successful portable export.

use crate::error::{MigrateError, MigrateResult};
use crate::paths::write_atomic;
use crate::types::TableCounts;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// File name of the state inside the backup directory.
pub const STATE_FILE: &str = "backup_state.json";

/// Contents of `backup_state.json`. Overwritten atomically, never deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupState {
    pub last_backup: Option<DateTime<Utc>>,
    /// Highest event id already appended to `events.jsonl`.
    #[serde(default)]
    pub last_event_id: i64,
    /// Target commit the export was taken from.
    #[serde(default)]
    pub last_commit: Option<String>,
    #[serde(default)]
    pub counts: TableCounts,
}

impl BackupState {
    /// Load the state. `None` before the first export.
    pub fn load(path: &Path) -> MigrateResult<Option<Self>> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                MigrateError::invalid_value(STATE_FILE, &e.to_string())
                    .with_details(path.display().to_string())
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> MigrateResult<()> {
        let mut json = serde_json::to_vec_pretty(self)?;
        json.push(b'\n');
        write_atomic(path, &json)
    }

    /// Earliest time an automatic export may run again.
    ///
    /// `None` before the first export, and also when the interval reaches
    /// past the representable range, in which case no automatic export is
    /// ever eligible again.
    pub fn next_eligible(&self, interval_secs: u64) -> Option<DateTime<Utc>> {
        let last = self.last_backup?;
        let interval = Duration::try_seconds(i64::try_from(interval_secs).ok()?)?;
        last.checked_add_signed(interval)
    }

    /// Whether an automatic export at `now` falls inside the interval.
    pub fn is_throttled(&self, now: DateTime<Utc>, interval_secs: u64) -> bool {
        if self.last_backup.is_none() {
            return false;
        }
        match self.next_eligible(interval_secs) {
            Some(next) => now < next,
            None => true,
        }
    }
}
