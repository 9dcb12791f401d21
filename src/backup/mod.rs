//! Portable JSONL backups of the target store.
//!
//! Each run rewrites `issues.jsonl`, `labels.jsonl`, `dependencies.jsonl`,
//! `comments.jsonl` and `config.jsonl` in full, and appends to
//! `events.jsonl` only the events past the recorded watermark. The state
//! file is written last, so a crash mid-run leaves the previous state in
//! force and the next run redoes the work.

mod git;
mod state;

pub use git::sync_backup_dir;
pub use state::{BackupState, STATE_FILE};

use crate::config::{AppConfig, BackupConfig};
use crate::error::{MigrateError, MigrateResult, Warning, best_effort};
use crate::paths::{DataPaths, write_atomic};
use crate::target::TargetEngine;
use crate::types::TableCounts;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// File holding the incrementally appended history events.
pub const EVENTS_FILE: &str = "events.jsonl";

/// Who asked for the export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupTrigger {
    /// Explicit command. Never throttled.
    #[default]
    Manual,
    /// Opportunistic run after a state change. Throttled by interval.
    Automatic,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BackupOptions {
    /// Export even when the target commit has not changed.
    pub force: bool,
    pub trigger: BackupTrigger,
}

/// Summary of a completed export.
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub dir: PathBuf,
    pub counts: TableCounts,
    pub events_appended: u64,
    pub last_event_id: i64,
    pub commit: Option<String>,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum BackupOutcome {
    Exported(BackupReport),
    /// The target commit matches the last export.
    Unchanged { commit: Option<String> },
    /// An automatic run inside the throttle interval. `next_eligible` is
    /// `None` when the interval never elapses.
    Throttled { next_eligible: Option<DateTime<Utc>> },
    /// No open store handle was available to an automatic run.
    NoHandle,
    /// An automatic run failed; reported, never propagated.
    Failed(Warning),
}

/// Report for `backup status`.
#[derive(Debug, Clone, Serialize)]
pub struct BackupStatus {
    pub dir: PathBuf,
    pub state: Option<BackupState>,
    pub interval_secs: u64,
    /// Set while an automatic run would be throttled.
    pub next_eligible: Option<DateTime<Utc>>,
    pub throttled: bool,
}

/// Writes portable backups into one directory.
#[derive(Debug, Clone)]
pub struct BackupExporter {
    dir: PathBuf,
    config: BackupConfig,
}

impl BackupExporter {
    pub fn new(dir: impl Into<PathBuf>, config: BackupConfig) -> Self {
        Self {
            dir: dir.into(),
            config,
        }
    }

    /// Exporter for the configured directory (default `<data_dir>/backup`).
    pub fn from_config(paths: &DataPaths, config: &AppConfig) -> Self {
        let dir = config
            .backup
            .dir
            .clone()
            .unwrap_or_else(|| paths.backup_dir());
        Self::new(dir, config.backup.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn load_state(&self) -> MigrateResult<Option<BackupState>> {
        BackupState::load(&self.state_path())
    }

    pub fn status(&self, now: DateTime<Utc>) -> MigrateResult<BackupStatus> {
        let state = self.load_state()?;
        let throttled = state
            .as_ref()
            .is_some_and(|s| s.is_throttled(now, self.config.interval_secs));
        let next_eligible = state
            .as_ref()
            .and_then(|s| s.next_eligible(self.config.interval_secs))
            .filter(|_| throttled);
        Ok(BackupStatus {
            dir: self.dir.clone(),
            state,
            interval_secs: self.config.interval_secs,
            next_eligible,
            throttled,
        })
    }

    /// Export the target into the backup directory.
    pub async fn run(
        &self,
        engine: &dyn TargetEngine,
        options: BackupOptions,
    ) -> MigrateResult<BackupOutcome> {
        if engine.is_closed() {
            return match options.trigger {
                BackupTrigger::Automatic => Ok(BackupOutcome::NoHandle),
                BackupTrigger::Manual => Err(MigrateError::handle_closed()),
            };
        }

        let now = Utc::now();
        let previous = self.load_state()?;

        if options.trigger == BackupTrigger::Automatic {
            if let Some(state) = &previous {
                if state.is_throttled(now, self.config.interval_secs) {
                    let next_eligible = state.next_eligible(self.config.interval_secs);
                    debug!(?next_eligible, "automatic backup throttled");
                    return Ok(BackupOutcome::Throttled { next_eligible });
                }
            }
        }

        let commit = engine.current_commit().await?;
        if !options.force {
            if let (Some(state), Some(current)) = (&previous, &commit) {
                if state.last_commit.as_ref() == Some(current) {
                    debug!(commit = %current, "no changes since last backup");
                    return Ok(BackupOutcome::Unchanged { commit });
                }
            }
        }

        fs::create_dir_all(&self.dir)?;

        let issues = engine.read_issues().await?;
        let labels = engine.read_labels().await?;
        let dependencies = engine.read_dependencies().await?;
        let comments = engine.read_comments().await?;
        let config = engine.read_config().await?;

        write_table(&self.dir, "issues", &issues)?;
        write_table(&self.dir, "labels", &labels)?;
        write_table(&self.dir, "dependencies", &dependencies)?;
        write_table(&self.dir, "comments", &comments)?;
        write_table(&self.dir, "config", &config)?;

        let watermark = previous.as_ref().map_or(0, |s| s.last_event_id);
        let events = engine.read_events_since(watermark).await?;
        let events_path = self.dir.join(EVENTS_FILE);
        let prior_events = match &previous {
            Some(state) => {
                append_lines(&events_path, &events)?;
                state.counts.events
            }
            None => {
                // First export: start the file fresh.
                write_atomic(&events_path, &to_jsonl(&events)?)?;
                0
            }
        };
        let last_event_id = events.iter().map(|e| e.id).max().unwrap_or(watermark);

        let counts = TableCounts {
            issues: issues.len() as u64,
            labels: labels.len() as u64,
            dependencies: dependencies.len() as u64,
            events: prior_events + events.len() as u64,
            comments: comments.len() as u64,
            config: config.len() as u64,
        };

        let state = BackupState {
            last_backup: Some(now),
            last_event_id,
            last_commit: commit.clone(),
            counts,
        };
        state.save(&self.state_path())?;

        info!(
            dir = %self.dir.display(),
            issues = counts.issues,
            events_appended = events.len(),
            trigger = ?options.trigger,
            "portable backup written"
        );

        let mut warnings = Vec::new();
        if self.config.git_push {
            let message = format!("backup: {} issues at {}", counts.issues, now.to_rfc3339());
            let limit = Duration::from_secs(self.config.git_timeout_secs);
            warnings.extend(best_effort(
                "git sync",
                sync_backup_dir(&self.dir, &message, limit).await,
            ));
        }

        Ok(BackupOutcome::Exported(BackupReport {
            dir: self.dir.clone(),
            counts,
            events_appended: events.len() as u64,
            last_event_id,
            commit,
            warnings,
        }))
    }
}

/// Automatic export hook for callers that just changed state.
///
/// Skips without error when no handle is available or open, honours the
/// throttle, and turns failures into [`BackupOutcome::Failed`].
pub async fn maybe_auto_backup(
    engine: Option<&dyn TargetEngine>,
    exporter: &BackupExporter,
) -> BackupOutcome {
    let Some(engine) = engine else {
        return BackupOutcome::NoHandle;
    };
    let options = BackupOptions {
        force: false,
        trigger: BackupTrigger::Automatic,
    };
    match exporter.run(engine, options).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(error = %err, "automatic backup failed");
            BackupOutcome::Failed(Warning {
                step: "automatic backup".to_string(),
                message: err.to_string(),
            })
        }
    }
}

fn to_jsonl<T: Serialize>(rows: &[T]) -> MigrateResult<Vec<u8>> {
    let mut out = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut out, row)?;
        out.push(b'\n');
    }
    Ok(out)
}

fn write_table<T: Serialize>(dir: &Path, table: &str, rows: &[T]) -> MigrateResult<()> {
    write_atomic(&dir.join(format!("{}.jsonl", table)), &to_jsonl(rows)?)
}

fn append_lines<T: Serialize>(path: &Path, rows: &[T]) -> MigrateResult<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let bytes = to_jsonl(rows)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupConfig;
    use tempfile::TempDir;

    #[test]
    fn test_to_jsonl_one_object_per_line() {
        let rows = vec![serde_json::json!({"a": 1}), serde_json::json!({"a": 2})];
        let bytes = to_jsonl(&rows).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "{\"a\":1}\n{\"a\":2}\n");
    }

    #[test]
    fn test_append_lines_extends_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(EVENTS_FILE);
        append_lines(&path, &[serde_json::json!(1)]).unwrap();
        append_lines(&path, &[serde_json::json!(2)]).unwrap();
        append_lines::<serde_json::Value>(&path, &[]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1\n2\n");
    }

    #[test]
    fn test_status_without_state() {
        let temp = TempDir::new().unwrap();
        let exporter = BackupExporter::new(temp.path(), BackupConfig::default());
        let status = exporter.status(Utc::now()).unwrap();
        assert!(status.state.is_none());
        assert!(!status.throttled);
        assert!(status.next_eligible.is_none());
    }

    #[tokio::test]
    async fn test_auto_backup_without_handle() {
        let temp = TempDir::new().unwrap();
        let exporter = BackupExporter::new(temp.path(), BackupConfig::default());
        assert!(matches!(
            maybe_auto_backup(None, &exporter).await,
            BackupOutcome::NoHandle
        ));
    }
}
