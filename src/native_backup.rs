//! Native backup destinations of the target engine.
//!
//! Destinations are registered with the engine's own backup primitive and
//! mirrored into `native_backup.json` together with the outcome of the last
//! sync, so `status` works without a live engine.

use crate::error::{MigrateError, MigrateResult};
use crate::paths::{absolutize, expand_home, file_uri, has_url_scheme, write_atomic};
use crate::target::{BackupDestination, TargetEngine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// Turn user input into a backup URL.
///
/// Inputs with a URL scheme pass through unchanged. Anything else is a
/// filesystem path: `~` is expanded, the path is made absolute and returned
/// as a `file://` URI.
pub fn normalize_destination(input: &str) -> MigrateResult<String> {
    let input = input.trim();
    if input.is_empty() {
        return Err(MigrateError::invalid_value("destination", "must not be empty"));
    }
    if has_url_scheme(input) {
        return Ok(input.to_string());
    }
    let path = absolutize(&expand_home(input)?)?;
    Ok(file_uri(&path))
}

/// A configured destination as recorded locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeDestination {
    pub name: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of the most recent sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub name: String,
    pub synced_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Contents of `native_backup.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeBackupState {
    #[serde(default)]
    pub destinations: Vec<NativeDestination>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<SyncRecord>,
}

impl NativeBackupState {
    pub fn load(path: &Path) -> MigrateResult<Self> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                MigrateError::invalid_value("native_backup.json", &e.to_string())
                    .with_details(path.display().to_string())
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> MigrateResult<()> {
        let mut json = serde_json::to_vec_pretty(self)?;
        json.push(b'\n');
        write_atomic(path, &json)
    }

    pub fn destination(&self, name: &str) -> Option<&NativeDestination> {
        self.destinations.iter().find(|d| d.name == name)
    }
}

/// Report for `native-backup status`.
#[derive(Debug, Clone, Serialize)]
pub struct NativeBackupStatus {
    pub state: NativeBackupState,
    /// Destinations the engine reports, when an engine was available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_destinations: Option<Vec<BackupDestination>>,
}

/// Configures and triggers native backups.
#[derive(Debug, Clone)]
pub struct NativeBackupManager {
    state_path: PathBuf,
}

impl NativeBackupManager {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Register `target` under `name`, replacing an existing registration.
    pub async fn add_destination(
        &self,
        engine: &dyn TargetEngine,
        name: &str,
        target: &str,
    ) -> MigrateResult<NativeDestination> {
        if name.trim().is_empty() {
            return Err(MigrateError::invalid_value("name", "must not be empty"));
        }
        let url = normalize_destination(target)?;

        let previous = engine
            .list_backups()
            .await?
            .into_iter()
            .find(|d| d.name == name);
        if previous.is_some() {
            info!(name, "replacing existing backup destination");
            engine.remove_backup(name).await?;
        }
        if let Err(err) = engine.add_backup(name, &url).await {
            // Put the replaced registration back.
            if let Some(previous) = &previous {
                if let Err(restore_err) = engine.add_backup(name, &previous.url).await {
                    warn!(name, error = %restore_err, "could not restore backup destination");
                    return Err(err.with_details(format!(
                        "restoring {} also failed: {}",
                        previous.url, restore_err
                    )));
                }
            }
            return Err(err);
        }

        let destination = NativeDestination {
            name: name.to_string(),
            url,
            created_at: Utc::now(),
        };
        let mut state = NativeBackupState::load(&self.state_path)?;
        state.destinations.retain(|d| d.name != name);
        state.destinations.push(destination.clone());
        state.save(&self.state_path)?;

        info!(name, url = %destination.url, "backup destination registered");
        Ok(destination)
    }

    pub async fn remove_destination(&self, engine: &dyn TargetEngine, name: &str) -> MigrateResult<()> {
        let existing = engine.list_backups().await?;
        if !existing.iter().any(|d| d.name == name) {
            return Err(MigrateError::destination_not_found(name));
        }
        engine.remove_backup(name).await?;

        let mut state = NativeBackupState::load(&self.state_path)?;
        state.destinations.retain(|d| d.name != name);
        state.save(&self.state_path)?;
        info!(name, "backup destination removed");
        Ok(())
    }

    /// Push to `name`, timing the push and recording the outcome either way.
    pub async fn sync(&self, engine: &dyn TargetEngine, name: &str) -> MigrateResult<SyncRecord> {
        let existing = engine.list_backups().await?;
        if !existing.iter().any(|d| d.name == name) {
            return Err(MigrateError::destination_not_found(name));
        }

        let started = Instant::now();
        let result = engine.sync_backup(name).await;
        let record = SyncRecord {
            name: name.to_string(),
            synced_at: Utc::now(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
        };

        let mut state = NativeBackupState::load(&self.state_path)?;
        state.last_sync = Some(record.clone());
        state.save(&self.state_path)?;

        match result {
            Ok(()) => {
                info!(name, duration_ms = record.duration_ms, "native backup synced");
                Ok(record)
            }
            Err(err) => {
                warn!(name, error = %err, "native backup sync failed");
                Err(err)
            }
        }
    }

    pub async fn status(&self, engine: Option<&dyn TargetEngine>) -> MigrateResult<NativeBackupStatus> {
        let state = NativeBackupState::load(&self.state_path)?;
        let engine_destinations = match engine {
            Some(engine) if !engine.is_closed() => Some(engine.list_backups().await?),
            _ => None,
        };
        Ok(NativeBackupStatus {
            state,
            engine_destinations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_urls_pass_through() {
        for url in ["aws://[table:bucket]/db", "https://dolthub.com/org/db", "file:///srv/b"] {
            assert_eq!(normalize_destination(url).unwrap(), url);
        }
    }

    #[test]
    fn test_absolute_path_becomes_file_uri() {
        assert_eq!(
            normalize_destination("/srv/backups/../dolt").unwrap(),
            "file:///srv/dolt"
        );
    }

    #[test]
    fn test_relative_path_is_absolutized() {
        let url = normalize_destination("backups/dolt").unwrap();
        let cwd = std::env::current_dir().unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("/backups/dolt"));
        assert!(url.contains(&crate::paths::path_to_forward_slashes(&cwd)));
    }

    #[test]
    fn test_home_is_expanded() {
        if let Some(home) = dirs::home_dir() {
            let url = normalize_destination("~/dolt-backup").unwrap();
            let expected = file_uri(&home.join("dolt-backup"));
            assert_eq!(url, expected);
        }
    }

    #[test]
    fn test_empty_destination_rejected() {
        assert!(normalize_destination("  ").is_err());
    }
}
