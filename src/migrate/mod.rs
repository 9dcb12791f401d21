//! One-time migration of the legacy SQLite store into the target engine.
//!
//! A run moves through [`MigrationStep`]s in a fixed order. Everything up to
//! and including count verification is undoable: a failure there restores
//! `metadata.json` from the snapshot captured before the first mutation.
//! Flipping `metadata.json` to the target backend is the point of no return;
//! the steps after it are best-effort and only produce warnings. The last of
//! them is an automatic portable backup of the freshly written store.

mod backup_file;
mod counts;
mod rollback;

pub use backup_file::{MAX_BACKUP_ATTEMPTS, backup_candidate, create_backup};
pub use counts::{verify_migration_counts, verify_table_counts};
pub use rollback::RollbackManager;

use crate::backup::{BackupExporter, BackupOutcome, maybe_auto_backup};
use crate::config::{AppConfig, Backend, MetadataStore, PersistedConfig, SyncMode};
use crate::config::metadata::write_sync_mode;
use crate::error::{MigrateError, MigrateResult, Warning, best_effort};
use crate::freshness::record_import_time;
use crate::legacy::{LegacyExtractor, extractor_for};
use crate::paths::{DataPaths, migrated_path};
use crate::target::{
    EngineOpener, Reachability, StandardOpener, TargetEngine, TargetLocation,
    database_name_for_prefix, verify_target,
};
use crate::types::TableCounts;
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Steps of a migration run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStep {
    Detect,
    Extract,
    BackupLegacy,
    VerifyTarget,
    CaptureConfig,
    WriteTarget,
    RecordImport,
    VerifyCounts,
    CommitConfig,
    RetireLegacy,
    Done,
}

impl MigrationStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStep::Detect => "detect",
            MigrationStep::Extract => "extract",
            MigrationStep::BackupLegacy => "backup-legacy",
            MigrationStep::VerifyTarget => "verify-target",
            MigrationStep::CaptureConfig => "capture-config",
            MigrationStep::WriteTarget => "write-target",
            MigrationStep::RecordImport => "record-import",
            MigrationStep::VerifyCounts => "verify-counts",
            MigrationStep::CommitConfig => "commit-config",
            MigrationStep::RetireLegacy => "retire-legacy",
            MigrationStep::Done => "done",
        }
    }
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-local state of one run. Never persisted.
#[derive(Debug)]
pub struct MigrationRun {
    step: MigrationStep,
    rollback: RollbackManager,
    database: Option<String>,
    committed: bool,
}

impl MigrationRun {
    fn new(store: MetadataStore) -> Self {
        Self {
            step: MigrationStep::Detect,
            rollback: RollbackManager::new(store),
            database: None,
            committed: false,
        }
    }

    fn enter(&mut self, step: MigrationStep) {
        debug!(step = %step, "migration step");
        self.step = step;
    }

    pub fn step(&self) -> MigrationStep {
        self.step
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Whether a failure now must restore the configuration.
    fn needs_rollback(&self) -> bool {
        self.rollback.is_captured() && !self.committed
    }
}

#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    /// Extract and probe only; mutate nothing.
    pub dry_run: bool,
}

/// What a dry run found.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationPlan {
    pub legacy_path: PathBuf,
    pub database: String,
    pub target: String,
    pub reachability: Reachability,
    pub counts: TableCounts,
}

/// Result of a completed migration.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub database: String,
    pub target: String,
    pub reachability: Reachability,
    pub backup_path: PathBuf,
    pub source_counts: TableCounts,
    pub target_counts: TableCounts,
    pub commit: String,
    /// False when the legacy file could not be renamed after the flip.
    pub legacy_retired: bool,
    /// Automatic portable backup taken after the flip.
    pub backup: BackupOutcome,
    pub warnings: Vec<Warning>,
}

/// Outcome of [`Migrator::run`]. No-ops are values, not errors.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum MigrationOutcome {
    /// No legacy store exists.
    NothingToMigrate { legacy_path: PathBuf },
    /// An earlier run already completed.
    AlreadyMigrated { reason: String },
    DryRun(MigrationPlan),
    Migrated(MigrationReport),
}

/// Runs migrations for one data directory.
pub struct Migrator {
    paths: DataPaths,
    config: AppConfig,
    extractor: Box<dyn LegacyExtractor>,
    opener: Box<dyn EngineOpener>,
}

impl Migrator {
    pub fn new(paths: DataPaths, config: AppConfig) -> Self {
        let extractor = extractor_for(&config.legacy);
        Self {
            paths,
            config,
            extractor,
            opener: Box::new(StandardOpener),
        }
    }

    pub fn with_extractor(mut self, extractor: Box<dyn LegacyExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_opener(mut self, opener: Box<dyn EngineOpener>) -> Self {
        self.opener = opener;
        self
    }

    fn store(&self) -> MetadataStore {
        MetadataStore::new(self.paths.metadata_json())
    }

    /// Why this data directory needs no migration, if it does not.
    pub fn already_migrated(&self, persisted: &PersistedConfig) -> Option<String> {
        if persisted.backend == Backend::Dolt {
            return Some(format!(
                "{} already names the {} backend",
                self.paths.metadata_json().display(),
                Backend::Dolt
            ));
        }
        let marker = migrated_path(&self.paths.legacy_db(persisted));
        if marker.exists() {
            return Some(format!("{} exists", marker.display()));
        }
        None
    }

    pub async fn run(&self, options: &MigrateOptions) -> MigrateResult<MigrationOutcome> {
        let store = self.store();
        let mut run = MigrationRun::new(store.clone());

        run.enter(MigrationStep::Detect);
        let persisted = store.load()?;
        if let Some(reason) = self.already_migrated(&persisted) {
            info!(%reason, "already migrated, nothing to do");
            return Ok(MigrationOutcome::AlreadyMigrated { reason });
        }
        let legacy = self.paths.legacy_db(&persisted);
        if !legacy.exists() {
            info!(path = %legacy.display(), "no legacy store found");
            return Ok(MigrationOutcome::NothingToMigrate { legacy_path: legacy });
        }

        run.enter(MigrationStep::Extract);
        let snapshot = self.extractor.extract(&legacy).map_err(|e| at_step(e, run.step))?;
        let database = database_name_for_prefix(&snapshot.prefix);
        run.database = Some(database.clone());
        let location = TargetLocation::for_migration(&self.paths, &self.config, &database);
        let source_counts = snapshot.counts();
        info!(
            extractor = self.extractor.name(),
            database = %database,
            target = %location,
            issues = source_counts.issues,
            "legacy store extracted"
        );

        let probe_timeout = Duration::from_millis(self.config.server.connect_timeout_ms);

        if options.dry_run {
            run.enter(MigrationStep::VerifyTarget);
            let reachability = verify_target(&location, &database, probe_timeout)
                .await
                .map_err(|e| at_step(e, run.step))?;
            return Ok(MigrationOutcome::DryRun(MigrationPlan {
                legacy_path: legacy,
                database,
                target: location.to_string(),
                reachability,
                counts: source_counts,
            }));
        }

        run.enter(MigrationStep::BackupLegacy);
        let backup_path = create_backup(&legacy, Utc::now()).map_err(|e| at_step(e, run.step))?;

        run.enter(MigrationStep::VerifyTarget);
        let reachability = verify_target(&location, &database, probe_timeout)
            .await
            .map_err(|e| at_step(e, run.step))?;
        info!(target = %location, result = reachability.describe(), "target verified");

        run.enter(MigrationStep::CaptureConfig);
        run.rollback.capture().map_err(|e| at_step(e, run.step))?;

        let mut engine: Option<Box<dyn TargetEngine>> = None;
        let staged = self
            .write_and_verify(&mut run, &mut engine, &persisted, &location, &snapshot)
            .await;

        let (commit, target_counts, mut pending) = match staged {
            Ok(staged) => staged,
            Err(err) => return Err(self.abort(&run, engine, err).await),
        };

        // Point of no return.
        run.enter(MigrationStep::CommitConfig);
        pending.backend = Backend::Dolt;
        pending.sync_mode = Some(SyncMode::DoltNative);
        pending.migrated_at = Some(Utc::now());
        if let Err(err) = store.save(&pending) {
            return Err(self.abort(&run, engine, at_step(err, run.step)).await);
        }
        run.committed = true;
        info!(database = %database, "backend switched to dolt");

        let mut warnings = Vec::new();

        run.enter(MigrationStep::RetireLegacy);
        let retired = migrated_path(&legacy);
        let rename = best_effort(
            "rename legacy store",
            fs::rename(&legacy, &retired).map_err(|e| {
                format!("{} -> {}: {}", legacy.display(), retired.display(), e)
            }),
        );
        let legacy_retired = rename.is_none();
        warnings.extend(rename);

        warnings.extend(best_effort(
            "update config.yaml sync.mode",
            write_sync_mode(&self.paths.config_yaml(), SyncMode::DoltNative),
        ));

        let exporter = BackupExporter::from_config(&self.paths, &self.config);
        let backup = maybe_auto_backup(engine.as_deref(), &exporter).await;
        if let BackupOutcome::Failed(warning) = &backup {
            warnings.push(warning.clone());
        }

        if let Some(engine) = engine {
            warnings.extend(best_effort("close target", engine.close().await));
        }

        run.enter(MigrationStep::Done);
        info!(
            database = %database,
            commit = %commit,
            warnings = warnings.len(),
            "migration complete"
        );

        Ok(MigrationOutcome::Migrated(MigrationReport {
            database,
            target: location.to_string(),
            reachability,
            backup_path,
            source_counts,
            target_counts,
            commit,
            legacy_retired,
            backup,
            warnings,
        }))
    }

    /// Steps between capture and the flip. Every failure here is undoable.
    async fn write_and_verify(
        &self,
        run: &mut MigrationRun,
        engine: &mut Option<Box<dyn TargetEngine>>,
        persisted: &PersistedConfig,
        location: &TargetLocation,
        snapshot: &crate::types::Snapshot,
    ) -> MigrateResult<(String, TableCounts, PersistedConfig)> {
        let database = run.database.clone().unwrap_or_default();

        // Record where the target lives while the legacy backend stays authoritative.
        let mut pending = persisted.clone();
        pending.dolt_database = Some(database.clone());
        pending.dolt_mode = Some(location.dolt_mode());
        if let TargetLocation::Server(endpoint) = location {
            pending.server_host = Some(endpoint.host.clone());
            pending.server_port = Some(endpoint.port);
            pending.server_user = Some(endpoint.user.clone());
        }
        self.store().save(&pending).map_err(|e| at_step(e, run.step))?;

        run.enter(MigrationStep::WriteTarget);
        let opened = self
            .opener
            .open(location, &database)
            .await
            .map_err(|e| at_step(e, run.step))?;
        let handle: &dyn TargetEngine = &**engine.insert(opened);
        let message = format!(
            "Migrate {} issues from {}",
            snapshot.issues.len(),
            self.paths.legacy_db(persisted).display()
        );
        let commit = handle
            .write_snapshot(snapshot, &message)
            .await
            .map_err(|e| at_step(e, run.step))?;

        run.enter(MigrationStep::RecordImport);
        record_import_time(handle, Utc::now())
            .await
            .map_err(|e| at_step(e, run.step))?;

        run.enter(MigrationStep::VerifyCounts);
        let target_counts = handle.table_counts().await.map_err(|e| at_step(e, run.step))?;
        verify_table_counts(&snapshot.counts(), &target_counts).map_err(|e| at_step(e, run.step))?;

        Ok((commit, target_counts, pending))
    }

    /// Roll back if the run is before the point of no return, then close the engine.
    async fn abort(
        &self,
        run: &MigrationRun,
        engine: Option<Box<dyn TargetEngine>>,
        err: MigrateError,
    ) -> MigrateError {
        error!(step = %run.step(), error = %err, "migration failed");
        let mut err = err;
        if run.needs_rollback() {
            if let Err(rollback_err) = run.rollback.rollback() {
                error!(error = %rollback_err, "rollback failed");
                err = err.with_details(format!(
                    "step: {}; rollback also failed: {}",
                    run.step(),
                    rollback_err
                ));
            }
        } else {
            warn!(step = %run.step(), "failure after the point of no return, not rolling back");
        }
        if let Some(engine) = engine {
            if let Some(warning) = best_effort("close target", engine.close().await) {
                err = append_warnings(err, &[warning]);
            }
        }
        err
    }
}

/// Fold best-effort warnings from the failure path into the error details.
fn append_warnings(err: MigrateError, warnings: &[Warning]) -> MigrateError {
    if warnings.is_empty() {
        return err;
    }
    let notes = warnings
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    let details = match &err.details {
        Some(details) => format!("{}; {}", details, notes),
        None => notes,
    };
    err.with_details(details)
}

/// Annotate an error with the step it happened in.
fn at_step(err: MigrateError, step: MigrationStep) -> MigrateError {
    if err.details.is_some() {
        err
    } else {
        err.with_details(format!("step: {}", step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_are_ordered() {
        assert!(MigrationStep::VerifyCounts < MigrationStep::CommitConfig);
        assert!(MigrationStep::CommitConfig < MigrationStep::RetireLegacy);
    }

    #[test]
    fn test_at_step_keeps_existing_details() {
        let err = MigrateError::internal("boom").with_details("original");
        assert_eq!(at_step(err, MigrationStep::Extract).details.as_deref(), Some("original"));
        let err = at_step(MigrateError::internal("boom"), MigrationStep::Extract);
        assert_eq!(err.details.as_deref(), Some("step: extract"));
    }

    #[test]
    fn test_append_warnings_keeps_step() {
        let err = at_step(MigrateError::internal("boom"), MigrationStep::VerifyCounts);
        let warning = Warning {
            step: "close target".to_string(),
            message: "connection reset".to_string(),
        };
        let err = append_warnings(err, &[warning]);
        assert_eq!(
            err.details.as_deref(),
            Some("step: verify-counts; close target: connection reset")
        );
        let err = append_warnings(MigrateError::internal("boom"), &[]);
        assert!(err.details.is_none());
    }

    #[test]
    fn test_needs_rollback_only_before_flip() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut run = MigrationRun::new(MetadataStore::new(temp.path().join("metadata.json")));
        run.enter(MigrationStep::WriteTarget);
        assert!(!run.needs_rollback());

        run.rollback.capture().unwrap();
        assert!(run.needs_rollback());

        run.enter(MigrationStep::CommitConfig);
        assert!(run.needs_rollback());

        run.committed = true;
        run.enter(MigrationStep::RetireLegacy);
        assert!(!run.needs_rollback());
    }
}
