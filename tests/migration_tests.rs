//! Integration tests for the SQLite to Dolt migration.
//!
//! Every test runs against the embedded engine inside a temporary data
//! directory; failure paths swap in openers that break at a chosen step.

mod common;

use async_trait::async_trait;
use common::Fixture;
use std::fs;
use std::path::PathBuf;
use trackdb::backup::{BackupOutcome, BackupState, STATE_FILE};
use trackdb::config::{Backend, DoltMode, MetadataStore, SyncMode};
use trackdb::error::{ErrorCode, MigrateError, MigrateResult};
use trackdb::legacy::CliExtractor;
use trackdb::migrate::{MigrateOptions, MigrationOutcome, Migrator};
use trackdb::target::{
    BackupDestination, EngineKind, EngineOpener, StandardOpener, TargetEngine, TargetLocation,
};
use trackdb::types::{Comment, ConfigRow, Dependency, Event, Issue, LabelRow, Snapshot, TableCounts};

async fn migrate(fixture: &Fixture) -> MigrateResult<MigrationOutcome> {
    Migrator::new(fixture.paths(), fixture.config())
        .run(&MigrateOptions::default())
        .await
}

/// Opener that always fails.
struct RefusingOpener;

#[async_trait]
impl EngineOpener for RefusingOpener {
    async fn open(&self, _: &TargetLocation, _: &str) -> MigrateResult<Box<dyn TargetEngine>> {
        Err(MigrateError::database("connection reset"))
    }
}

/// How a [`FaultyEngine`] departs from the real one.
#[derive(Clone)]
enum Fault {
    /// Under-report the comments table after writing.
    ShortCount,
    /// Under-report like `ShortCount`, and fail to close afterwards.
    ShortCountAndFailedClose,
    /// Occupy the retired-store path with a directory once the write is done.
    BlockRetire(PathBuf),
}

/// Opener wrapping the embedded engine with a [`Fault`].
struct FaultyOpener(Fault);

#[async_trait]
impl EngineOpener for FaultyOpener {
    async fn open(
        &self,
        location: &TargetLocation,
        database: &str,
    ) -> MigrateResult<Box<dyn TargetEngine>> {
        let inner = StandardOpener.open(location, database).await?;
        Ok(Box::new(FaultyEngine {
            inner,
            fault: self.0.clone(),
        }))
    }
}

struct FaultyEngine {
    inner: Box<dyn TargetEngine>,
    fault: Fault,
}

#[async_trait]
impl TargetEngine for FaultyEngine {
    fn kind(&self) -> EngineKind {
        self.inner.kind()
    }
    fn database(&self) -> &str {
        self.inner.database()
    }
    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
    async fn write_snapshot(&self, snapshot: &Snapshot, message: &str) -> MigrateResult<String> {
        let commit = self.inner.write_snapshot(snapshot, message).await?;
        if let Fault::BlockRetire(marker) = &self.fault {
            fs::create_dir_all(marker.join("occupied")).unwrap();
        }
        Ok(commit)
    }
    async fn table_counts(&self) -> MigrateResult<TableCounts> {
        let mut counts = self.inner.table_counts().await?;
        if matches!(self.fault, Fault::ShortCount | Fault::ShortCountAndFailedClose) {
            counts.comments = counts.comments.saturating_sub(1);
        }
        Ok(counts)
    }
    async fn current_commit(&self) -> MigrateResult<Option<String>> {
        self.inner.current_commit().await
    }
    async fn read_issues(&self) -> MigrateResult<Vec<Issue>> {
        self.inner.read_issues().await
    }
    async fn read_labels(&self) -> MigrateResult<Vec<LabelRow>> {
        self.inner.read_labels().await
    }
    async fn read_dependencies(&self) -> MigrateResult<Vec<Dependency>> {
        self.inner.read_dependencies().await
    }
    async fn read_comments(&self) -> MigrateResult<Vec<Comment>> {
        self.inner.read_comments().await
    }
    async fn read_config(&self) -> MigrateResult<Vec<ConfigRow>> {
        self.inner.read_config().await
    }
    async fn read_events_since(&self, after_id: i64) -> MigrateResult<Vec<Event>> {
        self.inner.read_events_since(after_id).await
    }
    async fn get_metadata(&self, key: &str) -> MigrateResult<Option<String>> {
        self.inner.get_metadata(key).await
    }
    async fn set_metadata(&self, key: &str, value: &str) -> MigrateResult<()> {
        self.inner.set_metadata(key, value).await
    }
    async fn list_backups(&self) -> MigrateResult<Vec<BackupDestination>> {
        self.inner.list_backups().await
    }
    async fn add_backup(&self, name: &str, url: &str) -> MigrateResult<()> {
        self.inner.add_backup(name, url).await
    }
    async fn remove_backup(&self, name: &str) -> MigrateResult<()> {
        self.inner.remove_backup(name).await
    }
    async fn sync_backup(&self, name: &str) -> MigrateResult<()> {
        self.inner.sync_backup(name).await
    }
    async fn close(&self) -> MigrateResult<()> {
        self.inner.close().await?;
        match self.fault {
            Fault::ShortCountAndFailedClose => Err(MigrateError::database("close timed out")),
            _ => Ok(()),
        }
    }
}

mod success {
    use super::*;

    #[tokio::test]
    async fn migrates_into_embedded_engine() {
        let fixture = Fixture::new();
        fixture.sample_legacy();

        let outcome = migrate(&fixture).await.expect("migration failed");
        let MigrationOutcome::Migrated(report) = outcome else {
            panic!("expected a completed migration, got {:?}", outcome);
        };

        assert_eq!(report.database, "proj");
        assert_eq!(report.source_counts, report.target_counts);
        assert_eq!(report.source_counts.issues, 3);
        assert_eq!(report.source_counts.labels, 4);
        assert_eq!(report.source_counts.dependencies, 2);
        assert_eq!(report.source_counts.events, 3);
        assert_eq!(report.source_counts.comments, 1);
        assert!(report.legacy_retired);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert!(report.backup_path.exists());
        assert!(!report.commit.is_empty());

        let persisted = MetadataStore::new(fixture.metadata_path()).load().unwrap();
        assert_eq!(persisted.backend, Backend::Dolt);
        assert_eq!(persisted.dolt_database.as_deref(), Some("proj"));
        assert_eq!(persisted.dolt_mode, Some(DoltMode::Embedded));
        assert_eq!(persisted.sync_mode, Some(SyncMode::DoltNative));
        assert!(persisted.migrated_at.is_some());

        assert!(!fixture.legacy_path().exists());
        assert!(fixture.data_dir().join("issues.db.migrated").exists());

        let config_yaml = fs::read_to_string(fixture.data_dir().join("config.yaml")).unwrap();
        assert!(config_yaml.contains("dolt-native"));
    }

    #[tokio::test]
    async fn migration_leaves_a_portable_backup() {
        let fixture = Fixture::new();
        fixture.sample_legacy();

        let outcome = migrate(&fixture).await.unwrap();
        let MigrationOutcome::Migrated(report) = outcome else {
            panic!("expected a completed migration, got {:?}", outcome);
        };
        let BackupOutcome::Exported(export) = &report.backup else {
            panic!("expected an automatic export, got {:?}", report.backup);
        };
        assert_eq!(export.counts, report.target_counts);

        let backup_dir = fixture.data_dir().join("backup");
        let state = BackupState::load(&backup_dir.join(STATE_FILE))
            .unwrap()
            .expect("backup state missing");
        assert_eq!(state.counts.issues, 3);
        assert_eq!(state.last_event_id, 3);
        assert!(backup_dir.join("issues.jsonl").exists());
    }

    #[tokio::test]
    async fn blocked_rename_after_flip_is_a_warning() {
        let fixture = Fixture::new();
        fixture.sample_legacy();
        let marker = fixture.data_dir().join("issues.db.migrated");

        let outcome = Migrator::new(fixture.paths(), fixture.config())
            .with_opener(Box::new(FaultyOpener(Fault::BlockRetire(marker.clone()))))
            .run(&MigrateOptions::default())
            .await
            .expect("failure after the flip must not fail the run");
        let MigrationOutcome::Migrated(report) = outcome else {
            panic!("expected a completed migration, got {:?}", outcome);
        };

        assert!(!report.legacy_retired);
        assert!(
            report
                .warnings
                .iter()
                .any(|w| w.step == "rename legacy store"),
            "{:?}",
            report.warnings
        );
        assert!(fixture.legacy_path().exists());
        assert!(marker.is_dir());

        let persisted = MetadataStore::new(fixture.metadata_path()).load().unwrap();
        assert_eq!(persisted.backend, Backend::Dolt);

        let rerun = migrate(&fixture).await.unwrap();
        let MigrationOutcome::AlreadyMigrated { reason } = rerun else {
            panic!("expected a no-op, got {:?}", rerun);
        };
        assert!(reason.contains("metadata.json"));
    }

    #[tokio::test]
    async fn migrated_rows_are_readable_from_target() {
        let fixture = Fixture::new();
        fixture.sample_legacy();
        migrate(&fixture).await.unwrap();

        let engine = StandardOpener
            .open(
                &TargetLocation::Embedded {
                    path: fixture.paths().embedded_db("proj"),
                },
                "proj",
            )
            .await
            .unwrap();

        let issues = engine.read_issues().await.unwrap();
        let ids: Vec<_> = issues.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["Proj-1", "Proj-2", "Proj-3"]);
        let docs = issues.iter().find(|i| i.id == "Proj-3").unwrap();
        assert!(docs.pinned);
        assert_eq!(docs.metadata, r#"{"area":"docs"}"#);
        assert_eq!(docs.status, "open");

        let events = engine.read_events_since(0).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(engine.get_metadata("last_import_time").await.unwrap().is_some());
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let fixture = Fixture::new();
        fixture.sample_legacy();
        migrate(&fixture).await.unwrap();

        let before = fs::read(fixture.metadata_path()).unwrap();
        let outcome = migrate(&fixture).await.unwrap();
        assert!(matches!(outcome, MigrationOutcome::AlreadyMigrated { .. }));
        assert_eq!(fs::read(fixture.metadata_path()).unwrap(), before);
    }

    #[tokio::test]
    async fn migrated_marker_alone_stops_a_rerun() {
        let fixture = Fixture::new();
        fixture.sample_legacy();
        fs::copy(
            fixture.legacy_path(),
            fixture.data_dir().join("issues.db.migrated"),
        )
        .unwrap();

        let outcome = migrate(&fixture).await.unwrap();
        assert!(matches!(outcome, MigrationOutcome::AlreadyMigrated { .. }));
        assert!(!fixture.metadata_path().exists());
    }

    #[tokio::test]
    async fn command_line_extractor_migrates_the_same_rows() {
        let cli = CliExtractor::new("sqlite3");
        if !cli.is_available() {
            eprintln!("sqlite3 not found, skipping");
            return;
        }
        let fixture = Fixture::new();
        fixture.sample_legacy();

        let outcome = Migrator::new(fixture.paths(), fixture.config())
            .with_extractor(Box::new(cli))
            .run(&MigrateOptions::default())
            .await
            .unwrap();
        let MigrationOutcome::Migrated(report) = outcome else {
            panic!("expected a completed migration");
        };
        assert_eq!(report.database, "proj");
        assert_eq!(report.target_counts.labels, 4);
    }

    #[tokio::test]
    async fn empty_legacy_store_migrates_to_empty_target() {
        let fixture = Fixture::new();
        fixture.legacy("");

        let outcome = migrate(&fixture).await.unwrap();
        let MigrationOutcome::Migrated(report) = outcome else {
            panic!("expected a completed migration");
        };
        assert_eq!(report.source_counts.total(), 0);
        assert_eq!(report.database, trackdb::target::DEFAULT_DATABASE_NAME);
    }
}

mod no_ops {
    use super::*;

    #[tokio::test]
    async fn missing_legacy_store_is_nothing_to_migrate() {
        let fixture = Fixture::new();
        let outcome = migrate(&fixture).await.unwrap();
        assert!(matches!(outcome, MigrationOutcome::NothingToMigrate { .. }));
        assert!(!fixture.metadata_path().exists());
    }

    #[tokio::test]
    async fn dry_run_mutates_nothing() {
        let fixture = Fixture::new();
        fixture.sample_legacy();
        fixture.write_metadata("{\"backend\": \"sqlite\"}\n");
        let legacy_before = fs::read(fixture.legacy_path()).unwrap();

        let outcome = Migrator::new(fixture.paths(), fixture.config())
            .run(&MigrateOptions { dry_run: true })
            .await
            .unwrap();
        let MigrationOutcome::DryRun(plan) = outcome else {
            panic!("expected a plan");
        };
        assert_eq!(plan.database, "proj");
        assert_eq!(plan.counts.issues, 3);

        assert_eq!(fs::read(fixture.legacy_path()).unwrap(), legacy_before);
        assert_eq!(
            fs::read_to_string(fixture.metadata_path()).unwrap(),
            "{\"backend\": \"sqlite\"}\n"
        );
        let entries: Vec<_> = fs::read_dir(fixture.data_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries.len(), 2, "unexpected files: {:?}", entries);
    }
}

mod failures {
    use super::*;

    const ORIGINAL_METADATA: &str = "{\n  \"backend\":   \"sqlite\",\n  \"database\": \"issues.db\"\n}\n";

    #[tokio::test]
    async fn open_failure_restores_metadata_byte_for_byte() {
        let fixture = Fixture::new();
        fixture.sample_legacy();
        fixture.write_metadata(ORIGINAL_METADATA);

        let err = Migrator::new(fixture.paths(), fixture.config())
            .with_opener(Box::new(RefusingOpener))
            .run(&MigrateOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::DatabaseError);
        assert!(err.details.as_deref().unwrap_or_default().contains("write-target"));
        assert_eq!(
            fs::read_to_string(fixture.metadata_path()).unwrap(),
            ORIGINAL_METADATA
        );
        assert!(fixture.legacy_path().exists());
        assert!(!fixture.data_dir().join("issues.db.migrated").exists());
    }

    #[tokio::test]
    async fn failure_without_prior_metadata_removes_it_again() {
        let fixture = Fixture::new();
        fixture.sample_legacy();

        Migrator::new(fixture.paths(), fixture.config())
            .with_opener(Box::new(RefusingOpener))
            .run(&MigrateOptions::default())
            .await
            .unwrap_err();

        assert!(!fixture.metadata_path().exists());
        assert!(fixture.legacy_path().exists());
    }

    #[tokio::test]
    async fn count_shortfall_rolls_back() {
        let fixture = Fixture::new();
        fixture.sample_legacy();
        fixture.write_metadata(ORIGINAL_METADATA);

        let err = Migrator::new(fixture.paths(), fixture.config())
            .with_opener(Box::new(FaultyOpener(Fault::ShortCount)))
            .run(&MigrateOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::VerificationShortfall);
        assert!(err.message.contains("comments"));
        assert_eq!(
            fs::read_to_string(fixture.metadata_path()).unwrap(),
            ORIGINAL_METADATA
        );
        assert!(fixture.legacy_path().exists());
    }

    #[tokio::test]
    async fn close_failure_during_rollback_is_reported() {
        let fixture = Fixture::new();
        fixture.sample_legacy();
        fixture.write_metadata(ORIGINAL_METADATA);

        let err = Migrator::new(fixture.paths(), fixture.config())
            .with_opener(Box::new(FaultyOpener(Fault::ShortCountAndFailedClose)))
            .run(&MigrateOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::VerificationShortfall);
        let details = err.details.as_deref().unwrap_or_default();
        assert!(details.contains("verify-counts"), "{}", details);
        assert!(details.contains("close target: "), "{}", details);
        assert_eq!(
            fs::read_to_string(fixture.metadata_path()).unwrap(),
            ORIGINAL_METADATA
        );
    }

    #[tokio::test]
    async fn retry_after_failure_succeeds() {
        let fixture = Fixture::new();
        fixture.sample_legacy();

        Migrator::new(fixture.paths(), fixture.config())
            .with_opener(Box::new(FaultyOpener(Fault::ShortCount)))
            .run(&MigrateOptions::default())
            .await
            .unwrap_err();

        let outcome = migrate(&fixture).await.unwrap();
        assert!(matches!(outcome, MigrationOutcome::Migrated(_)));
    }

    #[tokio::test]
    async fn corrupted_legacy_file_is_rejected() {
        let fixture = Fixture::new();
        fs::write(fixture.legacy_path(), vec![0x42; 4096]).unwrap();

        let err = migrate(&fixture).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::CorruptedInput);
        assert!(!fixture.metadata_path().exists());
        assert!(fixture.legacy_path().exists());
    }

    #[tokio::test]
    async fn truncated_legacy_file_is_rejected() {
        let fixture = Fixture::new();
        fs::write(fixture.legacy_path(), b"SQLite format 3\0short").unwrap();

        let err = migrate(&fixture).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::CorruptedInput);
    }
}
