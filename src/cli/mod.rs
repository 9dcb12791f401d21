//! CLI command definitions for trackdb.
//!
//! The `Cli` struct holds the global options; each subcommand's arguments
//! and runner live in their own module.

pub mod backup;
pub mod migrate;
pub mod native;

use crate::config::{AppConfig, Backend, MetadataStore, PersistedConfig};
use crate::paths::DataPaths;
use crate::target::{DEFAULT_DATABASE_NAME, EngineOpener, StandardOpener, TargetEngine, TargetLocation};
use anyhow::{Result, bail};
use backup::{BackupArgs, CheckFreshArgs};
use clap::{Parser, Subcommand};
use migrate::{ExtractArgs, MigrateArgs, VerifyTargetArgs};
use native::NativeBackupArgs;
use serde::Serialize;
use std::path::PathBuf;

/// Storage migration and backup for trackdb projects
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Data directory (default: .trackdb, or TRACKDB_DATA_DIR)
    #[arg(short, long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Explicit configuration file (replaces project and user config)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Migrate the legacy SQLite store into Dolt
    Migrate(MigrateArgs),

    /// Read the legacy store and print the extracted snapshot
    Extract(ExtractArgs),

    /// Probe the configured target server
    VerifyTarget(VerifyTargetArgs),

    /// Portable JSONL backups
    Backup(BackupArgs),

    /// Fail if the portable export is newer than the last import
    CheckFresh(CheckFreshArgs),

    /// Dolt native backup destinations
    NativeBackup(NativeBackupArgs),
}

/// Resolved state shared by every subcommand.
#[derive(Debug, Clone)]
pub struct CliContext {
    pub paths: DataPaths,
    pub config: AppConfig,
    pub json: bool,
}

impl CliContext {
    pub fn new(config: AppConfig, json: bool) -> Self {
        Self {
            paths: DataPaths::new(config.data_dir.clone()),
            config,
            json,
        }
    }

    pub fn metadata(&self) -> MetadataStore {
        MetadataStore::new(self.paths.metadata_json())
    }

    pub fn persisted(&self) -> Result<PersistedConfig> {
        Ok(self.metadata().load()?)
    }

    /// Open the engine recorded by a completed migration.
    pub async fn open_migrated_engine(&self) -> Result<Box<dyn TargetEngine>> {
        let persisted = self.persisted()?;
        if persisted.backend != Backend::Dolt {
            bail!(
                "{} names the {} backend; run `trackdb migrate` first",
                self.paths.metadata_json().display(),
                persisted.backend
            );
        }
        let location = TargetLocation::from_persisted(&self.paths, &persisted, &self.config);
        let database = persisted
            .dolt_database
            .as_deref()
            .unwrap_or(DEFAULT_DATABASE_NAME);
        Ok(StandardOpener.open(&location, database).await?)
    }

    /// Print `value` as JSON, or `human` otherwise.
    pub fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce()) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human();
        }
        Ok(())
    }
}

/// Dispatch a parsed command.
pub async fn run(command: &Command, ctx: &CliContext) -> Result<()> {
    match command {
        Command::Migrate(args) => migrate::run_migrate(args, ctx).await,
        Command::Extract(args) => migrate::run_extract(args, ctx),
        Command::VerifyTarget(args) => migrate::run_verify_target(args, ctx).await,
        Command::Backup(args) => backup::run_backup(args, ctx).await,
        Command::CheckFresh(args) => backup::run_check_fresh(args, ctx).await,
        Command::NativeBackup(args) => native::run_native_backup(args, ctx).await,
    }
}
