//! Portable backup commands: `backup run`, `backup status` and `check-fresh`.

use super::CliContext;
use crate::backup::{BackupExporter, BackupOptions, BackupOutcome, BackupTrigger};
use crate::freshness::{Freshness, check_freshness};
use anyhow::Result;
use chrono::Utc;
use clap::{Args, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

/// Arguments for the backup command.
#[derive(Args, Debug)]
pub struct BackupArgs {
    #[command(subcommand)]
    pub command: BackupCommand,
}

#[derive(Subcommand, Debug)]
pub enum BackupCommand {
    /// Export the store into the backup directory
    Run {
        /// Export even when nothing changed since the last backup
        #[arg(short, long)]
        force: bool,
    },
    /// Show the last backup and the throttle window
    Status,
}

/// Run the backup command.
pub async fn run_backup(args: &BackupArgs, ctx: &CliContext) -> Result<()> {
    let exporter = BackupExporter::from_config(&ctx.paths, &ctx.config);
    match &args.command {
        BackupCommand::Run { force } => {
            let engine = ctx.open_migrated_engine().await?;
            let options = BackupOptions {
                force: *force,
                trigger: BackupTrigger::Manual,
            };
            let outcome = exporter.run(engine.as_ref(), options).await;
            engine.close().await?;
            let outcome = outcome?;
            ctx.emit(&outcome, || print_outcome(&outcome))
        }
        BackupCommand::Status => {
            let status = exporter.status(Utc::now())?;
            ctx.emit(&status, || {
                println!("Backup directory: {}", status.dir.display());
                match &status.state {
                    None => println!("No backup has been written yet."),
                    Some(state) => {
                        if let Some(at) = state.last_backup {
                            println!("Last backup:      {}", at.to_rfc3339());
                        }
                        if let Some(commit) = &state.last_commit {
                            println!("Last commit:      {}", commit);
                        }
                        println!("Last event id:    {}", state.last_event_id);
                        println!("Issues:           {}", state.counts.issues);
                        println!("Events:           {}", state.counts.events);
                    }
                }
                println!("Interval:         {}s", status.interval_secs);
                match status.next_eligible {
                    Some(next) => println!("Next automatic:   {}", next.to_rfc3339()),
                    None if status.throttled => println!("Next automatic:   never"),
                    None => {}
                }
            })
        }
    }
}

fn print_outcome(outcome: &BackupOutcome) {
    match outcome {
        BackupOutcome::Exported(report) => {
            println!("Backup written to {}", report.dir.display());
            for (table, count) in report.counts.iter() {
                println!("  {:<14}{}", table, count);
            }
            println!("  ({} new events)", report.events_appended);
            for warning in &report.warnings {
                println!("Warning: {}", warning);
            }
        }
        BackupOutcome::Unchanged { commit } => match commit {
            Some(commit) => println!("No changes since the last backup (commit {}).", commit),
            None => println!("No changes since the last backup."),
        },
        BackupOutcome::Throttled { next_eligible } => match next_eligible {
            Some(next) => println!("Backup throttled until {}.", next.to_rfc3339()),
            None => println!("Automatic backups are throttled indefinitely."),
        },
        BackupOutcome::NoHandle => println!("No open store; backup skipped."),
        BackupOutcome::Failed(warning) => println!("Backup failed: {}", warning),
    }
}

/// Arguments for the check-fresh command.
#[derive(Args, Debug)]
pub struct CheckFreshArgs {
    /// Portable export to compare against (default: from metadata.json)
    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct FreshnessReport {
    file: PathBuf,
    #[serde(flatten)]
    freshness: Freshness,
}

/// Run the check-fresh command. A stale store is reported as an error.
pub async fn run_check_fresh(args: &CheckFreshArgs, ctx: &CliContext) -> Result<()> {
    let file = match &args.file {
        Some(file) => file.clone(),
        None => ctx.paths.portable_export(&ctx.persisted()?),
    };
    let engine = ctx.open_migrated_engine().await?;
    let result = check_freshness(engine.as_ref(), &file).await;
    engine.close().await?;

    let report = FreshnessReport {
        file,
        freshness: result?,
    };
    ctx.emit(&report, || match &report.freshness {
        Freshness::Fresh => println!("Store is up to date with {}.", report.file.display()),
        Freshness::NoPortableFile => {
            println!("No portable export at {}; nothing to compare.", report.file.display())
        }
        Freshness::NoBaseline => println!("Store has never recorded an import; check skipped."),
        Freshness::UnparsableBaseline { raw } => {
            println!("Recorded import time {:?} is unreadable; check skipped.", raw)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_backup_run_requires_migration() {
        let temp = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.data_dir = temp.path().to_path_buf();
        let ctx = CliContext::new(config, true);

        let args = BackupArgs {
            command: BackupCommand::Run { force: false },
        };
        let err = run_backup(&args, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("trackdb migrate"));
    }

    #[tokio::test]
    async fn test_backup_status_before_first_run() {
        let temp = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.data_dir = temp.path().to_path_buf();
        let ctx = CliContext::new(config, true);

        let args = BackupArgs {
            command: BackupCommand::Status,
        };
        run_backup(&args, &ctx).await.unwrap();
    }
}
