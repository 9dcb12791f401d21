//! Migration commands: `migrate`, `extract` and `verify-target`.

use super::CliContext;
use crate::backup::BackupOutcome;
use crate::config::{AppConfig, ExtractorChoice};
use crate::legacy::{extractor_for, validate_legacy_file};
use crate::migrate::{MigrateOptions, MigrationOutcome, MigrationPlan, MigrationReport, Migrator};
use crate::target::{
    DEFAULT_DATABASE_NAME, TargetLocation, database_name_for_prefix, verify_target,
};
use crate::types::TableCounts;
use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

/// Legacy reader selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExtractVia {
    /// Linked SQLite driver
    Native,
    /// The sqlite3 command-line client
    Cli,
}

impl From<ExtractVia> for ExtractorChoice {
    fn from(via: ExtractVia) -> Self {
        match via {
            ExtractVia::Native => ExtractorChoice::Native,
            ExtractVia::Cli => ExtractorChoice::Cli,
        }
    }
}

fn config_with_via(config: &AppConfig, via: Option<ExtractVia>) -> AppConfig {
    let mut config = config.clone();
    if let Some(via) = via {
        config.legacy.extractor = via.into();
    }
    config
}

/// Arguments for the migrate command.
#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Perform migration without prompting for confirmation.
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Show what would be migrated without making changes.
    #[arg(long)]
    pub dry_run: bool,

    /// Legacy reader (default: legacy.extractor from config)
    #[arg(long, value_enum)]
    pub via: Option<ExtractVia>,
}

/// Run the migrate command.
pub async fn run_migrate(args: &MigrateArgs, ctx: &CliContext) -> Result<()> {
    let config = config_with_via(&ctx.config, args.via);
    let migrator = Migrator::new(ctx.paths.clone(), config);

    // Every real run is preceded by a read-only plan, shown for confirmation.
    let plan = match migrator.run(&MigrateOptions { dry_run: true }).await? {
        MigrationOutcome::DryRun(plan) => plan,
        other => return report_outcome(ctx, &other),
    };

    if args.dry_run {
        return ctx.emit(&MigrationOutcome::DryRun(plan.clone()), || {
            print_plan(&plan);
            println!("Dry run: No changes made.");
        });
    }

    if !args.yes && !ctx.json {
        print_plan(&plan);
        println!(
            "This will copy {} into {} and switch the backend to dolt.",
            plan.legacy_path.display(),
            plan.target
        );
        print!("Continue? [y/N] ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Migration cancelled.");
            return Ok(());
        }
        println!("Migrating...");
    }

    let outcome = migrator
        .run(&MigrateOptions { dry_run: false })
        .await
        .context("migration failed")?;
    report_outcome(ctx, &outcome)
}

fn report_outcome(ctx: &CliContext, outcome: &MigrationOutcome) -> Result<()> {
    ctx.emit(outcome, || match outcome {
        MigrationOutcome::NothingToMigrate { legacy_path } => {
            println!(
                "No migration needed: '{}' does not exist.",
                legacy_path.display()
            );
        }
        MigrationOutcome::AlreadyMigrated { reason } => {
            println!("Already migrated: {}.", reason);
        }
        MigrationOutcome::DryRun(plan) => print_plan(plan),
        MigrationOutcome::Migrated(report) => print_report(report),
    })
}

fn print_counts(counts: &TableCounts) {
    for (table, count) in counts.iter() {
        println!("  {:<14}{}", table, count);
    }
}

fn print_plan(plan: &MigrationPlan) {
    println!("Migration plan:");
    println!("  From:     {}", plan.legacy_path.display());
    println!("  To:       {}", plan.target);
    println!("  Database: {}", plan.database);
    println!("  Target:   {}", plan.reachability.describe());
    println!();
    print_counts(&plan.counts);
    println!();
}

fn print_report(report: &MigrationReport) {
    println!("Migration complete!");
    println!();
    println!("  Database: {}", report.database);
    println!("  Target:   {}", report.target);
    println!("  Commit:   {}", report.commit);
    println!("  Backup:   {}", report.backup_path.display());
    if let BackupOutcome::Exported(export) = &report.backup {
        println!("  Export:   {}", export.dir.display());
    }
    println!();
    for (table, source) in report.source_counts.iter() {
        let target = report.target_counts.get(table).unwrap_or(0);
        println!("  {:<14}{} -> {}", table, source, target);
    }
    if !report.legacy_retired {
        println!();
        println!("The legacy store could not be renamed; it is no longer used.");
    }
    if !report.warnings.is_empty() {
        println!();
        println!("Warnings:");
        for warning in &report.warnings {
            println!("  {}", warning);
        }
    }
}

/// Arguments for the extract command.
#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Legacy reader (default: legacy.extractor from config)
    #[arg(long, value_enum)]
    pub via: Option<ExtractVia>,

    /// Legacy database file (default: from metadata.json)
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// Write the snapshot JSON to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print only the row counts
    #[arg(long)]
    pub counts: bool,
}

/// Run the extract command.
pub fn run_extract(args: &ExtractArgs, ctx: &CliContext) -> Result<()> {
    let path = match &args.path {
        Some(path) => path.clone(),
        None => ctx.paths.legacy_db(&ctx.persisted()?),
    };
    validate_legacy_file(&path)?;

    let config = config_with_via(&ctx.config, args.via);
    let extractor = extractor_for(&config.legacy);
    let snapshot = extractor
        .extract(&path)
        .with_context(|| format!("failed to extract {}", path.display()))?;

    if args.counts {
        let counts = snapshot.counts();
        return ctx.emit(&counts, || print_counts(&counts));
    }

    let json = serde_json::to_string_pretty(&snapshot)?;
    match &args.output {
        Some(output) => {
            fs::write(output, format!("{}\n", json))
                .with_context(|| format!("failed to write {}", output.display()))?;
            eprintln!(
                "Extracted {} issues via {} into {}",
                snapshot.issues.len(),
                extractor.name(),
                output.display()
            );
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// Arguments for the verify-target command.
#[derive(Args, Debug)]
pub struct VerifyTargetArgs {
    /// Database expected on the server (default: derived from the legacy prefix)
    #[arg(long)]
    pub database: Option<String>,
}

#[derive(Debug, Serialize)]
struct VerifyReport {
    target: String,
    database: String,
    reachability: crate::target::Reachability,
}

/// Run the verify-target command.
pub async fn run_verify_target(args: &VerifyTargetArgs, ctx: &CliContext) -> Result<()> {
    let persisted = ctx.persisted()?;
    let database = match &args.database {
        Some(database) => database.clone(),
        None => match &persisted.dolt_database {
            Some(database) => database.clone(),
            None => database_from_legacy(ctx)?,
        },
    };

    let location = TargetLocation::for_migration(&ctx.paths, &ctx.config, &database);
    let timeout = Duration::from_millis(ctx.config.server.connect_timeout_ms);
    let reachability = verify_target(&location, &database, timeout).await?;

    let report = VerifyReport {
        target: location.to_string(),
        database,
        reachability,
    };
    ctx.emit(&report, || {
        println!("Target:   {}", report.target);
        println!("Database: {}", report.database);
        println!("Result:   {}", report.reachability.describe());
    })
}

fn database_from_legacy(ctx: &CliContext) -> Result<String> {
    let legacy = ctx.paths.legacy_db(&ctx.persisted()?);
    if !legacy.exists() {
        return Ok(DEFAULT_DATABASE_NAME.to_string());
    }
    let snapshot = extractor_for(&ctx.config.legacy).extract(&legacy)?;
    Ok(database_name_for_prefix(&snapshot.prefix))
}
