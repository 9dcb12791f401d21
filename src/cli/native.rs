//! Native backup commands.

use super::CliContext;
use crate::backup::{BackupExporter, BackupOutcome, maybe_auto_backup};
use crate::native_backup::NativeBackupManager;
use anyhow::Result;
use clap::{Args, Subcommand};

/// Arguments for the native-backup command.
#[derive(Args, Debug)]
pub struct NativeBackupArgs {
    #[command(subcommand)]
    pub command: NativeBackupCommand,
}

#[derive(Subcommand, Debug)]
pub enum NativeBackupCommand {
    /// Register a destination (replaces one with the same name)
    Add {
        /// Destination name
        name: String,
        /// Filesystem path or remote URL
        target: String,
    },
    /// Unregister a destination
    Remove {
        /// Destination name
        name: String,
    },
    /// Push the store to a destination
    Sync {
        /// Destination name
        name: String,
    },
    /// Show destinations and the last sync
    Status,
}

/// Run the native-backup command.
pub async fn run_native_backup(args: &NativeBackupArgs, ctx: &CliContext) -> Result<()> {
    let manager = NativeBackupManager::new(ctx.paths.native_backup_state());

    if let NativeBackupCommand::Status = &args.command {
        // Status works from the local record when no store can be opened.
        let engine = ctx.open_migrated_engine().await.ok();
        let status = manager.status(engine.as_deref()).await;
        if let Some(engine) = engine {
            engine.close().await?;
        }
        let status = status?;
        return ctx.emit(&status, || {
            if status.state.destinations.is_empty() {
                println!("No native backup destinations.");
            }
            for dest in &status.state.destinations {
                println!("{:<16}{}", dest.name, dest.url);
            }
            if let Some(sync) = &status.state.last_sync {
                let result = match &sync.error {
                    None => "ok".to_string(),
                    Some(err) => format!("failed: {}", err),
                };
                println!();
                println!(
                    "Last sync: {} at {} ({} ms, {})",
                    sync.name,
                    sync.synced_at.to_rfc3339(),
                    sync.duration_ms,
                    result
                );
            }
        });
    }

    let engine = ctx.open_migrated_engine().await?;
    let result = match &args.command {
        NativeBackupCommand::Add { name, target } => manager
            .add_destination(engine.as_ref(), name, target)
            .await
            .map(|dest| {
                ctx.emit(&dest, || println!("Added '{}' -> {}", dest.name, dest.url))
            }),
        NativeBackupCommand::Remove { name } => manager
            .remove_destination(engine.as_ref(), name)
            .await
            .map(|()| {
                ctx.emit(&serde_json::json!({ "removed": name }), || {
                    println!("Removed '{}'", name)
                })
            }),
        NativeBackupCommand::Sync { name } => {
            manager.sync(engine.as_ref(), name).await.map(|record| {
                ctx.emit(&record, || {
                    println!("Synced '{}' in {} ms", record.name, record.duration_ms)
                })
            })
        }
        NativeBackupCommand::Status => Ok(Ok(())),
    };

    let changed = matches!(
        args.command,
        NativeBackupCommand::Add { .. } | NativeBackupCommand::Remove { .. }
    );
    if changed && matches!(result, Ok(Ok(()))) {
        let exporter = BackupExporter::from_config(&ctx.paths, &ctx.config);
        if let BackupOutcome::Failed(warning) =
            maybe_auto_backup(Some(engine.as_ref()), &exporter).await
        {
            if !ctx.json {
                eprintln!("Warning: {}", warning);
            }
        }
    }

    engine.close().await?;
    result?
}
