//! Version-control sync of the backup directory through the `git` binary.

use crate::error::{MigrateError, MigrateResult};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Stage, commit and push everything in `dir`.
///
/// The whole sequence runs under `limit`; child processes are killed when
/// the timeout drops them. A commit with nothing staged is not an error and
/// skips the push.
pub async fn sync_backup_dir(dir: &Path, message: &str, limit: Duration) -> MigrateResult<()> {
    match timeout(limit, run_sequence(dir, message)).await {
        Ok(result) => result,
        Err(_) => Err(MigrateError::external_tool(
            "git",
            format!("timed out after {:?}", limit),
        )),
    }
}

async fn run_sequence(dir: &Path, message: &str) -> MigrateResult<()> {
    git(dir, &["add", "-A", "."]).await?;
    match git(dir, &["commit", "-m", message]).await {
        Ok(()) => {}
        Err(e) if e.message.contains("nothing to commit") => {
            debug!(dir = %dir.display(), "backup directory unchanged, skipping push");
            return Ok(());
        }
        Err(e) => return Err(e),
    }
    git(dir, &["push"]).await
}

async fn git(dir: &Path, args: &[&str]) -> MigrateResult<()> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| MigrateError::external_tool("git", e))?;

    if output.status.success() {
        return Ok(());
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(MigrateError::external_tool(
        &format!("git {}", args.first().copied().unwrap_or_default()),
        format!("{} {}", stdout.trim(), stderr.trim()).trim(),
    ))
}
