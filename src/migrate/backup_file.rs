//! Timestamped, never-overwriting copies of the legacy store.

use crate::error::{MigrateError, MigrateResult};
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Number of distinct names tried for one timestamp before giving up.
pub const MAX_BACKUP_ATTEMPTS: u32 = 100;

/// SQLite sidecar files copied alongside the main file when present.
const SIDECAR_SUFFIXES: &[&str] = &["-wal", "-shm"];

/// Candidate backup path for `attempt` (1-based).
///
/// Attempt 1 is `<stem>.backup-YYYYMMDD-HHMMSS.<ext>`; later attempts
/// append `-N` to the timestamp.
pub fn backup_candidate(source: &Path, at: DateTime<Utc>, attempt: u32) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    let ext = source
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let stamp = at.format("%Y%m%d-%H%M%S");
    let name = if attempt <= 1 {
        format!("{}.backup-{}{}", stem, stamp, ext)
    } else {
        format!("{}.backup-{}-{}{}", stem, stamp, attempt, ext)
    };
    source.with_file_name(name)
}

/// Copy `source` to a fresh backup path stamped with `at`.
///
/// Existing files are never overwritten: each candidate is created with
/// `create_new`, and a taken name moves on to the next suffix. After
/// [`MAX_BACKUP_ATTEMPTS`] taken names the copy fails permanently.
pub fn create_backup(source: &Path, at: DateTime<Utc>) -> MigrateResult<PathBuf> {
    for attempt in 1..=MAX_BACKUP_ATTEMPTS {
        let candidate = backup_candidate(source, at, attempt);
        let dest = match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %candidate.display(), "backup name taken");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = copy_into(source, dest) {
            let _ = fs::remove_file(&candidate);
            return Err(e.into());
        }
        if let Err(e) = copy_sidecars(source, &candidate) {
            remove_partial(&candidate);
            return Err(e);
        }

        info!(source = %source.display(), backup = %candidate.display(), "legacy store backed up");
        return Ok(candidate);
    }
    Err(MigrateError::backup_slots_exhausted(source, MAX_BACKUP_ATTEMPTS))
}

fn copy_into(source: &Path, mut dest: File) -> io::Result<()> {
    let mut src = File::open(source)?;
    io::copy(&mut src, &mut dest)?;
    dest.sync_all()
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut side = path.as_os_str().to_owned();
    side.push(suffix);
    PathBuf::from(side)
}

fn copy_sidecars(source: &Path, backup: &Path) -> MigrateResult<()> {
    for suffix in SIDECAR_SUFFIXES {
        let side = sidecar(source, suffix);
        if !side.exists() {
            continue;
        }
        fs::copy(&side, sidecar(backup, suffix))?;
    }
    Ok(())
}

/// Remove a backup and whatever sidecars were copied next to it.
fn remove_partial(backup: &Path) {
    let _ = fs::remove_file(backup);
    for suffix in SIDECAR_SUFFIXES {
        let _ = fs::remove_file(sidecar(backup, suffix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 45).unwrap()
    }

    #[test]
    fn test_candidate_names() {
        let source = Path::new("/data/issues.db");
        assert_eq!(
            backup_candidate(source, fixed_time(), 1),
            PathBuf::from("/data/issues.backup-20250601-123045.db")
        );
        assert_eq!(
            backup_candidate(source, fixed_time(), 7),
            PathBuf::from("/data/issues.backup-20250601-123045-7.db")
        );
        let last = backup_candidate(source, fixed_time(), MAX_BACKUP_ATTEMPTS);
        assert!(last.to_string_lossy().ends_with("-123045-100.db"));
        let second = backup_candidate(source, fixed_time(), 2);
        assert!(second.to_string_lossy().ends_with("-123045-2.db"));
    }

    #[test]
    fn test_backup_copies_contents() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("issues.db");
        fs::write(&source, b"payload").unwrap();

        let backup = create_backup(&source, fixed_time()).unwrap();
        assert_eq!(fs::read(&backup).unwrap(), b"payload");
        assert_eq!(fs::read(&source).unwrap(), b"payload");
    }

    #[test]
    fn test_same_second_collisions_exhaust_after_limit() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("issues.db");
        fs::write(&source, b"payload").unwrap();

        let mut seen = HashSet::new();
        for _ in 0..MAX_BACKUP_ATTEMPTS {
            let path = create_backup(&source, fixed_time()).unwrap();
            assert!(seen.insert(path));
        }

        let err = create_backup(&source, fixed_time()).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::BackupSlotsExhausted);
        assert!(err.message.contains("100"));
    }

    #[test]
    fn test_existing_backup_is_not_overwritten() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("issues.db");
        fs::write(&source, b"new").unwrap();
        let taken = backup_candidate(&source, fixed_time(), 1);
        fs::write(&taken, b"old").unwrap();

        let backup = create_backup(&source, fixed_time()).unwrap();
        assert_ne!(backup, taken);
        assert_eq!(fs::read(&taken).unwrap(), b"old");
    }

    #[test]
    fn test_wal_sidecar_copied() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("issues.db");
        fs::write(&source, b"main").unwrap();
        fs::write(temp.path().join("issues.db-wal"), b"wal").unwrap();

        let backup = create_backup(&source, fixed_time()).unwrap();
        assert_eq!(fs::read(sidecar(&backup, "-wal")).unwrap(), b"wal");
    }

    #[test]
    fn test_failed_sidecar_copy_leaves_nothing_behind() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("issues.db");
        fs::write(&source, b"main").unwrap();
        fs::write(temp.path().join("issues.db-wal"), b"wal").unwrap();
        // A directory where the shm file should be cannot be copied.
        fs::create_dir(temp.path().join("issues.db-shm")).unwrap();

        assert!(create_backup(&source, fixed_time()).is_err());

        let candidate = backup_candidate(&source, fixed_time(), 1);
        assert!(!candidate.exists());
        assert!(!sidecar(&candidate, "-wal").exists());
        assert!(!sidecar(&candidate, "-shm").exists());
    }
}
