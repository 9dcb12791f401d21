//! Detects a live store that is older than the portable export on disk.
//!
//! After a `git pull` brings in a newer `issues.jsonl`, the database must be
//! re-imported before it is written to, or the pulled changes are lost on the
//! next export. The store records when it last imported in its metadata
//! table; this module compares that against the export's mtime.

use crate::error::{MigrateError, MigrateResult};
use crate::target::TargetEngine;
use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, warn};

/// Metadata key holding the time of the last import, RFC 3339.
pub const LAST_IMPORT_TIME_KEY: &str = "last_import_time";

/// Allowed clock skew between the file mtime and the recorded import, in seconds.
pub const FRESHNESS_TOLERANCE_SECS: i64 = 1;

/// A passing audit outcome. A stale store is an error, not a variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Freshness {
    /// The store imported at or after the file's last change.
    Fresh,
    /// No portable export exists, so there is nothing to be stale against.
    NoPortableFile,
    /// The store never recorded an import.
    NoBaseline,
    /// The recorded import time could not be parsed; the check is skipped.
    UnparsableBaseline { raw: String },
}

/// Parse a recorded import time.
///
/// RFC 3339 with nanoseconds is the form written by
/// [`record_import_time`]; plain RFC 3339 and `YYYY-MM-DD HH:MM:SS`
/// (UTC) written by older versions are also accepted.
pub fn parse_import_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|ts| ts.and_utc())
}

/// Decide freshness from the export's mtime and the raw recorded value.
pub fn evaluate(
    portable: &Path,
    file_mtime: Option<DateTime<Utc>>,
    recorded: Option<&str>,
) -> MigrateResult<Freshness> {
    let Some(file_mtime) = file_mtime else {
        return Ok(Freshness::NoPortableFile);
    };
    let Some(raw) = recorded.filter(|r| !r.trim().is_empty()) else {
        return Ok(Freshness::NoBaseline);
    };
    let Some(imported) = parse_import_time(raw) else {
        warn!(value = raw, key = LAST_IMPORT_TIME_KEY, "unparsable import time, skipping freshness check");
        return Ok(Freshness::UnparsableBaseline {
            raw: raw.to_string(),
        });
    };

    if file_mtime > imported + Duration::seconds(FRESHNESS_TOLERANCE_SECS) {
        return Err(MigrateError::stale_database(
            portable,
            file_mtime.to_rfc3339(),
            imported.to_rfc3339(),
        ));
    }
    debug!(file = %file_mtime, imported = %imported, "store is fresh");
    Ok(Freshness::Fresh)
}

/// Modification time of `path`, `None` if it does not exist.
pub fn file_mtime(path: &Path) -> MigrateResult<Option<DateTime<Utc>>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(DateTime::<Utc>::from(meta.modified()?))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Audit the live store against the portable export at `portable`.
pub async fn check_freshness(engine: &dyn TargetEngine, portable: &Path) -> MigrateResult<Freshness> {
    let mtime = file_mtime(portable)?;
    if mtime.is_none() {
        return Ok(Freshness::NoPortableFile);
    }
    let recorded = engine.get_metadata(LAST_IMPORT_TIME_KEY).await?;
    evaluate(portable, mtime, recorded.as_deref())
}

/// Record `at` as the time of the last import.
pub async fn record_import_time(engine: &dyn TargetEngine, at: DateTime<Utc>) -> MigrateResult<()> {
    let value = at.to_rfc3339_opts(SecondsFormat::Nanos, true);
    engine.set_metadata(LAST_IMPORT_TIME_KEY, &value).await
}
