//! Extraction of the legacy single-file SQLite store.
//!
//! Two independent readers produce the same [`Snapshot`]:
//! - [`NativeExtractor`] reads through the linked SQLite driver.
//! - [`CliExtractor`] shells out to the `sqlite3` client with `-json` output.
//!
//! Both validate the file header first and then map rows through the
//! column defaults below, so a column missing from an older schema version
//! reads as its empty value instead of failing the extraction:
//!
//! | column                        | default        |
//! |-------------------------------|----------------|
//! | text columns                  | `""`           |
//! | `status`                      | `"open"`       |
//! | `priority`                    | `2`            |
//! | `issue_type`                  | `"task"`       |
//! | `type` (dependencies)         | `"blocks"`     |
//! | `metadata`                    | `"{}"`         |
//! | `pinned`                      | `false`        |
//! | nullable columns              | `None`         |
//! | `created_at`                  | Unix epoch     |
//! | `updated_at`                  | `created_at`   |
//!
//! Tables missing entirely read as empty.

mod cli;
mod native;

pub use cli::CliExtractor;
pub use native::NativeExtractor;

use crate::config::{ExtractorChoice, LegacyConfig};
use crate::error::{MigrateError, MigrateResult};
use crate::types::{
    Comment, ConfigRow, Dependency, Event, Issue, LabelRow, Snapshot, SnapshotBuilder,
};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic string at the start of every SQLite 3 database file.
pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Size of the SQLite database header. Smaller non-empty files are truncated.
pub const SQLITE_HEADER_LEN: u64 = 100;

/// Tables read from the legacy store.
pub const LEGACY_TABLES: &[&str] = &[
    "issues",
    "labels",
    "dependencies",
    "events",
    "comments",
    "config",
];

/// Why a legacy file failed header validation.
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("file does not exist")]
    Missing,
    #[error("file is {len} bytes, shorter than the {SQLITE_HEADER_LEN}-byte SQLite header")]
    Truncated { len: u64 },
    #[error("not a SQLite 3 database (bad magic bytes)")]
    BadMagic,
    #[error("cannot read header: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of checking a legacy file before a full read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyFileState {
    /// Zero-length file, as left by a store that was opened but never written.
    Empty,
    /// Header looks like a SQLite 3 database.
    Valid,
}

/// Check the size and magic bytes of a legacy store.
pub fn validate_legacy_file(path: &Path) -> MigrateResult<LegacyFileState> {
    check_header(path).map_err(|e| MigrateError::corrupted(path, e))
}

fn check_header(path: &Path) -> Result<LegacyFileState, HeaderError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(HeaderError::Missing),
        Err(e) => return Err(e.into()),
    };
    let len = meta.len();
    if len == 0 {
        return Ok(LegacyFileState::Empty);
    }
    if len < SQLITE_HEADER_LEN {
        return Err(HeaderError::Truncated { len });
    }
    let mut magic = [0u8; 16];
    fs::File::open(path)?.read_exact(&mut magic)?;
    if &magic != SQLITE_MAGIC {
        return Err(HeaderError::BadMagic);
    }
    Ok(LegacyFileState::Valid)
}

/// Reads a legacy store into a [`Snapshot`].
pub trait LegacyExtractor: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Extract the entire store. An empty store yields an empty snapshot.
    fn extract(&self, path: &Path) -> MigrateResult<Snapshot>;
}

/// Build the extractor selected by configuration.
pub fn extractor_for(config: &LegacyConfig) -> Box<dyn LegacyExtractor> {
    match config.extractor {
        ExtractorChoice::Native => Box::new(NativeExtractor::new()),
        ExtractorChoice::Cli => Box::new(CliExtractor::new(PathBuf::from(&config.sqlite_binary))),
    }
}

/// A single cell as either extraction path sees it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Cell {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

/// Column access over one row, keyed by column name.
///
/// Returns `None` for columns the row does not have, which is how older
/// schema versions surface.
pub(crate) trait RowSource {
    fn cell(&self, column: &str) -> Option<Cell>;

    fn text(&self, column: &str) -> Option<String> {
        match self.cell(column)? {
            Cell::Null => None,
            Cell::Text(s) => Some(s),
            Cell::Integer(i) => Some(i.to_string()),
            Cell::Real(f) => Some(f.to_string()),
        }
    }

    fn text_or_default(&self, column: &str) -> String {
        self.text(column).unwrap_or_default()
    }

    fn int(&self, column: &str) -> Option<i64> {
        match self.cell(column)? {
            Cell::Integer(i) => Some(i),
            Cell::Real(f) => Some(f as i64),
            Cell::Text(s) => s.trim().parse().ok(),
            Cell::Null => None,
        }
    }

    fn timestamp(&self, column: &str) -> MigrateResult<Option<DateTime<Utc>>> {
        match self.cell(column) {
            None | Some(Cell::Null) => Ok(None),
            Some(Cell::Integer(secs)) => Ok(Utc.timestamp_opt(secs, 0).single()),
            Some(Cell::Real(secs)) => Ok(Utc.timestamp_opt(secs as i64, 0).single()),
            Some(Cell::Text(s)) if s.trim().is_empty() => Ok(None),
            Some(Cell::Text(s)) => parse_timestamp(&s).map(Some).ok_or_else(|| {
                MigrateError::invalid_value(column, &format!("unrecognized timestamp {:?}", s))
            }),
        }
    }
}

/// A materialized row keyed by column name.
#[derive(Debug, Default)]
pub(crate) struct CellRow(pub(crate) HashMap<String, Cell>);

impl RowSource for CellRow {
    fn cell(&self, column: &str) -> Option<Cell> {
        self.0.get(column).cloned()
    }
}

/// Map every row of every legacy table into a snapshot.
///
/// `rows_for` returns `None` for a table that does not exist.
pub(crate) fn build_snapshot<F>(mut rows_for: F) -> MigrateResult<Snapshot>
where
    F: FnMut(&str) -> MigrateResult<Option<Vec<CellRow>>>,
{
    let mut builder = SnapshotBuilder::new();
    for table in LEGACY_TABLES {
        let Some(rows) = rows_for(table)? else {
            debug!(table, "legacy table absent, treating as empty");
            continue;
        };
        for row in &rows {
            match *table {
                "issues" => builder.issue(issue_from_row(row)?),
                "labels" => builder.label(label_from_row(row)?),
                "dependencies" => builder.dependency(dependency_from_row(row)?),
                "events" => builder.event(event_from_row(row)?),
                "comments" => builder.comment(comment_from_row(row)?),
                _ => builder.config(config_from_row(row)?),
            };
        }
    }
    Ok(builder.build())
}

/// Parse the timestamp formats SQLite stores commonly hold.
///
/// RFC 3339 (any sub-second precision) is tried first, then space-separated
/// `YYYY-MM-DD HH:MM:SS[.f][+HH:MM]` forms. Offset-less values are UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(ts) = DateTime::parse_from_str(raw, fmt) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ts.and_utc());
        }
    }
    None
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

pub(crate) fn issue_from_row(row: &dyn RowSource) -> MigrateResult<Issue> {
    let id = row
        .text("id")
        .ok_or_else(|| MigrateError::invalid_value("issues.id", "missing issue id"))?;
    let created_at = row.timestamp("created_at")?.unwrap_or_else(epoch);
    Ok(Issue {
        content_hash: row.text_or_default("content_hash"),
        title: row.text_or_default("title"),
        description: row.text_or_default("description"),
        design: row.text_or_default("design"),
        acceptance_criteria: row.text_or_default("acceptance_criteria"),
        notes: row.text_or_default("notes"),
        status: row.text("status").unwrap_or_else(|| "open".to_string()),
        priority: row.int("priority").map(|p| p as i32).unwrap_or(2),
        issue_type: row.text("issue_type").unwrap_or_else(|| "task".to_string()),
        assignee: row.text("assignee").filter(|s| !s.is_empty()),
        estimated_minutes: row.int("estimated_minutes"),
        created_at,
        created_by: row.text_or_default("created_by"),
        updated_at: row.timestamp("updated_at")?.unwrap_or(created_at),
        closed_at: row.timestamp("closed_at")?,
        close_reason: row.text_or_default("close_reason"),
        external_ref: row.text("external_ref").filter(|s| !s.is_empty()),
        pinned: row.int("pinned").is_some_and(|p| p != 0),
        metadata: row
            .text("metadata")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "{}".to_string()),
        id,
    })
}

pub(crate) fn label_from_row(row: &dyn RowSource) -> MigrateResult<LabelRow> {
    Ok(LabelRow {
        issue_id: required(row, "labels", "issue_id")?,
        label: required(row, "labels", "label")?,
    })
}

pub(crate) fn dependency_from_row(row: &dyn RowSource) -> MigrateResult<Dependency> {
    Ok(Dependency {
        issue_id: required(row, "dependencies", "issue_id")?,
        depends_on_id: required(row, "dependencies", "depends_on_id")?,
        dep_type: row.text("type").unwrap_or_else(|| "blocks".to_string()),
        created_at: row.timestamp("created_at")?.unwrap_or_else(epoch),
        created_by: row.text_or_default("created_by"),
        metadata: row
            .text("metadata")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "{}".to_string()),
        thread_id: row.text("thread_id").filter(|s| !s.is_empty()),
        seq: row.int("_seq").unwrap_or(0),
    })
}

pub(crate) fn event_from_row(row: &dyn RowSource) -> MigrateResult<Event> {
    Ok(Event {
        id: row
            .int("id")
            .ok_or_else(|| MigrateError::invalid_value("events.id", "missing event id"))?,
        issue_id: required(row, "events", "issue_id")?,
        event_type: row.text_or_default("event_type"),
        actor: row.text_or_default("actor"),
        old_value: row.text("old_value"),
        new_value: row.text("new_value"),
        comment: row.text("comment"),
        created_at: row.timestamp("created_at")?.unwrap_or_else(epoch),
    })
}

pub(crate) fn comment_from_row(row: &dyn RowSource) -> MigrateResult<Comment> {
    Ok(Comment {
        id: row
            .int("id")
            .ok_or_else(|| MigrateError::invalid_value("comments.id", "missing comment id"))?,
        issue_id: required(row, "comments", "issue_id")?,
        author: row.text_or_default("author"),
        text: row.text_or_default("text"),
        created_at: row.timestamp("created_at")?.unwrap_or_else(epoch),
    })
}

pub(crate) fn config_from_row(row: &dyn RowSource) -> MigrateResult<ConfigRow> {
    Ok(ConfigRow {
        key: required(row, "config", "key")?,
        value: row.text_or_default("value"),
    })
}

fn required(row: &dyn RowSource, table: &str, column: &str) -> MigrateResult<String> {
    row.text(column).ok_or_else(|| {
        MigrateError::invalid_value(&format!("{}.{}", table, column), "missing value")
    })
}

/// Query for a legacy table. Dependencies expose their rowid as `_seq`.
pub(crate) fn select_all(table: &str) -> String {
    match table {
        "dependencies" => "SELECT rowid AS _seq, * FROM dependencies".to_string(),
        other => format!("SELECT * FROM {}", other),
    }
}
