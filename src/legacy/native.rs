//! Extraction through the linked SQLite driver.

use super::{
    Cell, CellRow, LegacyExtractor, LegacyFileState, build_snapshot, select_all,
    validate_legacy_file,
};
use crate::error::{MigrateError, MigrateResult};
use crate::types::Snapshot;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Reads the legacy store in-process with rusqlite, opened read-only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeExtractor;

impl NativeExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl LegacyExtractor for NativeExtractor {
    fn name(&self) -> &'static str {
        "native"
    }

    fn extract(&self, path: &Path) -> MigrateResult<Snapshot> {
        if validate_legacy_file(path)? == LegacyFileState::Empty {
            return Ok(Snapshot::default());
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| MigrateError::corrupted(path, e))?;

        let snapshot = build_snapshot(|table| {
            let rows = match table_exists(&conn, table) {
                Ok(false) => return Ok(None),
                Ok(true) => read_table(&conn, table),
                Err(e) => Err(e),
            };
            rows.map(Some).map_err(|e| read_error(path, e))
        })?;

        debug!(path = %path.display(), issues = snapshot.issues.len(), "native extraction complete");
        Ok(snapshot)
    }
}

/// A damaged page surfaces only once it is read, so classify here as well as on open.
fn read_error(path: &Path, err: rusqlite::Error) -> MigrateError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) => {
            MigrateError::corrupted(path, err)
        }
        _ => err.into(),
    }
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn read_table(conn: &Connection, table: &str) -> rusqlite::Result<Vec<CellRow>> {
    let mut stmt = conn.prepare(&select_all(table))?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut cells = HashMap::with_capacity(columns.len());
        for (idx, name) in columns.iter().enumerate() {
            let cell = match row.get_ref(idx)? {
                ValueRef::Null => Cell::Null,
                ValueRef::Integer(i) => Cell::Integer(i),
                ValueRef::Real(f) => Cell::Real(f),
                ValueRef::Text(bytes) => Cell::Text(String::from_utf8_lossy(bytes).into_owned()),
                ValueRef::Blob(bytes) => Cell::Text(String::from_utf8_lossy(bytes).into_owned()),
            };
            cells.insert(name.clone(), cell);
        }
        out.push(CellRow(cells));
    }
    Ok(out)
}
