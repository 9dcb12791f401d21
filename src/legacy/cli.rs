//! Extraction through the `sqlite3` command-line client.
//!
//! Runs one `sqlite3 -readonly -json` invocation per table and parses the
//! JSON array it prints. The client prints nothing at all for a query with no
//! rows, so empty output is an empty table.

use super::{
    Cell, CellRow, LegacyExtractor, LegacyFileState, build_snapshot, select_all,
    validate_legacy_file,
};
use crate::error::{MigrateError, MigrateResult};
use crate::types::Snapshot;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Reads the legacy store by shelling out to `sqlite3`.
#[derive(Debug, Clone)]
pub struct CliExtractor {
    binary: PathBuf,
}

impl CliExtractor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Whether the configured client can be executed.
    pub fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("-version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    fn query(&self, path: &Path, sql: &str) -> MigrateResult<Vec<Map<String, Value>>> {
        let tool = self.binary.display().to_string();
        let output = Command::new(&self.binary)
            .arg("-readonly")
            .arg("-json")
            .arg(path)
            .arg(sql)
            .output()
            .map_err(|e| MigrateError::external_tool(&tool, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MigrateError::corrupted(path, stderr.trim()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&stdout).map_err(|e| {
            MigrateError::external_tool(&tool, format!("unparseable JSON output: {}", e))
        })
    }
}

impl Default for CliExtractor {
    fn default() -> Self {
        Self::new("sqlite3")
    }
}

impl LegacyExtractor for CliExtractor {
    fn name(&self) -> &'static str {
        "cli"
    }

    fn extract(&self, path: &Path) -> MigrateResult<Snapshot> {
        if validate_legacy_file(path)? == LegacyFileState::Empty {
            return Ok(Snapshot::default());
        }

        let tables: HashSet<String> = self
            .query(path, "SELECT name FROM sqlite_master WHERE type = 'table'")?
            .into_iter()
            .filter_map(|mut row| match row.remove("name") {
                Some(Value::String(name)) => Some(name),
                _ => None,
            })
            .collect();

        let snapshot = build_snapshot(|table| {
            if !tables.contains(table) {
                return Ok(None);
            }
            let rows = self.query(path, &select_all(table))?;
            Ok(Some(rows.into_iter().map(json_row).collect()))
        })?;

        debug!(path = %path.display(), issues = snapshot.issues.len(), "cli extraction complete");
        Ok(snapshot)
    }
}

fn json_row(object: Map<String, Value>) -> CellRow {
    let cells: HashMap<String, Cell> = object
        .into_iter()
        .map(|(column, value)| (column, json_cell(value)))
        .collect();
    CellRow(cells)
}

fn json_cell(value: Value) -> Cell {
    match value {
        Value::Null => Cell::Null,
        Value::Bool(b) => Cell::Integer(i64::from(b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Cell::Integer(i),
            None => Cell::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Cell::Text(s),
        other => Cell::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_cell_types() {
        assert_eq!(json_cell(json!(null)), Cell::Null);
        assert_eq!(json_cell(json!(42)), Cell::Integer(42));
        assert_eq!(json_cell(json!(1.5)), Cell::Real(1.5));
        assert_eq!(json_cell(json!("x")), Cell::Text("x".to_string()));
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let extractor = CliExtractor::new("/nonexistent/sqlite3-binary");
        assert!(!extractor.is_available());
    }
}
