//! The driver-based and command-line extractors must agree on every row.
//!
//! Tests that need the `sqlite3` binary return early when it is missing.

mod common;

use common::{Fixture, SAMPLE_SEED};
use trackdb::error::ErrorCode;
use trackdb::legacy::{CliExtractor, LegacyExtractor, NativeExtractor};

fn cli_extractor() -> Option<CliExtractor> {
    let extractor = CliExtractor::new("sqlite3");
    if extractor.is_available() {
        Some(extractor)
    } else {
        eprintln!("sqlite3 not found, skipping");
        None
    }
}

#[test]
fn sample_project_extracts_identically() {
    let Some(cli) = cli_extractor() else { return };
    let fixture = Fixture::new();
    let path = fixture.legacy(SAMPLE_SEED);

    let native = NativeExtractor::new().extract(&path).unwrap();
    let via_cli = cli.extract(&path).unwrap();

    assert_eq!(native, via_cli);
    assert_eq!(native.prefix, "Proj");
    assert_eq!(native.counts().issues, 3);
}

#[test]
fn nulls_and_integer_timestamps_extract_identically() {
    let Some(cli) = cli_extractor() else { return };
    let fixture = Fixture::new();
    let path = fixture.legacy(
        "INSERT INTO issues (id, title, created_at, updated_at, assignee, estimated_minutes)
             VALUES ('x-1', 'epoch seconds', 1709283600, 1709283600, NULL, 90);
         INSERT INTO issues (id, title, created_at, updated_at, closed_at, close_reason)
             VALUES ('x-2', 'closed', '2024-03-01T09:00:00.250Z', '2024-03-01T10:00:00Z',
                     '2024-03-01 10:00:00', 'done');
         INSERT INTO comments (issue_id, author, text, created_at)
             VALUES ('x-2', 'kim', 'unicode: \u{00e9}t\u{00e9}', '2024-03-01 10:00:00');",
    );

    let native = NativeExtractor::new().extract(&path).unwrap();
    let via_cli = cli.extract(&path).unwrap();
    assert_eq!(native, via_cli);

    let closed = native.issues.iter().find(|i| i.id == "x-2").unwrap();
    assert!(closed.closed_at.is_some());
    let first = native.issues.iter().find(|i| i.id == "x-1").unwrap();
    assert_eq!(first.estimated_minutes, Some(90));
    assert!(first.assignee.is_none());
}

#[test]
fn missing_tables_extract_identically() {
    let Some(cli) = cli_extractor() else { return };
    let fixture = Fixture::new();
    let path = fixture.legacy_path();
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE issues (id TEXT PRIMARY KEY, title TEXT, created_at TEXT);
         INSERT INTO issues VALUES ('old-1', 'from an early schema', '2023-01-01 00:00:00');",
    )
    .unwrap();
    drop(conn);

    let native = NativeExtractor::new().extract(&path).unwrap();
    let via_cli = cli.extract(&path).unwrap();
    assert_eq!(native, via_cli);
    assert_eq!(native.issues[0].issue_type, "task");
    assert!(native.events.is_empty());
}

#[test]
fn truncated_store_is_corrupted_input_for_both() {
    let fixture = Fixture::new();
    let path = fixture.legacy(
        "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 500)
         INSERT INTO issues (id, title, created_at, updated_at)
             SELECT 'x-' || i, replace(hex(zeroblob(100)), '0', 'x'),
                    '2024-03-01 09:00:00', '2024-03-01 09:00:00'
             FROM n;",
    );
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    let err = NativeExtractor::new().extract(&path).unwrap_err();
    assert_eq!(err.code, ErrorCode::CorruptedInput);

    let Some(cli) = cli_extractor() else { return };
    let err = cli.extract(&path).unwrap_err();
    assert_eq!(err.code, ErrorCode::CorruptedInput);
}
