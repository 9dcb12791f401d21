//! Shared fixtures for integration tests.

#![allow(dead_code)]

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use trackdb::config::AppConfig;
use trackdb::paths::DataPaths;

/// Schema of the legacy store as written by the last SQLite-backed release.
pub const LEGACY_SCHEMA: &str = "
CREATE TABLE issues (
    id TEXT PRIMARY KEY,
    content_hash TEXT,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    design TEXT NOT NULL DEFAULT '',
    acceptance_criteria TEXT NOT NULL DEFAULT '',
    notes TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'open',
    priority INTEGER NOT NULL DEFAULT 2,
    issue_type TEXT NOT NULL DEFAULT 'task',
    assignee TEXT,
    estimated_minutes INTEGER,
    created_at DATETIME NOT NULL,
    created_by TEXT DEFAULT '',
    updated_at DATETIME NOT NULL,
    closed_at DATETIME,
    close_reason TEXT DEFAULT '',
    external_ref TEXT,
    pinned INTEGER DEFAULT 0,
    metadata TEXT DEFAULT '{}'
);
CREATE TABLE labels (
    issue_id TEXT NOT NULL,
    label TEXT NOT NULL,
    PRIMARY KEY (issue_id, label)
);
CREATE TABLE dependencies (
    issue_id TEXT NOT NULL,
    depends_on_id TEXT NOT NULL,
    type TEXT NOT NULL DEFAULT 'blocks',
    created_at DATETIME NOT NULL,
    created_by TEXT NOT NULL DEFAULT '',
    metadata TEXT DEFAULT '{}',
    thread_id TEXT,
    PRIMARY KEY (issue_id, depends_on_id)
);
CREATE TABLE events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    issue_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    actor TEXT NOT NULL,
    old_value TEXT,
    new_value TEXT,
    comment TEXT,
    created_at DATETIME NOT NULL
);
CREATE TABLE comments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    issue_id TEXT NOT NULL,
    author TEXT NOT NULL,
    text TEXT NOT NULL,
    created_at DATETIME NOT NULL
);
CREATE TABLE config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// A temporary data directory with helpers to populate the legacy store.
pub struct Fixture {
    pub temp: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            temp: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn data_dir(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> DataPaths {
        DataPaths::new(self.data_dir())
    }

    /// Config that targets the embedded engine and never touches the network.
    pub fn config(&self) -> AppConfig {
        let mut config = AppConfig::default();
        config.data_dir = self.data_dir().to_path_buf();
        config.server.port = 0;
        config.backup.dir = Some(self.data_dir().join("backup"));
        config
    }

    pub fn legacy_path(&self) -> PathBuf {
        self.data_dir().join("issues.db")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir().join("metadata.json")
    }

    /// Create the legacy store with the standard schema and `seed` applied.
    pub fn legacy(&self, seed: &str) -> PathBuf {
        let path = self.legacy_path();
        let conn = Connection::open(&path).expect("Failed to open legacy store");
        conn.execute_batch(LEGACY_SCHEMA).expect("Failed to create schema");
        conn.execute_batch(seed).expect("Failed to seed legacy store");
        path
    }

    /// A small project: three issues, labels, a dependency chain, history.
    pub fn sample_legacy(&self) -> PathBuf {
        self.legacy(SAMPLE_SEED)
    }

    pub fn write_metadata(&self, contents: &str) {
        std::fs::write(self.metadata_path(), contents).expect("Failed to write metadata.json");
    }
}

pub const SAMPLE_SEED: &str = "
INSERT INTO config VALUES ('issue_prefix', 'Proj');
INSERT INTO issues (id, title, description, status, priority, issue_type, created_at, updated_at)
    VALUES ('Proj-1', 'Set up CI', 'Pipeline for main', 'closed', 1, 'task',
            '2024-03-01 09:00:00', '2024-03-02 10:00:00');
INSERT INTO issues (id, title, status, priority, issue_type, assignee, created_at, updated_at)
    VALUES ('Proj-2', 'Release 1.0', 'open', 0, 'epic', 'sam',
            '2024-03-01 09:30:00', '2024-03-01 09:30:00');
INSERT INTO issues (id, title, created_at, updated_at, pinned, metadata)
    VALUES ('Proj-3', 'Write docs', '2024-03-03 12:00:00', '2024-03-03 12:00:00', 1, '{\"area\":\"docs\"}');
INSERT INTO labels VALUES ('Proj-1', 'infra');
INSERT INTO labels VALUES ('Proj-2', 'release');
INSERT INTO labels VALUES ('Proj-3', 'docs');
INSERT INTO labels VALUES ('Proj-3', 'good-first-issue');
INSERT INTO dependencies (issue_id, depends_on_id, type, created_at)
    VALUES ('Proj-2', 'Proj-1', 'blocks', '2024-03-01 09:31:00');
INSERT INTO dependencies (issue_id, depends_on_id, type, created_at)
    VALUES ('Proj-2', 'Proj-3', 'blocks', '2024-03-01 09:31:00');
INSERT INTO events (issue_id, event_type, actor, created_at)
    VALUES ('Proj-1', 'created', 'sam', '2024-03-01 09:00:00');
INSERT INTO events (issue_id, event_type, actor, old_value, new_value, created_at)
    VALUES ('Proj-1', 'status_changed', 'sam', 'open', 'closed', '2024-03-02 10:00:00');
INSERT INTO events (issue_id, event_type, actor, created_at)
    VALUES ('Proj-2', 'created', 'sam', '2024-03-01 09:30:00');
INSERT INTO comments (issue_id, author, text, created_at)
    VALUES ('Proj-2', 'sam', 'Blocked on CI and docs', '2024-03-01 09:32:00');
";
