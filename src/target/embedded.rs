//! In-process target engine backed by a SQLite file.
//!
//! Used for embedded mode (server port 0). Version history is a commit log
//! whose ids chain SHA-256 over the previous id, a digest of the migrated
//! tables and the commit message. A write that leaves the tables unchanged
//! produces no new commit.

use super::{BackupDestination, EngineKind, TargetEngine, ensure_open};
use crate::error::{MigrateError, MigrateResult};
use crate::types::{
    Comment, ConfigRow, Dependency, Event, Issue, LabelRow, MIGRATED_TABLES, Snapshot, TableCounts,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, Row, params};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

mod embedded_migrations {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Embedded engine handle.
pub struct EmbeddedEngine {
    conn: Mutex<Option<Connection>>,
    database: String,
    path: PathBuf,
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn ts_column(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    parse_ts(&row.get::<_, String>(column)?)
}

impl EmbeddedEngine {
    /// Open or create the engine database at `path`.
    pub fn open(path: &Path, database: &str) -> MigrateResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;",
        )?;
        embedded_migrations::migrations::runner().run(&mut conn)?;

        debug!(path = %path.display(), database, "opened embedded engine");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            database: database.to_string(),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` with the connection, failing if the handle is closed.
    fn with_conn<F, T>(&self, f: F) -> MigrateResult<T>
    where
        F: FnOnce(&mut Connection) -> MigrateResult<T>,
    {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| MigrateError::internal("embedded engine lock poisoned"))?;
        let conn = guard.as_mut().ok_or_else(MigrateError::handle_closed)?;
        f(conn)
    }
}

/// SHA-256 over every row of the migrated tables in primary-key order.
fn state_digest(conn: &Connection) -> MigrateResult<String> {
    let mut hasher = Sha256::new();
    for table in MIGRATED_TABLES {
        hasher.update(table.as_bytes());
        hasher.update([0u8]);
        let order = match *table {
            "labels" => "issue_id, label",
            "dependencies" => "issue_id, depends_on_id",
            "config" => "key",
            _ => "id",
        };
        let mut stmt = conn.prepare(&format!("SELECT * FROM {} ORDER BY {}", table, order))?;
        let width = stmt.column_count();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            for idx in 0..width {
                match row.get_ref(idx)? {
                    ValueRef::Null => hasher.update([0xff]),
                    ValueRef::Integer(i) => hasher.update(i.to_le_bytes()),
                    ValueRef::Real(f) => hasher.update(f.to_le_bytes()),
                    ValueRef::Text(bytes) | ValueRef::Blob(bytes) => hasher.update(bytes),
                }
                hasher.update([0u8]);
            }
            hasher.update([b'\n']);
        }
    }
    Ok(hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn head(conn: &Connection) -> MigrateResult<Option<(String, String)>> {
    Ok(conn
        .query_row(
            "SELECT hash, state FROM commit_log ORDER BY seq DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

/// Record a commit if the tables changed since HEAD. Returns the HEAD id.
fn commit(conn: &Connection, message: &str) -> MigrateResult<String> {
    let state = state_digest(conn)?;
    let previous = head(conn)?;
    if let Some((hash, prev_state)) = &previous {
        if *prev_state == state {
            debug!(commit = %hash, "nothing to commit");
            return Ok(hash.clone());
        }
    }

    let mut hasher = Sha256::new();
    if let Some((prev_hash, _)) = &previous {
        hasher.update(prev_hash.as_bytes());
    }
    hasher.update(state.as_bytes());
    hasher.update(message.as_bytes());
    let hash = hex(&hasher.finalize());

    conn.execute(
        "INSERT INTO commit_log (hash, state, message, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![hash, state, message, format_ts(&Utc::now())],
    )?;
    Ok(hash)
}

fn count(conn: &Connection, table: &str) -> MigrateResult<u64> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
    Ok(n.max(0) as u64)
}

fn issue_from_row(row: &Row<'_>) -> rusqlite::Result<Issue> {
    Ok(Issue {
        id: row.get("id")?,
        content_hash: row.get("content_hash")?,
        title: row.get("title")?,
        description: row.get("description")?,
        design: row.get("design")?,
        acceptance_criteria: row.get("acceptance_criteria")?,
        notes: row.get("notes")?,
        status: row.get("status")?,
        priority: row.get("priority")?,
        issue_type: row.get("issue_type")?,
        assignee: row.get("assignee")?,
        estimated_minutes: row.get("estimated_minutes")?,
        created_at: ts_column(row, "created_at")?,
        created_by: row.get("created_by")?,
        updated_at: ts_column(row, "updated_at")?,
        closed_at: row
            .get::<_, Option<String>>("closed_at")?
            .map(|raw| parse_ts(&raw))
            .transpose()?,
        close_reason: row.get("close_reason")?,
        external_ref: row.get("external_ref")?,
        pinned: row.get("pinned")?,
        metadata: row.get("metadata")?,
    })
}

fn dependency_from_row(row: &Row<'_>) -> rusqlite::Result<Dependency> {
    Ok(Dependency {
        issue_id: row.get("issue_id")?,
        depends_on_id: row.get("depends_on_id")?,
        dep_type: row.get("type")?,
        created_at: ts_column(row, "created_at")?,
        created_by: row.get("created_by")?,
        metadata: row.get("metadata")?,
        thread_id: row.get("thread_id")?,
        seq: row.get("seq")?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get("id")?,
        issue_id: row.get("issue_id")?,
        event_type: row.get("event_type")?,
        actor: row.get("actor")?,
        old_value: row.get("old_value")?,
        new_value: row.get("new_value")?,
        comment: row.get("comment")?,
        created_at: ts_column(row, "created_at")?,
    })
}

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: row.get("id")?,
        issue_id: row.get("issue_id")?,
        author: row.get("author")?,
        text: row.get("text")?,
        created_at: ts_column(row, "created_at")?,
    })
}

fn query_all<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> MigrateResult<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map)?;
    Ok(rows.collect::<rusqlite::Result<Vec<T>>>()?)
}

/// Filesystem directory of a `file://` backup URL.
fn file_destination(url: &str) -> MigrateResult<PathBuf> {
    let path = url
        .strip_prefix("file://")
        .ok_or_else(|| MigrateError::unsupported_destination(url, "embedded engine supports file:// only"))?;
    if path.is_empty() {
        return Err(MigrateError::unsupported_destination(url, "empty path"));
    }
    Ok(PathBuf::from(path))
}

#[async_trait]
impl TargetEngine for EmbeddedEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Embedded
    }

    fn database(&self) -> &str {
        &self.database
    }

    fn is_closed(&self) -> bool {
        self.conn.lock().map(|guard| guard.is_none()).unwrap_or(true)
    }

    async fn write_snapshot(&self, snapshot: &Snapshot, message: &str) -> MigrateResult<String> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO issues (id, content_hash, title, description, design,
                        acceptance_criteria, notes, status, priority, issue_type, assignee,
                        estimated_minutes, created_at, created_by, updated_at, closed_at,
                        close_reason, external_ref, pinned, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                        ?16, ?17, ?18, ?19, ?20)",
                )?;
                for issue in &snapshot.issues {
                    stmt.execute(params![
                        issue.id,
                        issue.content_hash,
                        issue.title,
                        issue.description,
                        issue.design,
                        issue.acceptance_criteria,
                        issue.notes,
                        issue.status,
                        issue.priority,
                        issue.issue_type,
                        issue.assignee,
                        issue.estimated_minutes,
                        format_ts(&issue.created_at),
                        issue.created_by,
                        format_ts(&issue.updated_at),
                        issue.closed_at.as_ref().map(format_ts),
                        issue.close_reason,
                        issue.external_ref,
                        issue.pinned,
                        issue.metadata,
                    ])?;
                }

                let mut stmt =
                    tx.prepare("INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?1, ?2)")?;
                for row in snapshot.label_rows() {
                    stmt.execute(params![row.issue_id, row.label])?;
                }

                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO dependencies (issue_id, depends_on_id, type, created_at,
                        created_by, metadata, thread_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for dep in snapshot.all_dependencies() {
                    stmt.execute(params![
                        dep.issue_id,
                        dep.depends_on_id,
                        dep.dep_type,
                        format_ts(&dep.created_at),
                        dep.created_by,
                        dep.metadata,
                        dep.thread_id,
                    ])?;
                }

                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO events (id, issue_id, event_type, actor, old_value,
                        new_value, comment, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for event in snapshot.all_events() {
                    stmt.execute(params![
                        event.id,
                        event.issue_id,
                        event.event_type,
                        event.actor,
                        event.old_value,
                        event.new_value,
                        event.comment,
                        format_ts(&event.created_at),
                    ])?;
                }

                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO comments (id, issue_id, author, text, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for comment in snapshot.all_comments() {
                    stmt.execute(params![
                        comment.id,
                        comment.issue_id,
                        comment.author,
                        comment.text,
                        format_ts(&comment.created_at),
                    ])?;
                }

                let mut stmt =
                    tx.prepare("INSERT OR REPLACE INTO config (key, value) VALUES (?1, ?2)")?;
                for (key, value) in &snapshot.config {
                    stmt.execute(params![key, value])?;
                }
            }
            let hash = commit(&tx, message)?;
            tx.commit()?;
            info!(commit = %hash, issues = snapshot.issues.len(), "snapshot written to embedded engine");
            Ok(hash)
        })
    }

    async fn table_counts(&self) -> MigrateResult<TableCounts> {
        self.with_conn(|conn| {
            Ok(TableCounts {
                issues: count(conn, "issues")?,
                labels: count(conn, "labels")?,
                dependencies: count(conn, "dependencies")?,
                events: count(conn, "events")?,
                comments: count(conn, "comments")?,
                config: count(conn, "config")?,
            })
        })
    }

    async fn current_commit(&self) -> MigrateResult<Option<String>> {
        self.with_conn(|conn| Ok(head(conn)?.map(|(hash, _)| hash)))
    }

    async fn read_issues(&self) -> MigrateResult<Vec<Issue>> {
        self.with_conn(|conn| {
            query_all(conn, "SELECT * FROM issues ORDER BY created_at, id", [], issue_from_row)
        })
    }

    async fn read_labels(&self) -> MigrateResult<Vec<LabelRow>> {
        self.with_conn(|conn| {
            query_all(
                conn,
                "SELECT issue_id, label FROM labels ORDER BY issue_id, label",
                [],
                |row| {
                    Ok(LabelRow {
                        issue_id: row.get(0)?,
                        label: row.get(1)?,
                    })
                },
            )
        })
    }

    async fn read_dependencies(&self) -> MigrateResult<Vec<Dependency>> {
        self.with_conn(|conn| {
            query_all(
                conn,
                "SELECT rowid AS seq, * FROM dependencies ORDER BY issue_id, created_at, rowid",
                [],
                dependency_from_row,
            )
        })
    }

    async fn read_comments(&self) -> MigrateResult<Vec<Comment>> {
        self.with_conn(|conn| {
            query_all(
                conn,
                "SELECT * FROM comments ORDER BY issue_id, created_at, id",
                [],
                comment_from_row,
            )
        })
    }

    async fn read_config(&self) -> MigrateResult<Vec<ConfigRow>> {
        self.with_conn(|conn| {
            query_all(conn, "SELECT key, value FROM config ORDER BY key", [], |row| {
                Ok(ConfigRow {
                    key: row.get(0)?,
                    value: row.get(1)?,
                })
            })
        })
    }

    async fn read_events_since(&self, after_id: i64) -> MigrateResult<Vec<Event>> {
        self.with_conn(|conn| {
            query_all(
                conn,
                "SELECT * FROM events WHERE id > ?1 ORDER BY id",
                [after_id],
                event_from_row,
            )
        })
    }

    async fn get_metadata(&self, key: &str) -> MigrateResult<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| row.get(0))
                .optional()?)
        })
    }

    async fn set_metadata(&self, key: &str, value: &str) -> MigrateResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
                [key, value],
            )?;
            Ok(())
        })
    }

    async fn list_backups(&self) -> MigrateResult<Vec<BackupDestination>> {
        self.with_conn(|conn| {
            query_all(conn, "SELECT name, url FROM backups ORDER BY name", [], |row| {
                Ok(BackupDestination {
                    name: row.get(0)?,
                    url: row.get(1)?,
                })
            })
        })
    }

    async fn add_backup(&self, name: &str, url: &str) -> MigrateResult<()> {
        file_destination(url)?;
        self.with_conn(|conn| {
            conn.execute("INSERT INTO backups (name, url) VALUES (?1, ?2)", [name, url])?;
            Ok(())
        })
    }

    async fn remove_backup(&self, name: &str) -> MigrateResult<()> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM backups WHERE name = ?1", [name])?;
            if removed == 0 {
                return Err(MigrateError::destination_not_found(name));
            }
            Ok(())
        })
    }

    async fn sync_backup(&self, name: &str) -> MigrateResult<()> {
        let database = self.database.clone();
        self.with_conn(|conn| {
            let url: String = conn
                .query_row("SELECT url FROM backups WHERE name = ?1", [name], |row| row.get(0))
                .optional()?
                .ok_or_else(|| MigrateError::destination_not_found(name))?;
            let dir = file_destination(&url)?;
            fs::create_dir_all(&dir)?;

            let target = dir.join(format!("{}.db", database));
            let temp = dir.join(format!("{}.db.tmp.{}", database, std::process::id()));
            if temp.exists() {
                fs::remove_file(&temp)?;
            }
            let temp_str = temp
                .to_str()
                .ok_or_else(|| MigrateError::invalid_value("backup url", "path is not valid UTF-8"))?;
            let vacuum = format!("VACUUM INTO '{}'", temp_str.replace('\'', "''"));
            if let Err(e) = conn.execute_batch(&vacuum) {
                let _ = fs::remove_file(&temp);
                return Err(e.into());
            }
            fs::rename(&temp, &target)?;
            info!(destination = %target.display(), "embedded backup synced");
            Ok(())
        })
    }

    async fn close(&self) -> MigrateResult<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| MigrateError::internal("embedded engine lock poisoned"))?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| MigrateError::from(e))?;
        }
        Ok(())
    }
}
