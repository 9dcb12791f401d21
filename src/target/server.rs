//! Dolt SQL server engine over the MySQL wire protocol.
//!
//! Queries are built at runtime (`sqlx::query`, not the `query!` macros) so
//! the crate compiles without a live database.

use super::{BackupDestination, EngineKind, ServerEndpoint, TargetEngine, ensure_open};
use crate::error::{MigrateError, MigrateResult};
use crate::types::{Comment, ConfigRow, Dependency, Event, Issue, LabelRow, Snapshot, TableCounts};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Connection, Row};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

const MAX_CONNECTIONS: u32 = 4;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS issues (
        id VARCHAR(255) PRIMARY KEY,
        content_hash VARCHAR(64) NOT NULL DEFAULT '',
        title TEXT NOT NULL,
        description LONGTEXT NOT NULL,
        design LONGTEXT NOT NULL,
        acceptance_criteria LONGTEXT NOT NULL,
        notes LONGTEXT NOT NULL,
        status VARCHAR(32) NOT NULL DEFAULT 'open',
        priority INT NOT NULL DEFAULT 2,
        issue_type VARCHAR(32) NOT NULL DEFAULT 'task',
        assignee VARCHAR(255),
        estimated_minutes BIGINT,
        created_at DATETIME(6) NOT NULL,
        created_by VARCHAR(255) NOT NULL DEFAULT '',
        updated_at DATETIME(6) NOT NULL,
        closed_at DATETIME(6),
        close_reason TEXT NOT NULL,
        external_ref VARCHAR(255),
        pinned TINYINT(1) NOT NULL DEFAULT 0,
        metadata LONGTEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS labels (
        issue_id VARCHAR(255) NOT NULL,
        label VARCHAR(255) NOT NULL,
        PRIMARY KEY (issue_id, label)
    )",
    "CREATE TABLE IF NOT EXISTS dependencies (
        issue_id VARCHAR(255) NOT NULL,
        depends_on_id VARCHAR(255) NOT NULL,
        `type` VARCHAR(32) NOT NULL DEFAULT 'blocks',
        created_at DATETIME(6) NOT NULL,
        created_by VARCHAR(255) NOT NULL DEFAULT '',
        metadata LONGTEXT NOT NULL,
        thread_id VARCHAR(255),
        PRIMARY KEY (issue_id, depends_on_id)
    )",
    "CREATE TABLE IF NOT EXISTS events (
        id BIGINT PRIMARY KEY AUTO_INCREMENT,
        issue_id VARCHAR(255) NOT NULL,
        event_type VARCHAR(64) NOT NULL,
        actor VARCHAR(255) NOT NULL DEFAULT '',
        old_value LONGTEXT,
        new_value LONGTEXT,
        comment LONGTEXT,
        created_at DATETIME(6) NOT NULL,
        INDEX idx_events_issue (issue_id)
    )",
    "CREATE TABLE IF NOT EXISTS comments (
        id BIGINT PRIMARY KEY AUTO_INCREMENT,
        issue_id VARCHAR(255) NOT NULL,
        author VARCHAR(255) NOT NULL DEFAULT '',
        text LONGTEXT NOT NULL,
        created_at DATETIME(6) NOT NULL,
        INDEX idx_comments_issue (issue_id)
    )",
    "CREATE TABLE IF NOT EXISTS config (
        `key` VARCHAR(255) PRIMARY KEY,
        value LONGTEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS metadata (
        `key` VARCHAR(255) PRIMARY KEY,
        value LONGTEXT NOT NULL
    )",
];

/// Handle to one database on a Dolt SQL server.
pub struct DoltServer {
    pool: MySqlPool,
    database: String,
    closed: AtomicBool,
}

fn connect_options(endpoint: &ServerEndpoint) -> MySqlConnectOptions {
    let mut options = MySqlConnectOptions::new()
        .host(&endpoint.host)
        .port(endpoint.port)
        .username(&endpoint.user);
    if let Some(password) = &endpoint.password {
        options = options.password(password);
    }
    options
}

/// List the databases hosted by the server (`SHOW DATABASES`).
pub async fn list_databases(endpoint: &ServerEndpoint) -> MigrateResult<Vec<String>> {
    let mut conn = MySqlConnection::connect_with(&connect_options(endpoint)).await?;
    let names: Vec<String> = sqlx::query_scalar("SHOW DATABASES")
        .fetch_all(&mut conn)
        .await?;
    let _ = conn.close().await;
    Ok(names)
}

fn validate_database_name(name: &str) -> MigrateResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MigrateError::invalid_value(
            "database",
            &format!("{:?} must match [a-z0-9_]+", name),
        ))
    }
}

impl DoltServer {
    /// Connect, create the database if needed and ensure the schema exists.
    pub async fn connect(endpoint: &ServerEndpoint, database: &str) -> MigrateResult<Self> {
        validate_database_name(database)?;

        let mut bootstrap = MySqlConnection::connect_with(&connect_options(endpoint)).await?;
        sqlx::query(&format!("CREATE DATABASE IF NOT EXISTS `{}`", database))
            .execute(&mut bootstrap)
            .await?;
        let _ = bootstrap.close().await;

        let pool = MySqlPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(connect_options(endpoint).database(database))
            .await?;

        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&pool).await?;
        }

        info!(%endpoint, database, "connected to Dolt server");
        Ok(Self {
            pool,
            database: database.to_string(),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> MigrateResult<()> {
        ensure_open(self.closed.load(Ordering::SeqCst))
    }

    async fn count(&self, table: &str) -> MigrateResult<u64> {
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }
}

fn naive(ts: &DateTime<Utc>) -> NaiveDateTime {
    ts.naive_utc()
}

fn utc(row: &MySqlRow, column: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    Ok(row.try_get::<NaiveDateTime, _>(column)?.and_utc())
}

fn utc_opt(row: &MySqlRow, column: &str) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    Ok(row
        .try_get::<Option<NaiveDateTime>, _>(column)?
        .map(|ts| ts.and_utc()))
}

fn issue_from_row(row: &MySqlRow) -> Result<Issue, sqlx::Error> {
    Ok(Issue {
        id: row.try_get("id")?,
        content_hash: row.try_get("content_hash")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        design: row.try_get("design")?,
        acceptance_criteria: row.try_get("acceptance_criteria")?,
        notes: row.try_get("notes")?,
        status: row.try_get("status")?,
        priority: row.try_get("priority")?,
        issue_type: row.try_get("issue_type")?,
        assignee: row.try_get("assignee")?,
        estimated_minutes: row.try_get("estimated_minutes")?,
        created_at: utc(row, "created_at")?,
        created_by: row.try_get("created_by")?,
        updated_at: utc(row, "updated_at")?,
        closed_at: utc_opt(row, "closed_at")?,
        close_reason: row.try_get("close_reason")?,
        external_ref: row.try_get("external_ref")?,
        pinned: row.try_get("pinned")?,
        metadata: row.try_get("metadata")?,
    })
}

fn dependency_from_row(row: &MySqlRow) -> Result<Dependency, sqlx::Error> {
    Ok(Dependency {
        issue_id: row.try_get("issue_id")?,
        depends_on_id: row.try_get("depends_on_id")?,
        dep_type: row.try_get("type")?,
        created_at: utc(row, "created_at")?,
        created_by: row.try_get("created_by")?,
        metadata: row.try_get("metadata")?,
        thread_id: row.try_get("thread_id")?,
        seq: 0,
    })
}

fn event_from_row(row: &MySqlRow) -> Result<Event, sqlx::Error> {
    Ok(Event {
        id: row.try_get("id")?,
        issue_id: row.try_get("issue_id")?,
        event_type: row.try_get("event_type")?,
        actor: row.try_get("actor")?,
        old_value: row.try_get("old_value")?,
        new_value: row.try_get("new_value")?,
        comment: row.try_get("comment")?,
        created_at: utc(row, "created_at")?,
    })
}

fn comment_from_row(row: &MySqlRow) -> Result<Comment, sqlx::Error> {
    Ok(Comment {
        id: row.try_get("id")?,
        issue_id: row.try_get("issue_id")?,
        author: row.try_get("author")?,
        text: row.try_get("text")?,
        created_at: utc(row, "created_at")?,
    })
}

fn is_nothing_to_commit(err: &sqlx::Error) -> bool {
    err.to_string().to_lowercase().contains("nothing to commit")
}

#[async_trait]
impl TargetEngine for DoltServer {
    fn kind(&self) -> EngineKind {
        EngineKind::Server
    }

    fn database(&self) -> &str {
        &self.database
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn write_snapshot(&self, snapshot: &Snapshot, message: &str) -> MigrateResult<String> {
        self.check_open()?;
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        for issue in &snapshot.issues {
            sqlx::query(
                "REPLACE INTO issues (id, content_hash, title, description, design,
                    acceptance_criteria, notes, status, priority, issue_type, assignee,
                    estimated_minutes, created_at, created_by, updated_at, closed_at,
                    close_reason, external_ref, pinned, metadata)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&issue.id)
            .bind(&issue.content_hash)
            .bind(&issue.title)
            .bind(&issue.description)
            .bind(&issue.design)
            .bind(&issue.acceptance_criteria)
            .bind(&issue.notes)
            .bind(&issue.status)
            .bind(issue.priority)
            .bind(&issue.issue_type)
            .bind(&issue.assignee)
            .bind(issue.estimated_minutes)
            .bind(naive(&issue.created_at))
            .bind(&issue.created_by)
            .bind(naive(&issue.updated_at))
            .bind(issue.closed_at.as_ref().map(naive))
            .bind(&issue.close_reason)
            .bind(&issue.external_ref)
            .bind(issue.pinned)
            .bind(&issue.metadata)
            .execute(&mut *tx)
            .await?;
        }

        for row in snapshot.label_rows() {
            sqlx::query("INSERT IGNORE INTO labels (issue_id, label) VALUES (?, ?)")
                .bind(&row.issue_id)
                .bind(&row.label)
                .execute(&mut *tx)
                .await?;
        }

        for dep in snapshot.all_dependencies() {
            sqlx::query(
                "REPLACE INTO dependencies (issue_id, depends_on_id, `type`, created_at,
                    created_by, metadata, thread_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&dep.issue_id)
            .bind(&dep.depends_on_id)
            .bind(&dep.dep_type)
            .bind(naive(&dep.created_at))
            .bind(&dep.created_by)
            .bind(&dep.metadata)
            .bind(&dep.thread_id)
            .execute(&mut *tx)
            .await?;
        }

        for event in snapshot.all_events() {
            sqlx::query(
                "INSERT IGNORE INTO events (id, issue_id, event_type, actor, old_value,
                    new_value, comment, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(event.id)
            .bind(&event.issue_id)
            .bind(&event.event_type)
            .bind(&event.actor)
            .bind(&event.old_value)
            .bind(&event.new_value)
            .bind(&event.comment)
            .bind(naive(&event.created_at))
            .execute(&mut *tx)
            .await?;
        }

        for comment in snapshot.all_comments() {
            sqlx::query(
                "INSERT IGNORE INTO comments (id, issue_id, author, text, created_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(comment.id)
            .bind(&comment.issue_id)
            .bind(&comment.author)
            .bind(&comment.text)
            .bind(naive(&comment.created_at))
            .execute(&mut *tx)
            .await?;
        }

        for (key, value) in &snapshot.config {
            sqlx::query("REPLACE INTO config (`key`, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        match sqlx::query("CALL DOLT_COMMIT('-Am', ?)")
            .bind(message)
            .execute(&mut *conn)
            .await
        {
            Ok(_) => {}
            Err(e) if is_nothing_to_commit(&e) => debug!("snapshot already committed"),
            Err(e) => return Err(e.into()),
        }

        self.current_commit()
            .await?
            .ok_or_else(|| MigrateError::internal("Dolt returned no HEAD commit"))
    }

    async fn table_counts(&self) -> MigrateResult<TableCounts> {
        self.check_open()?;
        Ok(TableCounts {
            issues: self.count("issues").await?,
            labels: self.count("labels").await?,
            dependencies: self.count("dependencies").await?,
            events: self.count("events").await?,
            comments: self.count("comments").await?,
            config: self.count("config").await?,
        })
    }

    async fn current_commit(&self) -> MigrateResult<Option<String>> {
        self.check_open()?;
        let hash: Option<String> = sqlx::query_scalar("SELECT DOLT_HASHOF('HEAD')")
            .fetch_optional(&self.pool)
            .await?;
        Ok(hash)
    }

    async fn read_issues(&self) -> MigrateResult<Vec<Issue>> {
        self.check_open()?;
        let rows = sqlx::query("SELECT * FROM issues ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(issue_from_row).collect::<Result<_, _>>()?)
    }

    async fn read_labels(&self) -> MigrateResult<Vec<LabelRow>> {
        self.check_open()?;
        let rows = sqlx::query("SELECT issue_id, label FROM labels ORDER BY issue_id, label")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> MigrateResult<LabelRow> {
                Ok(LabelRow {
                    issue_id: row.try_get("issue_id")?,
                    label: row.try_get("label")?,
                })
            })
            .collect()
    }

    async fn read_dependencies(&self) -> MigrateResult<Vec<Dependency>> {
        self.check_open()?;
        let rows = sqlx::query("SELECT * FROM dependencies ORDER BY issue_id, created_at, depends_on_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(dependency_from_row).collect::<Result<_, _>>()?)
    }

    async fn read_comments(&self) -> MigrateResult<Vec<Comment>> {
        self.check_open()?;
        let rows = sqlx::query("SELECT * FROM comments ORDER BY issue_id, created_at, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(comment_from_row).collect::<Result<_, _>>()?)
    }

    async fn read_config(&self) -> MigrateResult<Vec<ConfigRow>> {
        self.check_open()?;
        let rows = sqlx::query("SELECT `key`, value FROM config ORDER BY `key`")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> MigrateResult<ConfigRow> {
                Ok(ConfigRow {
                    key: row.try_get("key")?,
                    value: row.try_get("value")?,
                })
            })
            .collect()
    }

    async fn read_events_since(&self, after_id: i64) -> MigrateResult<Vec<Event>> {
        self.check_open()?;
        let rows = sqlx::query("SELECT * FROM events WHERE id > ? ORDER BY id")
            .bind(after_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(event_from_row).collect::<Result<_, _>>()?)
    }

    async fn get_metadata(&self, key: &str) -> MigrateResult<Option<String>> {
        self.check_open()?;
        let value = sqlx::query_scalar("SELECT value FROM metadata WHERE `key` = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_metadata(&self, key: &str, value: &str) -> MigrateResult<()> {
        self.check_open()?;
        sqlx::query("REPLACE INTO metadata (`key`, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_backups(&self) -> MigrateResult<Vec<BackupDestination>> {
        self.check_open()?;
        let rows = sqlx::query("SELECT name, url FROM dolt_backups ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> MigrateResult<BackupDestination> {
                Ok(BackupDestination {
                    name: row.try_get("name")?,
                    url: row.try_get("url")?,
                })
            })
            .collect()
    }

    async fn add_backup(&self, name: &str, url: &str) -> MigrateResult<()> {
        self.check_open()?;
        sqlx::query("CALL DOLT_BACKUP('add', ?, ?)")
            .bind(name)
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_backup(&self, name: &str) -> MigrateResult<()> {
        self.check_open()?;
        sqlx::query("CALL DOLT_BACKUP('remove', ?)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sync_backup(&self, name: &str) -> MigrateResult<()> {
        self.check_open()?;
        sqlx::query("CALL DOLT_BACKUP('sync', ?)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) -> MigrateResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pool.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_name_validation() {
        assert!(validate_database_name("proj_1").is_ok());
        assert!(validate_database_name("").is_err());
        assert!(validate_database_name("x`; DROP DATABASE y").is_err());
        assert!(validate_database_name("Proj").is_err());
    }
}
