//! The target store: a version-controlled SQL engine, either a Dolt SQL
//! server reached over the MySQL protocol or an in-process embedded engine.

pub mod embedded;
pub mod server;
pub mod verify;

pub use embedded::EmbeddedEngine;
pub use server::DoltServer;
pub use verify::{Reachability, classify_databases, verify_target};

use crate::config::{AppConfig, DoltMode, PersistedConfig, ServerConfig};
use crate::error::{MigrateError, MigrateResult};
use crate::paths::DataPaths;
use crate::types::{Comment, ConfigRow, Dependency, Event, Issue, LabelRow, Snapshot, TableCounts};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Database name used when no usable prefix exists.
pub const DEFAULT_DATABASE_NAME: &str = "trackdb";

/// Which engine implementation backs a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Embedded,
    Server,
}

/// A registered native backup destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupDestination {
    pub name: String,
    pub url: String,
}

/// Operations the migration and backup subsystem needs from the target.
///
/// Every write that changes table contents ends in a commit, so
/// [`current_commit`](Self::current_commit) changes exactly when data does.
#[async_trait]
pub trait TargetEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Name of the database this handle operates on.
    fn database(&self) -> &str;

    /// True once [`close`](Self::close) has been called.
    fn is_closed(&self) -> bool;

    /// Write every row of the snapshot and commit. Re-writing the same
    /// snapshot is idempotent. Returns the resulting commit id.
    async fn write_snapshot(&self, snapshot: &Snapshot, message: &str) -> MigrateResult<String>;

    async fn table_counts(&self) -> MigrateResult<TableCounts>;

    /// Id of the latest commit, `None` before the first one.
    async fn current_commit(&self) -> MigrateResult<Option<String>>;

    async fn read_issues(&self) -> MigrateResult<Vec<Issue>>;
    async fn read_labels(&self) -> MigrateResult<Vec<LabelRow>>;
    async fn read_dependencies(&self) -> MigrateResult<Vec<Dependency>>;
    async fn read_comments(&self) -> MigrateResult<Vec<Comment>>;
    async fn read_config(&self) -> MigrateResult<Vec<ConfigRow>>;

    /// Events with id strictly greater than `after_id`, ascending by id.
    async fn read_events_since(&self, after_id: i64) -> MigrateResult<Vec<Event>>;

    async fn get_metadata(&self, key: &str) -> MigrateResult<Option<String>>;
    async fn set_metadata(&self, key: &str, value: &str) -> MigrateResult<()>;

    async fn list_backups(&self) -> MigrateResult<Vec<BackupDestination>>;
    async fn add_backup(&self, name: &str, url: &str) -> MigrateResult<()>;
    async fn remove_backup(&self, name: &str) -> MigrateResult<()>;

    /// Push the current database state to a registered destination.
    async fn sync_backup(&self, name: &str) -> MigrateResult<()>;

    /// Release the handle. Later calls fail with `HANDLE_CLOSED`.
    async fn close(&self) -> MigrateResult<()>;
}

/// Network address and credentials of a SQL server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
}

impl ServerEndpoint {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            password: config.password.clone(),
        }
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Where the target lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetLocation {
    /// In-process engine backed by a file under the data directory.
    Embedded { path: PathBuf },
    Server(ServerEndpoint),
}

impl TargetLocation {
    /// Location for a fresh migration. Port 0 selects the embedded engine.
    pub fn for_migration(paths: &DataPaths, config: &AppConfig, database: &str) -> Self {
        if config.server.port == 0 {
            TargetLocation::Embedded {
                path: paths.embedded_db(database),
            }
        } else {
            TargetLocation::Server(ServerEndpoint::from_config(&config.server))
        }
    }

    /// Location recorded by a completed migration.
    ///
    /// Host, port and user come from `metadata.json` when present; the
    /// password only ever comes from application config.
    pub fn from_persisted(paths: &DataPaths, persisted: &PersistedConfig, config: &AppConfig) -> Self {
        let database = persisted
            .dolt_database
            .clone()
            .unwrap_or_else(|| DEFAULT_DATABASE_NAME.to_string());
        match persisted.dolt_mode {
            Some(DoltMode::Embedded) => TargetLocation::Embedded {
                path: paths.embedded_db(&database),
            },
            _ => TargetLocation::Server(ServerEndpoint {
                host: persisted
                    .server_host
                    .clone()
                    .unwrap_or_else(|| config.server.host.clone()),
                port: persisted.server_port.unwrap_or(config.server.port),
                user: persisted
                    .server_user
                    .clone()
                    .unwrap_or_else(|| config.server.user.clone()),
                password: config.server.password.clone(),
            }),
        }
    }

    pub fn dolt_mode(&self) -> DoltMode {
        match self {
            TargetLocation::Embedded { .. } => DoltMode::Embedded,
            TargetLocation::Server(_) => DoltMode::Server,
        }
    }

    /// Port probed by the reachability check. 0 for the embedded engine.
    pub fn probe_port(&self) -> u16 {
        match self {
            TargetLocation::Embedded { .. } => 0,
            TargetLocation::Server(endpoint) => endpoint.port,
        }
    }
}

impl fmt::Display for TargetLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetLocation::Embedded { path } => write!(f, "embedded:{}", path.display()),
            TargetLocation::Server(endpoint) => write!(f, "server:{}", endpoint),
        }
    }
}

/// Opens engine handles. Entry points take this as an explicit value.
#[async_trait]
pub trait EngineOpener: Send + Sync {
    /// Open `database` at `location`, creating it if needed.
    async fn open(
        &self,
        location: &TargetLocation,
        database: &str,
    ) -> MigrateResult<Box<dyn TargetEngine>>;
}

/// Opener for the two real engine implementations.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardOpener;

#[async_trait]
impl EngineOpener for StandardOpener {
    async fn open(
        &self,
        location: &TargetLocation,
        database: &str,
    ) -> MigrateResult<Box<dyn TargetEngine>> {
        match location {
            TargetLocation::Embedded { path } => {
                Ok(Box::new(EmbeddedEngine::open(path, database)?))
            }
            TargetLocation::Server(endpoint) => {
                Ok(Box::new(DoltServer::connect(endpoint, database).await?))
            }
        }
    }
}

/// Target database name for an issue ID prefix.
///
/// Lowercased, with anything outside `[a-z0-9_]` replaced by `_`.
pub fn database_name_for_prefix(prefix: &str) -> String {
    let name: String = prefix
        .trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.chars().all(|c| c == '_') {
        DEFAULT_DATABASE_NAME.to_string()
    } else {
        name
    }
}

/// Reject use of a handle after `close`.
pub(crate) fn ensure_open(closed: bool) -> MigrateResult<()> {
    if closed {
        Err(MigrateError::handle_closed())
    } else {
        Ok(())
    }
}
