//! Configuration types and structures.

use crate::target::verify::DEFAULT_CONNECT_TIMEOUT_MS;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default port of the Dolt SQL server.
pub const DEFAULT_SERVER_PORT: u16 = 3307;

/// Default minimum interval between automatic backups (15 minutes).
pub const DEFAULT_BACKUP_INTERVAL_SECS: u64 = 15 * 60;

/// Default timeout for version-control sync of the backup directory.
pub const DEFAULT_GIT_TIMEOUT_SECS: u64 = 60;

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Data directory holding metadata, the legacy store and backups.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub legacy: LegacyConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server: ServerConfig::default(),
            backup: BackupConfig::default(),
            sync: SyncConfig::default(),
            legacy: LegacyConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".trackdb")
}

/// Connection settings for the target SQL server.
///
/// A port of `0` selects the embedded engine: no network target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    /// Password, normally supplied through `TRACKDB_SERVER_PASSWORD`.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Timeout for the reachability probe in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_SERVER_PORT
}

fn default_user() -> String {
    "root".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

/// Portable backup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Minimum seconds between automatic backups.
    #[serde(default = "default_backup_interval")]
    pub interval_secs: u64,

    /// Commit and push the backup directory with git after each export.
    #[serde(default)]
    pub git_push: bool,

    /// Timeout for the git sync in seconds.
    #[serde(default = "default_git_timeout")]
    pub git_timeout_secs: u64,

    /// Override for the backup directory (default: `<data_dir>/backup`).
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_backup_interval(),
            git_push: false,
            git_timeout_secs: default_git_timeout(),
            dir: None,
        }
    }
}

fn default_backup_interval() -> u64 {
    DEFAULT_BACKUP_INTERVAL_SECS
}

fn default_git_timeout() -> u64 {
    DEFAULT_GIT_TIMEOUT_SECS
}

/// How project state is synchronized between clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// JSONL files committed to git (legacy default).
    #[default]
    GitPortable,
    /// Dolt's own push/pull.
    DoltNative,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::GitPortable => "git-portable",
            SyncMode::DoltNative => "dolt-native",
        }
    }
}

/// Sync settings, mirrored from `metadata.json` after a migration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub mode: SyncMode,
}

/// Which legacy extraction path to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorChoice {
    /// Linked SQLite driver.
    #[default]
    Native,
    /// The `sqlite3` command-line client.
    Cli,
}

/// Legacy store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyConfig {
    #[serde(default)]
    pub extractor: ExtractorChoice,

    /// Binary used by the command-line extraction path.
    #[serde(default = "default_sqlite_binary")]
    pub sqlite_binary: String,
}

impl Default for LegacyConfig {
    fn default() -> Self {
        Self {
            extractor: ExtractorChoice::default(),
            sqlite_binary: default_sqlite_binary(),
        }
    }
}

fn default_sqlite_binary() -> String {
    "sqlite3".to_string()
}
