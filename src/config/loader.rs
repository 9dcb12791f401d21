//! Configuration loader with tier-based merging.
//!
//! Loads configuration from multiple tiers and merges them field-by-field.

use super::merge::deep_merge_all;
use super::types::AppConfig;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Configuration tier priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    /// Embedded defaults (lowest priority)
    Defaults = 0,
    /// Project-level config (`<data_dir>/config.yaml`)
    Project = 1,
    /// User-level config (`~/.config/trackdb/config.yaml`)
    User = 2,
    /// Environment variables (highest priority)
    Environment = 3,
}

impl std::fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTier::Defaults => write!(f, "defaults"),
            ConfigTier::Project => write!(f, "project"),
            ConfigTier::User => write!(f, "user"),
            ConfigTier::Environment => write!(f, "environment"),
        }
    }
}

/// Paths for each configuration tier.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    /// Project data directory
    pub data_dir: PathBuf,
    /// User-level config directory
    pub user_dir: Option<PathBuf>,
}

impl ConfigPaths {
    /// Discover configuration paths from environment and defaults.
    pub fn discover(data_dir_override: Option<&Path>) -> Self {
        let data_dir = data_dir_override
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("TRACKDB_DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(".trackdb"));

        let user_dir = std::env::var("TRACKDB_USER_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| dirs::config_dir().map(|d| d.join("trackdb")));

        Self { data_dir, user_dir }
    }

    /// Create paths with explicit directories.
    pub fn with_dirs(data_dir: PathBuf, user_dir: Option<PathBuf>) -> Self {
        Self { data_dir, user_dir }
    }
}

/// Configuration loader that handles tier-based merging.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    pub paths: ConfigPaths,
    config: AppConfig,
    /// Config files that contributed, lowest tier first
    sources: Vec<(ConfigTier, PathBuf)>,
}

impl ConfigLoader {
    /// Load configuration from all tiers with proper merging.
    pub fn load(data_dir_override: Option<&Path>) -> Result<Self> {
        Self::load_with_paths(ConfigPaths::discover(data_dir_override))
    }

    /// Load configuration with explicit paths.
    pub fn load_with_paths(paths: ConfigPaths) -> Result<Self> {
        // Explicit config file replaces the file tiers
        if let Ok(explicit) = std::env::var("TRACKDB_CONFIG_PATH") {
            let path = PathBuf::from(explicit);
            let value = read_yaml(&path)?
                .with_context(|| format!("config file {} not found", path.display()))?;
            let mut config: AppConfig = serde_json::from_value(deep_merge_all([
                serde_json::to_value(AppConfig::default())?,
                value,
            ]))?;
            config.data_dir = paths.data_dir.clone();
            Self::apply_env_overrides(&mut config);
            return Ok(Self {
                paths,
                config,
                sources: vec![(ConfigTier::Project, path)],
            });
        }

        let mut configs: Vec<Value> = vec![serde_json::to_value(AppConfig::default())?];
        let mut sources = Vec::new();

        // Tier 2: Project config
        let project_file = paths.data_dir.join("config.yaml");
        match read_yaml(&project_file) {
            Ok(Some(value)) => {
                configs.push(value);
                sources.push((ConfigTier::Project, project_file));
            }
            Ok(None) => {}
            Err(e) => warn!(path = %project_file.display(), error = %e, "ignoring unreadable project config"),
        }

        // Tier 3: User config
        if let Some(ref user_dir) = paths.user_dir {
            let user_file = user_dir.join("config.yaml");
            match read_yaml(&user_file) {
                Ok(Some(value)) => {
                    configs.push(value);
                    sources.push((ConfigTier::User, user_file));
                }
                Ok(None) => {}
                Err(e) => warn!(path = %user_file.display(), error = %e, "ignoring unreadable user config"),
            }
        }

        let merged = deep_merge_all(configs);
        let mut config: AppConfig = serde_json::from_value(merged)?;
        config.data_dir = paths.data_dir.clone();

        // Tier 4: Environment variable overrides
        Self::apply_env_overrides(&mut config);

        debug!(sources = ?sources, "configuration loaded");

        Ok(Self {
            paths,
            config,
            sources,
        })
    }

    /// Apply environment variable overrides to config.
    fn apply_env_overrides(config: &mut AppConfig) {
        if let Ok(host) = std::env::var("TRACKDB_SERVER_HOST") {
            config.server.host = host;
        }

        if let Ok(port) = std::env::var("TRACKDB_SERVER_PORT") {
            match port.parse() {
                Ok(port) => config.server.port = port,
                Err(_) => warn!(value = %port, "ignoring invalid TRACKDB_SERVER_PORT"),
            }
        }

        if let Ok(user) = std::env::var("TRACKDB_SERVER_USER") {
            config.server.user = user;
        }

        if let Ok(password) = std::env::var("TRACKDB_SERVER_PASSWORD") {
            config.server.password = Some(password);
        }

        if let Ok(interval) = std::env::var("TRACKDB_BACKUP_INTERVAL_SECS") {
            match interval.parse() {
                Ok(secs) => config.backup.interval_secs = secs,
                Err(_) => warn!(value = %interval, "ignoring invalid TRACKDB_BACKUP_INTERVAL_SECS"),
            }
        }
    }

    /// Get the loaded configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Consume the loader and return the configuration.
    pub fn into_config(self) -> AppConfig {
        self.config
    }

    /// Config files that contributed to the merged configuration.
    pub fn sources(&self) -> &[(ConfigTier, PathBuf)] {
        &self.sources
    }
}

/// Read a YAML file as a JSON value. `Ok(None)` when the file does not exist.
fn read_yaml(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    let value: Value = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{DEFAULT_BACKUP_INTERVAL_SECS, SyncMode};
    use tempfile::TempDir;

    #[test]
    fn test_load_defaults_only() {
        let temp = TempDir::new().unwrap();
        let paths = ConfigPaths::with_dirs(temp.path().join("data"), Some(temp.path().join("user")));

        let loader = ConfigLoader::load_with_paths(paths).unwrap();
        let config = loader.config();

        assert_eq!(config.backup.interval_secs, DEFAULT_BACKUP_INTERVAL_SECS);
        assert_eq!(config.sync.mode, SyncMode::GitPortable);
        assert_eq!(config.data_dir, temp.path().join("data"));
        assert!(loader.sources().is_empty());
    }

    #[test]
    fn test_project_config_overrides_defaults() {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(
            data_dir.join("config.yaml"),
            "server:\n  port: 0\nsync:\n  mode: dolt-native\n",
        )
        .unwrap();

        let paths = ConfigPaths::with_dirs(data_dir, Some(temp.path().join("user")));
        let loader = ConfigLoader::load_with_paths(paths).unwrap();
        let config = loader.config();

        assert_eq!(config.server.port, 0);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.sync.mode, SyncMode::DoltNative);
        assert_eq!(loader.sources().len(), 1);
        assert_eq!(loader.sources()[0].0, ConfigTier::Project);
    }

    #[test]
    fn test_user_config_overrides_project() {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path().join("data");
        let user_dir = temp.path().join("user");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::create_dir_all(&user_dir).unwrap();

        std::fs::write(
            data_dir.join("config.yaml"),
            "backup:\n  interval_secs: 60\n  git_push: true\n",
        )
        .unwrap();
        std::fs::write(user_dir.join("config.yaml"), "backup:\n  interval_secs: 120\n").unwrap();

        let paths = ConfigPaths::with_dirs(data_dir, Some(user_dir));
        let loader = ConfigLoader::load_with_paths(paths).unwrap();
        let config = loader.config();

        assert_eq!(config.backup.interval_secs, 120);
        assert!(config.backup.git_push);
    }
}
