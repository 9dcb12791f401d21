//! Persisted backend configuration (`metadata.json`).
//!
//! This file is the single source of truth for which storage backend is
//! authoritative. Only the migration committer writes it forward and only the
//! rollback manager writes it backward; every write goes through an atomic
//! rename so readers never observe a half-written file.

use super::types::SyncMode;
use crate::error::{MigrateError, MigrateResult};
use crate::paths::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Storage backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Single-file SQLite store.
    #[default]
    Sqlite,
    /// Dolt, embedded or behind a SQL server.
    Dolt,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Sqlite => write!(f, "sqlite"),
            Backend::Dolt => write!(f, "dolt"),
        }
    }
}

/// How the Dolt backend is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoltMode {
    Embedded,
    Server,
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Legacy database file name, relative to the data directory.
    #[serde(default = "default_database")]
    pub database: String,

    /// Portable export file name, relative to the data directory.
    #[serde(default = "default_jsonl_export")]
    pub jsonl_export: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dolt_mode: Option<DoltMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dolt_database: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_mode: Option<SyncMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrated_at: Option<DateTime<Utc>>,
}

impl Default for PersistedConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            database: default_database(),
            jsonl_export: default_jsonl_export(),
            dolt_mode: None,
            dolt_database: None,
            server_host: None,
            server_port: None,
            server_user: None,
            sync_mode: None,
            migrated_at: None,
        }
    }
}

fn default_database() -> String {
    "issues.db".to_string()
}

fn default_jsonl_export() -> String {
    "issues.jsonl".to_string()
}

/// Raw captured contents of `metadata.json`, `None` when the file was absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    bytes: Option<Vec<u8>>,
}

impl ConfigSnapshot {
    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }
}

/// Reads and writes `metadata.json`.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted configuration. A missing file yields the defaults.
    pub fn load(&self) -> MigrateResult<PersistedConfig> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                MigrateError::invalid_value("metadata.json", &e.to_string())
                    .with_details(self.path.display().to_string())
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedConfig::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the persisted configuration.
    pub fn save(&self, config: &PersistedConfig) -> MigrateResult<()> {
        let mut json = serde_json::to_vec_pretty(config)?;
        json.push(b'\n');
        write_atomic(&self.path, &json)
    }

    /// Capture the exact current bytes for a later [`restore`](Self::restore).
    pub fn capture(&self) -> MigrateResult<ConfigSnapshot> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(ConfigSnapshot { bytes: Some(bytes) }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigSnapshot { bytes: None }),
            Err(e) => Err(e.into()),
        }
    }

    /// Put back exactly what [`capture`](Self::capture) saw, including absence.
    pub fn restore(&self, snapshot: &ConfigSnapshot) -> MigrateResult<()> {
        match &snapshot.bytes {
            Some(bytes) => write_atomic(&self.path, bytes),
            None => match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }
}

/// Mirror the sync mode into the human-editable `config.yaml`.
///
/// Only the `sync.mode` line is touched, so comments and layout elsewhere in
/// the file survive. Files the line edit cannot handle (flow mappings, a
/// scalar `sync:`) are rewritten through serde_yaml, which drops comments.
/// `metadata.json` stays the source of truth; callers treat a failure here
/// as a warning.
pub fn write_sync_mode(config_yaml: &Path, mode: SyncMode) -> MigrateResult<()> {
    let content = match fs::read_to_string(config_yaml) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let edited = set_sync_mode_line(&content, mode.as_str())
        .filter(|edited| reads_back_mode(edited, mode.as_str()));
    let yaml = match edited {
        Some(edited) => edited,
        None => rewrite_sync_mode(&content, mode)?,
    };
    write_atomic(config_yaml, yaml.as_bytes())
}

fn reads_back_mode(yaml: &str, mode: &str) -> bool {
    serde_yaml::from_str::<Value>(yaml)
        .map(|value| value["sync"]["mode"] == mode)
        .unwrap_or(false)
}

/// Line-level edit of a block-style `sync:` mapping. `None` when the file
/// has a top-level `sync` key in any other form.
fn set_sync_mode_line(content: &str, mode: &str) -> Option<String> {
    let mut lines: Vec<String> = content.lines().map(String::from).collect();

    let Some(sync_at) = lines.iter().position(|l| l.starts_with("sync:")) else {
        let mut out = content.to_string();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&format!("sync:\n  mode: {}\n", mode));
        return Some(out);
    };
    let rest = lines[sync_at]["sync:".len()..].trim();
    if !(rest.is_empty() || rest.starts_with('#')) {
        return None;
    }

    let mut child_indent = None;
    for line in lines.iter_mut().skip(sync_at + 1) {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let indent = line.len() - trimmed.len();
        if indent == 0 {
            break;
        }
        let child = *child_indent.get_or_insert(indent);
        if indent == child && trimmed.starts_with("mode:") {
            let comment = trimmed
                .find(" #")
                .map(|at| &trimmed[trimmed[..at].trim_end().len()..])
                .unwrap_or("");
            *line = format!("{}mode: {}{}", " ".repeat(indent), mode, comment);
            return Some(join_lines(&lines));
        }
    }

    let indent = " ".repeat(child_indent.unwrap_or(2));
    lines.insert(sync_at + 1, format!("{}mode: {}", indent, mode));
    Some(join_lines(&lines))
}

fn join_lines(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn rewrite_sync_mode(content: &str, mode: SyncMode) -> MigrateResult<String> {
    let mut root: Value = if content.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_yaml::from_str(content)?
    };

    let map = root.as_object_mut().ok_or_else(|| {
        MigrateError::invalid_value("config.yaml", "top level is not a mapping")
    })?;
    let sync = map
        .entry("sync")
        .or_insert_with(|| Value::Object(Default::default()));
    if !sync.is_object() {
        *sync = Value::Object(Default::default());
    }
    if let Some(sync) = sync.as_object_mut() {
        sync.insert("mode".to_string(), Value::String(mode.as_str().to_string()));
    }
    Ok(serde_yaml::to_string(&root)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_returns_defaults() {
        let temp = TempDir::new().unwrap();
        let store = MetadataStore::new(temp.path().join("metadata.json"));
        let config = store.load().unwrap();
        assert_eq!(config.backend, Backend::Sqlite);
        assert_eq!(config.database, "issues.db");
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let store = MetadataStore::new(temp.path().join("metadata.json"));
        let config = PersistedConfig {
            backend: Backend::Dolt,
            dolt_mode: Some(DoltMode::Server),
            dolt_database: Some("proj".to_string()),
            server_port: Some(3307),
            ..PersistedConfig::default()
        };
        store.save(&config).unwrap();
        assert_eq!(store.load().unwrap(), config);
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("metadata.json");
        fs::write(&path, r#"{"backend":"sqlite","database":"beads.db","future":1}"#).unwrap();
        let config = MetadataStore::new(&path).load().unwrap();
        assert_eq!(config.database, "beads.db");
        assert_eq!(config.jsonl_export, "issues.jsonl");
    }

    #[test]
    fn test_capture_restore_absent_file() {
        let temp = TempDir::new().unwrap();
        let store = MetadataStore::new(temp.path().join("metadata.json"));
        let snap = store.capture().unwrap();
        assert!(snap.bytes().is_none());

        store.save(&PersistedConfig::default()).unwrap();
        store.restore(&snap).unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn test_write_sync_mode_preserves_other_keys() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        fs::write(&path, "backup:\n  git_push: true\n").unwrap();

        write_sync_mode(&path, SyncMode::DoltNative).unwrap();

        let value: Value = serde_yaml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["sync"]["mode"], "dolt-native");
        assert_eq!(value["backup"]["git_push"], true);
    }

    #[test]
    fn test_write_sync_mode_keeps_comments() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        let original = "# project settings\nsync:\n    # set by trackdb\n    mode: git-portable  # old\nbackup:\n  interval_secs: 60 # one minute\n";
        fs::write(&path, original).unwrap();

        write_sync_mode(&path, SyncMode::DoltNative).unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "# project settings\nsync:\n    # set by trackdb\n    mode: dolt-native  # old\nbackup:\n  interval_secs: 60 # one minute\n"
        );
    }

    #[test]
    fn test_write_sync_mode_adds_missing_key() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        fs::write(&path, "sync:\n  remote: origin\n# trailing note\n").unwrap();
        write_sync_mode(&path, SyncMode::DoltNative).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "sync:\n  mode: dolt-native\n  remote: origin\n# trailing note\n"
        );

        let missing = temp.path().join("missing.yaml");
        write_sync_mode(&missing, SyncMode::DoltNative).unwrap();
        assert_eq!(fs::read_to_string(&missing).unwrap(), "sync:\n  mode: dolt-native\n");
    }

    #[test]
    fn test_write_sync_mode_flow_mapping_falls_back() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        fs::write(&path, "sync: {mode: git-portable}\n").unwrap();
        write_sync_mode(&path, SyncMode::DoltNative).unwrap();
        let value: Value = serde_yaml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["sync"]["mode"], "dolt-native");
    }
}
