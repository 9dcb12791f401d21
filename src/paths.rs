//! Path layout of the data directory and filesystem helpers.
//!
//! Every durable artifact of the subsystem lives under one data directory:
//!
//! ```text
//! .trackdb/
//!   metadata.json        persisted backend configuration (authoritative)
//!   config.yaml          human-editable settings (sync.mode mirror)
//!   issues.db            legacy SQLite store (renamed to issues.db.migrated)
//!   issues.jsonl         portable export checked by the freshness audit
//!   native_backup.json   native backup destinations and last sync outcome
//!   embedded/            embedded target engine databases
//!   backup/              portable backup tables and backup_state.json
//! ```

use crate::config::PersistedConfig;
use crate::error::{MigrateError, MigrateResult};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Suffix appended to the legacy store once it has been migrated.
pub const MIGRATED_SUFFIX: &str = ".migrated";

/// Resolved locations inside a data directory. Pure path arithmetic, no I/O.
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata_json(&self) -> PathBuf {
        self.root.join("metadata.json")
    }

    pub fn config_yaml(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn legacy_db(&self, persisted: &PersistedConfig) -> PathBuf {
        self.root.join(&persisted.database)
    }

    pub fn portable_export(&self, persisted: &PersistedConfig) -> PathBuf {
        self.root.join(&persisted.jsonl_export)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join("backup")
    }

    pub fn native_backup_state(&self) -> PathBuf {
        self.root.join("native_backup.json")
    }

    pub fn embedded_db(&self, database: &str) -> PathBuf {
        self.root.join("embedded").join(format!("{}.db", database))
    }
}

/// Path of the legacy store after retirement.
pub fn migrated_path(legacy: &Path) -> PathBuf {
    let mut name = legacy.as_os_str().to_owned();
    name.push(MIGRATED_SUFFIX);
    PathBuf::from(name)
}

/// Expand a leading `~` or `~/` to the home directory.
pub fn expand_home(input: &str) -> MigrateResult<PathBuf> {
    if input == "~" || input.starts_with("~/") || input.starts_with("~\\") {
        let home = dirs::home_dir()
            .ok_or_else(|| MigrateError::invalid_value("path", "home directory is unknown"))?;
        let rest = input[1..].trim_start_matches(['/', '\\']);
        return Ok(if rest.is_empty() {
            home
        } else {
            home.join(rest)
        });
    }
    Ok(PathBuf::from(input))
}

/// Make a path absolute against the current directory and resolve `.`/`..`.
pub fn absolutize(path: &Path) -> MigrateResult<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(normalize_path_components(&absolute))
}

/// Normalize path components without requiring the file to exist.
/// Handles `.` and `..` components.
pub fn normalize_path_components(path: &Path) -> PathBuf {
    let mut components = Vec::new();

    for component in path.components() {
        match component {
            Component::Prefix(p) => components.push(Component::Prefix(p)),
            Component::RootDir => components.push(Component::RootDir),
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                } else {
                    // Can't go up from root, keep the component
                    components.push(Component::ParentDir);
                }
            }
            Component::Normal(name) => components.push(Component::Normal(name)),
        }
    }

    components.iter().collect()
}

/// Convert path to string using forward slashes.
pub fn path_to_forward_slashes(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// True when the input carries a URL scheme (`scheme://...`).
pub fn has_url_scheme(input: &str) -> bool {
    match input.split_once("://") {
        Some((scheme, _)) => {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

/// `file://` URI for an absolute path. Windows drive paths get a leading `/`.
pub fn file_uri(absolute: &Path) -> String {
    let s = path_to_forward_slashes(absolute);
    if s.starts_with('/') {
        format!("file://{}", s)
    } else {
        format!("file:///{}", s)
    }
}

/// Write `contents` to `path` through a sibling temp file and an atomic rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> MigrateResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| MigrateError::invalid_value("path", "missing file name"))?;
    let mut tmp_name = file_name.to_owned();
    tmp_name.push(format!(".tmp.{}", std::process::id()));
    let tmp_path = parent.join(tmp_name);

    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if let Err(err) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}
