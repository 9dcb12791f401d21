//! Configuration system.
//!
//! Two kinds of configuration live here:
//!
//! - **Application settings** (`AppConfig`), merged field-by-field from
//!   embedded defaults, the project `config.yaml` in the data directory, the
//!   user `~/.config/trackdb/config.yaml`, and environment variables.
//! - **Persisted backend configuration** (`metadata.json`), which records the
//!   authoritative backend and is owned by the migration subsystem.
//!
//! ## Environment Variables
//! - `TRACKDB_CONFIG_PATH` - Explicit config file (replaces the file tiers)
//! - `TRACKDB_DATA_DIR` - Data directory (default: `./.trackdb`)
//! - `TRACKDB_USER_DIR` - User config dir
//! - `TRACKDB_SERVER_HOST` / `TRACKDB_SERVER_PORT` / `TRACKDB_SERVER_USER`
//! - `TRACKDB_SERVER_PASSWORD`
//! - `TRACKDB_BACKUP_INTERVAL_SECS`

mod loader;
mod merge;
pub mod metadata;
mod types;

pub use loader::{ConfigLoader, ConfigPaths, ConfigTier};
pub use merge::{deep_merge, deep_merge_all, merge_into};
pub use metadata::{Backend, ConfigSnapshot, DoltMode, MetadataStore, PersistedConfig};
pub use types::*;
