//! trackdb storage library
//!
//! Migration of the legacy SQLite store to Dolt, with rollback, portable
//! JSONL backups, the freshness audit and native backups.

pub mod backup;
pub mod cli;
pub mod config;
pub mod error;
pub mod freshness;
pub mod legacy;
pub mod logging;
pub mod migrate;
pub mod native_backup;
pub mod paths;
pub mod target;
pub mod types;
