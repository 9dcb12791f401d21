//! Structured error types for migration and backup operations.

use serde::Serialize;
use std::fmt;
use std::path::Path;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Input errors
    InvalidFieldValue,
    CorruptedInput,

    // Target state errors (fail closed)
    UnverifiableTarget,
    VerificationShortfall,

    // Resource errors
    BackupSlotsExhausted,

    // Caller errors
    RollbackNotCaptured,
    HandleClosed,
    DestinationNotFound,
    UnsupportedDestination,

    // Freshness
    StaleDatabase,

    // Internal errors
    DatabaseError,
    IoError,
    ExternalToolError,
    InternalError,
}

/// Structured error for migration and backup operations.
#[derive(Debug, Serialize)]
pub struct MigrateError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl MigrateError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    // Convenience constructors

    pub fn invalid_value(field: &str, reason: &str) -> Self {
        Self::new(ErrorCode::InvalidFieldValue, format!("{}: {}", field, reason))
    }

    pub fn corrupted(path: &Path, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::CorruptedInput,
            format!("Legacy store {} is not readable: {}", path.display(), reason),
        )
    }

    pub fn unverifiable_target(endpoint: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::UnverifiableTarget,
            format!(
                "Cannot verify target server at {}: {}; refusing to continue",
                endpoint, reason
            ),
        )
    }

    pub fn shortfall(table: &str, source: u64, target: u64) -> Self {
        Self::new(
            ErrorCode::VerificationShortfall,
            format!(
                "Verification failed for {}: source has {} rows, target has {}",
                table, source, target
            ),
        )
    }

    pub fn backup_slots_exhausted(source: &Path, attempts: u32) -> Self {
        Self::new(
            ErrorCode::BackupSlotsExhausted,
            format!(
                "Could not create a backup of {} after {} attempts",
                source.display(),
                attempts
            ),
        )
    }

    pub fn rollback_not_captured() -> Self {
        Self::new(
            ErrorCode::RollbackNotCaptured,
            "Rollback requested but no configuration snapshot was captured",
        )
    }

    pub fn handle_closed() -> Self {
        Self::new(ErrorCode::HandleClosed, "Store handle is closed")
    }

    pub fn destination_not_found(name: &str) -> Self {
        Self::new(
            ErrorCode::DestinationNotFound,
            format!("Backup destination not found: {}", name),
        )
    }

    pub fn unsupported_destination(url: &str, reason: &str) -> Self {
        Self::new(
            ErrorCode::UnsupportedDestination,
            format!("Unsupported backup destination {}: {}", url, reason),
        )
    }

    pub fn stale_database(path: &Path, file_time: impl fmt::Display, imported: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::StaleDatabase,
            format!(
                "{} was modified at {} but the database last imported at {}; re-import before continuing",
                path.display(),
                file_time,
                imported
            ),
        )
    }

    pub fn database(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::DatabaseError, err.to_string())
    }

    pub fn io(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::IoError, err.to_string())
    }

    pub fn external_tool(tool: &str, err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::ExternalToolError, format!("{}: {}", tool, err))
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InternalError, err.to_string())
    }
}

impl fmt::Display for MigrateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{} ({})", self.message, details),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for MigrateError {}

impl From<rusqlite::Error> for MigrateError {
    fn from(err: rusqlite::Error) -> Self {
        MigrateError::database(err)
    }
}

impl From<sqlx::Error> for MigrateError {
    fn from(err: sqlx::Error) -> Self {
        MigrateError::database(err)
    }
}

impl From<refinery::Error> for MigrateError {
    fn from(err: refinery::Error) -> Self {
        MigrateError::database(err)
    }
}

impl From<std::io::Error> for MigrateError {
    fn from(err: std::io::Error) -> Self {
        MigrateError::io(err)
    }
}

impl From<serde_json::Error> for MigrateError {
    fn from(err: serde_json::Error) -> Self {
        MigrateError::internal(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for MigrateError {
    fn from(err: serde_yaml::Error) -> Self {
        MigrateError::internal(format!("YAML error: {}", err))
    }
}

// Allow using ? with anyhow errors by converting them
impl From<anyhow::Error> for MigrateError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<MigrateError>() {
            Ok(migrate_err) => migrate_err,
            Err(err) => MigrateError::internal(err),
        }
    }
}

/// Result type for migration and backup operations.
pub type MigrateResult<T> = std::result::Result<T, MigrateError>;

/// A failed optional step, surfaced to the operator but never escalated.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Warning {
    pub step: String,
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.message)
    }
}

/// Run the outcome of a best-effort step through the non-propagating path.
///
/// A failure is logged at warn level and returned as a [`Warning`] for the
/// caller to report. It never becomes the operation's error.
pub fn best_effort<E: fmt::Display>(step: &str, result: Result<(), E>) -> Option<Warning> {
    match result {
        Ok(()) => None,
        Err(err) => {
            tracing::warn!(step, error = %err, "best-effort step failed");
            Some(Warning {
                step: step.to_string(),
                message: err.to_string(),
            })
        }
    }
}
