//! Restore of the persisted configuration after a failed migration.

use crate::config::{ConfigSnapshot, MetadataStore};
use crate::error::{MigrateError, MigrateResult};
use tracing::{info, warn};

/// Holds the pre-migration configuration and puts it back on request.
#[derive(Debug)]
pub struct RollbackManager {
    store: MetadataStore,
    captured: Option<ConfigSnapshot>,
}

impl RollbackManager {
    pub fn new(store: MetadataStore) -> Self {
        Self {
            store,
            captured: None,
        }
    }

    /// Capture the current bytes of `metadata.json` (or its absence).
    pub fn capture(&mut self) -> MigrateResult<()> {
        self.captured = Some(self.store.capture()?);
        Ok(())
    }

    pub fn is_captured(&self) -> bool {
        self.captured.is_some()
    }

    /// Restore the captured configuration byte-for-byte.
    ///
    /// Fails with `ROLLBACK_NOT_CAPTURED` if [`capture`](Self::capture)
    /// never ran.
    pub fn rollback(&self) -> MigrateResult<()> {
        let Some(snapshot) = &self.captured else {
            warn!("rollback requested without a captured configuration");
            return Err(MigrateError::rollback_not_captured());
        };
        self.store.restore(snapshot)?;
        info!(path = %self.store.path().display(), "configuration rolled back");
        Ok(())
    }
}
