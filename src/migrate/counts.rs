//! Post-write verification: the target must hold at least what was read.

use crate::error::{MigrateError, MigrateResult};
use crate::types::TableCounts;

/// Check issue and dependency counts.
///
/// The target may hold more rows than the source (an idempotent re-run
/// onto existing data) but never fewer.
pub fn verify_migration_counts(
    source_issues: u64,
    source_deps: u64,
    target_issues: u64,
    target_deps: u64,
) -> MigrateResult<()> {
    if target_issues < source_issues {
        return Err(MigrateError::shortfall("issues", source_issues, target_issues));
    }
    if target_deps < source_deps {
        return Err(MigrateError::shortfall("dependencies", source_deps, target_deps));
    }
    Ok(())
}

/// Check every migrated table.
pub fn verify_table_counts(source: &TableCounts, target: &TableCounts) -> MigrateResult<()> {
    verify_migration_counts(source.issues, source.dependencies, target.issues, target.dependencies)?;
    for (table, expected) in source.iter() {
        let actual = target.get(table).unwrap_or(0);
        if actual < expected {
            return Err(MigrateError::shortfall(table, expected, actual));
        }
    }
    Ok(())
}
