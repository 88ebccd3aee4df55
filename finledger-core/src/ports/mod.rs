//! Port definitions (hexagonal architecture)
//!
//! Ports define the interfaces for external collaborators of the runner: where
//! migration units come from, and who wants to hear about what was applied.

use crate::domain::{AppliedMigration, MigrationError, MigrationUnit, Result};

/// Discovery of migration units
///
/// The runner sorts what it receives; sources need not return units in order.
pub trait MigrationSource {
    fn load(&self) -> Result<Vec<MigrationUnit>>;
}

impl MigrationSource for Vec<MigrationUnit> {
    fn load(&self) -> Result<Vec<MigrationUnit>> {
        Ok(self.clone())
    }
}

/// Receives runner events after each unit commits or fails
///
/// Observers must not fail a migration; errors are theirs to swallow.
pub trait MigrationObserver {
    fn on_applied(&self, _unit: &MigrationUnit, _record: &AppliedMigration) {}

    fn on_reverted(&self, _unit: &MigrationUnit) {}

    fn on_failed(&self, _error: &MigrationError) {}
}
