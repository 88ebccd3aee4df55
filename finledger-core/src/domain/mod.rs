//! Core domain entities
//!
//! Migration units, their steps and the records the runner keeps. These are
//! plain data structures - execution lives in the services.

pub mod migration;
pub mod result;

pub use migration::{
    quote_ident, AppliedMigration, ChangeColumn, Conversion, ConvertFn, IntegrityMode,
    MigrationState, MigrationStatus, MigrationUnit, RebuildTable, Step, Version,
};
pub use result::{Error, MigrationError, MigrationFailure, OperationResult, Result};
