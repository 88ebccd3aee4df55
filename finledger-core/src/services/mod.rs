//! Service layer - business logic orchestration
//!
//! The migration service drives units through the executor; the event log
//! records what happened.

pub mod executor;
pub mod logging;
pub mod migration;

pub use logging::{EntryPoint, EventLog, LogEntry, LogEvent, LOG_DB_FILE};
pub use migration::{LintIssue, MigrationResult, MigrationService, RunnerOptions, MIGRATIONS_TABLE};
