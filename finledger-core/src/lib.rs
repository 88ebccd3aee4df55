//! Finledger Core - schema migrations for the personal-finance ledger
//!
//! This crate implements the migration runner following hexagonal architecture:
//!
//! - **domain**: Migration units, steps, records and errors
//! - **ports**: Trait definitions for migration sources and observers
//! - **services**: The runner, step executor and event log
//! - **adapters**: Concrete implementations (SQLite, migration directories)

pub mod adapters;
pub mod config;
pub mod domain;
pub mod log_migrations;
pub mod migrations;
pub mod ports;
pub mod services;

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use adapters::{DirectorySource, SqliteRepository};
use config::Config;
use migrations::LedgerMigrations;
use ports::{MigrationObserver, MigrationSource};
use services::{EntryPoint, EventLog, LintIssue, MigrationResult};

// Re-export commonly used types at crate root
pub use domain::{
    AppliedMigration, MigrationError, MigrationFailure, MigrationState, MigrationStatus,
    MigrationUnit,
};
pub use domain::result::{Error, OperationResult, Result};

/// Outcome of `check`: drift and unknown records from status, plus lint findings
#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub drifted: Vec<MigrationStatus>,
    pub unknown: Vec<MigrationStatus>,
    pub lint: Vec<LintIssue>,
}

impl CheckReport {
    /// Lint findings are advisory and do not make a report dirty
    pub fn is_clean(&self) -> bool {
        self.drifted.is_empty() && self.unknown.is_empty()
    }
}

/// Main context for ledger migrations
///
/// Holds the configuration, the ledger database, the migration source and
/// the event log.
pub struct LedgerContext {
    pub config: Config,
    pub ledger_dir: PathBuf,
    pub repository: SqliteRepository,
    pub event_log: Option<EventLog>,
    source: Box<dyn MigrationSource>,
}

impl LedgerContext {
    /// Open the ledger in `ledger_dir`, creating the directory if needed
    ///
    /// The event log is best-effort: if it cannot be opened the context works
    /// without one.
    pub fn open(ledger_dir: &Path, entry_point: EntryPoint) -> Result<Self> {
        std::fs::create_dir_all(ledger_dir)?;
        let config = Config::load(ledger_dir)?;

        let db_path = config.database_path(ledger_dir);
        debug!(path = %db_path.display(), "opening ledger database");
        let repository = SqliteRepository::open(&db_path, config.busy_timeout)?;

        let event_log = match EventLog::open(ledger_dir, entry_point, env!("CARGO_PKG_VERSION")) {
            Ok(log) => Some(log),
            Err(e) => {
                warn!(error = %e, "event log unavailable");
                None
            }
        };

        let source: Box<dyn MigrationSource> = match config.migrations_path(ledger_dir) {
            Some(dir) => Box::new(DirectorySource::new(dir)),
            None => Box::new(LedgerMigrations),
        };

        Ok(Self {
            config,
            ledger_dir: ledger_dir.to_path_buf(),
            repository,
            event_log,
            source,
        })
    }

    /// Replace the migration source
    pub fn with_source(mut self, source: impl MigrationSource + 'static) -> Self {
        self.source = Box::new(source);
        self
    }

    fn observer(&self) -> Option<&dyn MigrationObserver> {
        self.event_log.as_ref().map(|log| log as &dyn MigrationObserver)
    }

    fn run<T>(
        &self,
        f: impl FnOnce(&services::MigrationService<'_>) -> Result<T>,
    ) -> Result<T> {
        let units = self.source.load()?;
        self.repository
            .with_migrations(units, self.config.runner_options(), self.observer(), f)
    }

    /// Pending units in the order they would be applied
    pub fn plan(&self) -> Result<Vec<MigrationUnit>> {
        self.run(|runner| Ok(runner.plan()?.into_iter().cloned().collect()))
    }

    /// Pending units up to and including `target`; the target must be known
    pub fn plan_to(&self, target: &str) -> Result<Vec<MigrationUnit>> {
        self.run(|runner| Ok(runner.plan_to(target)?.into_iter().cloned().collect()))
    }

    /// Apply every pending unit
    pub fn migrate(&self) -> Result<MigrationResult> {
        let _lock = self.repository.lock_migrations()?;
        self.run(|runner| runner.apply_all())
    }

    /// Apply pending units up to and including `target`
    pub fn migrate_to(&self, target: &str) -> Result<MigrationResult> {
        let _lock = self.repository.lock_migrations()?;
        self.run(|runner| runner.apply_to(target))
    }

    /// Revert the newest applied unit
    pub fn revert_last(&self) -> Result<Option<String>> {
        let _lock = self.repository.lock_migrations()?;
        self.run(|runner| runner.revert_last())
    }

    pub fn status(&self) -> Result<Vec<MigrationStatus>> {
        self.run(|runner| runner.status())
    }

    /// Checksum drift, unknown records and lint findings, without changing anything
    pub fn check(&self) -> Result<CheckReport> {
        self.run(|runner| {
            let (drifted, rest): (Vec<_>, Vec<_>) = runner
                .status()?
                .into_iter()
                .filter(|s| !matches!(s.state, MigrationState::Applied { .. } | MigrationState::Pending))
                .partition(|s| matches!(s.state, MigrationState::Drifted { .. }));
            Ok(CheckReport {
                drifted,
                unknown: rest,
                lint: runner.lint(),
            })
        })
    }

    /// Log a command execution; failures only warn
    pub fn log_command(&self, command: &str) {
        if let Some(log) = &self.event_log {
            if let Err(e) = log.log_command(command) {
                warn!(error = %e, "failed to log command");
            }
        }
    }
}
