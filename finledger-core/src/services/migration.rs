//! Migration service - applies versioned schema changes
//!
//! Units are applied one at a time in ascending version order. Each unit's steps
//! and its `__schema_migrations` record commit in the same transaction, so a
//! unit is either fully applied and recorded or not at all. A failing unit halts
//! the batch.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use tracing::{debug, info, warn};

use crate::domain::{
    AppliedMigration, Error, MigrationError, MigrationFailure, MigrationState, MigrationStatus,
    MigrationUnit, Result, Step, Version,
};
use crate::ports::MigrationObserver;
use crate::services::executor::{execute_step, run_in_transaction};

/// Table holding one row per applied unit
pub const MIGRATIONS_TABLE: &str = "__schema_migrations";

/// Runner behavior switches
#[derive(Debug, Clone, Copy)]
pub struct RunnerOptions {
    /// Fail when an applied unit's content no longer matches its stored checksum
    pub verify_checksums: bool,
    /// Apply pending units older than the newest applied one instead of failing
    pub allow_out_of_order: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            verify_checksums: true,
            allow_out_of_order: false,
        }
    }
}

/// Result of running migrations
#[derive(Debug, Serialize)]
pub struct MigrationResult {
    /// Records of newly applied units
    pub applied: Vec<AppliedMigration>,
    /// Count of known units that were already applied
    pub already_applied: usize,
}

/// An SQL step the parser could not make sense of
#[derive(Debug, Clone, Serialize)]
pub struct LintIssue {
    pub version: String,
    pub direction: &'static str,
    pub step: usize,
    pub message: String,
}

/// Service for managing database migrations
pub struct MigrationService<'a> {
    conn: &'a Connection,
    units: Vec<MigrationUnit>,
    options: RunnerOptions,
    observer: Option<&'a dyn MigrationObserver>,
}

impl<'a> MigrationService<'a> {
    /// Create a migration service over the given units, in any order
    pub fn new(conn: &'a Connection, mut units: Vec<MigrationUnit>) -> Result<Self> {
        units.sort_by(|a, b| a.version().cmp(b.version()));

        let mut seen = HashSet::new();
        for unit in &units {
            if !seen.insert(unit.version().as_str()) {
                return Err(Error::validation(format!(
                    "duplicate migration version {}",
                    unit.version()
                )));
            }
        }

        Ok(Self {
            conn,
            units,
            options: RunnerOptions::default(),
            observer: None,
        })
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_observer(mut self, observer: &'a dyn MigrationObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Known units in version order
    pub fn units(&self) -> &[MigrationUnit] {
        &self.units
    }

    pub fn find(&self, version: &str) -> Option<&MigrationUnit> {
        self.units.iter().find(|u| u.version().as_str() == version)
    }

    /// Units not yet applied, in ascending version order
    ///
    /// Read-only: a fresh database reports every unit as pending.
    pub fn plan(&self) -> Result<Vec<&MigrationUnit>> {
        let applied: HashMap<String, AppliedMigration> = self
            .get_applied()?
            .into_iter()
            .map(|r| (r.version.clone(), r))
            .collect();

        if self.options.verify_checksums {
            for unit in &self.units {
                if let Some(record) = applied.get(unit.version().as_str()) {
                    let current = unit.checksum();
                    if record.checksum != current {
                        return Err(MigrationError::new(
                            unit.version().as_str(),
                            MigrationFailure::OutOfOrderApplication {
                                stored: record.checksum.clone(),
                                current,
                            },
                        )
                        .into());
                    }
                }
            }
        }

        let pending: Vec<&MigrationUnit> = self
            .units
            .iter()
            .filter(|u| !applied.contains_key(u.version().as_str()))
            .collect();

        if !self.options.allow_out_of_order {
            if let Some(newest) = applied.keys().max() {
                if let Some(stale) = pending.iter().find(|u| u.version().as_str() < newest.as_str()) {
                    return Err(MigrationError::new(
                        stale.version().as_str(),
                        MigrationFailure::StaleVersion {
                            newest_applied: newest.clone(),
                        },
                    )
                    .into());
                }
            }
        }

        Ok(pending)
    }

    /// Apply one unit: its forward steps and its record, atomically
    ///
    /// Returns `None` when the version turned out to be recorded already once the
    /// exclusive transaction was open.
    pub fn apply(&self, unit: &MigrationUnit) -> Result<Option<AppliedMigration>> {
        let version = unit.version().to_string();
        debug!(version = %version, name = unit.name(), "applying migration");

        let outcome = run_in_transaction(self.conn, unit.forward_integrity(), |tx| {
            ensure_migrations_table(tx)?;
            if is_recorded(tx, &version)? {
                return Ok(None);
            }

            for (index, step) in unit.up().iter().enumerate() {
                execute_step(tx, index + 1, step)?;
            }

            let record = AppliedMigration {
                version: version.clone(),
                applied_at: Utc::now(),
                checksum: unit.checksum(),
            };
            insert_record(tx, &record)?;
            Ok(Some(record))
        });

        match outcome {
            Ok(Some(record)) => {
                info!(version = %version, name = unit.name(), "migration applied");
                if let Some(observer) = self.observer {
                    observer.on_applied(unit, &record);
                }
                Ok(Some(record))
            }
            Ok(None) => {
                warn!(version = %version, "migration already applied by another runner");
                Ok(None)
            }
            Err(cause) => Err(self.failed(&version, cause)),
        }
    }

    /// Apply every pending unit, stopping at the first failure
    pub fn apply_all(&self) -> Result<MigrationResult> {
        self.apply_pending(None)
    }

    /// Apply pending units up to and including `target`
    pub fn apply_to(&self, target: &str) -> Result<MigrationResult> {
        let target = self.target(target)?;
        self.apply_pending(Some(&target))
    }

    /// Pending units up to and including `target`, in the order they would be applied
    pub fn plan_to(&self, target: &str) -> Result<Vec<&MigrationUnit>> {
        let target = self.target(target)?;
        Ok(self
            .plan()?
            .into_iter()
            .take_while(|u| u.version() <= &target)
            .collect())
    }

    /// A target version must be well formed and known
    fn target(&self, target: &str) -> Result<Version> {
        let target = Version::parse(target)?;
        if self.find(target.as_str()).is_none() {
            return Err(Error::not_found(format!("migration {}", target)));
        }
        Ok(target)
    }

    fn apply_pending(&self, target: Option<&Version>) -> Result<MigrationResult> {
        let pending = self.plan()?;
        let already_applied = self.units.len() - pending.len();

        let mut applied = Vec::new();
        for unit in pending {
            if target.is_some_and(|t| unit.version() > t) {
                break;
            }
            if let Some(record) = self.apply(unit)? {
                applied.push(record);
            }
        }

        Ok(MigrationResult {
            applied,
            already_applied,
        })
    }

    /// Run a unit's reverse steps and delete its record, atomically
    ///
    /// Only the newest applied unit can be reverted, and only while its checksum
    /// still matches the stored one (unless checksum verification is off).
    pub fn revert(&self, unit: &MigrationUnit) -> Result<()> {
        let version = unit.version().to_string();

        let Some(steps) = unit.down() else {
            return Err(self.failed(&version, MigrationFailure::NoReverseDefined));
        };

        let applied = self.get_applied()?;
        let Some(record) = applied.iter().find(|r| r.version == version) else {
            return Err(self.failed(&version, MigrationFailure::NotApplied));
        };
        if self.options.verify_checksums {
            let current = unit.checksum();
            if record.checksum != current {
                return Err(self.failed(
                    &version,
                    MigrationFailure::OutOfOrderApplication {
                        stored: record.checksum.clone(),
                        current,
                    },
                ));
            }
        }
        if let Some(newest) = applied.iter().map(|r| &r.version).max() {
            if *newest != version {
                return Err(self.failed(
                    &version,
                    MigrationFailure::RevertNotLatest {
                        newest_applied: newest.clone(),
                    },
                ));
            }
        }

        debug!(version = %version, name = unit.name(), "reverting migration");
        run_in_transaction(self.conn, unit.reverse_integrity(), |tx| {
            for (index, step) in steps.iter().enumerate() {
                execute_step(tx, index + 1, step)?;
            }
            tx.execute(
                &format!("DELETE FROM {} WHERE version = ?1", MIGRATIONS_TABLE),
                [&version],
            )?;
            Ok(())
        })
        .map_err(|cause| self.failed(&version, cause))?;

        info!(version = %version, name = unit.name(), "migration reverted");
        if let Some(observer) = self.observer {
            observer.on_reverted(unit);
        }
        Ok(())
    }

    /// Revert the newest applied unit, returning its version
    pub fn revert_last(&self) -> Result<Option<String>> {
        let applied = self.get_applied()?;
        let Some(newest) = applied.iter().map(|r| r.version.as_str()).max() else {
            return Ok(None);
        };

        let unit = self.find(newest).ok_or_else(|| {
            Error::not_found(format!(
                "migration {} is applied but not known to this build",
                newest
            ))
        })?;
        self.revert(unit)?;
        Ok(Some(newest.to_string()))
    }

    fn failed(&self, version: &str, cause: MigrationFailure) -> Error {
        let error = MigrationError::new(version, cause);
        warn!(version = %version, error = %error.cause, "migration failed");
        if let Some(observer) = self.observer {
            observer.on_failed(&error);
        }
        error.into()
    }

    /// Every known or recorded version with its state
    pub fn status(&self) -> Result<Vec<MigrationStatus>> {
        let mut applied: HashMap<String, AppliedMigration> = self
            .get_applied()?
            .into_iter()
            .map(|r| (r.version.clone(), r))
            .collect();

        let mut statuses: Vec<MigrationStatus> = self
            .units
            .iter()
            .map(|unit| {
                let state = match applied.remove(unit.version().as_str()) {
                    None => MigrationState::Pending,
                    Some(record) => {
                        let current = unit.checksum();
                        if record.checksum == current {
                            MigrationState::Applied {
                                applied_at: record.applied_at,
                            }
                        } else {
                            MigrationState::Drifted {
                                applied_at: record.applied_at,
                                stored: record.checksum,
                                current,
                            }
                        }
                    }
                };
                MigrationStatus {
                    version: unit.version().to_string(),
                    name: Some(unit.name().to_string()),
                    reversible: unit.is_reversible(),
                    state,
                }
            })
            .collect();

        statuses.extend(applied.into_values().map(|record| MigrationStatus {
            version: record.version,
            name: None,
            reversible: false,
            state: MigrationState::Unknown {
                applied_at: record.applied_at,
            },
        }));
        statuses.sort_by(|a, b| a.version.cmp(&b.version));

        Ok(statuses)
    }

    /// Get applied records in version order
    pub fn get_applied(&self) -> Result<Vec<AppliedMigration>> {
        if !migrations_table_exists(self.conn)? {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT version, applied_at, checksum FROM {} ORDER BY version",
            MIGRATIONS_TABLE
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (version, applied_at, checksum) = row?;
            let applied_at = DateTime::parse_from_rfc3339(&applied_at)
                .map_err(|e| {
                    Error::database(format!("bad applied_at for migration {}: {}", version, e))
                })?
                .with_timezone(&Utc);
            result.push(AppliedMigration {
                version,
                applied_at,
                checksum,
            });
        }
        Ok(result)
    }

    /// Parse every SQL step with the SQLite dialect; advisory only
    pub fn lint(&self) -> Vec<LintIssue> {
        let dialect = SQLiteDialect {};
        let mut issues = Vec::new();

        for unit in &self.units {
            let directions = [("up", Some(unit.up())), ("down", unit.down())];
            for (direction, steps) in directions {
                for (index, step) in steps.unwrap_or_default().iter().enumerate() {
                    if let Step::Sql(sql) = step {
                        if let Err(e) = Parser::parse_sql(&dialect, sql) {
                            let msg = e.to_string();
                            issues.push(LintIssue {
                                version: unit.version().to_string(),
                                direction,
                                step: index + 1,
                                message: msg.trim_start_matches("sql parser error: ").to_string(),
                            });
                        }
                    }
                }
            }
        }

        issues
    }
}

/// Check if the migrations table exists
fn migrations_table_exists(conn: &Connection) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [MIGRATIONS_TABLE],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn ensure_migrations_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            version TEXT PRIMARY KEY NOT NULL,
            applied_at TIMESTAMP NOT NULL,
            checksum TEXT NOT NULL
        )",
        MIGRATIONS_TABLE
    ))
}

fn is_recorded(conn: &Connection, version: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        &format!("SELECT 1 FROM {} WHERE version = ?1", MIGRATIONS_TABLE),
        [version],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

/// Record a migration as applied
fn insert_record(conn: &Connection, record: &AppliedMigration) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {} (version, applied_at, checksum) VALUES (?1, ?2, ?3)",
            MIGRATIONS_TABLE
        ),
        params![
            record.version,
            record.applied_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            record.checksum,
        ],
    )?;
    Ok(())
}
