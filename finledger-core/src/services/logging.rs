//! Event log - structured migration events stored in SQLite
//!
//! Keeps a privacy-safe record of what the runner did in `logs.sqlite`.
//! No ledger data (records, accounts, amounts, details) is ever logged; events
//! carry a version, a command name and error text at most.
//!
//! The log database is migrated by the same runner as the ledger.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adapters::sqlite::{SqliteRepository, DEFAULT_BUSY_TIMEOUT};
use crate::domain::{AppliedMigration, MigrationError, MigrationUnit, Result};
use crate::log_migrations::log_migrations;
use crate::ports::MigrationObserver;
use crate::services::RunnerOptions;

/// File name of the log database inside the ledger directory
pub const LOG_DB_FILE: &str = "logs.sqlite";

/// Counter for generating unique IDs within the same millisecond
static ID_COUNTER: AtomicI64 = AtomicI64::new(0);

/// Generate a unique ID based on timestamp + counter
fn generate_id() -> i64 {
    // Lower 16 bits: counter (65536 unique IDs per millisecond)
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xFFFF;
    (now_ms() << 16) | counter
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn detect_platform() -> &'static str {
    if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        "unknown"
    }
}

/// Who is driving the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryPoint {
    Cli,
    Library,
}

impl EntryPoint {
    fn as_str(&self) -> &'static str {
        match self {
            EntryPoint::Cli => "cli",
            EntryPoint::Library => "library",
        }
    }
}

/// A log event to be recorded
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogEvent {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

impl LogEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_error_details(mut self, details: impl Into<String>) -> Self {
        self.error_details = Some(details.into());
        self
    }
}

/// A log entry as stored in the database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    /// Unix milliseconds
    pub timestamp: i64,
    pub entry_point: String,
    pub app_version: String,
    pub platform: String,
    pub event: String,
    pub version: Option<String>,
    pub command: Option<String>,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
}

const ENTRY_COLUMNS: &str = "id, timestamp, entry_point, app_version, platform, \
                             event, version, command, error_message, error_details";

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
    Ok(LogEntry {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        entry_point: row.get(2)?,
        app_version: row.get(3)?,
        platform: row.get(4)?,
        event: row.get(5)?,
        version: row.get(6)?,
        command: row.get(7)?,
        error_message: row.get(8)?,
        error_details: row.get(9)?,
    })
}

/// Structured event log over `logs.sqlite`
pub struct EventLog {
    repository: SqliteRepository,
    db_path: PathBuf,
    entry_point: EntryPoint,
    app_version: String,
    platform: &'static str,
}

impl EventLog {
    /// Open or create `logs.sqlite` in the ledger directory and migrate it
    pub fn open(
        ledger_dir: &Path,
        entry_point: EntryPoint,
        app_version: impl Into<String>,
    ) -> Result<Self> {
        let db_path = ledger_dir.join(LOG_DB_FILE);
        let repository = SqliteRepository::open(&db_path, DEFAULT_BUSY_TIMEOUT)?;

        repository.with_migrations(log_migrations()?, RunnerOptions::default(), None, |runner| {
            runner.apply_all()
        })?;

        Ok(Self {
            repository,
            db_path,
            entry_point,
            app_version: app_version.into(),
            platform: detect_platform(),
        })
    }

    /// Record an event; entry point, app version and platform are added here
    pub fn log(&self, event: LogEvent) -> Result<()> {
        self.repository.with_connection(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO sys_logs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    ENTRY_COLUMNS
                ),
                params![
                    generate_id(),
                    now_ms(),
                    self.entry_point.as_str(),
                    &self.app_version,
                    self.platform,
                    &event.event,
                    &event.version,
                    &event.command,
                    &event.error_message,
                    &event.error_details,
                ],
            )?;
            Ok(())
        })
    }

    /// Log a CLI command execution
    pub fn log_command(&self, command: &str) -> Result<()> {
        self.log(LogEvent::new("command_executed").with_command(command))
    }

    fn query(&self, filter: &str, limit: usize) -> Result<Vec<LogEntry>> {
        self.repository.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM sys_logs {} ORDER BY timestamp DESC, id DESC LIMIT ?1",
                ENTRY_COLUMNS, filter
            ))?;
            let entries = stmt
                .query_map([limit as i64], row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    /// Most recent entries first
    pub fn get_recent(&self, limit: usize) -> Result<Vec<LogEntry>> {
        self.query("", limit)
    }

    /// Most recent entries carrying an error
    pub fn get_errors(&self, limit: usize) -> Result<Vec<LogEntry>> {
        self.query("WHERE error_message IS NOT NULL", limit)
    }

    pub fn count(&self) -> Result<u64> {
        self.repository.with_connection(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM sys_logs", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    /// Delete logs older than the given unix-millisecond timestamp
    pub fn delete_before(&self, timestamp_ms: i64) -> Result<u64> {
        self.repository.with_connection(|conn| {
            let deleted = conn.execute("DELETE FROM sys_logs WHERE timestamp < ?1", [timestamp_ms])?;
            Ok(deleted as u64)
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn record(&self, event: LogEvent) {
        if let Err(e) = self.log(event) {
            warn!(error = %e, "failed to write event log");
        }
    }
}

impl MigrationObserver for EventLog {
    fn on_applied(&self, _unit: &MigrationUnit, record: &AppliedMigration) {
        self.record(LogEvent::new("migration_applied").with_version(&record.version));
    }

    fn on_reverted(&self, unit: &MigrationUnit) {
        self.record(LogEvent::new("migration_reverted").with_version(unit.version().as_str()));
    }

    fn on_failed(&self, error: &MigrationError) {
        self.record(
            LogEvent::new("migration_failed")
                .with_version(&error.version)
                .with_error(error.cause.to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MigrationFailure;
    use tempfile::tempdir;

    #[test]
    fn test_event_log_creation() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path(), EntryPoint::Cli, "1.0.0").unwrap();

        assert!(log.db_path().exists());
        assert_eq!(log.count().unwrap(), 0);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempdir().unwrap();
        {
            let log = EventLog::open(dir.path(), EntryPoint::Cli, "1.0.0").unwrap();
            log.log_command("migrate up").unwrap();
        }
        let log = EventLog::open(dir.path(), EntryPoint::Cli, "1.0.1").unwrap();
        assert_eq!(log.count().unwrap(), 1);
    }

    #[test]
    fn test_log_command() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path(), EntryPoint::Library, "2.0.0").unwrap();

        log.log_command("migrate status").unwrap();

        let entries = log.get_recent(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "command_executed");
        assert_eq!(entries[0].command, Some("migrate status".to_string()));
        assert_eq!(entries[0].entry_point, "library");
        assert_eq!(entries[0].app_version, "2.0.0");
    }

    #[test]
    fn test_observer_records_failures() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path(), EntryPoint::Cli, "1.0.0").unwrap();

        log.on_failed(&MigrationError::new(
            "2024-10-03-201145",
            MigrationFailure::NoReverseDefined,
        ));

        let errors = log.get_errors(10).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].event, "migration_failed");
        assert_eq!(errors[0].version, Some("2024-10-03-201145".to_string()));
        assert_eq!(errors[0].error_message, Some("no reverse steps defined".to_string()));
    }

    #[test]
    fn test_count_and_delete() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path(), EntryPoint::Cli, "1.0.0").unwrap();

        log.log(LogEvent::new("event1")).unwrap();
        log.log(LogEvent::new("event2").with_error_details("details")).unwrap();
        log.log(LogEvent::new("event3")).unwrap();
        assert_eq!(log.count().unwrap(), 3);

        let deleted = log.delete_before(now_ms() + 1000).unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(log.count().unwrap(), 0);
    }
}
