//! SQLite repository implementation

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::domain::{Error, MigrationUnit, Result};
use crate::ports::MigrationObserver;
use crate::services::{MigrationService, RunnerOptions};

/// Maximum number of attempts when the database file is locked
const MAX_RETRIES: u32 = 5;

/// Initial retry delay in milliseconds (doubles each retry: 50, 100, 200, 400ms)
const INITIAL_RETRY_DELAY_MS: u64 = 50;

/// Default time a statement waits on another connection's lock
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Check if an error message indicates a locking issue that should be retried
fn is_retryable_error(err_msg: &str) -> bool {
    let lower = err_msg.to_lowercase();
    lower.contains("database is locked")
        || lower.contains("database table is locked")
        || lower.contains("resource temporarily unavailable")
        // Windows
        || lower.contains("being used by another process")
}

/// Exclusive advisory lock held for the length of a migration run
///
/// The lock lives in `<database>.migrate.lock` next to the database file and is
/// released when the guard drops.
#[derive(Debug)]
pub struct MigrationLock {
    file: File,
    path: PathBuf,
}

impl MigrationLock {
    /// Take the lock or fail immediately with [`Error::Locked`]
    pub fn acquire(db_path: &Path) -> Result<Self> {
        let path = lock_path(db_path);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(Error::Locked(format!(
                    "another migration run holds {}",
                    path.display()
                )));
            }
            return Err(e.into());
        }

        debug!(path = %path.display(), "acquired migration lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MigrationLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release migration lock");
        }
    }
}

fn lock_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".migrate.lock");
    PathBuf::from(name)
}

/// SQLite repository implementation
pub struct SqliteRepository {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteRepository {
    /// Open (or create) the database at `db_path`
    ///
    /// Includes retry logic with exponential backoff for locking errors, which
    /// can occur when another process is opening or writing the same file.
    /// Foreign keys are switched on for the connection.
    pub fn open(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        let mut attempt = 0;
        loop {
            match Self::try_open_connection(db_path, busy_timeout) {
                Ok(conn) => {
                    return Ok(Self {
                        conn: Mutex::new(conn),
                        db_path: Some(db_path.to_path_buf()),
                    });
                }
                Err(e) => {
                    let err_msg = e.to_string();
                    attempt += 1;
                    if !is_retryable_error(&err_msg) || attempt >= MAX_RETRIES {
                        return Err(e.into());
                    }
                    // Exponential backoff: 50ms, 100ms, 200ms, 400ms
                    let delay = Duration::from_millis(INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt - 1));
                    warn!(
                        attempt,
                        max = MAX_RETRIES,
                        delay_ms = delay.as_millis() as u64,
                        error = %err_msg,
                        "database busy, retrying"
                    );
                    thread::sleep(delay);
                }
            }
        }
    }

    /// A private in-memory database, mainly for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: None,
        })
    }

    /// Attempt to open a connection (called by open() with retry logic)
    fn try_open_connection(db_path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        Ok(conn)
    }

    /// Path of the database file; `None` when in memory
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::database(format!("Lock poisoned: {}", e)))
    }

    /// Take the run lock for a file-backed database; in-memory databases need none
    pub fn lock_migrations(&self) -> Result<Option<MigrationLock>> {
        self.db_path.as_deref().map(MigrationLock::acquire).transpose()
    }

    /// Run `f` against a migration service over this database
    pub fn with_migrations<T>(
        &self,
        units: Vec<MigrationUnit>,
        options: RunnerOptions,
        observer: Option<&dyn MigrationObserver>,
        f: impl FnOnce(&MigrationService<'_>) -> Result<T>,
    ) -> Result<T> {
        let conn = self.connection()?;
        let mut service = MigrationService::new(&conn, units)?.with_options(options);
        if let Some(observer) = observer {
            service = service.with_observer(observer);
        }
        f(&service)
    }

    /// Run `f` with the raw connection
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.connection()?;
        f(&conn)
    }

    /// Names of the user tables, excluding SQLite internals
    pub fn table_names(&self) -> Result<Vec<String>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_enables_foreign_keys() {
        let dir = tempdir().unwrap();
        let repo = SqliteRepository::open(&dir.path().join("ledger.sqlite"), DEFAULT_BUSY_TIMEOUT)
            .unwrap();

        let enabled: i64 = repo
            .with_connection(|conn| Ok(conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(enabled, 1);
        assert!(repo.table_names().unwrap().is_empty());
    }

    #[test]
    fn test_lock_path_sits_next_to_database() {
        assert_eq!(
            lock_path(Path::new("/tmp/ledger.sqlite")),
            PathBuf::from("/tmp/ledger.sqlite.migrate.lock")
        );
    }

    #[test]
    fn test_second_lock_fails_fast() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("ledger.sqlite");

        let held = MigrationLock::acquire(&db_path).unwrap();
        assert!(held.path().exists());
        assert!(matches!(MigrationLock::acquire(&db_path), Err(Error::Locked(_))));

        drop(held);
        assert!(MigrationLock::acquire(&db_path).is_ok());
    }

    #[test]
    fn test_in_memory_needs_no_lock() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        assert!(repo.db_path().is_none());
        assert!(repo.lock_migrations().unwrap().is_none());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable_error("database is locked"));
        assert!(is_retryable_error("Resource temporarily unavailable"));
        assert!(!is_retryable_error("no such table: records"));
    }
}
