//! Adapter implementations
//!
//! Adapters implement the port traits with concrete technologies:
//! - SQLite for the ledger and log databases
//! - The local filesystem for the MigrationSource port

pub mod directory;
pub mod sqlite;

pub use directory::DirectorySource;
pub use sqlite::{MigrationLock, SqliteRepository, DEFAULT_BUSY_TIMEOUT};
