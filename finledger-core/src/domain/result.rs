//! Result and error types for the core library

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core library error type
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Locked: {0}")]
    Locked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// The migration failure carried by this error, if any
    pub fn migration_failure(&self) -> Option<&MigrationFailure> {
        match self {
            Self::Migration(e) => Some(&e.cause),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Core library result type
pub type Result<T> = std::result::Result<T, Error>;

/// A migration unit failed; names the version and the underlying cause
#[derive(Error, Debug)]
#[error("Migration {version} failed: {cause}")]
pub struct MigrationError {
    pub version: String,
    #[source]
    pub cause: MigrationFailure,
}

impl MigrationError {
    pub fn new(version: impl Into<String>, cause: MigrationFailure) -> Self {
        Self {
            version: version.into(),
            cause,
        }
    }
}

/// Why a migration unit could not be applied or reverted
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MigrationFailure {
    #[error("step {step} was rejected: {message}")]
    StepExecution { step: usize, message: String },

    #[error("cannot convert {table}.{column} at row {row} (value {value}): {reason}")]
    Conversion {
        table: String,
        column: String,
        row: i64,
        value: String,
        reason: String,
    },

    #[error("no reverse steps defined")]
    NoReverseDefined,

    #[error("already applied with different content (stored checksum {stored}, current {current})")]
    OutOfOrderApplication { stored: String, current: String },

    #[error("pending but older than the newest applied version {newest_applied}")]
    StaleVersion { newest_applied: String },

    #[error("{count} foreign key violation(s) in table {table}")]
    ForeignKeyViolation { table: String, count: usize },

    #[error("not applied")]
    NotApplied,

    #[error("cannot revert while newer version {newest_applied} is applied")]
    RevertNotLatest { newest_applied: String },

    #[error("transaction failed: {0}")]
    Transaction(String),
}

impl From<rusqlite::Error> for MigrationFailure {
    fn from(e: rusqlite::Error) -> Self {
        Self::Transaction(e.to_string())
    }
}

/// Operation result envelope for JSON output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub context: Option<HashMap<String, serde_json::Value>>,
}

impl<T> OperationResult<T> {
    /// Create a successful result
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            context: None,
        }
    }

    /// Create a failed result
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            context: None,
        }
    }

    /// Create a failed result with context
    pub fn fail_with_context(
        error: impl Into<String>,
        context: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            context: Some(context),
        }
    }
}

impl<T> From<Result<T>> for OperationResult<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(Error::Migration(e)) => {
                let mut context = HashMap::new();
                context.insert("version".to_string(), serde_json::Value::String(e.version.clone()));
                Self::fail_with_context(e.to_string(), context)
            }
            Err(e) => Self::fail(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_result_ok() {
        let result: OperationResult<i32> = OperationResult::ok(42);
        assert!(result.success);
        assert_eq!(result.data, Some(42));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_from_result() {
        let ok: Result<i32> = Ok(42);
        let result: OperationResult<i32> = ok.into();
        assert!(result.success);

        let err: Result<i32> = Err(Error::validation("bad input"));
        let result: OperationResult<i32> = err.into();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Validation error"));
    }

    #[test]
    fn test_migration_error_names_version() {
        let err: Result<()> = Err(MigrationError::new(
            "2024-09-02-140627",
            MigrationFailure::StepExecution {
                step: 1,
                message: "no such table: accounts".to_string(),
            },
        )
        .into());

        let result: OperationResult<()> = err.into();
        let message = result.error.unwrap();
        assert!(message.contains("2024-09-02-140627"));
        assert!(message.contains("no such table: accounts"));
        assert_eq!(
            result.context.unwrap()["version"],
            serde_json::Value::String("2024-09-02-140627".to_string())
        );
    }
}
