//! Configuration management
//!
//! Read from `settings.json` in the ledger directory; every field is optional:
//! ```json
//! {
//!   "database": "ledger.sqlite",
//!   "migrations": {
//!     "verifyChecksums": true,
//!     "allowOutOfOrder": false,
//!     "busyTimeoutMs": 5000,
//!     "directory": null
//!   }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::domain::Result;
use crate::services::RunnerOptions;

pub const SETTINGS_FILE: &str = "settings.json";
pub const DEFAULT_DATABASE: &str = "ledger.sqlite";

/// Raw settings.json structure; unknown keys are ignored
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    #[serde(default)]
    database: Option<String>,
    #[serde(default)]
    migrations: MigrationSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MigrationSettings {
    #[serde(default)]
    verify_checksums: Option<bool>,
    #[serde(default)]
    allow_out_of_order: Option<bool>,
    #[serde(default)]
    busy_timeout_ms: Option<u64>,
    #[serde(default)]
    directory: Option<PathBuf>,
}

/// Ledger configuration (resolved view of settings and environment)
#[derive(Debug, Clone)]
pub struct Config {
    /// Database file, relative to the ledger directory unless absolute
    pub database: PathBuf,
    pub verify_checksums: bool,
    pub allow_out_of_order: bool,
    pub busy_timeout: Duration,
    /// Load units from this directory instead of the embedded history
    pub migrations_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let options = RunnerOptions::default();
        Self {
            database: PathBuf::from(DEFAULT_DATABASE),
            verify_checksums: options.verify_checksums,
            allow_out_of_order: options.allow_out_of_order,
            busy_timeout: Duration::from_millis(5000),
            migrations_dir: None,
        }
    }
}

/// Parse a boolean environment override
fn env_flag(name: &str) -> Option<bool> {
    match std::env::var(name).ok().as_deref() {
        Some("true" | "1" | "yes" | "TRUE" | "YES") => Some(true),
        Some("false" | "0" | "no" | "FALSE" | "NO") => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load config from the ledger directory
    ///
    /// An unreadable or malformed settings file falls back to defaults.
    /// `FINLEDGER_VERIFY_CHECKSUMS` and `FINLEDGER_ALLOW_OUT_OF_ORDER` override
    /// the file.
    pub fn load(ledger_dir: &Path) -> Result<Self> {
        let settings_path = ledger_dir.join(SETTINGS_FILE);

        let raw: SettingsFile = if settings_path.exists() {
            let content = std::fs::read_to_string(&settings_path)?;
            serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %settings_path.display(), error = %e, "ignoring malformed settings");
                SettingsFile::default()
            })
        } else {
            SettingsFile::default()
        };

        let defaults = Self::default();
        let migrations = raw.migrations;

        Ok(Self {
            database: raw.database.map(PathBuf::from).unwrap_or(defaults.database),
            verify_checksums: env_flag("FINLEDGER_VERIFY_CHECKSUMS")
                .or(migrations.verify_checksums)
                .unwrap_or(defaults.verify_checksums),
            allow_out_of_order: env_flag("FINLEDGER_ALLOW_OUT_OF_ORDER")
                .or(migrations.allow_out_of_order)
                .unwrap_or(defaults.allow_out_of_order),
            busy_timeout: migrations
                .busy_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.busy_timeout),
            migrations_dir: migrations.directory,
        })
    }

    /// Absolute path of the database file
    pub fn database_path(&self, ledger_dir: &Path) -> PathBuf {
        ledger_dir.join(&self.database)
    }

    /// Migrations directory, resolved against the ledger directory
    pub fn migrations_path(&self, ledger_dir: &Path) -> Option<PathBuf> {
        self.migrations_dir.as_ref().map(|dir| ledger_dir.join(dir))
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            verify_checksums: self.verify_checksums,
            allow_out_of_order: self.allow_out_of_order,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_settings_use_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();

        assert_eq!(config.database_path(dir.path()), dir.path().join("ledger.sqlite"));
        assert_eq!(config.busy_timeout, Duration::from_millis(5000));
        assert!(config.migrations_path(dir.path()).is_none());
    }

    #[test]
    fn test_settings_file_is_read() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            r#"{
                "database": "books.sqlite",
                "migrations": { "busyTimeoutMs": 250, "directory": "schema" },
                "theme": "dark"
            }"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.database, PathBuf::from("books.sqlite"));
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
        assert_eq!(
            config.migrations_path(dir.path()),
            Some(dir.path().join("schema"))
        );
    }

    #[test]
    fn test_malformed_settings_fall_back() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), "{ not json").unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.database, PathBuf::from(DEFAULT_DATABASE));
    }
}
