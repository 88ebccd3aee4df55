//! Migration units read from a directory tree
//!
//! ```text
//! migrations/
//!   2024-07-01-090000_create_accounts/
//!     up.sql
//!     down.sql      (optional)
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::debug;

use crate::domain::{Error, MigrationUnit, Result};
use crate::ports::MigrationSource;

const UNIT_DIR_PATTERN: &str = r"^(\d{4}-\d{2}-\d{2}-\d{6})_([A-Za-z0-9_]+)$";

/// Loads plain SQL units from `<version>_<name>` sub-directories
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn load_unit(dir: &Path, version: &str, name: &str) -> Result<MigrationUnit> {
        let up_path = dir.join("up.sql");
        if !up_path.is_file() {
            return Err(Error::validation(format!(
                "migration {} has no up.sql",
                dir.display()
            )));
        }

        let mut unit = MigrationUnit::new(version, name)?.sql(fs::read_to_string(&up_path)?);

        let down_path = dir.join("down.sql");
        if down_path.is_file() {
            unit = unit.reverse_sql(fs::read_to_string(&down_path)?);
        }
        Ok(unit)
    }
}

impl MigrationSource for DirectorySource {
    fn load(&self) -> Result<Vec<MigrationUnit>> {
        if !self.root.is_dir() {
            return Err(Error::not_found(format!(
                "migrations directory {}",
                self.root.display()
            )));
        }

        let pattern = Regex::new(UNIT_DIR_PATTERN)
            .map_err(|e| Error::validation(format!("bad unit pattern: {}", e)))?;

        let mut units = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let Some(dir_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(captures) = pattern.captures(dir_name) else {
                debug!(entry = dir_name, "skipping non-migration directory");
                continue;
            };
            units.push(Self::load_unit(&path, &captures[1], &captures[2])?);
        }

        units.sort_by(|a, b| a.version().cmp(b.version()));
        Ok(units)
    }
}
