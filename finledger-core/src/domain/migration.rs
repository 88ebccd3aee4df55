//! Migration units and their steps
//!
//! A unit is identified by a timestamp-derived version (`YYYY-MM-DD-HHMMSS`) and
//! carries ordered forward steps plus optional reverse steps. Units are immutable
//! once authored; their checksum is derived from the canonical rendering of the
//! forward steps.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Value;
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

use super::result::{Error, Result};

/// Quote an SQL identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Monotonic version token of a migration unit
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    at: NaiveDateTime,
    raw: String,
}

impl Version {
    /// Textual layout of a version, e.g. `2024-09-02-140627`
    pub const FORMAT: &'static str = "%Y-%m-%d-%H%M%S";

    pub fn parse(s: &str) -> Result<Self> {
        let at = NaiveDateTime::parse_from_str(s, Self::FORMAT)
            .map_err(|e| Error::validation(format!("invalid migration version '{}': {}", s, e)))?;

        // Reject non-canonical spellings so that text order equals time order
        if at.format(Self::FORMAT).to_string() != s {
            return Err(Error::validation(format!(
                "invalid migration version '{}': expected YYYY-MM-DD-HHMMSS",
                s
            )));
        }

        Ok(Self {
            at,
            raw: s.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

/// Whether referential integrity stays enforced while a unit runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityMode {
    Enforced,
    /// `PRAGMA foreign_keys` is switched off for the transaction and restored afterwards
    Suspended,
}

/// Signature of a backfill conversion: old value in, new value out
pub type ConvertFn = fn(&Value) -> std::result::Result<Value, String>;

/// A named, total conversion used to backfill a changed column
#[derive(Clone, Copy)]
pub struct Conversion {
    pub name: &'static str,
    pub convert: ConvertFn,
}

impl fmt::Debug for Conversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Conversion").field(&self.name).finish()
    }
}

/// Shadow-and-swap rebuild of a table
///
/// Creates `<table>__shadow` with the target definition, copies every row through
/// the column projection, drops the original and renames the shadow in its place.
#[derive(Debug, Clone)]
pub struct RebuildTable {
    pub table: String,
    /// Column and constraint definitions of the target table (without parentheses)
    pub definition: String,
    /// Target column and the SQL expression that produces it from the original row
    pub projection: Vec<(String, String)>,
    pub group_by: Option<String>,
    /// Statements run after the swap, typically `CREATE INDEX`
    pub after: Vec<String>,
}

impl RebuildTable {
    pub fn new(table: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            definition: definition.into(),
            projection: Vec::new(),
            group_by: None,
            after: Vec::new(),
        }
    }

    /// Copy a column unchanged
    pub fn copy(self, column: &str) -> Self {
        let expression = quote_ident(column);
        self.project(column, expression)
    }

    /// Copy several columns unchanged
    pub fn copy_all(self, columns: &[&str]) -> Self {
        columns.iter().fold(self, |rebuild, column| rebuild.copy(column))
    }

    /// Produce `column` from an SQL expression over the original row
    pub fn project(mut self, column: impl Into<String>, expression: impl Into<String>) -> Self {
        self.projection.push((column.into(), expression.into()));
        self
    }

    pub fn group_by(mut self, clause: impl Into<String>) -> Self {
        self.group_by = Some(clause.into());
        self
    }

    pub fn then(mut self, sql: impl Into<String>) -> Self {
        self.after.push(sql.into());
        self
    }

    pub fn shadow_name(&self) -> String {
        format!("{}__shadow", self.table)
    }

    /// The statements of the rebuild, in execution order
    pub fn statements(&self) -> Vec<String> {
        let table = quote_ident(&self.table);
        let shadow = quote_ident(&self.shadow_name());

        let targets: Vec<String> = self.projection.iter().map(|(c, _)| quote_ident(c)).collect();
        let sources: Vec<&str> = self.projection.iter().map(|(_, e)| e.as_str()).collect();

        let mut copy = format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            shadow,
            targets.join(", "),
            sources.join(", "),
            table
        );
        if let Some(group_by) = &self.group_by {
            copy.push_str(" GROUP BY ");
            copy.push_str(group_by);
        }

        let mut statements = vec![
            format!("CREATE TABLE {} ({})", shadow, self.definition.trim()),
            copy,
            format!("DROP TABLE {}", table),
            format!("ALTER TABLE {} RENAME TO {}", shadow, table),
        ];
        statements.extend(self.after.iter().cloned());
        statements
    }
}

/// Column-type change with backfill (rename, add, populate, drop)
#[derive(Debug, Clone)]
pub struct ChangeColumn {
    pub table: String,
    pub column: String,
    pub column_type: String,
    /// SQL literal used as `NOT NULL DEFAULT <literal>`; the new column is nullable without it
    pub not_null_default: Option<String>,
    pub conversion: Conversion,
}

impl ChangeColumn {
    pub fn new(
        table: impl Into<String>,
        column: impl Into<String>,
        column_type: impl Into<String>,
        conversion: Conversion,
    ) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            column_type: column_type.into(),
            not_null_default: None,
            conversion,
        }
    }

    pub fn not_null_default(mut self, literal: impl Into<String>) -> Self {
        self.not_null_default = Some(literal.into());
        self
    }

    pub fn temporary_name(&self) -> String {
        format!("{}__old", self.column)
    }

    pub fn column_definition(&self) -> String {
        match &self.not_null_default {
            Some(literal) => format!(
                "{} {} NOT NULL DEFAULT {}",
                quote_ident(&self.column),
                self.column_type,
                literal
            ),
            None => format!("{} {}", quote_ident(&self.column), self.column_type),
        }
    }
}

/// One forward or reverse step of a unit
#[derive(Debug, Clone)]
pub enum Step {
    /// One or more statements executed as a batch
    Sql(String),
    RebuildTable(RebuildTable),
    ChangeColumn(ChangeColumn),
}

impl Step {
    /// Canonical rendering used for checksums
    pub fn fingerprint(&self) -> String {
        match self {
            Step::Sql(sql) => sql.trim().to_string(),
            Step::RebuildTable(rebuild) => rebuild.statements().join(";\n"),
            Step::ChangeColumn(change) => format!(
                "CHANGE COLUMN {}.{} USING {}",
                quote_ident(&change.table),
                change.column_definition(),
                change.conversion.name
            ),
        }
    }

    fn suspends_integrity(&self) -> bool {
        matches!(self, Step::RebuildTable(_))
    }
}

impl From<RebuildTable> for Step {
    fn from(rebuild: RebuildTable) -> Self {
        Step::RebuildTable(rebuild)
    }
}

impl From<ChangeColumn> for Step {
    fn from(change: ChangeColumn) -> Self {
        Step::ChangeColumn(change)
    }
}

/// A versioned schema-change unit
#[derive(Debug, Clone)]
pub struct MigrationUnit {
    version: Version,
    name: String,
    up: Vec<Step>,
    down: Option<Vec<Step>>,
    suspend_integrity: bool,
}

impl MigrationUnit {
    pub fn new(version: &str, name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            version: Version::parse(version)?,
            name: name.into(),
            up: Vec::new(),
            down: None,
            suspend_integrity: false,
        })
    }

    /// Append a forward SQL step
    pub fn sql(self, sql: impl Into<String>) -> Self {
        self.step(Step::Sql(sql.into()))
    }

    /// Append a forward step
    pub fn step(mut self, step: impl Into<Step>) -> Self {
        self.up.push(step.into());
        self
    }

    /// Append a reverse SQL step
    pub fn reverse_sql(self, sql: impl Into<String>) -> Self {
        self.reverse_step(Step::Sql(sql.into()))
    }

    /// Append a reverse step
    pub fn reverse_step(mut self, step: impl Into<Step>) -> Self {
        self.down.get_or_insert_with(Vec::new).push(step.into());
        self
    }

    /// Run this unit with foreign keys switched off even without a rebuild step
    pub fn suspend_integrity(mut self) -> Self {
        self.suspend_integrity = true;
        self
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn up(&self) -> &[Step] {
        &self.up
    }

    pub fn down(&self) -> Option<&[Step]> {
        self.down.as_deref()
    }

    pub fn is_reversible(&self) -> bool {
        self.down.is_some()
    }

    pub fn forward_integrity(&self) -> IntegrityMode {
        self.integrity_for(&self.up)
    }

    pub fn reverse_integrity(&self) -> IntegrityMode {
        self.integrity_for(self.down().unwrap_or_default())
    }

    fn integrity_for(&self, steps: &[Step]) -> IntegrityMode {
        if self.suspend_integrity || steps.iter().any(Step::suspends_integrity) {
            IntegrityMode::Suspended
        } else {
            IntegrityMode::Enforced
        }
    }

    /// SHA-256 (hex) of the forward steps
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for step in &self.up {
            hasher.update(step.fingerprint().as_bytes());
            hasher.update(b"\n--\n");
        }
        hex::encode(hasher.finalize())
    }
}

/// A persisted `{version, applied_at, checksum}` record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedMigration {
    pub version: String,
    pub applied_at: DateTime<Utc>,
    pub checksum: String,
}

/// State of one version as seen by `status`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MigrationState {
    Applied {
        applied_at: DateTime<Utc>,
    },
    Pending,
    /// Applied, but the unit's content changed since
    Drifted {
        applied_at: DateTime<Utc>,
        stored: String,
        current: String,
    },
    /// Recorded in the database but unknown to the source
    Unknown {
        applied_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub version: String,
    pub name: Option<String>,
    pub reversible: bool,
    #[serde(flatten)]
    pub state: MigrationState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keep(value: &Value) -> std::result::Result<Value, String> {
        Ok(value.clone())
    }

    const KEEP: Conversion = Conversion {
        name: "keep",
        convert: keep,
    };

    #[test]
    fn test_version_parse_and_order() {
        let older = Version::parse("2024-08-28-174512").unwrap();
        let newer = Version::parse("2024-09-02-140627").unwrap();
        assert!(older < newer);
        assert_eq!(newer.to_string(), "2024-09-02-140627");
    }

    #[test]
    fn test_version_rejects_malformed() {
        assert!(Version::parse("2024-09-02").is_err());
        assert!(Version::parse("20240902140627").is_err());
        assert!(Version::parse("2024-13-02-140627").is_err());
        assert!("not-a-version".parse::<Version>().is_err());
    }

    #[test]
    fn test_rebuild_statements() {
        let rebuild = RebuildTable::new("stats", "year INTEGER NOT NULL, total BIGINT NOT NULL")
            .copy("year")
            .project("total", "SUM(\"amount\")")
            .group_by("\"year\"")
            .then("CREATE INDEX stats_year ON stats (year)");

        let statements = rebuild.statements();
        assert_eq!(statements.len(), 5);
        assert_eq!(
            statements[0],
            "CREATE TABLE \"stats__shadow\" (year INTEGER NOT NULL, total BIGINT NOT NULL)"
        );
        assert_eq!(
            statements[1],
            "INSERT INTO \"stats__shadow\" (\"year\", \"total\") SELECT \"year\", SUM(\"amount\") FROM \"stats\" GROUP BY \"year\""
        );
        assert_eq!(statements[2], "DROP TABLE \"stats\"");
        assert_eq!(statements[3], "ALTER TABLE \"stats__shadow\" RENAME TO \"stats\"");
    }

    #[test]
    fn test_integrity_mode_follows_steps() {
        let plain = MigrationUnit::new("2024-07-01-090000", "plain")
            .unwrap()
            .sql("CREATE TABLE a (id INTEGER PRIMARY KEY)");
        assert_eq!(plain.forward_integrity(), IntegrityMode::Enforced);

        let rebuild = MigrationUnit::new("2024-07-01-090001", "rebuild")
            .unwrap()
            .step(RebuildTable::new("a", "id INTEGER PRIMARY KEY").copy("id"))
            .reverse_sql("SELECT 1");
        assert_eq!(rebuild.forward_integrity(), IntegrityMode::Suspended);
        assert_eq!(rebuild.reverse_integrity(), IntegrityMode::Enforced);

        let forced = plain.clone().suspend_integrity();
        assert_eq!(forced.forward_integrity(), IntegrityMode::Suspended);
    }

    #[test]
    fn test_checksum_tracks_forward_content() {
        let unit = MigrationUnit::new("2024-07-01-090000", "accounts")
            .unwrap()
            .sql("CREATE TABLE accounts (id INTEGER PRIMARY KEY)");
        let same = MigrationUnit::new("2024-07-01-090000", "renamed")
            .unwrap()
            .sql("CREATE TABLE accounts (id INTEGER PRIMARY KEY)\n")
            .reverse_sql("DROP TABLE accounts");
        let edited = MigrationUnit::new("2024-07-01-090000", "accounts")
            .unwrap()
            .sql("CREATE TABLE accounts (id INTEGER PRIMARY KEY, name TEXT)");

        assert_eq!(unit.checksum().len(), 64);
        assert_eq!(unit.checksum(), same.checksum());
        assert_ne!(unit.checksum(), edited.checksum());

        let change = MigrationUnit::new("2024-07-01-090001", "change")
            .unwrap()
            .step(ChangeColumn::new("records", "value_date", "DATE", KEEP));
        assert!(change.up()[0].fingerprint().contains("USING keep"));
    }

    #[test]
    fn test_change_column_definition() {
        let change = ChangeColumn::new("records", "value_date", "DATE", KEEP);
        assert_eq!(change.temporary_name(), "value_date__old");
        assert_eq!(change.column_definition(), "\"value_date\" DATE");

        let change = change.not_null_default("'1970-01-01'");
        assert_eq!(
            change.column_definition(),
            "\"value_date\" DATE NOT NULL DEFAULT '1970-01-01'"
        );
    }
}
