//! Ledger schema history - embedded migration units
//!
//! Plain SQL units are compiled into the binary with include_str!. Units that
//! change column types or rebuild tables are assembled from steps here.
//!
//! IMPORTANT: When adding a migration:
//! 1. Pick a version newer than every existing one (YYYY-MM-DD-HHMMSS)
//! 2. For SQL units, create `<version>_<name>/up.sql` (and `down.sql` if reversible)
//! 3. Add the unit to `ledger_migrations` in order
//!
//! Never edit a unit once released: applied checksums are verified.

pub mod convert;

use crate::domain::{ChangeColumn, MigrationUnit, RebuildTable, Result};
use crate::ports::MigrationSource;

use convert::{NAIVE_TO_UTC, TIMESTAMP_TO_DATE, UTC_TO_NAIVE};

/// A plain SQL unit from embedded `up.sql` / `down.sql`
fn sql_unit(version: &str, name: &str, up: &str, down: Option<&str>) -> Result<MigrationUnit> {
    let unit = MigrationUnit::new(version, name)?.sql(up);
    Ok(match down {
        Some(down) => unit.reverse_sql(down),
        None => unit,
    })
}

const RECORD_DATE_COLUMNS: [&str; 2] = ["operation_date", "value_date"];

fn records_zoned_timestamps() -> Result<MigrationUnit> {
    let mut unit = MigrationUnit::new("2024-08-12-193000", "records_zoned_timestamps")?;
    for column in RECORD_DATE_COLUMNS {
        unit = unit
            .step(
                ChangeColumn::new("records", column, "TIMESTAMP", NAIVE_TO_UTC)
                    .not_null_default("'1970-01-01T00:00:00+00:00'"),
            )
            .reverse_step(
                ChangeColumn::new("records", column, "TIMESTAMP", UTC_TO_NAIVE)
                    .not_null_default("'1970-01-01 00:00:00'"),
            );
    }
    Ok(unit)
}

fn monthly_stats_natural_key() -> Result<MigrationUnit> {
    let natural_key = RebuildTable::new(
        "monthly_stats",
        "year INTEGER NOT NULL,
         month INTEGER NOT NULL,
         debit_amount BIGINT NOT NULL DEFAULT 0,
         credit_amount BIGINT NOT NULL DEFAULT 0,
         currency TEXT NOT NULL,
         PRIMARY KEY (year, month, currency)",
    )
    .copy_all(&["year", "month"])
    .project("debit_amount", "SUM(\"debit_amount\")")
    .project("credit_amount", "SUM(\"credit_amount\")")
    .copy("currency")
    .group_by("\"year\", \"month\", \"currency\"");

    let surrogate_key = RebuildTable::new(
        "monthly_stats",
        "id INTEGER PRIMARY KEY NOT NULL,
         year INTEGER NOT NULL,
         month INTEGER NOT NULL,
         debit_amount BIGINT NOT NULL DEFAULT 0,
         credit_amount BIGINT NOT NULL DEFAULT 0,
         currency TEXT NOT NULL",
    )
    .copy_all(&["year", "month", "debit_amount", "credit_amount", "currency"]);

    Ok(MigrationUnit::new("2024-08-28-174512", "monthly_stats_natural_key")?
        .step(natural_key)
        .reverse_step(surrogate_key))
}

/// Irreversible: the time of day is discarded
fn records_operation_dates() -> Result<MigrationUnit> {
    let mut unit = MigrationUnit::new("2024-09-15-082210", "records_operation_dates")?;
    for column in RECORD_DATE_COLUMNS {
        unit = unit.step(
            ChangeColumn::new("records", column, "DATE", TIMESTAMP_TO_DATE)
                .not_null_default("'1970-01-01'"),
        );
    }
    Ok(unit)
}

const RECORDS_COLUMNS: [&str; 11] = [
    "id",
    "account_id",
    "amount",
    "currency",
    "direction",
    "mode",
    "details",
    "category_id",
    "merchant_id",
    "operation_date",
    "value_date",
];

fn records_references() -> Result<MigrationUnit> {
    let referenced = RebuildTable::new(
        "records",
        "id INTEGER PRIMARY KEY NOT NULL,
         account_id BIGINT NOT NULL REFERENCES accounts (id) ON DELETE CASCADE,
         amount BIGINT NOT NULL,
         currency TEXT NOT NULL,
         direction TEXT NOT NULL CHECK (direction IN ('Debit', 'Credit')),
         mode TEXT NOT NULL,
         details TEXT NOT NULL DEFAULT '',
         category_id BIGINT REFERENCES categories (id) ON DELETE SET NULL,
         merchant_id BIGINT REFERENCES merchants (id) ON DELETE SET NULL,
         operation_date DATE NOT NULL,
         value_date DATE NOT NULL",
    )
    .copy_all(&RECORDS_COLUMNS)
    .then("CREATE INDEX records_account_id ON records (account_id)")
    .then("CREATE INDEX records_operation_date ON records (operation_date)");

    let unreferenced = RebuildTable::new(
        "records",
        "id INTEGER PRIMARY KEY NOT NULL,
         account_id BIGINT NOT NULL REFERENCES accounts (id) ON DELETE CASCADE,
         amount BIGINT NOT NULL,
         currency TEXT NOT NULL,
         direction TEXT NOT NULL CHECK (direction IN ('Debit', 'Credit')),
         mode TEXT NOT NULL,
         details TEXT NOT NULL DEFAULT '',
         category_id BIGINT,
         merchant_id BIGINT,
         operation_date DATE NOT NULL DEFAULT '1970-01-01',
         value_date DATE NOT NULL DEFAULT '1970-01-01'",
    )
    .copy_all(&RECORDS_COLUMNS)
    .then("CREATE INDEX records_account_id ON records (account_id)");

    Ok(MigrationUnit::new("2024-10-20-110000", "records_references")?
        .step(referenced)
        .reverse_step(unreferenced))
}

/// The full ledger schema history, in version order
pub fn ledger_migrations() -> Result<Vec<MigrationUnit>> {
    Ok(vec![
        sql_unit(
            "2024-07-01-090000",
            "create_accounts",
            include_str!("2024-07-01-090000_create_accounts/up.sql"),
            Some(include_str!("2024-07-01-090000_create_accounts/down.sql")),
        )?,
        sql_unit(
            "2024-07-01-090100",
            "create_categories_and_merchants",
            include_str!("2024-07-01-090100_create_categories_and_merchants/up.sql"),
            Some(include_str!("2024-07-01-090100_create_categories_and_merchants/down.sql")),
        )?,
        sql_unit(
            "2024-07-01-090200",
            "create_records",
            include_str!("2024-07-01-090200_create_records/up.sql"),
            Some(include_str!("2024-07-01-090200_create_records/down.sql")),
        )?,
        sql_unit(
            "2024-07-14-181500",
            "create_monthly_stats",
            include_str!("2024-07-14-181500_create_monthly_stats/up.sql"),
            Some(include_str!("2024-07-14-181500_create_monthly_stats/down.sql")),
        )?,
        records_zoned_timestamps()?,
        monthly_stats_natural_key()?,
        sql_unit(
            "2024-09-02-140627",
            "create_recurring_payments",
            include_str!("2024-09-02-140627_create_recurring_payments/up.sql"),
            Some(include_str!("2024-09-02-140627_create_recurring_payments/down.sql")),
        )?,
        records_operation_dates()?,
        sql_unit(
            "2024-09-21-103045",
            "rename_category_parent",
            include_str!("2024-09-21-103045_rename_category_parent/up.sql"),
            Some(include_str!("2024-09-21-103045_rename_category_parent/down.sql")),
        )?,
        sql_unit(
            "2024-10-03-201145",
            "replaced_by_references",
            include_str!("2024-10-03-201145_replaced_by_references/up.sql"),
            None,
        )?,
        records_references()?,
        sql_unit(
            "2024-11-05-094500",
            "create_reports",
            include_str!("2024-11-05-094500_create_reports/up.sql"),
            Some(include_str!("2024-11-05-094500_create_reports/down.sql")),
        )?,
    ])
}

/// The embedded ledger history as a migration source
#[derive(Debug, Default, Clone, Copy)]
pub struct LedgerMigrations;

impl MigrationSource for LedgerMigrations {
    fn load(&self) -> Result<Vec<MigrationUnit>> {
        ledger_migrations()
    }
}
