//! Log database migrations - embedded SQL files
//!
//! Migrations are compiled into the binary at build time using include_str!
//! and applied by the same runner as the ledger history.
//!
//! IMPORTANT: When adding a new migration:
//! 1. Create `<version>_<name>/up.sql` (and `down.sql`)
//! 2. Add an entry here in order

use crate::domain::{MigrationUnit, Result};

/// All log migrations as (version, name, up, down)
const LOG_MIGRATIONS: &[(&str, &str, &str, &str)] = &[
    (
        "2024-07-01-000000",
        "create_sys_logs",
        include_str!("2024-07-01-000000_create_sys_logs/up.sql"),
        include_str!("2024-07-01-000000_create_sys_logs/down.sql"),
    ),
    (
        "2024-10-20-120000",
        "sys_logs_version",
        include_str!("2024-10-20-120000_sys_logs_version/up.sql"),
        include_str!("2024-10-20-120000_sys_logs_version/down.sql"),
    ),
];

pub fn log_migrations() -> Result<Vec<MigrationUnit>> {
    LOG_MIGRATIONS
        .iter()
        .map(|(version, name, up, down)| Ok(MigrationUnit::new(version, *name)?.sql(*up).reverse_sql(*down)))
        .collect()
}
