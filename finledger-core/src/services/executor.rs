//! Step execution inside a migration transaction
//!
//! Every unit runs in one `EXCLUSIVE` transaction. Units that rebuild tables run
//! with `PRAGMA foreign_keys` switched off; the pragma is a no-op inside a
//! transaction, so it is toggled around it and restored on every exit path.

use rusqlite::types::Value;
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tracing::{debug, warn};

use crate::domain::{quote_ident, ChangeColumn, IntegrityMode, MigrationFailure, RebuildTable, Step};

/// Whether the connection currently enforces foreign keys
pub fn foreign_keys_enabled(conn: &Connection) -> rusqlite::Result<bool> {
    conn.query_row("PRAGMA foreign_keys", [], |row| row.get::<_, i64>(0))
        .map(|enabled| enabled != 0)
}

/// Switches foreign keys off for its lifetime when they were on
struct ForeignKeySuspension<'c> {
    conn: &'c Connection,
    restore: bool,
}

impl<'c> ForeignKeySuspension<'c> {
    fn begin(conn: &'c Connection, mode: IntegrityMode) -> rusqlite::Result<Self> {
        let restore = mode == IntegrityMode::Suspended && foreign_keys_enabled(conn)?;
        if restore {
            conn.execute_batch("PRAGMA foreign_keys = OFF")?;
        }
        Ok(Self { conn, restore })
    }
}

impl Drop for ForeignKeySuspension<'_> {
    fn drop(&mut self) {
        if self.restore {
            if let Err(e) = self.conn.execute_batch("PRAGMA foreign_keys = ON") {
                warn!(error = %e, "failed to re-enable foreign keys");
            }
        }
    }
}

/// Run `f` in an exclusive transaction, committing only if it succeeds
///
/// With [`IntegrityMode::Suspended`] foreign keys are off while `f` runs and
/// `PRAGMA foreign_key_check` must come back clean before the commit.
pub fn run_in_transaction<T>(
    conn: &Connection,
    integrity: IntegrityMode,
    f: impl FnOnce(&Transaction<'_>) -> Result<T, MigrationFailure>,
) -> Result<T, MigrationFailure> {
    // Declared before the transaction so it is dropped after it
    let _suspension = ForeignKeySuspension::begin(conn, integrity)?;
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Exclusive)?;

    let value = f(&tx)?;

    if integrity == IntegrityMode::Suspended {
        check_foreign_keys(&tx)?;
    }

    tx.commit()?;
    Ok(value)
}

fn check_foreign_keys(conn: &Connection) -> Result<(), MigrationFailure> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    match tables.first() {
        Some(table) => Err(MigrationFailure::ForeignKeyViolation {
            table: table.clone(),
            count: tables.iter().filter(|t| *t == table).count(),
        }),
        None => Ok(()),
    }
}

/// Execute one step; `index` is 1-based and only used in error reports
pub fn execute_step(conn: &Connection, index: usize, step: &Step) -> Result<(), MigrationFailure> {
    match step {
        Step::Sql(sql) => {
            debug!(step = index, "executing sql step");
            batch(conn, index, sql)
        }
        Step::RebuildTable(rebuild) => rebuild_table(conn, index, rebuild),
        Step::ChangeColumn(change) => change_column(conn, index, change),
    }
}

fn batch(conn: &Connection, index: usize, sql: &str) -> Result<(), MigrationFailure> {
    conn.execute_batch(sql).map_err(|e| rejected(index, e))
}

fn rejected(index: usize, e: rusqlite::Error) -> MigrationFailure {
    MigrationFailure::StepExecution {
        step: index,
        message: e.to_string(),
    }
}

/// Shadow-and-swap: create shadow, copy through the projection, drop, rename
fn rebuild_table(conn: &Connection, index: usize, rebuild: &RebuildTable) -> Result<(), MigrationFailure> {
    debug!(step = index, table = %rebuild.table, "rebuilding table");
    for statement in rebuild.statements() {
        batch(conn, index, &statement)?;
    }
    Ok(())
}

/// Rename the column aside, add the new one, backfill it row by row, drop the old one
///
/// Rows are addressed by `rowid`, so the table must not be `WITHOUT ROWID`.
fn change_column(conn: &Connection, index: usize, change: &ChangeColumn) -> Result<(), MigrationFailure> {
    debug!(
        step = index,
        table = %change.table,
        column = %change.column,
        conversion = change.conversion.name,
        "changing column type"
    );

    let table = quote_ident(&change.table);
    let column = quote_ident(&change.column);
    let temporary = quote_ident(&change.temporary_name());

    batch(
        conn,
        index,
        &format!("ALTER TABLE {} RENAME COLUMN {} TO {}", table, column, temporary),
    )?;
    batch(
        conn,
        index,
        &format!("ALTER TABLE {} ADD COLUMN {}", table, change.column_definition()),
    )?;

    let rows = {
        let mut stmt = conn
            .prepare(&format!("SELECT rowid, {} FROM {}", temporary, table))
            .map_err(|e| rejected(index, e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Value>(1)?)))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| rejected(index, e))?;
        rows
    };

    let mut update = conn
        .prepare(&format!("UPDATE {} SET {} = ?1 WHERE rowid = ?2", table, column))
        .map_err(|e| rejected(index, e))?;

    for (rowid, old) in &rows {
        let new = (change.conversion.convert)(old).map_err(|reason| MigrationFailure::Conversion {
            table: change.table.clone(),
            column: change.column.clone(),
            row: *rowid,
            value: describe(old),
            reason,
        })?;
        update
            .execute(params![new, rowid])
            .map_err(|e| rejected(index, e))?;
    }
    drop(update);

    debug!(rows = rows.len(), "backfilled column");

    batch(
        conn,
        index,
        &format!("ALTER TABLE {} DROP COLUMN {}", table, temporary),
    )
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => format!("'{}'", s),
        Value::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Conversion;

    fn double(value: &Value) -> Result<Value, String> {
        match value {
            Value::Integer(i) => Ok(Value::Integer(i * 2)),
            other => Err(format!("not an integer: {:?}", other)),
        }
    }

    const DOUBLE: Conversion = Conversion {
        name: "double",
        convert: double,
    };

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE parents (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE children (
                 id INTEGER PRIMARY KEY,
                 parent_id INTEGER NOT NULL REFERENCES parents (id) ON DELETE CASCADE,
                 amount
             );
             INSERT INTO parents (id, name) VALUES (1, 'a'), (2, 'b');
             INSERT INTO children (parent_id, amount) VALUES (1, 10), (2, 20), (2, 30);",
        )
        .unwrap();
        conn
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_rebuild_parent_keeps_children() {
        let conn = setup();
        let rebuild = Step::from(
            RebuildTable::new("parents", "id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE")
                .copy_all(&["id", "name"]),
        );

        run_in_transaction(&conn, IntegrityMode::Suspended, |tx| execute_step(tx, 1, &rebuild))
            .unwrap();

        assert_eq!(count(&conn, "parents"), 2);
        assert_eq!(count(&conn, "children"), 3);
        assert!(foreign_keys_enabled(&conn).unwrap());
        assert!(conn
            .execute("INSERT INTO parents (id, name) VALUES (3, 'a')", [])
            .is_err());
    }

    #[test]
    fn test_failed_transaction_restores_foreign_keys() {
        let conn = setup();
        let bad = Step::Sql("INSERT INTO missing (id) VALUES (1)".to_string());

        let err = run_in_transaction(&conn, IntegrityMode::Suspended, |tx| {
            tx.execute_batch("DELETE FROM children")?;
            execute_step(tx, 2, &bad)
        })
        .unwrap_err();

        assert!(matches!(err, MigrationFailure::StepExecution { step: 2, .. }));
        assert_eq!(count(&conn, "children"), 3);
        assert!(foreign_keys_enabled(&conn).unwrap());
    }

    #[test]
    fn test_suspension_keeps_foreign_keys_off_when_they_were_off() {
        let conn = setup();
        conn.execute_batch("PRAGMA foreign_keys = OFF").unwrap();
        let rebuild = Step::from(
            RebuildTable::new("parents", "id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE")
                .copy_all(&["id", "name"]),
        );

        run_in_transaction(&conn, IntegrityMode::Suspended, |tx| execute_step(tx, 1, &rebuild))
            .unwrap();
        assert!(!foreign_keys_enabled(&conn).unwrap());

        let bad = Step::Sql("INSERT INTO missing (id) VALUES (1)".to_string());
        run_in_transaction(&conn, IntegrityMode::Suspended, |tx| execute_step(tx, 1, &bad))
            .unwrap_err();
        assert!(!foreign_keys_enabled(&conn).unwrap());
        assert_eq!(count(&conn, "parents"), 2);
    }

    #[test]
    fn test_foreign_key_check_rejects_dangling_rows() {
        let conn = setup();

        let err = run_in_transaction(&conn, IntegrityMode::Suspended, |tx| {
            tx.execute_batch("DELETE FROM parents WHERE id = 2")?;
            Ok(())
        })
        .unwrap_err();

        assert_eq!(
            err,
            MigrationFailure::ForeignKeyViolation {
                table: "children".to_string(),
                count: 2,
            }
        );
        assert_eq!(count(&conn, "parents"), 2);
    }

    #[test]
    fn test_change_column_backfills() {
        let conn = setup();
        let change = Step::from(ChangeColumn::new("children", "amount", "BIGINT", DOUBLE));

        run_in_transaction(&conn, IntegrityMode::Enforced, |tx| execute_step(tx, 1, &change))
            .unwrap();

        let total: i64 = conn
            .query_row("SELECT SUM(amount) FROM children", [], |row| row.get(0))
            .unwrap();
        assert_eq!(total, 120);

        let old_column = conn.prepare("SELECT amount__old FROM children");
        assert!(old_column.is_err());
    }

    #[test]
    fn test_change_column_conversion_failure_rolls_back() {
        let conn = setup();
        conn.execute("UPDATE children SET amount = 'n/a' WHERE id = 3", [])
            .unwrap();
        let change = Step::from(ChangeColumn::new("children", "amount", "BIGINT", DOUBLE));

        let err = run_in_transaction(&conn, IntegrityMode::Enforced, |tx| execute_step(tx, 1, &change))
            .unwrap_err();

        match err {
            MigrationFailure::Conversion { table, column, row, value, .. } => {
                assert_eq!(table, "children");
                assert_eq!(column, "amount");
                assert_eq!(row, 3);
                assert_eq!(value, "'n/a'");
            }
            other => panic!("unexpected failure: {:?}", other),
        }

        let amounts: Vec<Value> = conn
            .prepare("SELECT amount FROM children ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(
            amounts,
            vec![Value::Integer(10), Value::Integer(20), Value::Text("n/a".to_string())]
        );
    }
}
