//! Durable database engine: one SQLite file per data dir.

use crate::db::{Database, Row, Statement, Transaction};
use crate::layout::DataLayout;
use crate::schema::{table_def, TableDef, TABLES};
use crate::StoreError;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{ffi, params_from_iter, Connection, ErrorCode};
use serde_json::{Number, Value};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// SQLite database under `<data_dir>/db`.
///
/// One connection serves both reads and writes and is held for the whole
/// life of a transaction, so transactions on one database never interleave.
/// Callers are expected to hold the data-dir lock for as long as the
/// database is open.
pub struct FileDatabase {
    layout: DataLayout,
    conn: Mutex<Connection>,
}

impl FileDatabase {
    /// Open (creating if needed) the database under `layout` and make sure
    /// every table exists.
    pub fn open(layout: DataLayout) -> Result<Self, StoreError> {
        layout.initialize()?;
        let conn = Connection::open(layout.db_path())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        for def in TABLES {
            conn.execute_batch(def.create)?;
        }
        debug!("opened sqlite store at {}", layout.db_path().display());

        Ok(Self {
            layout,
            conn: Mutex::new(conn),
        })
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::poisoned("sqlite connection"))
    }
}

impl Database for FileDatabase {
    fn name(&self) -> &'static str {
        "file"
    }

    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError> {
        let conn = self.conn()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(FileTransaction { conn, open: true }))
    }

    fn query_row(&self, table: &str, column: &str, value: &Value) -> Result<Row, StoreError> {
        let def = table_def(table)?;
        check_column(def, column)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {column} = ?1 LIMIT 1",
            def.columns.join(", "),
            def.name
        );
        let conn = self.conn()?;
        match conn.query_row(&sql, [to_sql(value)], |r| read_row(def, r)) {
            Ok(row) => Ok(row),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(StoreError::NoRows {
                table: def.name.to_owned(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn scan(&self, table: &str) -> Result<Vec<Row>, StoreError> {
        let def = table_def(table)?;
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            def.columns.join(", "),
            def.name,
            def.primary_key
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |r| read_row(def, r))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// An open `BEGIN IMMEDIATE` transaction. Rolled back on drop unless
/// committed.
struct FileTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    open: bool,
}

impl FileTransaction<'_> {
    fn insert(&self, def: &TableDef, row: &Row) -> Result<u64, StoreError> {
        let mut row = row.clone();
        let key = def.normalize_row(&mut row)?;
        let placeholders: Vec<String> = (1..=def.columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            def.name,
            def.columns.join(", "),
            placeholders.join(", ")
        );
        let values = def
            .columns
            .iter()
            .map(|column| row.get(*column).map_or(SqlValue::Null, to_sql));

        match self.conn.execute(&sql, params_from_iter(values)) {
            Ok(n) => Ok(n as u64),
            Err(e) if is_key_conflict(&e) => Err(StoreError::Duplicate {
                table: def.name.to_owned(),
                key,
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn update(
        &self,
        def: &TableDef,
        key: &str,
        set: &Row,
        guard: Option<&(String, Value)>,
    ) -> Result<u64, StoreError> {
        def.check_update(set)?;
        if set.is_empty() {
            return Err(StoreError::Schema(format!(
                "empty update of '{}' row '{key}'",
                def.name
            )));
        }

        let mut values: Vec<SqlValue> = Vec::with_capacity(set.len() + 2);
        let mut assignments = Vec::with_capacity(set.len());
        for (column, value) in set {
            values.push(to_sql(value));
            assignments.push(format!("{column} = ?{}", values.len()));
        }
        values.push(SqlValue::Text(key.to_owned()));
        let mut sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            def.name,
            assignments.join(", "),
            def.primary_key,
            values.len()
        );
        if let Some((column, expected)) = guard {
            check_column(def, column)?;
            values.push(to_sql(expected));
            sql.push_str(&format!(" AND {column} = ?{}", values.len()));
        }

        let affected = self.conn.execute(&sql, params_from_iter(values))?;
        Ok(affected as u64)
    }
}

impl Transaction for FileTransaction<'_> {
    fn exec(&mut self, stmt: &Statement) -> Result<u64, StoreError> {
        let def = table_def(stmt.table())?;
        match stmt {
            Statement::Insert { row, .. } => self.insert(def, row),
            Statement::Update {
                key, set, guard, ..
            } => self.update(def, key, set, guard.as_ref()),
        }
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        self.open = false;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.open = false;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for FileTransaction<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("rollback of abandoned transaction failed: {e}");
            }
        }
    }
}

fn check_column(def: &TableDef, column: &str) -> Result<(), StoreError> {
    if def.has_column(column) {
        Ok(())
    } else {
        Err(StoreError::Schema(format!(
            "table '{}' has no column '{column}'",
            def.name
        )))
    }
}

fn is_key_conflict(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && (e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE)
    )
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn read_row(def: &TableDef, r: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    let mut row = Row::new();
    for (i, column) in def.columns.iter().enumerate() {
        let value = match r.get_ref(i)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::from(i),
            ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
            ValueRef::Text(t) | ValueRef::Blob(t) => {
                Value::String(String::from_utf8_lossy(t).into_owned())
            }
        };
        row.insert((*column).to_owned(), value);
    }
    Ok(row)
}
