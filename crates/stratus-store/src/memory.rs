//! In-process database engine, used for `storage = "memory"` and as the
//! fault-injecting double in tests.

use crate::db::{Database, Row, Statement, Transaction};
use crate::schema::table_def;
use crate::StoreError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

/// Rows of one table keyed by primary key.
type TableRows = BTreeMap<String, Row>;

/// Committed contents of every table, keyed by table name then primary key.
#[derive(Debug, Clone, Default)]
struct Tables {
    tables: BTreeMap<String, TableRows>,
}

impl Tables {
    fn get(&self, table: &str) -> Option<&TableRows> {
        self.tables.get(table)
    }

    fn query_row(&self, table: &str, column: &str, value: &Value) -> Result<Row, StoreError> {
        let def = table_def(table)?;
        if !def.has_column(column) {
            return Err(StoreError::Schema(format!(
                "table '{table}' has no column '{column}'"
            )));
        }
        let no_rows = || StoreError::NoRows {
            table: table.to_owned(),
        };
        let rows = self.tables.get(def.name).ok_or_else(no_rows)?;

        let found = if column == def.primary_key {
            value.as_str().and_then(|key| rows.get(key))
        } else {
            rows.values().find(|row| row.get(column) == Some(value))
        };
        found.cloned().ok_or_else(no_rows)
    }

    fn scan(&self, table: &str) -> Result<Vec<Row>, StoreError> {
        let def = table_def(table)?;
        Ok(self
            .tables
            .get(def.name)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// Uncommitted writes of one transaction. A table is copied from the
/// committed state the first time a statement touches it.
#[derive(Debug, Default)]
struct Staged {
    changed: BTreeMap<String, TableRows>,
}

impl Staged {
    fn exec(&mut self, committed: &Tables, stmt: &Statement) -> Result<u64, StoreError> {
        let def = table_def(stmt.table())?;
        let rows = self
            .changed
            .entry(def.name.to_owned())
            .or_insert_with(|| committed.get(def.name).cloned().unwrap_or_default());

        match stmt {
            Statement::Insert { row, .. } => {
                let mut row = row.clone();
                let key = def.normalize_row(&mut row)?;
                if rows.contains_key(&key) {
                    return Err(StoreError::Duplicate {
                        table: def.name.to_owned(),
                        key,
                    });
                }
                rows.insert(key, row);
                Ok(1)
            }
            Statement::Update {
                key, set, guard, ..
            } => {
                def.check_update(set)?;
                let Some(existing) = rows.get_mut(key) else {
                    return Ok(0);
                };
                if let Some((column, expected)) = guard {
                    if !def.has_column(column) {
                        return Err(StoreError::Schema(format!(
                            "table '{}' has no column '{column}'",
                            def.name
                        )));
                    }
                    if existing.get(column) != Some(expected) {
                        return Ok(0);
                    }
                }
                for (column, value) in set {
                    existing.insert(column.clone(), value.clone());
                }
                Ok(1)
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Faults {
    insert_into: Option<String>,
    commit: bool,
    rollback: bool,
}

/// In-process database. Nothing survives the process.
///
/// Carries fault-injection switches so callers can exercise rollback paths:
/// a failing insert into a given table, a failing commit, a failing rollback.
/// Every read is counted.
#[derive(Default)]
pub struct MemoryDatabase {
    tables: RwLock<Tables>,
    writer: Mutex<()>,
    faults: Mutex<Faults>,
    reads: AtomicUsize,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent insert into `table` fail.
    pub fn fail_inserts_into(&self, table: &str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert_into = Some(table.to_owned());
        }
    }

    pub fn fail_commits(&self, fail: bool) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.commit = fail;
        }
    }

    pub fn fail_rollbacks(&self, fail: bool) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.rollback = fail;
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            *faults = Faults::default();
        }
    }

    /// Number of `query_row`/`scan` calls served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn faults(&self) -> Faults {
        self.faults.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

impl Database for MemoryDatabase {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError> {
        let writer = self
            .writer
            .lock()
            .map_err(|_| StoreError::poisoned("memory writer"))?;
        Ok(Box::new(MemoryTransaction {
            db: self,
            _writer: writer,
            staged: Staged::default(),
        }))
    }

    fn query_row(&self, table: &str, column: &str, value: &Value) -> Result<Row, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::poisoned("memory tables"))?;
        tables.query_row(table, column, value)
    }

    fn scan(&self, table: &str) -> Result<Vec<Row>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::poisoned("memory tables"))?;
        tables.scan(table)
    }
}

/// Holds the writer mutex for its whole lifetime, so transactions on one
/// database never interleave.
struct MemoryTransaction<'a> {
    db: &'a MemoryDatabase,
    _writer: MutexGuard<'a, ()>,
    staged: Staged,
}

impl Transaction for MemoryTransaction<'_> {
    fn exec(&mut self, stmt: &Statement) -> Result<u64, StoreError> {
        if let Statement::Insert { table, .. } = stmt {
            if self.db.faults().insert_into.as_deref() == Some(*table) {
                return Err(StoreError::Backend(format!(
                    "injected insert failure on '{table}'"
                )));
            }
        }
        let committed = self
            .db
            .tables
            .read()
            .map_err(|_| StoreError::poisoned("memory tables"))?;
        self.staged.exec(&committed, stmt)
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if self.db.faults().commit {
            return Err(StoreError::Backend("injected commit failure".to_owned()));
        }
        let MemoryTransaction {
            db,
            _writer: writer,
            staged,
        } = *self;
        let mut tables = db
            .tables
            .write()
            .map_err(|_| StoreError::poisoned("memory tables"))?;
        tables.tables.extend(staged.changed);
        drop(tables);
        drop(writer);
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        if self.db.faults().rollback {
            return Err(StoreError::Backend("injected rollback failure".to_owned()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AWS_CLUSTERS, CLUSTERS, CREDENTIALS};
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn commit_makes_rows_visible() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().unwrap();
        tx.exec(&Statement::insert(
            CREDENTIALS.name,
            row(json!({"id": "k", "secret": "s"})),
        ))
        .unwrap();
        tx.commit().unwrap();

        let found = db.query_row("credentials", "id", &json!("k")).unwrap();
        assert_eq!(found["secret"], "s");
    }

    #[test]
    fn rollback_discards_rows() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().unwrap();
        tx.exec(&Statement::insert(
            CREDENTIALS.name,
            row(json!({"id": "k", "secret": "s"})),
        ))
        .unwrap();
        tx.rollback().unwrap();
        assert!(db.scan("credentials").unwrap().is_empty());
    }

    #[test]
    fn drop_without_commit_discards_rows() {
        let db = MemoryDatabase::new();
        {
            let mut tx = db.begin().unwrap();
            tx.exec(&Statement::insert(
                CREDENTIALS.name,
                row(json!({"id": "k", "secret": "s"})),
            ))
            .unwrap();
        }
        assert!(db.scan("credentials").unwrap().is_empty());
    }

    #[test]
    fn injected_insert_failure_only_hits_target_table() {
        let db = MemoryDatabase::new();
        db.fail_inserts_into(AWS_CLUSTERS.name);
        let mut tx = db.begin().unwrap();
        assert!(tx
            .exec(&Statement::insert(CLUSTERS.name, row(json!({"id": "c1"}))))
            .is_ok());
        assert!(tx
            .exec(&Statement::insert(
                AWS_CLUSTERS.name,
                row(json!({"cluster_id": "c1"}))
            ))
            .is_err());
        tx.rollback().unwrap();
        assert!(db.scan("clusters").unwrap().is_empty());
    }

    #[test]
    fn injected_commit_failure_leaves_nothing() {
        let db = MemoryDatabase::new();
        db.fail_commits(true);
        let mut tx = db.begin().unwrap();
        tx.exec(&Statement::insert(CLUSTERS.name, row(json!({"id": "c1"}))))
            .unwrap();
        assert!(tx.commit().is_err());
        db.clear_faults();
        assert!(db.scan("clusters").unwrap().is_empty());
    }

    #[test]
    fn query_by_primary_key_and_column() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().unwrap();
        tx.exec(&Statement::insert(
            CREDENTIALS.name,
            row(json!({"id": "k1", "secret": "s1"})),
        ))
        .unwrap();
        tx.commit().unwrap();

        assert_eq!(db.query_row("credentials", "id", &json!("k1")).unwrap()["secret"], "s1");
        assert_eq!(db.query_row("credentials", "secret", &json!("s1")).unwrap()["id"], "k1");
        assert!(matches!(
            db.query_row("credentials", "id", &json!("missing")),
            Err(StoreError::NoRows { .. })
        ));
        assert!(matches!(
            db.query_row("domains", "cluster_id", &json!("c1")),
            Err(StoreError::NoRows { .. })
        ));
        assert!(matches!(
            db.query_row("credentials", "colour", &json!("x")),
            Err(StoreError::Schema(_))
        ));
    }

    #[test]
    fn guarded_update_only_applies_on_match() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().unwrap();
        tx.exec(&Statement::insert(
            CLUSTERS.name,
            row(json!({"id": "c1", "state": "persisted"})),
        ))
        .unwrap();

        let miss = Statement::update(CLUSTERS.name, "c1", row(json!({"state": "ready"})))
            .guarded("state", "provisioning");
        assert_eq!(tx.exec(&miss).unwrap(), 0);
        let hit = Statement::update(CLUSTERS.name, "c1", row(json!({"state": "provisioning"})))
            .guarded("state", "persisted");
        assert_eq!(tx.exec(&hit).unwrap(), 1);
        let absent = Statement::update(CLUSTERS.name, "c2", row(json!({"state": "ready"})));
        assert_eq!(tx.exec(&absent).unwrap(), 0);
        tx.commit().unwrap();

        assert_eq!(
            db.query_row("clusters", "id", &json!("c1")).unwrap()["state"],
            "provisioning"
        );
    }

    #[test]
    fn duplicate_insert_rejected() {
        let db = MemoryDatabase::new();
        let insert = Statement::insert(CREDENTIALS.name, row(json!({"id": "k1", "secret": "s"})));
        let mut tx = db.begin().unwrap();
        tx.exec(&insert).unwrap();
        let err = tx.exec(&insert).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { key, .. } if key == "k1"));
    }

    #[test]
    fn reads_are_counted() {
        let db = MemoryDatabase::new();
        assert_eq!(db.read_count(), 0);
        let _ = db.query_row("credentials", "id", &json!("k"));
        let _ = db.scan("clusters");
        assert_eq!(db.read_count(), 2);
    }
}
