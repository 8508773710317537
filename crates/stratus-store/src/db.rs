//! The persistence handle contract: transactional exec plus limit-one
//! queries with a distinguishable "no rows" outcome.

use crate::file::FileDatabase;
use crate::layout::DataLayout;
use crate::memory::MemoryDatabase;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// One relational row: column name to value.
pub type Row = serde_json::Map<String, Value>;

/// A write executed inside a [`Transaction`].
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Insert a new row. Fails with [`StoreError::Duplicate`] if the primary
    /// key is taken.
    Insert { table: &'static str, row: Row },
    /// Overwrite columns of the row with primary key `key`. When `guard` is
    /// set, the row is only touched if that column currently holds that value.
    Update {
        table: &'static str,
        key: String,
        set: Row,
        guard: Option<(String, Value)>,
    },
}

impl Statement {
    pub fn insert(table: &'static str, row: Row) -> Self {
        Statement::Insert { table, row }
    }

    pub fn update(table: &'static str, key: impl Into<String>, set: Row) -> Self {
        Statement::Update {
            table,
            key: key.into(),
            set,
            guard: None,
        }
    }

    /// Attach an equality guard to an update. No-op on inserts.
    #[must_use]
    pub fn guarded(self, column: &str, value: impl Into<Value>) -> Self {
        match self {
            Statement::Update {
                table, key, set, ..
            } => Statement::Update {
                table,
                key,
                set,
                guard: Some((column.to_owned(), value.into())),
            },
            insert @ Statement::Insert { .. } => insert,
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Statement::Insert { table, .. } | Statement::Update { table, .. } => table,
        }
    }
}

/// An open write transaction. Dropping it without `commit` discards it.
pub trait Transaction {
    /// Execute one statement, returning the number of rows affected.
    fn exec(&mut self, stmt: &Statement) -> Result<u64, StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Transactional relational storage.
///
/// Reads are single-row, limit-one lookups; an empty result is
/// [`StoreError::NoRows`], never a generic failure.
pub trait Database: Send + Sync {
    fn name(&self) -> &'static str;

    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError>;

    /// First row of `table` whose `column` equals `value`.
    fn query_row(&self, table: &str, column: &str, value: &Value) -> Result<Row, StoreError>;

    /// Every row of `table`, ordered by primary key.
    fn scan(&self, table: &str) -> Result<Vec<Row>, StoreError>;
}

/// Shared handles are databases too, so a caller can keep one for inspection.
impl<D: Database + ?Sized> Database for Arc<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError> {
        (**self).begin()
    }

    fn query_row(&self, table: &str, column: &str, value: &Value) -> Result<Row, StoreError> {
        (**self).query_row(table, column, value)
    }

    fn scan(&self, table: &str) -> Result<Vec<Row>, StoreError> {
        (**self).scan(table)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Memory,
}

pub fn open_database(kind: StorageKind, layout: &DataLayout) -> Result<Box<dyn Database>, StoreError> {
    match kind {
        StorageKind::File => Ok(Box::new(FileDatabase::open(layout.clone())?)),
        StorageKind::Memory => Ok(Box::new(MemoryDatabase::new())),
    }
}
