//! Persistence for the Stratus installer.
//!
//! This crate provides the storage layer: the `Database` handle contract
//! (transactional exec plus limit-one queries with a distinguishable "no rows"
//! outcome), two engines implementing it (`FileDatabase` over SQLite;
//! `MemoryDatabase`, in-process with fault injection), the relational table
//! definitions, and the `PersistenceGateway` that marshals clusters, domains
//! and credentials into rows.

pub mod db;
pub mod file;
pub mod gateway;
pub mod layout;
pub mod memory;
pub mod rows;
pub mod schema;

pub use db::{open_database, Database, Row, Statement, StorageKind, Transaction};
pub use file::FileDatabase;
pub use gateway::PersistenceGateway;
pub use layout::{DataLayout, STORE_FORMAT_VERSION};
pub use memory::MemoryDatabase;
pub use schema::{TableDef, AWS_CLUSTERS, CLUSTERS, CREDENTIALS, DOMAINS, TABLES};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A limit-one query matched nothing. Raised by the database handle.
    #[error("no rows in table '{table}'")]
    NoRows { table: String },
    /// An entity the gateway was asked for does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("duplicate key '{key}' in table '{table}'")]
    Duplicate { table: String, key: String },
    #[error("conditional update on '{table}' row '{key}' did not match: {reason}")]
    GuardMismatch {
        table: String,
        key: String,
        reason: String,
    },
    #[error("schema violation: {0}")]
    Schema(String),
    #[error("corrupt row in '{table}': {reason}")]
    CorruptRow { table: String, reason: String },
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// "Does not exist", as opposed to "cannot reach storage".
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NoRows { .. } | StoreError::NotFound { .. })
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        StoreError::Backend(format!("{what} lock poisoned"))
    }
}
