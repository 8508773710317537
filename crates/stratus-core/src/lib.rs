//! Installer core for Stratus clusters.
//!
//! This crate ties the schema, storage and provider crates together into the
//! `Installer`: the single entry point for launching, finding and deleting
//! clusters, managing cloud credentials and subscribing to lifecycle events.
//! It also provides the in-memory cluster registry, the event log with
//! per-subscriber cursors, the provisioning task registry, startup
//! reconciliation and the data-dir lock.

pub mod concurrency;
pub mod config;
pub mod credentials;
pub mod events;
pub mod installer;
pub mod lifecycle;
pub mod registry;
pub mod tasks;

pub use concurrency::{install_signal_handler, shutdown_requested, DataDirLock};
pub use config::InstallerConfig;
pub use credentials::CredentialStore;
pub use events::{
    EventLog, RecvTimeoutError, Subscription, SubscriptionId, SubscriptionSet, TryRecvError,
};
pub use installer::{Installer, InstallerBuilder, ReconcileReport};
pub use lifecycle::validate_transition;
pub use registry::{ClusterRegistry, ProviderCluster, SharedAwsCluster};
pub use tasks::{ProvisionTasks, TaskHandle, TaskStatus};

use stratus_schema::{ClusterId, ClusterState, CredentialId, SchemaError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("invalid launch request: {0}")]
    Validation(SchemaError),
    #[error("unsupported cluster type: {0}")]
    UnsupportedType(String),
    #[error("cluster not found: {0}")]
    ClusterNotFound(ClusterId),
    #[error("credential not found: {0}")]
    CredentialNotFound(CredentialId),
    #[error("cluster {0} is already registered")]
    AlreadyRegistered(ClusterId),
    #[error("storage error: {0}")]
    Storage(#[from] stratus_store::StoreError),
    #[error("credential error: {0}")]
    Credential(#[from] stratus_provider::CredentialError),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: ClusterState, to: ClusterState },
    #[error("cannot open installer at {path}: {reason}")]
    Open { path: String, reason: String },
    #[error("config error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SchemaError> for InstallerError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::UnsupportedType(kind) => InstallerError::UnsupportedType(kind),
            other => InstallerError::Validation(other),
        }
    }
}

impl InstallerError {
    /// True when the cluster or credential does not exist, as opposed to
    /// storage being unreachable.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            InstallerError::ClusterNotFound(_) | InstallerError::CredentialNotFound(_)
        )
    }
}
