//! Cluster data model, launch requests and lifecycle events for Stratus.
//!
//! This crate defines the schema layer: identifier newtypes, the
//! provider-agnostic `Cluster` and its provider variants (`AwsCluster`),
//! launch request decoding and validation (`LaunchRequest`), and the
//! `Event` records broadcast by the installer.

pub mod aws;
pub mod cidr;
pub mod cluster;
pub mod event;
pub mod request;
pub mod token;
pub mod types;

pub use aws::{AwsCluster, AwsLaunchRequest};
pub use cidr::Ipv4Cidr;
pub use cluster::{Cluster, ClusterState, ClusterType, Credential, Domain};
pub use event::{Event, EventKind};
pub use request::LaunchRequest;
pub use token::{generate_cluster_id, generate_token};
pub use types::{ClusterId, CredentialId, EventId};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unsupported cluster type: {0}")]
    UnsupportedType(String),
    #[error("invalid cluster state: {0}")]
    InvalidState(String),
    #[error("cluster {0} already has a domain")]
    DomainAlreadyAttached(String),
    #[error("failed to parse launch request: {0}")]
    Parse(#[from] serde_json::Error),
}

impl SchemaError {
    /// True for errors caused by a bad or incomplete request, as opposed to
    /// a provider the installer does not know about.
    pub fn is_validation(&self) -> bool {
        !matches!(self, SchemaError::UnsupportedType(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_type_is_not_validation() {
        assert!(!SchemaError::UnsupportedType("gce".to_owned()).is_validation());
        assert!(SchemaError::MissingField("credential_id").is_validation());
    }

    #[test]
    fn invalid_field_display() {
        let e = SchemaError::InvalidField {
            field: "num_instances",
            reason: "2: must be 1 or 3-12".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("num_instances"));
        assert!(msg.contains("must be 1"));
    }
}
