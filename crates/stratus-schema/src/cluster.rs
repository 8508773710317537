use crate::types::{ClusterId, CredentialId};
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Cloud provider a cluster is launched on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    Aws,
}

impl ClusterType {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterType::Aws => "aws",
        }
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aws" => Ok(ClusterType::Aws),
            other => Err(SchemaError::UnsupportedType(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    Requested,
    Validating,
    Persisted,
    Registered,
    Provisioning,
    Ready,
    Failed,
    Deleting,
    Deleted,
}

impl ClusterState {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterState::Requested => "requested",
            ClusterState::Validating => "validating",
            ClusterState::Persisted => "persisted",
            ClusterState::Registered => "registered",
            ClusterState::Provisioning => "provisioning",
            ClusterState::Ready => "ready",
            ClusterState::Failed => "failed",
            ClusterState::Deleting => "deleting",
            ClusterState::Deleted => "deleted",
        }
    }

    /// Ready, Failed and Deleted end the lifecycle as far as the installer is concerned.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ClusterState::Ready | ClusterState::Failed | ClusterState::Deleted
        )
    }

    pub fn is_deleting(self) -> bool {
        matches!(self, ClusterState::Deleting | ClusterState::Deleted)
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterState {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(ClusterState::Requested),
            "validating" => Ok(ClusterState::Validating),
            "persisted" => Ok(ClusterState::Persisted),
            "registered" => Ok(ClusterState::Registered),
            "provisioning" => Ok(ClusterState::Provisioning),
            "ready" => Ok(ClusterState::Ready),
            "failed" => Ok(ClusterState::Failed),
            "deleting" => Ok(ClusterState::Deleting),
            "deleted" => Ok(ClusterState::Deleted),
            other => Err(SchemaError::InvalidState(other.to_owned())),
        }
    }
}

/// DNS domain handed out to a cluster once it is reachable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Domain {
    pub name: String,
    pub token: String,
}

/// Provider-agnostic projection of a cluster.
///
/// This is what callers of the installer see; provider variants embed
/// exactly one of these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cluster {
    pub id: ClusterId,
    pub credential_id: CredentialId,
    #[serde(rename = "type")]
    pub cluster_type: ClusterType,
    pub state: ClusterState,
    pub num_instances: u32,
    pub controller_key: String,
    #[serde(default)]
    pub controller_pin: Option<String>,
    pub dashboard_login_token: String,
    #[serde(default)]
    pub ca_cert: Option<String>,
    pub ssh_key_name: String,
    pub vpc_cidr: String,
    pub subnet_cidr: String,
    pub discovery_token: String,
    #[serde(default)]
    pub dns_zone_id: Option<String>,
    #[serde(default)]
    pub domain: Option<Domain>,
}

impl Cluster {
    /// Attach the cluster's domain. A domain, once attached, never changes.
    pub fn attach_domain(&mut self, domain: Domain) -> Result<(), SchemaError> {
        if self.domain.is_some() {
            return Err(SchemaError::DomainAlreadyAttached(self.id.to_string()));
        }
        if domain.name.is_empty() {
            return Err(SchemaError::MissingField("domain.name"));
        }
        self.domain = Some(domain);
        Ok(())
    }
}

/// A stored (id, secret) credential pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub id: CredentialId,
    pub secret: String,
}
