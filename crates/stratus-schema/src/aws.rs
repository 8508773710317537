use crate::cidr::Ipv4Cidr;
use crate::cluster::{Cluster, ClusterState, ClusterType};
use crate::token::{generate_cluster_id, generate_token};
use crate::types::{ClusterId, CredentialId};
use crate::SchemaError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_INSTANCE_TYPE: &str = "m3.medium";
pub const DEFAULT_VPC_CIDR: &str = "10.0.0.0/16";
pub const DEFAULT_SUBNET_CIDR: &str = "10.0.0.0/21";
pub const DEFAULT_SSH_KEY_NAME: &str = "stratus";
pub const MAX_INSTANCES: u32 = 12;

/// An AWS cluster: exactly one generic [`Cluster`] plus the AWS-only fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AwsCluster {
    pub cluster: Cluster,
    pub region: String,
    pub instance_type: String,
    pub stack_name: String,
    #[serde(default)]
    pub stack_id: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
}

impl AwsCluster {
    pub fn id(&self) -> &ClusterId {
        &self.cluster.id
    }
}

/// Launch parameters for an AWS cluster, as submitted by a caller.
///
/// Everything except `credential_id` has a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AwsLaunchRequest {
    #[serde(default)]
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub credential_id: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub num_instances: Option<u32>,
    #[serde(default)]
    pub vpc_cidr: Option<String>,
    #[serde(default)]
    pub subnet_cidr: Option<String>,
    #[serde(default)]
    pub ssh_key_name: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
}

fn validate_cluster_id(id: &str) -> Result<(), SchemaError> {
    let invalid = |reason: &str| SchemaError::InvalidField {
        field: "cluster_id",
        reason: format!("'{id}': {reason}"),
    };
    if id.is_empty() || id.len() > 63 {
        return Err(invalid("must be 1-63 characters"));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(invalid("must match [a-z0-9-]"));
    }
    if id.starts_with('-') {
        return Err(invalid("must not start with '-'"));
    }
    Ok(())
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v.trim().to_owned(),
        _ => default.to_owned(),
    }
}

impl AwsLaunchRequest {
    pub fn new(credential_id: impl Into<String>) -> Self {
        Self {
            credential_id: credential_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_cluster_id(mut self, id: impl Into<String>) -> Self {
        self.cluster_id = Some(id.into());
        self
    }

    /// Validate the request and fill in defaults, producing the cluster that
    /// will be persisted. Nothing is written anywhere on failure.
    pub fn validate_and_default(self) -> Result<AwsCluster, SchemaError> {
        let credential_id = self.credential_id.trim();
        if credential_id.is_empty() {
            return Err(SchemaError::MissingField("credential_id"));
        }

        let id = match self.cluster_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => {
                validate_cluster_id(id)?;
                ClusterId::new(id)
            }
            _ => generate_cluster_id(),
        };

        let num_instances = self.num_instances.unwrap_or(1);
        if !(num_instances == 1 || (3..=MAX_INSTANCES).contains(&num_instances)) {
            return Err(SchemaError::InvalidField {
                field: "num_instances",
                reason: format!("{num_instances}: must be 1 or 3-{MAX_INSTANCES}"),
            });
        }

        let vpc_cidr = non_empty_or(self.vpc_cidr, DEFAULT_VPC_CIDR);
        let subnet_cidr = non_empty_or(self.subnet_cidr, DEFAULT_SUBNET_CIDR);
        let vpc = Ipv4Cidr::parse("vpc_cidr", &vpc_cidr)?;
        let subnet = Ipv4Cidr::parse("subnet_cidr", &subnet_cidr)?;
        if !vpc.contains(&subnet) {
            return Err(SchemaError::InvalidField {
                field: "subnet_cidr",
                reason: format!("{subnet_cidr} is not inside vpc {vpc_cidr}"),
            });
        }

        let cluster = Cluster {
            id: id.clone(),
            credential_id: CredentialId::new(credential_id),
            cluster_type: ClusterType::Aws,
            state: ClusterState::Validating,
            num_instances,
            controller_key: generate_token(40),
            controller_pin: None,
            dashboard_login_token: generate_token(32),
            ca_cert: None,
            ssh_key_name: non_empty_or(self.ssh_key_name, DEFAULT_SSH_KEY_NAME),
            vpc_cidr,
            subnet_cidr,
            discovery_token: generate_token(32),
            dns_zone_id: None,
            domain: None,
        };

        Ok(AwsCluster {
            stack_name: id.to_string(),
            cluster,
            region: non_empty_or(self.region, DEFAULT_REGION),
            instance_type: non_empty_or(self.instance_type, DEFAULT_INSTANCE_TYPE),
            stack_id: None,
            image_id: self.image_id.filter(|s| !s.trim().is_empty()),
        })
    }
}
