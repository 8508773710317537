use crate::aws::{AwsApi, AwsProvisioner};
use crate::credentials::Credentials;
use crate::ProvisionError;
use std::sync::Arc;
use stratus_schema::{AwsCluster, ClusterId, ClusterType, Domain};

/// What a provisioner is asked to bring up, one variant per provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionTarget {
    Aws(AwsCluster),
}

/// Facts learned while provisioning. Unset fields leave the cluster as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionOutput {
    pub stack_id: Option<String>,
    pub image_id: Option<String>,
    pub ca_cert: Option<String>,
    pub controller_pin: Option<String>,
    pub dns_zone_id: Option<String>,
}

impl ProvisionOutput {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Callbacks a provisioner reports through. Implemented by the installer for
/// each provisioning task.
pub trait ProvisionContext: Send + Sync {
    fn cluster_id(&self) -> &ClusterId;

    /// Snapshot of the cluster being provisioned.
    fn target(&self) -> ProvisionTarget;

    fn credentials(&self) -> Result<Credentials, ProvisionError>;

    /// Emit a progress message for subscribers.
    fn log(&self, message: &str);

    fn record_output(&self, output: ProvisionOutput) -> Result<(), ProvisionError>;

    fn attach_domain(&self, domain: Domain) -> Result<(), ProvisionError>;

    /// True once cancellation has been requested for this task.
    fn cancelled(&self) -> bool;
}

pub trait Provisioner: Send + Sync {
    fn cluster_type(&self) -> ClusterType;

    /// Bring the target up. Returning `Ok` means the cluster is ready.
    fn run(&self, ctx: &dyn ProvisionContext) -> Result<(), ProvisionError>;
}

pub fn provisioner_for(cluster_type: ClusterType, aws: &Arc<dyn AwsApi>) -> Box<dyn Provisioner> {
    match cluster_type {
        ClusterType::Aws => Box::new(AwsProvisioner::new(Arc::clone(aws))),
    }
}
