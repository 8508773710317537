use crate::context::{ProvisionContext, ProvisionOutput, ProvisionTarget, Provisioner};
use crate::credentials::Credentials;
use crate::ProvisionError;
use std::fmt;
use std::sync::Arc;
use stratus_schema::{AwsCluster, ClusterType, Domain};
use tracing::{debug, info};

/// One step of the AWS launch workflow, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AwsStep {
    CreateKeyPair,
    CreateStack,
    WaitForStack,
    Bootstrap,
    AllocateDomain,
}

impl AwsStep {
    pub const ALL: [AwsStep; 5] = [
        AwsStep::CreateKeyPair,
        AwsStep::CreateStack,
        AwsStep::WaitForStack,
        AwsStep::Bootstrap,
        AwsStep::AllocateDomain,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AwsStep::CreateKeyPair => "create_key_pair",
            AwsStep::CreateStack => "create_stack",
            AwsStep::WaitForStack => "wait_for_stack",
            AwsStep::Bootstrap => "bootstrap",
            AwsStep::AllocateDomain => "allocate_domain",
        }
    }

    fn progress(self) -> &'static str {
        match self {
            AwsStep::CreateKeyPair => "creating key pair",
            AwsStep::CreateStack => "creating stack",
            AwsStep::WaitForStack => "waiting for stack to complete",
            AwsStep::Bootstrap => "bootstrapping controller",
            AwsStep::AllocateDomain => "allocating domain",
        }
    }
}

impl fmt::Display for AwsStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackInfo {
    pub stack_id: String,
    pub image_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapOutput {
    pub ca_cert: String,
    pub controller_pin: String,
}

/// The slice of AWS the launch workflow needs.
pub trait AwsApi: Send + Sync {
    fn create_key_pair(
        &self,
        creds: &Credentials,
        region: &str,
        name: &str,
    ) -> Result<(), ProvisionError>;

    fn create_stack(
        &self,
        creds: &Credentials,
        cluster: &AwsCluster,
    ) -> Result<StackInfo, ProvisionError>;

    /// Block until the stack settles. Returns the DNS zone id it created.
    fn wait_for_stack(
        &self,
        creds: &Credentials,
        region: &str,
        stack_id: &str,
    ) -> Result<String, ProvisionError>;

    fn bootstrap(
        &self,
        creds: &Credentials,
        cluster: &AwsCluster,
    ) -> Result<BootstrapOutput, ProvisionError>;

    fn allocate_domain(&self, cluster: &AwsCluster) -> Result<Domain, ProvisionError>;
}

/// An `AwsApi` for installers started without a cloud client. Every call
/// fails, so launches end in `failed` with the reason in an error event.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineAws;

impl OfflineAws {
    fn refuse<T>(step: AwsStep) -> Result<T, ProvisionError> {
        Err(ProvisionError::api(step, "no AWS API configured"))
    }
}

impl AwsApi for OfflineAws {
    fn create_key_pair(&self, _: &Credentials, _: &str, _: &str) -> Result<(), ProvisionError> {
        Self::refuse(AwsStep::CreateKeyPair)
    }

    fn create_stack(&self, _: &Credentials, _: &AwsCluster) -> Result<StackInfo, ProvisionError> {
        Self::refuse(AwsStep::CreateStack)
    }

    fn wait_for_stack(&self, _: &Credentials, _: &str, _: &str) -> Result<String, ProvisionError> {
        Self::refuse(AwsStep::WaitForStack)
    }

    fn bootstrap(
        &self,
        _: &Credentials,
        _: &AwsCluster,
    ) -> Result<BootstrapOutput, ProvisionError> {
        Self::refuse(AwsStep::Bootstrap)
    }

    fn allocate_domain(&self, _: &AwsCluster) -> Result<Domain, ProvisionError> {
        Self::refuse(AwsStep::AllocateDomain)
    }
}

/// Runs the AWS launch workflow, checking for cancellation between steps.
pub struct AwsProvisioner {
    api: Arc<dyn AwsApi>,
}

impl AwsProvisioner {
    pub fn new(api: Arc<dyn AwsApi>) -> Self {
        Self { api }
    }

    fn begin(ctx: &dyn ProvisionContext, step: AwsStep) -> Result<(), ProvisionError> {
        if ctx.cancelled() {
            return Err(ProvisionError::Cancelled(step));
        }
        debug!("cluster {}: {step}", ctx.cluster_id());
        ctx.log(step.progress());
        Ok(())
    }
}

impl Provisioner for AwsProvisioner {
    fn cluster_type(&self) -> ClusterType {
        ClusterType::Aws
    }

    fn run(&self, ctx: &dyn ProvisionContext) -> Result<(), ProvisionError> {
        let ProvisionTarget::Aws(mut cluster) = ctx.target();
        let creds = ctx.credentials()?;

        Self::begin(ctx, AwsStep::CreateKeyPair)?;
        self.api
            .create_key_pair(&creds, &cluster.region, &cluster.cluster.ssh_key_name)?;

        Self::begin(ctx, AwsStep::CreateStack)?;
        let stack = self.api.create_stack(&creds, &cluster)?;
        cluster.stack_id = Some(stack.stack_id.clone());
        cluster.image_id = Some(stack.image_id.clone());
        ctx.record_output(ProvisionOutput {
            stack_id: Some(stack.stack_id.clone()),
            image_id: Some(stack.image_id),
            ..ProvisionOutput::default()
        })?;

        Self::begin(ctx, AwsStep::WaitForStack)?;
        let zone = self
            .api
            .wait_for_stack(&creds, &cluster.region, &stack.stack_id)?;
        cluster.cluster.dns_zone_id = Some(zone.clone());
        ctx.record_output(ProvisionOutput {
            dns_zone_id: Some(zone),
            ..ProvisionOutput::default()
        })?;

        Self::begin(ctx, AwsStep::Bootstrap)?;
        let boot = self.api.bootstrap(&creds, &cluster)?;
        ctx.record_output(ProvisionOutput {
            ca_cert: Some(boot.ca_cert),
            controller_pin: Some(boot.controller_pin),
            ..ProvisionOutput::default()
        })?;

        Self::begin(ctx, AwsStep::AllocateDomain)?;
        let domain = self.api.allocate_domain(&cluster)?;
        ctx.attach_domain(domain)?;

        info!("cluster {} provisioned", ctx.cluster_id());
        Ok(())
    }
}
