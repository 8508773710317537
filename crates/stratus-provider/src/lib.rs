//! Provider provisioning for Stratus clusters.
//!
//! This crate implements the provider side of a launch: the `Provisioner`
//! trait and the `ProvisionContext` callbacks it reports through, the AWS
//! workflow (`AwsProvisioner`) over a narrow `AwsApi` seam, a deterministic
//! `MockAws`, and cloud credential resolution from the environment.

pub mod aws;
pub mod context;
pub mod credentials;
pub mod mock;

pub use aws::{AwsApi, AwsProvisioner, AwsStep, BootstrapOutput, OfflineAws, StackInfo};
pub use context::{provisioner_for, ProvisionContext, ProvisionOutput, ProvisionTarget, Provisioner};
pub use credentials::{
    credentials_from, env_credential_source, env_credentials, Credentials, EnvCredentialSource,
};
pub use mock::MockAws;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),
    #[error("credential '{0}' not found")]
    NotFound(String),
    #[error("credential lookup failed: {0}")]
    Lookup(String),
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{step} failed: {reason}")]
    Api { step: AwsStep, reason: String },
    #[error("provisioning cancelled before {0}")]
    Cancelled(AwsStep),
    #[error("credentials unavailable: {0}")]
    Credential(#[from] CredentialError),
    /// The installer could not apply something the provider reported.
    #[error("provisioning context error: {0}")]
    Context(String),
}

impl ProvisionError {
    pub fn api(step: AwsStep, reason: impl Into<String>) -> Self {
        ProvisionError::Api {
            step,
            reason: reason.into(),
        }
    }
}
