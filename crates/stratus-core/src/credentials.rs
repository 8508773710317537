use crate::InstallerError;
use std::fmt;
use std::sync::Arc;
use stratus_provider::{env_credential_source, Credentials, EnvCredentialSource};
use stratus_schema::{CredentialId, SchemaError};
use stratus_store::PersistenceGateway;
use tracing::debug;

/// Cloud credentials by id.
///
/// One id is reserved: it resolves from the process environment on every
/// lookup and is never read from or written to storage.
pub struct CredentialStore {
    gateway: Arc<PersistenceGateway>,
    reserved: CredentialId,
    env: EnvCredentialSource,
}

impl CredentialStore {
    pub fn new(gateway: Arc<PersistenceGateway>, reserved: impl Into<CredentialId>) -> Self {
        Self::with_env_source(gateway, reserved, env_credential_source())
    }

    pub fn with_env_source(
        gateway: Arc<PersistenceGateway>,
        reserved: impl Into<CredentialId>,
        env: EnvCredentialSource,
    ) -> Self {
        Self {
            gateway,
            reserved: reserved.into(),
            env,
        }
    }

    pub fn reserved_id(&self) -> &CredentialId {
        &self.reserved
    }

    pub fn is_reserved(&self, id: &str) -> bool {
        self.reserved.as_str() == id
    }

    pub fn find(&self, id: &str) -> Result<Credentials, InstallerError> {
        if self.is_reserved(id) {
            debug!("credential {id} resolved from environment");
            return Ok((self.env)()?);
        }
        match self.gateway.find_credential_secret(id) {
            Ok(secret) => Ok(Credentials::Stored {
                id: CredentialId::new(id),
                secret,
            }),
            Err(e) if e.is_not_found() => Err(InstallerError::CredentialNotFound(id.into())),
            Err(e) => Err(e.into()),
        }
    }

    /// Store a secret under `id`. The reserved id and ids already in use
    /// are refused.
    pub fn save(&self, id: &CredentialId, secret: &str) -> Result<(), InstallerError> {
        if id.as_str().trim().is_empty() {
            return Err(SchemaError::MissingField("credential_id").into());
        }
        if secret.is_empty() {
            return Err(SchemaError::MissingField("secret").into());
        }
        if self.is_reserved(id) {
            return Err(SchemaError::InvalidField {
                field: "credential_id",
                reason: format!("'{id}' is reserved for environment credentials"),
            }
            .into());
        }
        self.gateway.save_credentials(id, secret)?;
        debug!("credential {id} saved");
        Ok(())
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("backend", &self.gateway.backend())
            .field("reserved", &self.reserved)
            .finish_non_exhaustive()
    }
}
