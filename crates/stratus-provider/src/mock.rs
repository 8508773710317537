use crate::aws::{AwsApi, AwsStep, BootstrapOutput, StackInfo};
use crate::credentials::Credentials;
use crate::ProvisionError;
use std::sync::{Condvar, Mutex};
use stratus_schema::{AwsCluster, ClusterId, Domain};

fn digest(parts: &[&str]) -> String {
    blake3::hash(parts.join(":").as_bytes()).to_hex().to_string()
}

/// Deterministic in-memory AWS.
///
/// Outputs are derived from the cluster id so runs are repeatable. A step
/// can be made to fail, and [`hold`](Self::hold) parks every
/// `wait_for_stack` call until [`release`](Self::release), which keeps
/// provisioning open for as long as a test needs.
#[derive(Default)]
pub struct MockAws {
    fail_at: Mutex<Option<AwsStep>>,
    calls: Mutex<Vec<(ClusterId, AwsStep)>>,
    held: Mutex<bool>,
    gate: Condvar,
}

impl MockAws {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(step: AwsStep) -> Self {
        let mock = Self::default();
        mock.fail_at(Some(step));
        mock
    }

    pub fn fail_at(&self, step: Option<AwsStep>) {
        if let Ok(mut fail_at) = self.fail_at.lock() {
            *fail_at = step;
        }
    }

    pub fn hold(&self) {
        if let Ok(mut held) = self.held.lock() {
            *held = true;
        }
    }

    pub fn release(&self) {
        if let Ok(mut held) = self.held.lock() {
            *held = false;
        }
        self.gate.notify_all();
    }

    /// Every step attempted so far, in call order.
    pub fn calls(&self) -> Vec<(ClusterId, AwsStep)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn steps_for(&self, id: &str) -> Vec<AwsStep> {
        self.calls()
            .into_iter()
            .filter(|(cid, _)| cid == id)
            .map(|(_, step)| step)
            .collect()
    }

    fn enter(&self, id: &ClusterId, step: AwsStep) -> Result<(), ProvisionError> {
        self.calls
            .lock()
            .map_err(|_| ProvisionError::api(step, "mock call log poisoned"))?
            .push((id.clone(), step));
        let fail_at = *self
            .fail_at
            .lock()
            .map_err(|_| ProvisionError::api(step, "mock fault switch poisoned"))?;
        if fail_at == Some(step) {
            return Err(ProvisionError::api(step, "injected failure"));
        }
        Ok(())
    }

    fn wait_for_release(&self) -> Result<(), ProvisionError> {
        let poisoned = |_| ProvisionError::api(AwsStep::WaitForStack, "mock gate poisoned");
        let mut held = self.held.lock().map_err(poisoned)?;
        while *held {
            held = self.gate.wait(held).map_err(poisoned)?;
        }
        Ok(())
    }
}

impl AwsApi for MockAws {
    fn create_key_pair(
        &self,
        _creds: &Credentials,
        _region: &str,
        name: &str,
    ) -> Result<(), ProvisionError> {
        // Key pairs are not per cluster; the call is attributed to the key name.
        self.enter(&ClusterId::new(name), AwsStep::CreateKeyPair)
    }

    fn create_stack(
        &self,
        _creds: &Credentials,
        cluster: &AwsCluster,
    ) -> Result<StackInfo, ProvisionError> {
        self.enter(cluster.id(), AwsStep::CreateStack)?;
        let hash = digest(&["stack", cluster.id().as_str()]);
        Ok(StackInfo {
            stack_id: format!(
                "arn:aws:cloudformation:{}:000000000000:stack/{}/{}",
                cluster.region,
                cluster.stack_name,
                &hash[..12]
            ),
            image_id: cluster
                .image_id
                .clone()
                .unwrap_or_else(|| format!("ami-{}", &hash[12..20])),
        })
    }

    fn wait_for_stack(
        &self,
        _creds: &Credentials,
        _region: &str,
        stack_id: &str,
    ) -> Result<String, ProvisionError> {
        let name = stack_id.rsplit('/').nth(1).unwrap_or(stack_id);
        self.enter(&ClusterId::new(name), AwsStep::WaitForStack)?;
        self.wait_for_release()?;
        Ok(format!("Z{}", digest(&["zone", stack_id])[..13].to_uppercase()))
    }

    fn bootstrap(
        &self,
        _creds: &Credentials,
        cluster: &AwsCluster,
    ) -> Result<BootstrapOutput, ProvisionError> {
        self.enter(cluster.id(), AwsStep::Bootstrap)?;
        let hash = digest(&["bootstrap", cluster.id().as_str()]);
        let pin: String = hash
            .bytes()
            .filter(u8::is_ascii_digit)
            .chain(std::iter::repeat(b'0'))
            .take(6)
            .map(char::from)
            .collect();
        Ok(BootstrapOutput {
            ca_cert: format!(
                "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
                &hash[..48]
            ),
            controller_pin: pin,
        })
    }

    fn allocate_domain(&self, cluster: &AwsCluster) -> Result<Domain, ProvisionError> {
        self.enter(cluster.id(), AwsStep::AllocateDomain)?;
        let hash = digest(&["domain", cluster.id().as_str()]);
        Ok(Domain {
            name: format!("{}.stratus.example", &hash[..8]),
            token: hash[8..40].to_owned(),
        })
    }
}
