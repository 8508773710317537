use crate::db::{Database, Row, Statement, Transaction};
use crate::rows;
use crate::schema::{AWS_CLUSTERS, CLUSTERS, CREDENTIALS, DOMAINS};
use crate::StoreError;
use serde_json::Value;
use std::sync::{RwLock, RwLockReadGuard};
use stratus_schema::{AwsCluster, Cluster, ClusterId, ClusterState, Credential, CredentialId, Domain};
use tracing::{debug, warn};

/// Marshals clusters, domains and credentials into rows of a [`Database`].
///
/// Writes take the persistence lock exclusively and run in one transaction;
/// reads share it. The lock is never held while any other installer lock is
/// taken.
pub struct PersistenceGateway {
    db: Box<dyn Database>,
    lock: RwLock<()>,
}

impl PersistenceGateway {
    pub fn new(db: Box<dyn Database>) -> Self {
        Self {
            db,
            lock: RwLock::new(()),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.db.name()
    }

    /// Run `body` in a transaction. Commits on success; on failure rolls
    /// back and returns the body's error even if the rollback fails too.
    fn write<'a, T>(
        &'a self,
        what: &str,
        body: impl FnOnce(&mut (dyn Transaction + 'a)) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self
            .lock
            .write()
            .map_err(|_| StoreError::poisoned("persistence"))?;
        let mut tx = self.db.begin()?;
        match body(tx.as_mut()) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback() {
                    warn!("rollback of {what} failed: {rb}");
                }
                Err(e)
            }
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, ()>, StoreError> {
        self.lock
            .read()
            .map_err(|_| StoreError::poisoned("persistence"))
    }

    /// Insert the generic and AWS rows of a new cluster (and its domain, if
    /// already attached) atomically.
    pub fn save_aws_cluster(&self, aws: &AwsCluster) -> Result<(), StoreError> {
        let cluster_row = rows::cluster_row(&aws.cluster)?;
        let aws_row = rows::aws_cluster_row(aws)?;
        let domain_row = match &aws.cluster.domain {
            Some(domain) => Some(rows::domain_row(aws.id(), domain)?),
            None => None,
        };

        self.write("save cluster", |tx| {
            tx.exec(&Statement::insert(CLUSTERS.name, cluster_row))?;
            tx.exec(&Statement::insert(AWS_CLUSTERS.name, aws_row))?;
            if let Some(row) = domain_row {
                tx.exec(&Statement::insert(DOMAINS.name, row))?;
            }
            Ok(())
        })?;
        debug!("saved cluster {} to {}", aws.id(), self.db.name());
        Ok(())
    }

    /// Store a credential. An id that is already taken is rejected with
    /// [`StoreError::Duplicate`]; secrets are never overwritten.
    pub fn save_credentials(&self, id: &CredentialId, secret: &str) -> Result<(), StoreError> {
        let row = rows::credential_row(&Credential {
            id: id.clone(),
            secret: secret.to_owned(),
        })?;
        self.write("save credentials", |tx| {
            tx.exec(&Statement::insert(CREDENTIALS.name, row))
                .map(|_| ())
        })
    }

    pub fn find_credential_secret(&self, id: &str) -> Result<String, StoreError> {
        let _guard = self.read()?;
        let row = self
            .db
            .query_row(CREDENTIALS.name, "id", &Value::from(id))
            .map_err(|e| not_found(e, "credential", id))?;
        match row.get("secret") {
            Some(Value::String(secret)) => Ok(secret.clone()),
            _ => Err(StoreError::CorruptRow {
                table: CREDENTIALS.name.to_owned(),
                reason: format!("credential '{id}' has no secret"),
            }),
        }
    }

    /// The generic cluster with its domain, if one has been attached.
    pub fn find_cluster(&self, id: &str) -> Result<Cluster, StoreError> {
        let _guard = self.read()?;
        self.load_cluster(id)
    }

    pub fn find_aws_cluster(&self, id: &str) -> Result<AwsCluster, StoreError> {
        let _guard = self.read()?;
        let cluster = self.load_cluster(id)?;
        self.load_aws(cluster)
    }

    /// Every stored cluster, each paired with its own load result so that
    /// one corrupt row does not hide the others. Fails as a whole only when
    /// the clusters table itself cannot be read.
    pub fn list_aws_clusters(
        &self,
    ) -> Result<Vec<(ClusterId, Result<AwsCluster, StoreError>)>, StoreError> {
        let _guard = self.read()?;
        let mut out = Vec::new();
        for row in self.db.scan(CLUSTERS.name)? {
            let id = match CLUSTERS.key_of(&row) {
                Ok(key) => ClusterId::new(key),
                Err(e) => {
                    warn!("skipping cluster row without a key: {e}");
                    continue;
                }
            };
            let loaded = self
                .load_domain(&id)
                .and_then(|domain| rows::cluster_from_row(row, domain))
                .and_then(|cluster| self.load_aws(cluster));
            out.push((id, loaded));
        }
        Ok(out)
    }

    pub fn save_domain(&self, cluster_id: &str, domain: &Domain) -> Result<(), StoreError> {
        let row = rows::domain_row(cluster_id, domain)?;
        self.write("save domain", |tx| {
            tx.exec(&Statement::insert(DOMAINS.name, row)).map(|_| ())
        })
    }

    /// Set the persisted state of a cluster.
    ///
    /// With `expected` set this is a compare-and-set: the row only changes
    /// if it is currently in that state, otherwise
    /// [`StoreError::GuardMismatch`].
    pub fn transition_state(
        &self,
        id: &str,
        expected: Option<ClusterState>,
        to: ClusterState,
    ) -> Result<(), StoreError> {
        let mut stmt = Statement::update(CLUSTERS.name, id, rows::state_row(to));
        if let Some(from) = expected {
            stmt = stmt.guarded("state", from.as_str());
        }
        let affected = self.write("state transition", |tx| tx.exec(&stmt))?;
        if affected > 0 {
            debug!("cluster {id} persisted as {to}");
            return Ok(());
        }

        let _guard = self.read()?;
        let current = self
            .db
            .query_row(CLUSTERS.name, "id", &Value::from(id))
            .map_err(|e| not_found(e, "cluster", id))?;
        Err(StoreError::GuardMismatch {
            table: CLUSTERS.name.to_owned(),
            key: id.to_owned(),
            reason: format!(
                "expected state {}, found {}",
                expected.map_or("any", ClusterState::as_str),
                current.get("state").and_then(Value::as_str).unwrap_or("?")
            ),
        })
    }

    /// Persist what provisioning learned about a cluster: stack id, image,
    /// controller pin, CA certificate and DNS zone.
    pub fn record_aws_outputs(&self, aws: &AwsCluster) -> Result<(), StoreError> {
        let id = aws.id().to_string();
        let mut generic = Row::new();
        generic.insert("controller_pin".to_owned(), opt(&aws.cluster.controller_pin));
        generic.insert("ca_cert".to_owned(), opt(&aws.cluster.ca_cert));
        generic.insert("dns_zone_id".to_owned(), opt(&aws.cluster.dns_zone_id));
        let mut specific = Row::new();
        specific.insert("stack_id".to_owned(), opt(&aws.stack_id));
        specific.insert("image_id".to_owned(), opt(&aws.image_id));

        let affected = self.write("record outputs", |tx| {
            let a = tx.exec(&Statement::update(CLUSTERS.name, id.as_str(), generic))?;
            let b = tx.exec(&Statement::update(AWS_CLUSTERS.name, id.as_str(), specific))?;
            Ok(a.min(b))
        })?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                kind: "cluster",
                id,
            });
        }
        Ok(())
    }

    fn load_cluster(&self, id: &str) -> Result<Cluster, StoreError> {
        let row = self
            .db
            .query_row(CLUSTERS.name, "id", &Value::from(id))
            .map_err(|e| not_found(e, "cluster", id))?;
        let domain = self.load_domain(id)?;
        rows::cluster_from_row(row, domain)
    }

    fn load_domain(&self, cluster_id: &str) -> Result<Option<Domain>, StoreError> {
        match self
            .db
            .query_row(DOMAINS.name, "cluster_id", &Value::from(cluster_id))
        {
            Ok(row) => rows::domain_from_row(row).map(Some),
            Err(StoreError::NoRows { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn load_aws(&self, cluster: Cluster) -> Result<AwsCluster, StoreError> {
        let row = self
            .db
            .query_row(AWS_CLUSTERS.name, "cluster_id", &Value::from(cluster.id.as_str()))
            .map_err(|e| not_found(e, "aws cluster", &cluster.id))?;
        rows::aws_cluster_from_rows(cluster, row)
    }
}

fn not_found(err: StoreError, kind: &'static str, id: &str) -> StoreError {
    match err {
        StoreError::NoRows { .. } => StoreError::NotFound {
            kind,
            id: id.to_owned(),
        },
        other => other,
    }
}

fn opt(value: &Option<String>) -> Value {
    value.clone().map_or(Value::Null, Value::String)
}
