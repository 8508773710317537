use crate::concurrency::DataDirLock;
use crate::config::InstallerConfig;
use crate::credentials::CredentialStore;
use crate::events::{EventLog, Subscription, SubscriptionId, SubscriptionSet};
use crate::lifecycle::validate_transition;
use crate::registry::{ClusterRegistry, ProviderCluster};
use crate::tasks::{ProvisionTasks, TaskHandle, TaskStatus};
use crate::InstallerError;
use std::fmt;
use std::sync::Arc;
use stratus_provider::{
    provisioner_for, AwsApi, CredentialError, Credentials, EnvCredentialSource, OfflineAws,
    ProvisionContext, ProvisionError, ProvisionOutput, ProvisionTarget,
};
use stratus_schema::{
    AwsCluster, Cluster, ClusterId, ClusterState, CredentialId, Domain, Event, EventId, EventKind,
    LaunchRequest,
};
use stratus_store::{open_database, DataLayout, Database, PersistenceGateway, StorageKind, StoreError};
use tracing::{debug, info, warn};

/// What startup reconciliation did with each stored cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Ready or failed clusters registered as they were.
    pub restored: Vec<ClusterId>,
    /// Clusters whose provisioning died with the previous process, now failed.
    pub interrupted: Vec<ClusterId>,
    /// Clusters being deleted; left out of the registry.
    pub deleting: Vec<ClusterId>,
    /// Rows that could not be loaded.
    pub skipped: Vec<ClusterId>,
}

impl ReconcileReport {
    pub fn registered(&self) -> usize {
        self.restored.len() + self.interrupted.len()
    }
}

struct Inner {
    config: InstallerConfig,
    gateway: Arc<PersistenceGateway>,
    registry: ClusterRegistry,
    events: Arc<EventLog>,
    subscriptions: SubscriptionSet,
    credentials: CredentialStore,
    tasks: ProvisionTasks,
    aws: Arc<dyn AwsApi>,
    reconciled: ReconcileReport,
    span: tracing::Span,
    // Held until the last clone and the last provisioning task are gone.
    _lock: Option<DataDirLock>,
}

/// Entry point for launching, finding and deleting clusters.
///
/// Cheap to clone; clones share one registry, event log and database.
/// Provisioning runs on a background thread per cluster and reports back
/// only through cluster state and events.
#[derive(Clone)]
pub struct Installer {
    inner: Arc<Inner>,
}

/// Configures how an [`Installer`] reaches the outside world before it is
/// opened.
pub struct InstallerBuilder {
    config: InstallerConfig,
    aws: Option<Arc<dyn AwsApi>>,
    env: Option<EnvCredentialSource>,
    database: Option<Box<dyn Database>>,
}

impl InstallerBuilder {
    /// The AWS client provisioning runs against. Defaults to [`OfflineAws`].
    #[must_use]
    pub fn aws_api(mut self, api: Arc<dyn AwsApi>) -> Self {
        self.aws = Some(api);
        self
    }

    /// Where the reserved credential id resolves from. Defaults to the
    /// process environment.
    #[must_use]
    pub fn env_credentials(mut self, source: EnvCredentialSource) -> Self {
        self.env = Some(source);
        self
    }

    /// Use `db` instead of opening one from the config. No data-dir lock is
    /// taken.
    #[must_use]
    pub fn database(mut self, db: Box<dyn Database>) -> Self {
        self.database = Some(db);
        self
    }

    pub fn open(self) -> Result<Installer, InstallerError> {
        let Self {
            config,
            aws,
            env,
            database,
        } = self;
        let path = config.data_dir.display().to_string();
        let open_error = |reason: String| InstallerError::Open {
            path: path.clone(),
            reason,
        };
        let layout = DataLayout::new(&config.data_dir);
        let span = tracing::info_span!("installer", data_dir = %config.data_dir.display());
        let _entered = span.enter();

        let (db, lock) = match database {
            Some(db) => (db, None),
            None => {
                let lock = if config.storage == StorageKind::File {
                    Some(DataDirLock::try_acquire(&layout)?)
                } else {
                    None
                };
                let db = open_database(config.storage, &layout)
                    .map_err(|e| open_error(e.to_string()))?;
                (db, lock)
            }
        };

        let gateway = Arc::new(PersistenceGateway::new(db));
        let credentials = match env {
            Some(source) => CredentialStore::with_env_source(
                Arc::clone(&gateway),
                config.env_credential_id.as_str(),
                source,
            ),
            None => CredentialStore::new(Arc::clone(&gateway), config.env_credential_id.as_str()),
        };
        let events = Arc::new(EventLog::new());
        let mut inner = Inner {
            subscriptions: SubscriptionSet::new(Arc::clone(&events)),
            events,
            registry: ClusterRegistry::new(),
            tasks: ProvisionTasks::new(),
            aws: aws.unwrap_or_else(|| Arc::new(OfflineAws)),
            reconciled: ReconcileReport::default(),
            span: span.clone(),
            credentials,
            gateway,
            _lock: lock,
            config,
        };

        if inner.config.reconcile_on_start {
            inner.reconciled = inner.reconcile().map_err(|e| open_error(e.to_string()))?;
        }
        info!(
            "installer opened on {} storage at {} ({} clusters registered)",
            inner.gateway.backend(),
            inner.config.data_dir.display(),
            inner.registry.len()
        );
        Ok(Installer {
            inner: Arc::new(inner),
        })
    }
}

impl Installer {
    pub fn builder(config: InstallerConfig) -> InstallerBuilder {
        InstallerBuilder {
            config,
            aws: None,
            env: None,
            database: None,
        }
    }

    /// Open an installer with the default AWS client and environment
    /// credentials. Failing to open storage is the only fatal error.
    pub fn open(config: InstallerConfig) -> Result<Self, InstallerError> {
        Self::builder(config).open()
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.inner.config
    }

    pub fn reconcile_report(&self) -> &ReconcileReport {
        &self.inner.reconciled
    }

    /// Validate, persist and register a new cluster, then start provisioning
    /// it in the background. Returns as soon as the cluster is registered;
    /// provisioning failures show up only as state and events.
    pub fn launch_cluster(&self, request: LaunchRequest) -> Result<ClusterId, InstallerError> {
        let _span = self.inner.span.enter();
        let LaunchRequest::Aws(request) = request;
        let mut aws = request.validate_and_default()?;
        let id = aws.id().clone();
        info!("launching cluster {id}");

        validate_transition(aws.cluster.state, ClusterState::Persisted)?;
        aws.cluster.state = ClusterState::Persisted;
        self.inner.gateway.save_aws_cluster(&aws)?;

        validate_transition(aws.cluster.state, ClusterState::Registered)?;
        aws.cluster.state = ClusterState::Registered;
        let entry = ProviderCluster::aws(aws);
        if let Err(e) = self.inner.registry.register(entry.clone()) {
            let marked = self.inner.gateway.transition_state(
                &id,
                Some(ClusterState::Persisted),
                ClusterState::Failed,
            );
            if let Err(mark) = marked {
                warn!("cannot mark unregistered cluster {id} failed: {mark}");
            }
            return Err(e);
        }
        self.inner
            .events
            .emit(Event::new(EventKind::NewCluster, id.clone()).with_cluster(entry.snapshot()));

        let inner = Arc::clone(&self.inner);
        let task_entry = entry.clone();
        let spawned = self.inner.tasks.spawn(id.clone(), move |handle| {
            let _span =
                tracing::info_span!(parent: &inner.span, "provision", cluster = %handle.cluster_id())
                    .entered();
            inner.provision(&task_entry, handle)
        });
        if let Err(e) = spawned {
            self.inner
                .abandon(&entry, &format!("cannot start provisioning: {e}"));
        }
        Ok(id)
    }

    pub fn launch_cluster_json(&self, request: &str) -> Result<ClusterId, InstallerError> {
        self.launch_cluster(LaunchRequest::from_json(request)?)
    }

    /// Look a cluster up in the registry, falling back to storage for
    /// clusters that are no longer registered.
    pub fn find_cluster(&self, id: &str) -> Result<Cluster, InstallerError> {
        let _span = self.inner.span.enter();
        match self.inner.registry.find(id) {
            Some(cluster) => Ok(cluster),
            None => self.inner.find_stored(id),
        }
    }

    /// Mark a cluster `deleting` and drop it from the registry. Rows stay
    /// in storage, nothing is deprovisioned and running provisioning is not
    /// stopped, though it can no longer change the cluster's state.
    /// Deleting a cluster that is already deleting is a no-op.
    pub fn delete_cluster(&self, id: &str) -> Result<(), InstallerError> {
        let _span = self.inner.span.enter();
        match self.inner.registry.get(id) {
            Some(entry) => self.inner.delete_registered(&entry),
            None => self.inner.delete_unregistered(id),
        }
    }

    /// Registered clusters, in registration order.
    pub fn list_clusters(&self) -> Vec<Cluster> {
        self.inner.registry.list()
    }

    pub fn save_credentials(&self, id: &CredentialId, secret: &str) -> Result<(), InstallerError> {
        self.inner.credentials.save(id, secret)
    }

    pub fn find_credentials(&self, id: &str) -> Result<Credentials, InstallerError> {
        self.inner.credentials.find(id)
    }

    /// Events emitted from now on.
    pub fn subscribe(&self) -> Subscription {
        self.inner.subscriptions.subscribe()
    }

    /// Events emitted after `since`; `None` replays the whole log.
    pub fn subscribe_since(&self, since: Option<EventId>) -> Subscription {
        self.inner.subscriptions.subscribe_since(since)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscriptions.unsubscribe(id)
    }

    pub fn events(&self) -> Vec<Arc<Event>> {
        self.inner.events.snapshot()
    }

    pub fn provisioning_status(&self, id: &str) -> Option<TaskStatus> {
        self.inner.tasks.status(id)
    }

    pub fn cancel_provisioning(&self, id: &str) -> bool {
        self.inner.tasks.request_cancel(id)
    }

    pub fn wait_for_provisioning(&self, id: &str) -> Option<TaskStatus> {
        self.inner.tasks.wait(id)
    }

    pub fn wait_for_all_provisioning(&self) {
        self.inner.tasks.wait_all();
    }

    /// Close every open subscription. Blocked readers return `None`.
    pub fn close_subscriptions(&self) {
        self.inner.subscriptions.close_all();
    }
}

impl fmt::Debug for Installer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Installer")
            .field("data_dir", &self.inner.config.data_dir)
            .field("backend", &self.inner.gateway.backend())
            .field("clusters", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

/// The state a cluster's row holds while it is in `state` in memory.
/// `registered` is never persisted.
fn persisted_form(state: ClusterState) -> ClusterState {
    if state == ClusterState::Registered {
        ClusterState::Persisted
    } else {
        state
    }
}

impl Inner {
    fn emit_state(&self, cluster: &Cluster, description: Option<&str>) {
        let mut event = Event::new(EventKind::ClusterState, cluster.id.clone());
        if let Some(description) = description {
            event = event.with_description(description);
        }
        self.events.emit(event.with_cluster(cluster.clone()));
    }

    fn find_stored(&self, id: &str) -> Result<Cluster, InstallerError> {
        match self.gateway.find_cluster(id) {
            Ok(cluster) => Ok(cluster),
            Err(e) if e.is_not_found() => Err(InstallerError::ClusterNotFound(id.into())),
            Err(e) => Err(e.into()),
        }
    }

    /// Move a registered cluster to `to`: guarded write to storage, then
    /// memory, then a `cluster_state` event, all under the cluster's lock.
    fn advance(&self, entry: &ProviderCluster, to: ClusterState) -> Result<(), InstallerError> {
        let id = entry.id();
        let from = entry.transition(
            to,
            |from| {
                self.gateway
                    .transition_state(&id, Some(persisted_form(from)), to)
                    .map_err(InstallerError::from)
            },
            |cluster| self.emit_state(cluster, None),
        )?;
        debug!("cluster {id}: {from} -> {to}");
        Ok(())
    }

    fn delete_registered(&self, entry: &ProviderCluster) -> Result<(), InstallerError> {
        let id = entry.id();
        let deleted = entry.transition(
            ClusterState::Deleting,
            |_| {
                self.gateway
                    .transition_state(&id, None, ClusterState::Deleting)
                    .map_err(InstallerError::from)
            },
            |cluster| {
                self.events.emit(
                    Event::new(EventKind::ClusterDeleted, id.clone()).with_cluster(cluster.clone()),
                );
            },
        );
        match deleted {
            Ok(from) => info!("deleted cluster {id} (was {from})"),
            Err(InstallerError::InvalidTransition { from, .. }) if from.is_deleting() => {
                debug!("cluster {id} is already {from}");
            }
            Err(e) => return Err(e),
        }
        self.registry.remove_entry(entry);
        self.tasks.forget(&id);
        Ok(())
    }

    /// Delete a cluster only storage knows about, e.g. one left failed by a
    /// launch that could not register it.
    fn delete_unregistered(&self, id: &str) -> Result<(), InstallerError> {
        let mut cluster = self.find_stored(id)?;
        if cluster.state.is_deleting() {
            debug!("cluster {id} is already {}", cluster.state);
            return Ok(());
        }
        validate_transition(cluster.state, ClusterState::Deleting)?;
        self.gateway
            .transition_state(id, Some(cluster.state), ClusterState::Deleting)?;
        info!("deleted unregistered cluster {id} (was {})", cluster.state);
        cluster.state = ClusterState::Deleting;
        self.events
            .emit(Event::new(EventKind::ClusterDeleted, id.into()).with_cluster(cluster));
        self.tasks.forget(id);
        Ok(())
    }

    fn provision(&self, entry: &ProviderCluster, handle: &TaskHandle) -> TaskStatus {
        let id = entry.id();
        if let Err(e) = self.advance(entry, ClusterState::Provisioning) {
            return self.abandon(entry, &e.to_string());
        }

        let provisioner = provisioner_for(entry.cluster_type(), &self.aws);
        let ctx = TaskContext {
            inner: self,
            entry,
            cluster_id: id.clone(),
            credential_id: entry.snapshot().credential_id,
            handle,
        };
        match provisioner.run(&ctx) {
            Ok(()) => match self.advance(entry, ClusterState::Ready) {
                Ok(()) => {
                    info!("cluster {id} is ready");
                    TaskStatus::Succeeded
                }
                Err(e) => self.abandon(entry, &e.to_string()),
            },
            Err(ProvisionError::Cancelled(step)) => {
                self.abandon(entry, &format!("provisioning cancelled before {step}"));
                TaskStatus::Cancelled
            }
            Err(e) => self.abandon(entry, &e.to_string()),
        }
    }

    /// End provisioning without a ready cluster: emit an `error` event and
    /// mark the cluster failed. A cluster deleted in the meantime stays
    /// `deleting`, gets no event and the task counts as cancelled.
    fn abandon(&self, entry: &ProviderCluster, reason: &str) -> TaskStatus {
        let id = entry.id();
        let error_event = || Event::new(EventKind::Error, id.clone()).with_description(reason);
        let marked = entry.transition(
            ClusterState::Failed,
            |from| {
                self.gateway
                    .transition_state(&id, Some(persisted_form(from)), ClusterState::Failed)
                    .map_err(InstallerError::from)
            },
            |cluster| {
                self.events.emit(error_event());
                self.emit_state(cluster, None);
            },
        );
        match marked {
            Ok(_) => warn!("provisioning cluster {id} failed: {reason}"),
            Err(InstallerError::InvalidTransition { from, .. }) if from.is_deleting() => {
                debug!("cluster {id} was deleted during provisioning: {reason}");
                return TaskStatus::Cancelled;
            }
            Err(e) => {
                warn!("provisioning cluster {id} failed: {reason}; cannot mark it failed: {e}");
                self.events.emit(error_event());
            }
        }
        TaskStatus::Failed(reason.to_owned())
    }

    /// Rebuild the registry from storage. Clusters caught mid-provisioning
    /// by a restart are marked failed; deleting clusters stay unregistered.
    fn reconcile(&self) -> Result<ReconcileReport, InstallerError> {
        let mut report = ReconcileReport::default();
        for (id, loaded) in self.gateway.list_aws_clusters()? {
            let mut aws = match loaded {
                Ok(aws) => aws,
                Err(e) => {
                    warn!("skipping stored cluster {id}: {e}");
                    report.skipped.push(id);
                    continue;
                }
            };
            match aws.cluster.state {
                ClusterState::Ready | ClusterState::Failed => {
                    if self.restore(aws, &mut report).is_some() {
                        report.restored.push(id);
                    }
                }
                ClusterState::Deleting | ClusterState::Deleted => {
                    debug!("cluster {id} is {}; not registering", aws.cluster.state);
                    report.deleting.push(id);
                }
                interrupted => {
                    self.gateway
                        .transition_state(&id, Some(interrupted), ClusterState::Failed)?;
                    aws.cluster.state = ClusterState::Failed;
                    warn!("cluster {id} was {interrupted} at shutdown; marked failed");
                    if let Some(entry) = self.restore(aws, &mut report) {
                        self.emit_state(
                            &entry.snapshot(),
                            Some("provisioning interrupted by restart"),
                        );
                        report.interrupted.push(id);
                    }
                }
            }
        }
        if !report.skipped.is_empty() {
            warn!("{} stored clusters could not be loaded", report.skipped.len());
        }
        Ok(report)
    }

    fn restore(&self, aws: AwsCluster, report: &mut ReconcileReport) -> Option<ProviderCluster> {
        let id = aws.id().clone();
        let entry = ProviderCluster::aws(aws);
        match self.registry.register(entry.clone()) {
            Ok(()) => Some(entry),
            Err(e) => {
                warn!("skipping stored cluster {id}: {e}");
                report.skipped.push(id);
                None
            }
        }
    }
}

/// The installer's side of one provisioning run.
struct TaskContext<'a> {
    inner: &'a Inner,
    entry: &'a ProviderCluster,
    cluster_id: ClusterId,
    credential_id: CredentialId,
    handle: &'a TaskHandle,
}

impl TaskContext<'_> {
    fn store_error(&self, what: &str, e: &StoreError) -> ProvisionError {
        ProvisionError::Context(format!("cannot {what} for {}: {e}", self.cluster_id))
    }
}

impl ProvisionContext for TaskContext<'_> {
    fn cluster_id(&self) -> &ClusterId {
        &self.cluster_id
    }

    fn target(&self) -> ProvisionTarget {
        ProvisionTarget::Aws(self.entry.aws_snapshot())
    }

    fn credentials(&self) -> Result<Credentials, ProvisionError> {
        self.inner
            .credentials
            .find(&self.credential_id)
            .map_err(|e| match e {
                InstallerError::Credential(e) => ProvisionError::Credential(e),
                InstallerError::CredentialNotFound(id) => {
                    ProvisionError::Credential(CredentialError::NotFound(id.into_inner()))
                }
                other => ProvisionError::Credential(CredentialError::Lookup(other.to_string())),
            })
    }

    fn log(&self, message: &str) {
        self.inner.events.emit(
            Event::new(EventKind::Log, self.cluster_id.clone()).with_description(message),
        );
    }

    fn record_output(&self, output: ProvisionOutput) -> Result<(), ProvisionError> {
        if output.is_empty() {
            return Ok(());
        }
        let snapshot = self.entry.update_aws(|aws| {
            if let Some(stack_id) = output.stack_id {
                aws.stack_id = Some(stack_id);
            }
            if let Some(image_id) = output.image_id {
                aws.image_id = Some(image_id);
            }
            if let Some(ca_cert) = output.ca_cert {
                aws.cluster.ca_cert = Some(ca_cert);
            }
            if let Some(pin) = output.controller_pin {
                aws.cluster.controller_pin = Some(pin);
            }
            if let Some(zone) = output.dns_zone_id {
                aws.cluster.dns_zone_id = Some(zone);
            }
            aws.clone()
        });
        self.inner
            .gateway
            .record_aws_outputs(&snapshot)
            .map_err(|e| self.store_error("record provisioning outputs", &e))
    }

    fn attach_domain(&self, domain: Domain) -> Result<(), ProvisionError> {
        self.entry
            .update_aws(|aws| aws.cluster.attach_domain(domain.clone()))
            .map_err(|e| ProvisionError::Context(e.to_string()))?;
        self.inner
            .gateway
            .save_domain(&self.cluster_id, &domain)
            .map_err(|e| self.store_error("save domain", &e))?;
        info!("cluster {} has domain {}", self.cluster_id, domain.name);
        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.handle.cancelled()
    }
}
