use crate::lifecycle::validate_transition;
use crate::InstallerError;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use stratus_schema::{AwsCluster, Cluster, ClusterId, ClusterState, ClusterType};

pub type SharedAwsCluster = Arc<RwLock<AwsCluster>>;

/// A registered cluster, one variant per provider.
///
/// Cloning is cheap and shares the cluster; each cluster has its own lock,
/// independent of the registry lock.
#[derive(Debug, Clone)]
pub enum ProviderCluster {
    Aws(SharedAwsCluster),
}

impl ProviderCluster {
    pub fn aws(cluster: AwsCluster) -> Self {
        ProviderCluster::Aws(Arc::new(RwLock::new(cluster)))
    }

    // A poisoned cluster lock only means a writer panicked between two
    // plain field stores; the data is still usable.
    fn read_aws(&self) -> RwLockReadGuard<'_, AwsCluster> {
        let ProviderCluster::Aws(shared) = self;
        shared.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_aws(&self) -> RwLockWriteGuard<'_, AwsCluster> {
        let ProviderCluster::Aws(shared) = self;
        shared.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> ClusterId {
        self.read_aws().cluster.id.clone()
    }

    pub fn cluster_type(&self) -> ClusterType {
        match self {
            ProviderCluster::Aws(_) => ClusterType::Aws,
        }
    }

    /// Provider-agnostic copy of the cluster.
    pub fn snapshot(&self) -> Cluster {
        self.read_aws().cluster.clone()
    }

    pub fn aws_snapshot(&self) -> AwsCluster {
        self.read_aws().clone()
    }

    pub fn state(&self) -> ClusterState {
        self.read_aws().cluster.state
    }

    /// Move to `to` if the lifecycle allows it from the current state.
    /// Move the cluster to `to` with its write lock held throughout.
    ///
    /// `persist` sees the current state and may refuse; only then does the
    /// in-memory state change, after which `announce` runs with the new
    /// snapshot. Two transitions of one cluster never interleave, so storage,
    /// memory and the event log agree on their order. Neither callback may
    /// touch the registry lock. Returns the state the cluster left.
    pub fn transition(
        &self,
        to: ClusterState,
        persist: impl FnOnce(ClusterState) -> Result<(), InstallerError>,
        announce: impl FnOnce(&Cluster),
    ) -> Result<ClusterState, InstallerError> {
        let mut aws = self.write_aws();
        let from = aws.cluster.state;
        validate_transition(from, to)?;
        persist(from)?;
        aws.cluster.state = to;
        announce(&aws.cluster);
        Ok(from)
    }

    /// Apply `f` under the cluster's write lock.
    pub fn update_aws<R>(&self, f: impl FnOnce(&mut AwsCluster) -> R) -> R {
        f(&mut self.write_aws())
    }

    pub fn same_as(&self, other: &ProviderCluster) -> bool {
        match (self, other) {
            (ProviderCluster::Aws(a), ProviderCluster::Aws(b)) => Arc::ptr_eq(a, b),
        }
    }
}

#[derive(Debug, Default)]
struct Arena {
    clusters: Vec<ProviderCluster>,
    index: HashMap<ClusterId, usize>,
}

impl Arena {
    fn take(&mut self, slot: usize) -> ProviderCluster {
        let removed = self.clusters.remove(slot);
        self.index.retain(|_, position| *position != slot);
        for position in self.index.values_mut() {
            if *position > slot {
                *position -= 1;
            }
        }
        removed
    }
}

/// In-memory set of live clusters, keyed by id.
///
/// The registry lock guards only the arena; it is released before any
/// cluster lock is taken and never held across I/O.
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    arena: RwLock<Arena>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Arena> {
        self.arena.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arena> {
        self.arena.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, cluster: ProviderCluster) -> Result<(), InstallerError> {
        let id = cluster.id();
        let mut arena = self.write();
        if arena.index.contains_key(&id) {
            return Err(InstallerError::AlreadyRegistered(id));
        }
        let slot = arena.clusters.len();
        arena.clusters.push(cluster);
        arena.index.insert(id, slot);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<ProviderCluster> {
        let arena = self.read();
        arena
            .index
            .get(id)
            .and_then(|&slot| arena.clusters.get(slot))
            .cloned()
    }

    /// Snapshot of a registered cluster. Never touches storage.
    pub fn find(&self, id: &str) -> Option<Cluster> {
        self.get(id).map(|entry| entry.snapshot())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().index.contains_key(id)
    }

    /// Remove `entry` only if it is the cluster currently registered under
    /// its id. A different cluster that reused the id stays. The arena is
    /// compacted and the index rebuilt.
    pub fn remove_entry(&self, entry: &ProviderCluster) -> bool {
        let id = entry.id();
        let mut arena = self.write();
        let Some(&slot) = arena.index.get(&id) else {
            return false;
        };
        if !arena.clusters[slot].same_as(entry) {
            return false;
        }
        arena.take(slot);
        true
    }

    /// Snapshots of every registered cluster, in registration order.
    pub fn list(&self) -> Vec<Cluster> {
        let entries: Vec<ProviderCluster> = self.read().clusters.clone();
        entries.iter().map(ProviderCluster::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.read().clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use stratus_schema::AwsLaunchRequest;

    fn entry(id: &str) -> ProviderCluster {
        let mut aws = AwsLaunchRequest::new("k")
            .with_cluster_id(id)
            .validate_and_default()
            .unwrap();
        aws.cluster.state = ClusterState::Registered;
        ProviderCluster::aws(aws)
    }

    #[test]
    fn register_and_find() {
        let registry = ClusterRegistry::new();
        registry.register(entry("a")).unwrap();
        assert_eq!(registry.find("a").unwrap().id, "a");
        assert!(registry.find("b").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_id_rejected() {
        let registry = ClusterRegistry::new();
        registry.register(entry("a")).unwrap();
        assert!(matches!(
            registry.register(entry("a")),
            Err(InstallerError::AlreadyRegistered(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_keeps_index_consistent() {
        let registry = ClusterRegistry::new();
        for id in ["a", "b", "c", "d"] {
            registry.register(entry(id)).unwrap();
        }
        let b = registry.get("b").unwrap();
        assert!(registry.remove_entry(&b));
        assert!(registry.get("b").is_none());

        assert_eq!(registry.len(), 3);
        for id in ["a", "c", "d"] {
            assert_eq!(registry.find(id).unwrap().id, id);
        }
        let ids: Vec<String> = registry.list().into_iter().map(|c| c.id.into_inner()).collect();
        assert_eq!(ids, vec!["a", "c", "d"]);
    }

    #[test]
    fn remove_entry_matches_identity() {
        let registry = ClusterRegistry::new();
        let first = entry("a");
        registry.register(first.clone()).unwrap();
        assert!(!registry.remove_entry(&entry("a")));
        assert!(registry.contains("a"));
        assert!(registry.remove_entry(&first));
        assert!(!registry.remove_entry(&first));
        assert!(registry.is_empty());
    }

    #[test]
    fn clones_share_state() {
        let registry = ClusterRegistry::new();
        let e = entry("a");
        registry.register(e.clone()).unwrap();
        e.transition(ClusterState::Provisioning, |_| Ok(()), |_| {})
            .unwrap();
        assert_eq!(
            registry.find("a").unwrap().state,
            ClusterState::Provisioning
        );
        assert!(registry.get("a").unwrap().same_as(&e));
        assert!(!entry("a").same_as(&e));
    }

    #[test]
    fn transition_enforces_lifecycle_before_persisting() {
        let e = entry("a");
        let mut persisted = false;
        let err = e
            .transition(
                ClusterState::Ready,
                |_| {
                    persisted = true;
                    Ok(())
                },
                |_| panic!("announced an invalid transition"),
            )
            .unwrap_err();
        assert!(matches!(err, InstallerError::InvalidTransition { .. }));
        assert!(!persisted);
        assert_eq!(e.state(), ClusterState::Registered);
    }

    #[test]
    fn refused_persist_leaves_memory_untouched() {
        let e = entry("a");
        let result = e.transition(
            ClusterState::Provisioning,
            |from| {
                assert_eq!(from, ClusterState::Registered);
                Err(InstallerError::Config("disk full".to_owned()))
            },
            |_| panic!("announced a refused transition"),
        );
        assert!(result.is_err());
        assert_eq!(e.state(), ClusterState::Registered);

        let mut announced = None;
        let from = e
            .transition(ClusterState::Provisioning, |_| Ok(()), |c| announced = Some(c.state))
            .unwrap();
        assert_eq!(from, ClusterState::Registered);
        assert_eq!(announced, Some(ClusterState::Provisioning));
    }

    #[test]
    fn concurrent_transitions_of_one_cluster_serialize() {
        let e = entry("a");
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [ClusterState::Provisioning, ClusterState::Deleting]
            .into_iter()
            .map(|to| {
                let e = e.clone();
                let order = Arc::clone(&order);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let persisted = Arc::clone(&order);
                    e.transition(
                        to,
                        move |_| {
                            persisted.lock().unwrap().push(format!("persist {to}"));
                            thread::sleep(std::time::Duration::from_millis(5));
                            Ok(())
                        },
                        |c| order.lock().unwrap().push(format!("announce {}", c.state)),
                    )
                    .is_ok()
                })
            })
            .collect();
        let outcomes: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(outcomes.iter().any(|ok| *ok));

        // Each persist is immediately followed by its own announce.
        let order = order.lock().unwrap();
        for pair in order.chunks(2) {
            assert_eq!(pair[0].replace("persist", ""), pair[1].replace("announce", ""));
        }
        assert_eq!(e.state(), ClusterState::Deleting);
    }

    #[test]
    fn concurrent_registration() {
        let registry = Arc::new(ClusterRegistry::new());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.register(entry(&format!("c{i}"))).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.len(), 8);
        for i in 0..8 {
            assert!(registry.contains(&format!("c{i}")));
        }
    }
}
