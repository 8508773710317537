use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use stratus_core::{Installer, InstallerConfig, InstallerError, RecvTimeoutError, TaskStatus};
use stratus_provider::{AwsApi, AwsStep, Credentials, EnvCredentialSource, MockAws};
use stratus_schema::{AwsLaunchRequest, ClusterId, ClusterState, EventKind, LaunchRequest};
use stratus_store::{MemoryDatabase, PersistenceGateway};

fn env_source() -> EnvCredentialSource {
    Arc::new(|| {
        Ok(Credentials::Environment {
            access_key_id: "AKIAENV".to_owned(),
            secret: "from-env".to_owned(),
        })
    })
}

fn open_with(api: &Arc<MockAws>, db: &Arc<MemoryDatabase>) -> Installer {
    let aws: Arc<dyn AwsApi> = api.clone();
    Installer::builder(InstallerConfig::in_memory())
        .database(Box::new(Arc::clone(db)))
        .aws_api(aws)
        .env_credentials(env_source())
        .open()
        .unwrap()
}

fn open_mock() -> (Arc<MockAws>, Arc<MemoryDatabase>, Installer) {
    let api = Arc::new(MockAws::new());
    let db = Arc::new(MemoryDatabase::new());
    let installer = open_with(&api, &db);
    (api, db, installer)
}

fn request(id: &str) -> LaunchRequest {
    AwsLaunchRequest::new("aws_env").with_cluster_id(id).into()
}

#[test]
fn concurrent_launches_all_reach_ready() {
    let (api, _db, installer) = open_mock();
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|n| {
            let installer = installer.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                installer.launch_cluster(request(&format!("c{n}"))).unwrap()
            })
        })
        .collect();
    let ids: Vec<ClusterId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    installer.wait_for_all_provisioning();

    assert_eq!(installer.list_clusters().len(), 8);
    for id in &ids {
        assert_eq!(installer.find_cluster(id).unwrap().state, ClusterState::Ready);
        assert_eq!(installer.provisioning_status(id), Some(TaskStatus::Succeeded));
        assert_eq!(
            api.steps_for(id),
            vec![
                AwsStep::CreateStack,
                AwsStep::WaitForStack,
                AwsStep::Bootstrap,
                AwsStep::AllocateDomain
            ]
        );
    }

    // Per cluster, state events arrive in lifecycle order.
    let mut states: HashMap<ClusterId, Vec<ClusterState>> = HashMap::new();
    for event in installer.events() {
        if event.kind == EventKind::ClusterState {
            states
                .entry(event.cluster_id.clone())
                .or_default()
                .push(event.cluster.as_ref().unwrap().state);
        }
    }
    for id in &ids {
        assert_eq!(
            states[id],
            vec![ClusterState::Provisioning, ClusterState::Ready]
        );
    }
}

#[test]
fn event_ids_are_gapless_and_ordered() {
    let (_api, _db, installer) = open_mock();
    let mut sub = installer.subscribe();
    for n in 0..4 {
        installer.launch_cluster(request(&format!("c{n}"))).unwrap();
    }
    installer.wait_for_all_provisioning();

    let total = installer.events().len();
    let ids: Vec<u64> = (0..total).map(|_| sub.recv().unwrap().id).collect();
    assert_eq!(ids, (1..=total as u64).collect::<Vec<_>>());
}

#[test]
fn launch_reaches_every_prior_subscriber() {
    let (_api, _db, installer) = open_mock();
    let _never_drained = installer.subscribe();
    let mut subscribers: Vec<_> = (0..3).map(|_| installer.subscribe()).collect();

    let id = installer.launch_cluster(request("c1")).unwrap();
    for sub in &mut subscribers {
        let event = sub.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::NewCluster);
        assert_eq!(event.cluster_id, id);
    }

    let second = installer.launch_cluster(request("c2")).unwrap();
    installer.wait_for_all_provisioning();
    for sub in &mut subscribers {
        let mut new_clusters = Vec::new();
        while let Ok(event) = sub.try_recv() {
            if event.kind == EventKind::NewCluster {
                new_clusters.push(event.cluster_id.clone());
            }
        }
        assert_eq!(new_clusters, vec![second.clone()]);
    }
}

#[test]
fn stalled_subscriber_does_not_block_others() {
    let (_api, _db, installer) = open_mock();
    let _stalled = installer.subscribe();
    let mut live = installer.subscribe();

    let reader = thread::spawn(move || {
        let mut ready = 0;
        while ready < 5 {
            let event = live.recv_timeout(Duration::from_secs(10)).unwrap();
            if event.kind == EventKind::ClusterState
                && event.cluster.as_ref().unwrap().state == ClusterState::Ready
            {
                ready += 1;
            }
        }
        ready
    });

    for n in 0..5 {
        installer.launch_cluster(request(&format!("c{n}"))).unwrap();
    }
    installer.wait_for_all_provisioning();
    assert_eq!(reader.join().unwrap(), 5);
}

#[test]
fn unsubscribe_wakes_blocked_reader() {
    let (_api, _db, installer) = open_mock();
    let mut sub = installer.subscribe();
    let id = sub.id();
    let reader = thread::spawn(move || sub.recv_timeout(Duration::from_secs(10)));

    thread::sleep(Duration::from_millis(20));
    assert!(installer.unsubscribe(id));
    assert_eq!(reader.join().unwrap().unwrap_err(), RecvTimeoutError::Closed);
    assert!(!installer.unsubscribe(id));
}

#[test]
fn subscribe_since_replays_missed_events() {
    let (_api, _db, installer) = open_mock();
    let id = installer.launch_cluster(request("c1")).unwrap();
    installer.wait_for_provisioning(&id);

    let mut replay = installer.subscribe_since(Some(1));
    let first = replay.try_recv().unwrap();
    assert_eq!(first.id, 2);
    assert_eq!(first.kind, EventKind::ClusterState);

    let mut everything = installer.subscribe_since(None);
    assert_eq!(everything.try_recv().unwrap().kind, EventKind::NewCluster);
}

#[test]
fn env_credential_never_reads_storage() {
    let (_api, db, installer) = open_mock();
    let reads = db.read_count();
    let creds = installer.find_credentials("aws_env").unwrap();
    assert!(creds.is_environment());
    assert_eq!(creds.access_key_id(), "AKIAENV");
    assert_eq!(db.read_count(), reads);
}

#[test]
fn duplicate_credential_rejected() {
    let (_api, _db, installer) = open_mock();
    installer.save_credentials(&"AKIA1".into(), "one").unwrap();
    assert!(installer.save_credentials(&"AKIA1".into(), "two").is_err());
    assert_eq!(installer.find_credentials("AKIA1").unwrap().secret(), "one");
    assert!(matches!(
        installer.find_credentials("AKIA2"),
        Err(InstallerError::CredentialNotFound(_))
    ));
}

#[test]
fn rejected_launch_leaves_no_trace() {
    let (_api, db, installer) = open_mock();
    let reads = db.read_count();
    let bad: LaunchRequest = AwsLaunchRequest::new("aws_env")
        .with_cluster_id("Not_Valid")
        .into();
    assert!(matches!(
        installer.launch_cluster(bad),
        Err(InstallerError::Validation(_))
    ));
    assert!(installer.list_clusters().is_empty());
    assert!(installer.events().is_empty());
    assert_eq!(db.read_count(), reads);

    let gateway = PersistenceGateway::new(Box::new(Arc::clone(&db)));
    assert!(gateway.list_aws_clusters().unwrap().is_empty());
}

#[test]
fn storage_failure_at_launch_registers_nothing() {
    let (_api, db, installer) = open_mock();
    db.fail_inserts_into(stratus_store::AWS_CLUSTERS.name);
    assert!(matches!(
        installer.launch_cluster(request("c1")),
        Err(InstallerError::Storage(_))
    ));
    db.clear_faults();

    assert!(installer.list_clusters().is_empty());
    assert!(installer.events().is_empty());
    assert!(installer.find_cluster("c1").unwrap_err().is_not_found());
}

#[test]
fn provisioning_failure_is_visible_only_through_state() {
    let api = Arc::new(MockAws::failing_at(AwsStep::WaitForStack));
    let db = Arc::new(MemoryDatabase::new());
    let installer = open_with(&api, &db);
    let mut sub = installer.subscribe();

    let id = installer.launch_cluster(request("c1")).unwrap();
    installer.wait_for_provisioning(&id);

    assert_eq!(installer.find_cluster(&id).unwrap().state, ClusterState::Failed);
    let kinds: Vec<EventKind> = std::iter::from_fn(|| sub.try_recv().ok())
        .map(|e| e.kind)
        .collect();
    assert!(kinds.contains(&EventKind::Error));
    assert_eq!(kinds.last(), Some(&EventKind::ClusterState));
    assert!(!api.steps_for(&id).contains(&AwsStep::Bootstrap));
}

#[test]
fn delete_then_find_falls_back_to_storage() {
    let (_api, db, installer) = open_mock();
    let id = installer.launch_cluster(request("c1")).unwrap();
    installer.wait_for_provisioning(&id);
    let mut sub = installer.subscribe();

    installer.delete_cluster(&id).unwrap();
    let event = sub.try_recv().unwrap();
    assert_eq!(event.kind, EventKind::ClusterDeleted);
    assert_eq!(event.cluster_id, id);

    let reads = db.read_count();
    let found = installer.find_cluster(&id).unwrap();
    assert_eq!(found.state, ClusterState::Deleting);
    assert!(db.read_count() > reads);
    assert!(installer.list_clusters().is_empty());
}

#[test]
fn delete_during_provisioning_leaves_deleting() {
    let api = Arc::new(MockAws::new());
    api.hold();
    let db = Arc::new(MemoryDatabase::new());
    let installer = open_with(&api, &db);

    let id = installer.launch_cluster(request("c1")).unwrap();
    installer.delete_cluster(&id).unwrap();
    api.release();
    assert_eq!(installer.wait_for_provisioning(&id), Some(TaskStatus::Cancelled));
    assert!(installer.events().iter().all(|e| e.kind != EventKind::Error));

    let gateway = PersistenceGateway::new(Box::new(Arc::clone(&db)));
    assert_eq!(
        gateway.find_cluster(&id).unwrap().state,
        ClusterState::Deleting
    );
    assert_eq!(installer.find_cluster(&id).unwrap().state, ClusterState::Deleting);
    assert!(!installer
        .events()
        .iter()
        .any(|e| e.kind == EventKind::ClusterState
            && e.cluster.as_ref().unwrap().state == ClusterState::Ready));
}
