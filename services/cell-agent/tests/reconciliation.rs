//! Tick-level tests for the bulk reconciler: drive `tick()` directly and
//! assert that backend, record store, and ledger converge.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use hive_cell_agent::backend::MockBackend;
use hive_cell_agent::health::HealthStatus;
use hive_cell_agent::ledger::ResourceLedger;
use hive_cell_agent::model::{
    Allocation, AllocationState, Tags, DOMAIN_TAG, INDEX_TAG, INSTANCE_GUID_TAG, LIFECYCLE_TAG,
    PROCESS_GUID_TAG, TASK_GUID_TAG,
};
use hive_cell_agent::reconciler::{BulkReconciler, ReconcilerConfig};
use hive_cell_agent::records::{
    ActualLrpFilter, ActualLrpInstanceKey, ActualLrpKey, InMemoryRecordStore, LrpState,
    RecordStore, TaskDefinition, TaskFilter, TaskState,
};
use hive_cell_api::{PlacementKey, Resources, RootFs, RootFsProviders};

const CELL_ID: &str = "cell-a";

struct Rig {
    reconciler: BulkReconciler,
    backend: Arc<MockBackend>,
    store: Arc<InMemoryRecordStore>,
    ledger: Arc<ResourceLedger>,
    shutdown_rx: watch::Receiver<bool>,
    _shutdown_tx: watch::Sender<bool>,
    _health_tx: watch::Sender<HealthStatus>,
}

fn rig() -> Rig {
    let backend = Arc::new(MockBackend::new());
    let store = Arc::new(InMemoryRecordStore::new());
    let ledger = Arc::new(ResourceLedger::new(
        Resources::new(1024, 2048, 3),
        RootFsProviders {
            preloaded: vec!["the-rootfs".to_string()],
            schemes: vec![],
        },
    ));
    let (_health_tx, health_rx) = watch::channel(HealthStatus::Healthy);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = BulkReconciler::new(
        CELL_ID.to_string(),
        ledger.clone(),
        backend.clone(),
        store.clone(),
        health_rx,
        // Zero grace: everything is ripe immediately, so ticks act at once.
        ReconcilerConfig {
            interval: Duration::from_millis(50),
            grace: Duration::ZERO,
            op_timeout: Duration::from_secs(1),
        },
    );
    Rig {
        reconciler,
        backend,
        store,
        ledger,
        shutdown_rx,
        _shutdown_tx,
        _health_tx,
    }
}

fn lrp_tags(process_guid: &str, index: i32, instance_guid: &str) -> Tags {
    let mut tags = Tags::new();
    tags.insert(LIFECYCLE_TAG.to_string(), "app".to_string());
    tags.insert(PROCESS_GUID_TAG.to_string(), process_guid.to_string());
    tags.insert(INDEX_TAG.to_string(), index.to_string());
    tags.insert(INSTANCE_GUID_TAG.to_string(), instance_guid.to_string());
    tags.insert(DOMAIN_TAG.to_string(), "some-domain".to_string());
    tags
}

fn task_tags(task_guid: &str) -> Tags {
    let mut tags = Tags::new();
    tags.insert(LIFECYCLE_TAG.to_string(), "task".to_string());
    tags.insert(TASK_GUID_TAG.to_string(), task_guid.to_string());
    tags.insert(DOMAIN_TAG.to_string(), "some-domain".to_string());
    tags
}

#[tokio::test]
async fn first_tick_cleans_a_fresh_node() {
    let mut r = rig();
    r.backend
        .seed_container("cnr1", Tags::new(), Resources::new(10, 10, 1));
    r.backend
        .seed_container("cnr2", lrp_tags("pg", 0, "cnr2"), Resources::new(10, 10, 1));

    r.reconciler.tick(&r.shutdown_rx).await.unwrap();

    let mut destroyed = r.backend.destroyed();
    destroyed.sort();
    assert_eq!(destroyed, vec!["cnr1".to_string(), "cnr2".to_string()]);
}

#[tokio::test]
async fn adopts_containers_the_store_says_are_ours() {
    let mut r = rig();
    let key = ActualLrpKey {
        process_guid: "pg".to_string(),
        index: 0,
    };
    let instance_key = ActualLrpInstanceKey {
        instance_guid: "ig-1".to_string(),
        cell_id: CELL_ID.to_string(),
    };
    r.store.start_actual_lrp(&key, &instance_key).await.unwrap();
    r.backend
        .seed_container("ig-1", lrp_tags("pg", 0, "ig-1"), Resources::new(64, 64, 1));

    r.reconciler.tick(&r.shutdown_rx).await.unwrap();

    // The container survived and the ledger knows it again.
    assert!(r.backend.destroyed().is_empty());
    let snapshot = r.ledger.snapshot();
    assert_eq!(snapshot.allocations.len(), 1);
    assert_eq!(snapshot.allocations[0].instance_guid, "ig-1");
    assert_eq!(snapshot.available, Resources::new(960, 1984, 2));
}

#[tokio::test]
async fn converges_within_two_ticks() {
    let mut r = rig();

    // One container the store backs, one it does not, one store claim with
    // nothing behind it.
    let key = ActualLrpKey {
        process_guid: "pg".to_string(),
        index: 0,
    };
    let instance_key = ActualLrpInstanceKey {
        instance_guid: "ig-1".to_string(),
        cell_id: CELL_ID.to_string(),
    };
    r.store.start_actual_lrp(&key, &instance_key).await.unwrap();
    r.backend
        .seed_container("ig-1", lrp_tags("pg", 0, "ig-1"), Resources::new(64, 64, 1));
    r.backend
        .seed_container("stray", Tags::new(), Resources::new(10, 10, 1));
    r.store
        .claim_actual_lrp(
            &ActualLrpKey {
                process_guid: "ghost".to_string(),
                index: 2,
            },
            &ActualLrpInstanceKey {
                instance_guid: "ig-ghost".to_string(),
                cell_id: CELL_ID.to_string(),
            },
        )
        .await
        .unwrap();

    r.reconciler.tick(&r.shutdown_rx).await.unwrap();
    r.reconciler.tick(&r.shutdown_rx).await.unwrap();

    // Backend and ledger agree: exactly the adopted container remains.
    let handles = r.backend.handles();
    assert_eq!(handles, vec!["ig-1".to_string()]);
    let snapshot = r.ledger.snapshot();
    assert_eq!(snapshot.allocations.len(), 1);
    assert_eq!(
        snapshot.allocations[0].key,
        PlacementKey::Lrp {
            process_guid: "pg".to_string(),
            index: 0
        }
    );

    // And the store only knows about what actually runs here.
    let groups = r
        .store
        .actual_lrp_groups(&ActualLrpFilter::default())
        .await
        .unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(
        groups[0].instance.as_ref().unwrap().key,
        ActualLrpKey {
            process_guid: "pg".to_string(),
            index: 0
        }
    );
}

#[tokio::test]
async fn crashed_lrp_containers_are_reported_and_reaped() {
    let mut r = rig();
    let key = ActualLrpKey {
        process_guid: "pg".to_string(),
        index: 0,
    };
    let instance_key = ActualLrpInstanceKey {
        instance_guid: "ig-1".to_string(),
        cell_id: CELL_ID.to_string(),
    };
    r.store.start_actual_lrp(&key, &instance_key).await.unwrap();
    r.backend
        .seed_container("ig-1", lrp_tags("pg", 0, "ig-1"), Resources::new(64, 64, 1));

    let mut allocation = Allocation::new(
        PlacementKey::Lrp {
            process_guid: "pg".to_string(),
            index: 0,
        },
        "ig-1".to_string(),
        "some-domain".to_string(),
        RootFs::new("preloaded:the-rootfs"),
        Resources::new(64, 64, 1),
    );
    allocation.state = AllocationState::Running;
    r.ledger.adopt(allocation);

    r.backend.finish_container("ig-1", 137);
    r.reconciler.tick(&r.shutdown_rx).await.unwrap();

    // Exit pushed to the store, container destroyed, ledger released.
    let groups = r
        .store
        .actual_lrp_groups(&ActualLrpFilter::default())
        .await
        .unwrap();
    let instance = groups[0].instance.as_ref().unwrap();
    assert_eq!(instance.state, LrpState::Unclaimed);
    assert_eq!(
        instance.crash_reason.as_deref(),
        Some("exited with status 137")
    );
    assert_eq!(r.backend.destroyed(), vec!["ig-1".to_string()]);
    assert!(r.ledger.snapshot().allocations.is_empty());
}

#[tokio::test]
async fn completed_task_containers_push_their_exit_code() {
    let mut r = rig();
    r.store
        .desire_task(&TaskDefinition {
            task_guid: "tg".to_string(),
            domain: "some-domain".to_string(),
            rootfs: RootFs::new("preloaded:the-rootfs"),
            resources: Resources::new(64, 64, 1),
        })
        .await
        .unwrap();
    r.store.start_task("tg", CELL_ID).await.unwrap();
    r.backend
        .seed_container("tg", task_tags("tg"), Resources::new(64, 64, 1));

    let mut allocation = Allocation::new(
        PlacementKey::Task {
            task_guid: "tg".to_string(),
        },
        "tg".to_string(),
        "some-domain".to_string(),
        RootFs::new("preloaded:the-rootfs"),
        Resources::new(64, 64, 1),
    );
    allocation.state = AllocationState::Running;
    r.ledger.adopt(allocation);

    r.backend.finish_container("tg", 0);
    r.reconciler.tick(&r.shutdown_rx).await.unwrap();

    let tasks = r.store.tasks(&TaskFilter::default()).await.unwrap();
    assert_eq!(tasks[0].state, TaskState::Completed);
    assert!(!tasks[0].failed);
    assert_eq!(r.backend.destroyed(), vec!["tg".to_string()]);
    assert!(r.ledger.snapshot().allocations.is_empty());
}

#[tokio::test]
async fn orphaned_allocations_release_and_report() {
    let mut r = rig();
    // First tick marks startup done with a quiet node.
    r.reconciler.tick(&r.shutdown_rx).await.unwrap();

    let key = ActualLrpKey {
        process_guid: "pg".to_string(),
        index: 0,
    };
    let instance_key = ActualLrpInstanceKey {
        instance_guid: "ig-1".to_string(),
        cell_id: CELL_ID.to_string(),
    };
    r.store.start_actual_lrp(&key, &instance_key).await.unwrap();

    let mut allocation = Allocation::new(
        PlacementKey::Lrp {
            process_guid: "pg".to_string(),
            index: 0,
        },
        "ig-1".to_string(),
        "some-domain".to_string(),
        RootFs::new("preloaded:the-rootfs"),
        Resources::new(64, 64, 1),
    );
    allocation.state = AllocationState::Created;
    r.ledger.adopt(allocation);

    r.reconciler.tick(&r.shutdown_rx).await.unwrap();

    assert!(r.ledger.snapshot().allocations.is_empty());
    let groups = r
        .store
        .actual_lrp_groups(&ActualLrpFilter::default())
        .await
        .unwrap();
    let instance = groups[0].instance.as_ref().unwrap();
    assert_eq!(instance.state, LrpState::Unclaimed);
    assert_eq!(instance.crash_reason.as_deref(), Some("container-missing"));
}

#[tokio::test]
async fn a_failing_destroy_does_not_stall_other_actions() {
    let mut r = rig();
    r.backend
        .seed_container("stray", Tags::new(), Resources::new(10, 10, 1));
    r.store
        .desire_task(&TaskDefinition {
            task_guid: "tg".to_string(),
            domain: "some-domain".to_string(),
            rootfs: RootFs::new("preloaded:the-rootfs"),
            resources: Resources::new(64, 64, 1),
        })
        .await
        .unwrap();
    r.store.start_task("tg", CELL_ID).await.unwrap();

    // Destroys hang; the per-call deadline contains the damage and the
    // stale task is still failed in the same tick.
    r.backend.set_hang_destroys(true);
    let start = std::time::Instant::now();
    r.reconciler.tick(&r.shutdown_rx).await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));

    let tasks = r.store.tasks(&TaskFilter::default()).await.unwrap();
    assert_eq!(tasks[0].state, TaskState::Completed);
    assert!(tasks[0].failed);
    assert_eq!(tasks[0].failure_reason.as_deref(), Some("no-container"));
}
