//! Auction representative: `State` and `Perform` on behalf of the
//! auctioneer, plus the stop/cancel operations routed through the same
//! capabilities.
//!
//! `Perform` is a small per-item state machine (reserve, claim, create,
//! start) with compensation at each stage. Ledger reservation happens
//! before any backend dispatch, so a committed reservation is immediately
//! visible to `State`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use hive_cell_api::{CellState, LrpWork, PlacementKey, Resources, TaskWork, Work};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::backend::{ContainerBackend, ContainerFilter, ContainerSpec};
use crate::health::HealthStatus;
use crate::ledger::ResourceLedger;
use crate::model::{Allocation, AllocationState};
use crate::records::{
    allow_conflict, ActualLrpInstanceKey, ActualLrpKey, RecordStore, StoreError,
};

/// Why `State` could not be served.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cell-unhealthy")]
    Unhealthy,
}

/// Why a stop/cancel operation failed.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Backend(#[from] crate::backend::BackendError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct AuctionConfig {
    /// Deadline for the backend consultation inside `State`.
    pub state_timeout: Duration,
    /// Bound on concurrently dispatching placements.
    pub dispatch_concurrency: usize,
    /// Per-call deadline for backend and store I/O during dispatch.
    pub op_timeout: Duration,
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self {
            state_timeout: Duration::from_millis(100),
            dispatch_concurrency: 16,
            op_timeout: Duration::from_secs(5),
        }
    }
}

/// The cell's auction face. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct AuctionCell {
    cell_id: Arc<String>,
    zone: Arc<String>,
    ledger: Arc<ResourceLedger>,
    backend: Arc<dyn ContainerBackend>,
    store: Arc<dyn RecordStore>,
    health: watch::Receiver<HealthStatus>,
    evacuating: watch::Receiver<bool>,
    dispatch_permits: Arc<Semaphore>,
    config: Arc<AuctionConfig>,
}

impl AuctionCell {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cell_id: String,
        zone: String,
        ledger: Arc<ResourceLedger>,
        backend: Arc<dyn ContainerBackend>,
        store: Arc<dyn RecordStore>,
        health: watch::Receiver<HealthStatus>,
        evacuating: watch::Receiver<bool>,
        config: AuctionConfig,
    ) -> Self {
        let dispatch_permits = Arc::new(Semaphore::new(config.dispatch_concurrency));
        Self {
            cell_id: Arc::new(cell_id),
            zone: Arc::new(zone),
            ledger,
            backend,
            store,
            health,
            evacuating,
            dispatch_permits,
            config: Arc::new(config),
        }
    }

    pub fn cell_id(&self) -> &str {
        &self.cell_id
    }

    pub fn is_healthy(&self) -> bool {
        self.health.borrow().is_healthy()
    }

    pub fn is_evacuating(&self) -> bool {
        *self.evacuating.borrow()
    }

    /// Produce a `CellState` snapshot.
    ///
    /// The ledger view is authoritative; the backend is consulted within
    /// the state deadline to account for containers the ledger has not
    /// observed yet. If the backend cannot answer in time the snapshot is
    /// partial: available resources are conservatively zero and `stale` is
    /// set, so the auction loop's latency budget holds.
    pub async fn state(&self) -> Result<CellState, StateError> {
        if !self.is_healthy() {
            return Err(StateError::Unhealthy);
        }

        let snapshot = self.ledger.snapshot();

        let mut lrps = Vec::new();
        let mut tasks = Vec::new();
        for allocation in &snapshot.allocations {
            if allocation.is_completed() {
                continue;
            }
            match &allocation.key {
                PlacementKey::Lrp {
                    process_guid,
                    index,
                } => lrps.push(LrpWork {
                    process_guid: process_guid.clone(),
                    index: *index,
                    domain: allocation.domain.clone(),
                    rootfs: allocation.rootfs.clone(),
                    resources: allocation.resources,
                }),
                PlacementKey::Task { task_guid } => tasks.push(TaskWork {
                    task_guid: task_guid.clone(),
                    domain: allocation.domain.clone(),
                    rootfs: allocation.rootfs.clone(),
                    resources: allocation.resources,
                }),
            }
        }

        let backend_view = tokio::time::timeout(
            self.config.state_timeout,
            self.backend.list(ContainerFilter::workloads()),
        )
        .await;

        let (available, stale) = match backend_view {
            Ok(Ok(containers)) => {
                let known: HashSet<PlacementKey> = snapshot
                    .allocations
                    .iter()
                    .map(|a| a.key.clone())
                    .collect();
                let mut available = snapshot.available;
                for container in containers {
                    let tracked = container
                        .placement_key()
                        .map(|key| known.contains(&key))
                        .unwrap_or(false);
                    if !tracked {
                        available = available.saturating_sub(&container.resources);
                    }
                }
                (available, false)
            }
            _ => (Resources::ZERO, true),
        };

        Ok(CellState {
            cell_id: self.cell_id.as_ref().clone(),
            zone: self.zone.as_ref().clone(),
            rootfs_providers: self.ledger.providers().clone(),
            available_resources: available,
            total_resources: snapshot.total,
            lrps,
            tasks,
            evacuating: self.is_evacuating(),
            stale,
        })
    }

    /// Accept a work batch. Returns the work that was *not* accepted.
    ///
    /// LRPs are processed before tasks, ties broken by placement key, and
    /// the whole accepted subset is reserved atomically. Items that were
    /// dispatched but fail later surface through the record store, not
    /// through the returned work.
    pub async fn perform(&self, work: Work) -> Work {
        if self.is_evacuating() || !self.is_healthy() {
            info!(
                evacuating = self.is_evacuating(),
                items = work.len(),
                "rejecting work batch"
            );
            return work;
        }

        let mut lrps = work.lrps;
        let mut tasks = work.tasks;
        lrps.sort_by(|a, b| a.placement_key().cmp(&b.placement_key()));
        tasks.sort_by(|a, b| a.placement_key().cmp(&b.placement_key()));

        let mut failed = Work::default();
        let mut accepted_lrps = Vec::new();
        let mut accepted_tasks = Vec::new();
        let mut batch = Vec::new();

        for lrp in lrps {
            match self.validate(&lrp.rootfs, &lrp.resources) {
                Ok(()) => {
                    let allocation = Allocation::new(
                        lrp.placement_key(),
                        uuid::Uuid::new_v4().to_string(),
                        lrp.domain.clone(),
                        lrp.rootfs.clone(),
                        lrp.resources,
                    );
                    batch.push(allocation.clone());
                    accepted_lrps.push((lrp, allocation));
                }
                Err(reason) => {
                    debug!(key = %lrp.placement_key(), reason, "lrp failed validation");
                    failed.lrps.push(lrp);
                }
            }
        }
        for task in tasks {
            match self.validate(&task.rootfs, &task.resources) {
                Ok(()) => {
                    let allocation = Allocation::new(
                        task.placement_key(),
                        task.task_guid.clone(),
                        task.domain.clone(),
                        task.rootfs.clone(),
                        task.resources,
                    );
                    batch.push(allocation.clone());
                    accepted_tasks.push((task, allocation));
                }
                Err(reason) => {
                    debug!(key = %task.placement_key(), reason, "task failed validation");
                    failed.tasks.push(task);
                }
            }
        }

        if let Err(rejected) = self.ledger.reserve(batch) {
            for (key, reason) in &rejected.rejections {
                info!(key = %key, reason = reason.as_str(), "reservation rejected");
            }
            // Reservation is all-or-nothing: the whole accepted subset
            // comes back as failed work.
            failed.lrps.extend(accepted_lrps.into_iter().map(|(w, _)| w));
            failed.tasks.extend(accepted_tasks.into_iter().map(|(w, _)| w));
            return failed;
        }

        for (lrp, allocation) in accepted_lrps {
            self.spawn_lrp_dispatch(lrp, allocation).await;
        }
        for (_, allocation) in accepted_tasks {
            self.spawn_task_dispatch(allocation).await;
        }

        failed
    }

    fn validate(&self, rootfs: &hive_cell_api::RootFs, resources: &Resources) -> Result<(), &'static str> {
        if !self.ledger.providers().supports(rootfs) {
            return Err("unsupported-rootfs");
        }
        if !self.ledger.total().fits(resources) {
            return Err("exceeds-cell-capacity");
        }
        Ok(())
    }

    async fn spawn_lrp_dispatch(&self, lrp: LrpWork, allocation: Allocation) {
        let permit = self
            .dispatch_permits
            .clone()
            .acquire_owned()
            .await
            .expect("dispatch semaphore closed");
        let cell = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            cell.dispatch_lrp(lrp, allocation).await;
        });
    }

    async fn spawn_task_dispatch(&self, allocation: Allocation) {
        let permit = self
            .dispatch_permits
            .clone()
            .acquire_owned()
            .await
            .expect("dispatch semaphore closed");
        let cell = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            cell.dispatch_task(allocation).await;
        });
    }

    /// Claim, create, start; compensate on each stage.
    async fn dispatch_lrp(&self, lrp: LrpWork, allocation: Allocation) {
        let key = ActualLrpKey {
            process_guid: lrp.process_guid.clone(),
            index: lrp.index,
        };
        let instance_key = ActualLrpInstanceKey {
            instance_guid: allocation.instance_guid.clone(),
            cell_id: self.cell_id.as_ref().clone(),
        };

        self.ledger
            .transition(&allocation.key, AllocationState::Initializing);

        match self
            .store_call(self.store.claim_actual_lrp(&key, &instance_key))
            .await
        {
            Ok(()) => {}
            Err(StoreError::CasConflict(_)) => {
                // Another cell won the slot; success-after-loss.
                debug!(key = %allocation.key, "claim lost, releasing");
                self.ledger.release(&allocation.key);
                return;
            }
            Err(e) => {
                warn!(key = %allocation.key, error = %e, "claim failed");
                self.ledger.release(&allocation.key);
                return;
            }
        }

        let spec = ContainerSpec {
            handle: allocation.instance_guid.clone(),
            tags: allocation.tags(),
            rootfs: allocation.rootfs.clone(),
            resources: allocation.resources,
        };
        if let Err(e) = self.backend_call(self.backend.create(spec)).await {
            warn!(key = %allocation.key, error = %e, "container create failed");
            self.ledger.fail(&allocation.key, &e.to_string());
            let _ = allow_conflict(
                self.store_call(self.store.crash_actual_lrp(
                    &key,
                    &instance_key,
                    &e.to_string(),
                ))
                .await,
            );
            self.ledger.release(&allocation.key);
            return;
        }
        self.ledger
            .transition(&allocation.key, AllocationState::Created);

        match self
            .store_call(self.store.start_actual_lrp(&key, &instance_key))
            .await
        {
            Ok(()) => {
                self.ledger
                    .transition(&allocation.key, AllocationState::Running);
                debug!(key = %allocation.key, instance_guid = %allocation.instance_guid, "lrp running");
            }
            Err(StoreError::CasConflict(_)) => {
                // Lost after create: tear the container back down.
                debug!(key = %allocation.key, "start lost, destroying container");
                let _ = self
                    .backend_call(self.backend.destroy(&allocation.instance_guid))
                    .await;
                self.ledger.release(&allocation.key);
            }
            Err(e) => {
                // Container exists; leave convergence to the reconciler.
                warn!(key = %allocation.key, error = %e, "start write failed");
            }
        }
    }

    async fn dispatch_task(&self, allocation: Allocation) {
        let PlacementKey::Task { task_guid } = allocation.key.clone() else {
            return;
        };

        self.ledger
            .transition(&allocation.key, AllocationState::Initializing);

        match self
            .store_call(self.store.start_task(&task_guid, &self.cell_id))
            .await
        {
            Ok(()) => {}
            Err(StoreError::CasConflict(_)) => {
                debug!(task_guid = %task_guid, "task claim lost, releasing");
                self.ledger.release(&allocation.key);
                return;
            }
            Err(e) => {
                warn!(task_guid = %task_guid, error = %e, "task start failed");
                self.ledger.release(&allocation.key);
                return;
            }
        }

        let spec = ContainerSpec {
            handle: task_guid.clone(),
            tags: allocation.tags(),
            rootfs: allocation.rootfs.clone(),
            resources: allocation.resources,
        };
        if let Err(e) = self.backend_call(self.backend.create(spec)).await {
            warn!(task_guid = %task_guid, error = %e, "task container create failed");
            self.ledger.fail(&allocation.key, &e.to_string());
            let _ = self
                .store_call(self.store.fail_task(&task_guid, &e.to_string()))
                .await;
            self.ledger.release(&allocation.key);
            return;
        }

        self.ledger
            .transition(&allocation.key, AllocationState::Running);
        debug!(task_guid = %task_guid, "task container created");
    }

    /// Stop one LRP instance: destroy its container and clear its record.
    /// Repeating the call observes nothing left and returns not-found.
    pub async fn stop_lrp_instance(
        &self,
        process_guid: &str,
        instance_guid: &str,
    ) -> Result<(), OperationError> {
        let allocation = self
            .ledger
            .find_lrp_instance(process_guid, instance_guid)
            .ok_or_else(|| {
                OperationError::NotFound(format!("{process_guid}/{instance_guid}"))
            })?;
        let PlacementKey::Lrp { index, .. } = &allocation.key else {
            return Err(OperationError::NotFound(process_guid.to_string()));
        };
        let index = *index;

        info!(process_guid, instance_guid, "stopping lrp instance");

        match self.backend_call(self.backend.destroy(instance_guid)).await {
            Ok(()) | Err(crate::backend::BackendError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let key = ActualLrpKey {
            process_guid: process_guid.to_string(),
            index,
        };
        match self.store_call(self.store.remove_actual_lrp(&key)).await {
            Ok(()) | Err(StoreError::NotFound(_)) | Err(StoreError::CasConflict(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.ledger.release(&allocation.key);
        Ok(())
    }

    /// Cancel one task: destroy its container and fail its record.
    pub async fn cancel_task(&self, task_guid: &str) -> Result<(), OperationError> {
        let key = PlacementKey::Task {
            task_guid: task_guid.to_string(),
        };
        if self.ledger.get(&key).is_none() {
            return Err(OperationError::NotFound(task_guid.to_string()));
        }

        info!(task_guid, "cancelling task");

        match self.backend_call(self.backend.destroy(task_guid)).await {
            Ok(()) | Err(crate::backend::BackendError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        match self
            .store_call(self.store.fail_task(task_guid, "task-cancelled"))
            .await
        {
            Ok(()) | Err(StoreError::NotFound(_)) | Err(StoreError::CasConflict(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.ledger.release(&key);
        Ok(())
    }

    async fn backend_call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, crate::backend::BackendError>>,
    ) -> Result<T, crate::backend::BackendError> {
        match tokio::time::timeout(self.config.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(crate::backend::BackendError::Unreachable(
                "deadline exceeded".to_string(),
            )),
        }
    }

    async fn store_call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.config.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unreachable("deadline exceeded".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::records::{ActualLrpFilter, InMemoryRecordStore, LrpState, TaskFilter};
    use hive_cell_api::{RootFs, RootFsProviders};

    struct Harness {
        cell: AuctionCell,
        backend: Arc<MockBackend>,
        store: Arc<InMemoryRecordStore>,
        health_tx: watch::Sender<HealthStatus>,
        evac_tx: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let backend = Arc::new(MockBackend::new());
        let store = Arc::new(InMemoryRecordStore::new());
        let providers = RootFsProviders {
            preloaded: vec!["trusty".to_string()],
            schemes: vec!["docker".to_string()],
        };
        let ledger = Arc::new(ResourceLedger::new(Resources::new(1024, 2048, 3), providers));
        let (health_tx, health_rx) = watch::channel(HealthStatus::Healthy);
        let (evac_tx, evac_rx) = watch::channel(false);
        let cell = AuctionCell::new(
            "cell-a".to_string(),
            "z1".to_string(),
            ledger,
            backend.clone(),
            store.clone(),
            health_rx,
            evac_rx,
            AuctionConfig::default(),
        );
        Harness {
            cell,
            backend,
            store,
            health_tx,
            evac_tx,
        }
    }

    fn lrp(process_guid: &str, index: i32, memory_mb: u64) -> LrpWork {
        LrpWork {
            process_guid: process_guid.to_string(),
            index,
            domain: "apps".to_string(),
            rootfs: RootFs::new("preloaded:trusty"),
            resources: Resources::new(memory_mb, 10, 1),
        }
    }

    fn task(task_guid: &str) -> TaskWork {
        TaskWork {
            task_guid: task_guid.to_string(),
            domain: "apps".to_string(),
            rootfs: RootFs::new("preloaded:trusty"),
            resources: Resources::new(64, 10, 1),
        }
    }

    async fn desire_task(store: &InMemoryRecordStore, task_guid: &str) {
        store
            .desire_task(&crate::records::TaskDefinition {
                task_guid: task_guid.to_string(),
                domain: "apps".to_string(),
                rootfs: RootFs::new("preloaded:trusty"),
                resources: Resources::new(64, 10, 1),
            })
            .await
            .unwrap();
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn perform_places_lrps_and_tasks() {
        let h = harness();
        desire_task(&h.store, "tg").await;
        let failed = h
            .cell
            .perform(Work {
                lrps: vec![lrp("pg", 0, 128)],
                tasks: vec![task("tg")],
            })
            .await;
        assert!(failed.is_empty());
        settle().await;

        // Containers exist under the expected handles.
        let mut handles = h.backend.handles();
        handles.sort();
        assert_eq!(handles.len(), 2);
        assert!(handles.contains(&"tg".to_string()));

        // Store reflects the placements.
        let groups = h
            .store
            .actual_lrp_groups(&ActualLrpFilter {
                cell_id: Some("cell-a".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].instance.as_ref().unwrap().state, LrpState::Running);

        let state = h.cell.state().await.unwrap();
        assert_eq!(state.lrps.len(), 1);
        assert_eq!(state.tasks.len(), 1);
        assert_eq!(state.available_resources, Resources::new(832, 2028, 1));
    }

    #[tokio::test]
    async fn perform_is_atomic_over_the_batch() {
        let h = harness();
        // Second LRP alone overflows memory; the whole batch must fail
        // with the ledger untouched.
        let failed = h
            .cell
            .perform(Work {
                lrps: vec![lrp("pg", 0, 600), lrp("pg", 1, 600)],
                tasks: vec![task("tg")],
            })
            .await;
        assert_eq!(failed.len(), 3);
        settle().await;

        assert!(h.backend.handles().is_empty());
        let state = h.cell.state().await.unwrap();
        assert_eq!(state.available_resources, Resources::new(1024, 2048, 3));
        assert!(h
            .store
            .actual_lrp_groups(&ActualLrpFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn perform_rejects_everything_while_evacuating() {
        let h = harness();
        h.evac_tx.send(true).unwrap();

        let work = Work {
            lrps: vec![lrp("pg", 0, 128)],
            tasks: vec![task("tg")],
        };
        let failed = h.cell.perform(work.clone()).await;
        assert_eq!(failed.len(), work.len());
    }

    #[tokio::test]
    async fn perform_rejects_everything_while_unhealthy() {
        let h = harness();
        h.health_tx
            .send(HealthStatus::Unhealthy {
                reason: "probe failed".to_string(),
            })
            .unwrap();

        let failed = h
            .cell
            .perform(Work {
                lrps: vec![lrp("pg", 0, 128)],
                tasks: vec![],
            })
            .await;
        assert_eq!(failed.len(), 1);
        assert!(matches!(h.cell.state().await, Err(StateError::Unhealthy)));
    }

    #[tokio::test]
    async fn invalid_rootfs_fails_only_that_item() {
        let h = harness();
        let mut bad = lrp("bad", 0, 64);
        bad.rootfs = RootFs::new("oci:///nope");

        let failed = h
            .cell
            .perform(Work {
                lrps: vec![lrp("pg", 0, 64), bad],
                tasks: vec![],
            })
            .await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed.lrps[0].process_guid, "bad");
        settle().await;
        assert_eq!(h.backend.handles().len(), 1);
    }

    #[tokio::test]
    async fn failed_create_releases_reservation_and_reports() {
        let h = harness();
        desire_task(&h.store, "tg").await;
        h.backend.set_fail_creates(true);

        let failed = h
            .cell
            .perform(Work {
                lrps: vec![],
                tasks: vec![task("tg")],
            })
            .await;
        // Accepted at reservation time; the asynchronous failure surfaces
        // through the record store.
        assert!(failed.is_empty());
        settle().await;

        let tasks = h.store.tasks(&TaskFilter::default()).await.unwrap();
        assert!(tasks.is_empty() || tasks[0].failed);
        let state = h.cell.state().await.unwrap();
        assert_eq!(state.available_resources, Resources::new(1024, 2048, 3));
    }

    #[tokio::test]
    async fn stop_and_cancel_are_idempotent() {
        let h = harness();
        desire_task(&h.store, "tg").await;
        h.cell
            .perform(Work {
                lrps: vec![lrp("pg", 0, 64)],
                tasks: vec![task("tg")],
            })
            .await;
        settle().await;

        let state = h.cell.state().await.unwrap();
        assert_eq!(state.lrps.len(), 1);
        let groups = h
            .store
            .actual_lrp_groups(&ActualLrpFilter::default())
            .await
            .unwrap();
        let instance_guid = groups[0]
            .instance
            .as_ref()
            .unwrap()
            .instance_key
            .as_ref()
            .unwrap()
            .instance_guid
            .clone();

        h.cell.stop_lrp_instance("pg", &instance_guid).await.unwrap();
        let err = h
            .cell
            .stop_lrp_instance("pg", &instance_guid)
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::NotFound(_)));

        h.cell.cancel_task("tg").await.unwrap();
        let err = h.cell.cancel_task("tg").await.unwrap_err();
        assert!(matches!(err, OperationError::NotFound(_)));

        // Store state settled: no LRP group, task completed+failed once.
        assert!(h
            .store
            .actual_lrp_groups(&ActualLrpFilter::default())
            .await
            .unwrap()
            .is_empty());
        let tasks = h.store.tasks(&TaskFilter::default()).await.unwrap();
        assert!(tasks[0].failed);
        assert_eq!(tasks[0].failure_reason.as_deref(), Some("task-cancelled"));
    }

    #[tokio::test]
    async fn state_goes_stale_when_backend_is_slow() {
        let h = harness();
        h.backend.set_hang_lists(true);

        let state = h.cell.state().await.unwrap();
        assert!(state.stale);
        assert_eq!(state.available_resources, Resources::ZERO);
        assert_eq!(state.total_resources, Resources::new(1024, 2048, 3));
    }
}
