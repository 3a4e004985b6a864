//! Bulk reconciliation loop.
//!
//! Every polling interval the reconciler snapshots three sources of truth
//! (backend containers, record-store claims for this cell, the in-memory
//! ledger), sorts every divergence into one bucket, and issues the minimum
//! set of corrective actions. A key lands in at most one bucket per tick;
//! failures are logged and retried on the next tick.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use hive_cell_api::PlacementKey;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{ContainerBackend, ContainerFilter, ContainerInfo};
use crate::health::HealthStatus;
use crate::ledger::ResourceLedger;
use crate::model::{Allocation, Container, ContainerState};
use crate::records::{
    allow_conflict, ActualLrp, ActualLrpFilter, ActualLrpInstanceKey, ActualLrpKey, RecordStore,
    TaskFilter, TaskRecord, TaskState,
};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// Containers and allocations younger than this are left alone, so a
    /// placement still in flight is not destroyed under the dispatcher.
    pub grace: Duration,
    pub op_timeout: Duration,
}

impl ReconcilerConfig {
    /// Grace and per-call deadlines both derive from the polling interval,
    /// so a wedged backend cannot pin a tick past its own period.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            grace: interval,
            op_timeout: interval.clamp(Duration::from_millis(50), Duration::from_secs(5)),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::with_interval(Duration::from_secs(30))
    }
}

/// The per-tick divergence buckets, in action priority order.
#[derive(Debug, Default)]
pub struct Buckets {
    /// Backend has a container the store does not account for.
    pub extra_containers: Vec<Container>,
    /// Ledger has an allocation with no backing container.
    pub orphaned_allocations: Vec<Allocation>,
    /// Store claims this cell but the backend has nothing.
    pub missing_containers: Vec<ActualLrp>,
    /// Store claim matches this cell but a different instance incarnation.
    pub mismatched_instances: Vec<ActualLrp>,
    /// Backend reports the container's process has exited.
    pub completed_containers: Vec<(Container, i32)>,
    /// Store task claimed by this cell with no container behind it.
    pub stale_tasks: Vec<TaskRecord>,
    /// Containers claimed by this cell in the store but absent from the
    /// ledger; re-adopted to restore the ledger/backend correspondence.
    pub adoptions: Vec<Allocation>,
}

impl Buckets {
    pub fn is_empty(&self) -> bool {
        self.extra_containers.is_empty()
            && self.orphaned_allocations.is_empty()
            && self.missing_containers.is_empty()
            && self.mismatched_instances.is_empty()
            && self.completed_containers.is_empty()
            && self.stale_tasks.is_empty()
            && self.adoptions.is_empty()
    }
}

pub struct BulkReconciler {
    cell_id: String,
    ledger: Arc<ResourceLedger>,
    backend: Arc<dyn ContainerBackend>,
    store: Arc<dyn RecordStore>,
    health: watch::Receiver<HealthStatus>,
    config: ReconcilerConfig,
    first_seen: HashMap<String, Instant>,
    startup_done: bool,
}

impl BulkReconciler {
    pub fn new(
        cell_id: String,
        ledger: Arc<ResourceLedger>,
        backend: Arc<dyn ContainerBackend>,
        store: Arc<dyn RecordStore>,
        health: watch::Receiver<HealthStatus>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            cell_id,
            ledger,
            backend,
            store,
            health,
            config,
            first_seen: HashMap::new(),
            startup_done: false,
        }
    }

    /// Run ticks until shutdown. Ticks are mutually exclusive by
    /// construction; a tick that overruns the interval causes the next one
    /// to be skipped rather than queued.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "starting bulk reconciler"
        );
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("bulk reconciler shutting down");
                        return;
                    }
                    continue;
                }
            }

            if !self.health.borrow().is_healthy() {
                debug!("skipping reconciliation, cell not healthy");
                continue;
            }

            if let Err(e) = self.tick(&shutdown).await {
                warn!(error = %e, "reconciliation tick failed");
            }
        }
    }

    /// One full reconciliation pass.
    pub async fn tick(&mut self, shutdown: &watch::Receiver<bool>) -> anyhow::Result<()> {
        let containers = self
            .io(self.backend.list(ContainerFilter::workloads()))
            .await
            .context("listing containers")??;

        let handles: Vec<String> = containers.iter().map(|c| c.handle.clone()).collect();
        let infos = self
            .io(self.backend.bulk_info(&handles))
            .await
            .context("bulk container info")??;

        let groups = self
            .io(self.store.actual_lrp_groups(&ActualLrpFilter {
                cell_id: Some(self.cell_id.clone()),
                ..Default::default()
            }))
            .await
            .context("listing actual lrps")??;
        let lrps: Vec<ActualLrp> = groups
            .into_iter()
            .filter_map(|g| g.instance)
            .filter(|lrp| {
                lrp.instance_key
                    .as_ref()
                    .map(|k| k.cell_id == self.cell_id)
                    .unwrap_or(false)
            })
            .collect();

        let tasks = self
            .io(self.store.tasks(&TaskFilter {
                cell_id: Some(self.cell_id.clone()),
            }))
            .await
            .context("listing tasks")??;

        let now = Instant::now();
        self.first_seen.retain(|handle, _| handles.contains(handle));
        for handle in &handles {
            self.first_seen.entry(handle.clone()).or_insert(now);
        }
        let ripe_handles: HashSet<String> = self
            .first_seen
            .iter()
            .filter(|(_, first)| now.duration_since(**first) >= self.config.grace)
            .map(|(handle, _)| handle.clone())
            .collect();

        let allocations = self.ledger.snapshot().allocations;
        let buckets = diff(
            &containers,
            &infos,
            &lrps,
            &tasks,
            &allocations,
            !self.startup_done,
            &ripe_handles,
            self.config.grace,
        );
        self.startup_done = true;

        if !buckets.is_empty() {
            info!(
                extra = buckets.extra_containers.len(),
                orphaned = buckets.orphaned_allocations.len(),
                missing = buckets.missing_containers.len(),
                mismatched = buckets.mismatched_instances.len(),
                completed = buckets.completed_containers.len(),
                stale_tasks = buckets.stale_tasks.len(),
                adopted = buckets.adoptions.len(),
                "reconciliation divergences"
            );
        }

        for allocation in buckets.adoptions {
            debug!(key = %allocation.key, "adopting container into ledger");
            self.ledger.adopt(allocation);
        }

        if self.should_stop(shutdown) {
            return Ok(());
        }
        for container in buckets.extra_containers {
            if let Err(e) = self.destroy_container(&container.handle).await {
                warn!(handle = %container.handle, error = %e, "failed to destroy extra container");
            }
        }

        if self.should_stop(shutdown) {
            return Ok(());
        }
        for allocation in buckets.orphaned_allocations {
            if let Err(e) = self.reap_orphaned_allocation(&allocation).await {
                warn!(key = %allocation.key, error = %e, "failed to reap orphaned allocation");
            }
        }

        if self.should_stop(shutdown) {
            return Ok(());
        }
        for lrp in buckets
            .missing_containers
            .iter()
            .chain(buckets.mismatched_instances.iter())
        {
            if let Err(e) = self.remove_claim(lrp).await {
                warn!(
                    process_guid = %lrp.key.process_guid,
                    index = lrp.key.index,
                    error = %e,
                    "failed to remove stale claim"
                );
            }
        }

        if self.should_stop(shutdown) {
            return Ok(());
        }
        for (container, exit_code) in buckets.completed_containers {
            if let Err(e) = self.reap_completed_container(&container, exit_code).await {
                warn!(handle = %container.handle, error = %e, "failed to reap completed container");
            }
        }

        if self.should_stop(shutdown) {
            return Ok(());
        }
        for task in buckets.stale_tasks {
            debug!(task_guid = %task.task_guid, "failing task with no container");
            if let Err(e) = allow_conflict(
                self.io(self.store.fail_task(&task.task_guid, "no-container"))
                    .await?,
            ) {
                warn!(task_guid = %task.task_guid, error = %e, "failed to fail stale task");
            }
        }

        Ok(())
    }

    fn should_stop(&self, shutdown: &watch::Receiver<bool>) -> bool {
        *shutdown.borrow()
    }

    async fn destroy_container(&self, handle: &str) -> anyhow::Result<()> {
        info!(handle = %handle, "destroying container");
        match self.io(self.backend.destroy(handle)).await? {
            Ok(()) | Err(crate::backend::BackendError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn reap_orphaned_allocation(&self, allocation: &Allocation) -> anyhow::Result<()> {
        info!(key = %allocation.key, "releasing allocation with no container");
        self.ledger.release(&allocation.key);
        match &allocation.key {
            PlacementKey::Lrp {
                process_guid,
                index,
            } => {
                let key = ActualLrpKey {
                    process_guid: process_guid.clone(),
                    index: *index,
                };
                let instance_key = ActualLrpInstanceKey {
                    instance_guid: allocation.instance_guid.clone(),
                    cell_id: self.cell_id.clone(),
                };
                let result = self
                    .io(self.store.crash_actual_lrp(&key, &instance_key, "container-missing"))
                    .await?;
                match result {
                    Ok(()) | Err(crate::records::StoreError::NotFound(_)) => Ok(()),
                    other => allow_conflict(other).map_err(Into::into),
                }
            }
            PlacementKey::Task { task_guid } => {
                let result = self
                    .io(self.store.fail_task(task_guid, "container-missing"))
                    .await?;
                match result {
                    Ok(()) | Err(crate::records::StoreError::NotFound(_)) => Ok(()),
                    other => allow_conflict(other).map_err(Into::into),
                }
            }
        }
    }

    async fn remove_claim(&self, lrp: &ActualLrp) -> anyhow::Result<()> {
        info!(
            process_guid = %lrp.key.process_guid,
            index = lrp.key.index,
            "removing actual lrp this cell no longer backs"
        );
        let result = self.io(self.store.remove_actual_lrp(&lrp.key)).await?;
        match result {
            Ok(()) | Err(crate::records::StoreError::NotFound(_)) => Ok(()),
            other => allow_conflict(other).map_err(Into::into),
        }
    }

    async fn reap_completed_container(
        &self,
        container: &Container,
        exit_code: i32,
    ) -> anyhow::Result<()> {
        let Some(key) = container.placement_key() else {
            return self.destroy_container(&container.handle).await;
        };
        info!(key = %key, exit_code, "reaping completed container");

        match &key {
            PlacementKey::Lrp {
                process_guid,
                index,
            } => {
                let store_key = ActualLrpKey {
                    process_guid: process_guid.clone(),
                    index: *index,
                };
                if exit_code == 0 {
                    let result = self.io(self.store.remove_actual_lrp(&store_key)).await?;
                    if let Err(e) = result {
                        if !matches!(e, crate::records::StoreError::NotFound(_)) {
                            allow_conflict(Err(e))?;
                        }
                    }
                } else {
                    let instance_key = ActualLrpInstanceKey {
                        instance_guid: container
                            .instance_guid()
                            .unwrap_or(&container.handle)
                            .to_string(),
                        cell_id: self.cell_id.clone(),
                    };
                    let reason = format!("exited with status {exit_code}");
                    let result = self
                        .io(self.store.crash_actual_lrp(&store_key, &instance_key, &reason))
                        .await?;
                    if let Err(e) = result {
                        if !matches!(e, crate::records::StoreError::NotFound(_)) {
                            allow_conflict(Err(e))?;
                        }
                    }
                }
            }
            PlacementKey::Task { task_guid } => {
                let reason = if exit_code == 0 {
                    String::new()
                } else {
                    format!("exited with status {exit_code}")
                };
                let result = self
                    .io(self
                        .store
                        .complete_task(task_guid, &self.cell_id, exit_code != 0, &reason))
                    .await?;
                if let Err(e) = result {
                    if !matches!(e, crate::records::StoreError::NotFound(_)) {
                        allow_conflict(Err(e))?;
                    }
                }
            }
        }

        self.destroy_container(&container.handle).await?;
        self.ledger.release(&key);
        Ok(())
    }

    async fn io<T>(
        &self,
        fut: impl std::future::Future<Output = T>,
    ) -> anyhow::Result<T> {
        tokio::time::timeout(self.config.op_timeout, fut)
            .await
            .map_err(|_| anyhow::anyhow!("deadline exceeded"))
    }
}

/// Pure three-way diff. Each placement key lands in at most one bucket;
/// earlier buckets win ties.
#[allow(clippy::too_many_arguments)]
fn diff(
    containers: &[Container],
    infos: &HashMap<String, ContainerInfo>,
    lrps: &[ActualLrp],
    tasks: &[TaskRecord],
    allocations: &[Allocation],
    startup: bool,
    ripe_handles: &HashSet<String>,
    grace: Duration,
) -> Buckets {
    let mut buckets = Buckets::default();
    let mut claimed: HashSet<PlacementKey> = HashSet::new();

    let allocation_by_key: HashMap<&PlacementKey, &Allocation> =
        allocations.iter().map(|a| (&a.key, a)).collect();
    let container_by_key: HashMap<PlacementKey, &Container> = containers
        .iter()
        .filter_map(|c| c.placement_key().map(|k| (k, c)))
        .collect();
    let lrp_by_key: HashMap<PlacementKey, &ActualLrp> = lrps
        .iter()
        .map(|lrp| {
            (
                PlacementKey::Lrp {
                    process_guid: lrp.key.process_guid.clone(),
                    index: lrp.key.index,
                },
                lrp,
            )
        })
        .collect();
    let task_by_key: HashMap<PlacementKey, &TaskRecord> = tasks
        .iter()
        .map(|task| {
            (
                PlacementKey::Task {
                    task_guid: task.task_guid.clone(),
                },
                task,
            )
        })
        .collect();

    // Containers first: extras and adoptions. Completions are only
    // collected here; they rank below missing/mismatched claims and are
    // folded in after those loops have run.
    let mut completed_candidates: Vec<(PlacementKey, Container, i32)> = Vec::new();
    for container in containers {
        let key = container.placement_key();

        let store_backed = match &key {
            None => false,
            Some(k @ PlacementKey::Lrp { .. }) => lrp_by_key.contains_key(k),
            Some(k @ PlacementKey::Task { .. }) => task_by_key.contains_key(k),
        };

        if !store_backed {
            // Freshly created containers get a grace period so an
            // in-flight placement is not destroyed; at startup the node is
            // assumed fresh and everything unaccounted for goes.
            let young_allocation = key
                .as_ref()
                .and_then(|k| allocation_by_key.get(k))
                .map(|a| a.reserved_at.elapsed() < grace)
                .unwrap_or(false);
            let ripe = startup || ripe_handles.contains(&container.handle);
            if ripe && !young_allocation {
                if let Some(k) = &key {
                    claimed.insert(k.clone());
                }
                buckets.extra_containers.push(container.clone());
            }
            continue;
        }

        let key = key.expect("store-backed container has a key");

        if allocation_by_key.contains_key(&key) {
            if let Some(info) = infos.get(&container.handle) {
                if info.state == ContainerState::Stopped {
                    let exit_code = info.exit_result.map(|r| r.exit_code).unwrap_or(-1);
                    completed_candidates.push((key.clone(), container.clone(), exit_code));
                }
            }
        } else {
            // Store says ours, backend agrees, ledger forgot: adopt. Only
            // when the claim names this container's incarnation, though; a
            // guid mismatch belongs to the mismatched bucket below.
            let instance_guid = container
                .instance_guid()
                .unwrap_or(&container.handle)
                .to_string();
            if let Some(lrp) = lrp_by_key.get(&key) {
                let store_guid = lrp
                    .instance_key
                    .as_ref()
                    .map(|k| k.instance_guid.as_str())
                    .unwrap_or_default();
                if store_guid != instance_guid {
                    continue;
                }
            }
            let domain = container
                .tags
                .get(crate::model::DOMAIN_TAG)
                .cloned()
                .unwrap_or_default();
            let mut allocation = Allocation::new(
                key.clone(),
                instance_guid,
                domain,
                hive_cell_api::RootFs::default(),
                container.resources,
            );
            allocation.state = crate::model::AllocationState::Running;
            claimed.insert(key.clone());
            buckets.adoptions.push(allocation);
        }
    }

    // Ledger allocations with no container, past the grace period.
    for allocation in allocations {
        if claimed.contains(&allocation.key) || allocation.is_completed() {
            continue;
        }
        if container_by_key.contains_key(&allocation.key) {
            continue;
        }
        if allocation.reserved_at.elapsed() >= grace && claimed.insert(allocation.key.clone()) {
            buckets.orphaned_allocations.push(allocation.clone());
        }
    }

    // Store claims with nothing behind them.
    for (key, lrp) in &lrp_by_key {
        if claimed.contains(key) {
            continue;
        }
        match container_by_key.get(key) {
            None => {
                if allocation_by_key.contains_key(key) {
                    continue; // in flight; the orphan path owns it later
                }
                claimed.insert(key.clone());
                buckets.missing_containers.push((*lrp).clone());
            }
            Some(container) => {
                let store_guid = lrp
                    .instance_key
                    .as_ref()
                    .map(|k| k.instance_guid.as_str())
                    .unwrap_or_default();
                let container_guid = container.instance_guid().unwrap_or(&container.handle);
                if store_guid != container_guid {
                    claimed.insert(key.clone());
                    buckets.mismatched_instances.push((*lrp).clone());
                }
            }
        }
    }

    // Completions last among container-backed divergences: a claim that
    // moved to another instance incarnation outranks the stale container's
    // exit.
    for (key, container, exit_code) in completed_candidates {
        if claimed.insert(key) {
            buckets.completed_containers.push((container, exit_code));
        }
    }

    // Store tasks running here with no container.
    for (key, task) in &task_by_key {
        if claimed.contains(key) || task.state != TaskState::Running {
            continue;
        }
        if container_by_key.contains_key(key) || allocation_by_key.contains_key(key) {
            continue;
        }
        claimed.insert(key.clone());
        buckets.stale_tasks.push((*task).clone());
    }

    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Tags, DOMAIN_TAG, INDEX_TAG, INSTANCE_GUID_TAG, LIFECYCLE_TAG, PROCESS_GUID_TAG, TASK_GUID_TAG};
    use crate::records::LrpState;
    use hive_cell_api::Resources;

    fn lrp_container(handle: &str, process_guid: &str, index: i32) -> Container {
        let mut tags = Tags::new();
        tags.insert(LIFECYCLE_TAG.to_string(), "app".to_string());
        tags.insert(PROCESS_GUID_TAG.to_string(), process_guid.to_string());
        tags.insert(INDEX_TAG.to_string(), index.to_string());
        tags.insert(INSTANCE_GUID_TAG.to_string(), handle.to_string());
        tags.insert(DOMAIN_TAG.to_string(), "apps".to_string());
        Container {
            handle: handle.to_string(),
            tags,
            resources: Resources::new(64, 64, 1),
            state: ContainerState::Running,
            exit_result: None,
        }
    }

    fn task_container(task_guid: &str) -> Container {
        let mut tags = Tags::new();
        tags.insert(LIFECYCLE_TAG.to_string(), "task".to_string());
        tags.insert(TASK_GUID_TAG.to_string(), task_guid.to_string());
        Container {
            handle: task_guid.to_string(),
            tags,
            resources: Resources::new(64, 64, 1),
            state: ContainerState::Running,
            exit_result: None,
        }
    }

    fn claimed_lrp(process_guid: &str, index: i32, instance_guid: &str, cell_id: &str) -> ActualLrp {
        ActualLrp {
            key: ActualLrpKey {
                process_guid: process_guid.to_string(),
                index,
            },
            instance_key: Some(ActualLrpInstanceKey {
                instance_guid: instance_guid.to_string(),
                cell_id: cell_id.to_string(),
            }),
            state: LrpState::Claimed,
            crash_reason: None,
        }
    }

    fn running_task(task_guid: &str, cell_id: &str) -> TaskRecord {
        TaskRecord {
            task_guid: task_guid.to_string(),
            domain: "apps".to_string(),
            cell_id: Some(cell_id.to_string()),
            state: TaskState::Running,
            failed: false,
            failure_reason: None,
        }
    }

    #[test]
    fn startup_marks_unaccounted_containers_extra() {
        let containers = vec![lrp_container("ig-1", "pg", 0), task_container("tg")];
        let buckets = diff(
            &containers,
            &HashMap::new(),
            &[],
            &[],
            &[],
            true,
            &HashSet::new(),
            Duration::from_secs(30),
        );
        assert_eq!(buckets.extra_containers.len(), 2);
    }

    #[test]
    fn extras_wait_for_grace_after_startup() {
        let containers = vec![lrp_container("ig-1", "pg", 0)];
        let buckets = diff(
            &containers,
            &HashMap::new(),
            &[],
            &[],
            &[],
            false,
            &HashSet::new(),
            Duration::from_secs(30),
        );
        assert!(buckets.extra_containers.is_empty());

        let ripe: HashSet<String> = ["ig-1".to_string()].into_iter().collect();
        let buckets = diff(
            &containers,
            &HashMap::new(),
            &[],
            &[],
            &[],
            false,
            &ripe,
            Duration::from_secs(30),
        );
        assert_eq!(buckets.extra_containers.len(), 1);
    }

    #[test]
    fn missing_container_claims_are_removed() {
        let lrps = vec![claimed_lrp("pg", 0, "ig-1", "cell-a")];
        let buckets = diff(
            &[],
            &HashMap::new(),
            &lrps,
            &[],
            &[],
            false,
            &HashSet::new(),
            Duration::from_secs(30),
        );
        assert_eq!(buckets.missing_containers.len(), 1);
    }

    #[test]
    fn mismatched_instance_guid_is_its_own_bucket() {
        let containers = vec![lrp_container("ig-actual", "pg", 0)];
        let lrps = vec![claimed_lrp("pg", 0, "ig-claimed", "cell-a")];
        let buckets = diff(
            &containers,
            &HashMap::new(),
            &lrps,
            &[],
            &[],
            false,
            &HashSet::new(),
            Duration::from_secs(30),
        );
        assert_eq!(buckets.mismatched_instances.len(), 1);
        assert!(buckets.missing_containers.is_empty());
        assert!(buckets.extra_containers.is_empty());
    }

    #[test]
    fn stale_running_tasks_are_failed() {
        let tasks = vec![running_task("tg", "cell-a")];
        let buckets = diff(
            &[],
            &HashMap::new(),
            &[],
            &tasks,
            &[],
            false,
            &HashSet::new(),
            Duration::from_secs(30),
        );
        assert_eq!(buckets.stale_tasks.len(), 1);
    }

    #[test]
    fn mismatched_instance_wins_over_completed_container() {
        // The claim moved on to a new incarnation while this cell still
        // holds the old allocation and its stopped container.
        let containers = vec![{
            let mut c = lrp_container("ig-old", "pg", 0);
            c.state = ContainerState::Stopped;
            c
        }];
        let mut infos = HashMap::new();
        infos.insert(
            "ig-old".to_string(),
            ContainerInfo {
                state: ContainerState::Stopped,
                exit_result: Some(crate::model::ExitResult { exit_code: 1 }),
            },
        );
        let lrps = vec![claimed_lrp("pg", 0, "ig-new", "cell-a")];
        let mut allocation = Allocation::new(
            PlacementKey::Lrp {
                process_guid: "pg".to_string(),
                index: 0,
            },
            "ig-old".to_string(),
            "apps".to_string(),
            hive_cell_api::RootFs::new("preloaded:trusty"),
            Resources::new(64, 64, 1),
        );
        allocation.state = crate::model::AllocationState::Running;

        let buckets = diff(
            &containers,
            &infos,
            &lrps,
            &[],
            &[allocation],
            false,
            &HashSet::new(),
            Duration::from_secs(30),
        );
        assert_eq!(buckets.mismatched_instances.len(), 1);
        assert!(buckets.completed_containers.is_empty());
    }

    #[test]
    fn completed_container_wins_over_stale_task() {
        let containers = vec![{
            let mut c = task_container("tg");
            c.state = ContainerState::Stopped;
            c
        }];
        let mut infos = HashMap::new();
        infos.insert(
            "tg".to_string(),
            ContainerInfo {
                state: ContainerState::Stopped,
                exit_result: Some(crate::model::ExitResult { exit_code: 3 }),
            },
        );
        let tasks = vec![running_task("tg", "cell-a")];
        let mut allocation = Allocation::new(
            PlacementKey::Task {
                task_guid: "tg".to_string(),
            },
            "tg".to_string(),
            "apps".to_string(),
            hive_cell_api::RootFs::new("preloaded:trusty"),
            Resources::new(64, 64, 1),
        );
        allocation.state = crate::model::AllocationState::Running;

        let buckets = diff(
            &containers,
            &infos,
            &[],
            &tasks,
            &[allocation],
            false,
            &HashSet::new(),
            Duration::from_secs(30),
        );
        assert_eq!(buckets.completed_containers.len(), 1);
        assert_eq!(buckets.completed_containers[0].1, 3);
        assert!(buckets.stale_tasks.is_empty());
    }

    #[test]
    fn store_backed_container_missing_from_ledger_is_adopted() {
        let containers = vec![lrp_container("ig-1", "pg", 0)];
        let lrps = vec![claimed_lrp("pg", 0, "ig-1", "cell-a")];
        let buckets = diff(
            &containers,
            &HashMap::new(),
            &lrps,
            &[],
            &[],
            false,
            &HashSet::new(),
            Duration::from_secs(30),
        );
        assert_eq!(buckets.adoptions.len(), 1);
        assert_eq!(buckets.adoptions[0].instance_guid, "ig-1");
    }
}
