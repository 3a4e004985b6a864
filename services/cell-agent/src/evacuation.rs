//! Evacuation: graceful drain under a hard deadline.
//!
//! Once triggered there is no way back: the evacuating latch flips, new
//! work is refused, running LRPs are handed back to the auctioneer for
//! re-placement, and tasks are failed. Drain completes when every
//! allocation has finished or the deadline fires; survivors are then
//! force-stopped and their records cleared.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hive_cell_api::PlacementKey;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use crate::backend::ContainerBackend;
use crate::health::HealthStatus;
use crate::ledger::ResourceLedger;
use crate::model::Allocation;
use crate::records::{
    allow_conflict, ActualLrpInstanceKey, ActualLrpKey, RecordStore,
};

#[derive(Debug, Clone)]
pub struct EvacuationConfig {
    /// Hard deadline for the whole drain.
    pub timeout: Duration,
}

impl Default for EvacuationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
        }
    }
}

/// Handle used by the HTTP surface and the signal handler to request
/// evacuation. Requests after the first are no-ops.
#[derive(Clone, Default)]
pub struct EvacuationTrigger {
    notify: Arc<Notify>,
}

impl EvacuationTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.notify.notify_one();
    }
}

pub struct EvacuationController {
    cell_id: String,
    ledger: Arc<ResourceLedger>,
    backend: Arc<dyn ContainerBackend>,
    store: Arc<dyn RecordStore>,
    health: watch::Receiver<HealthStatus>,
    trigger: EvacuationTrigger,
    evacuating_tx: watch::Sender<bool>,
    drained_tx: watch::Sender<bool>,
    config: EvacuationConfig,
}

impl EvacuationController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cell_id: String,
        ledger: Arc<ResourceLedger>,
        backend: Arc<dyn ContainerBackend>,
        store: Arc<dyn RecordStore>,
        health: watch::Receiver<HealthStatus>,
        trigger: EvacuationTrigger,
        evacuating_tx: watch::Sender<bool>,
        drained_tx: watch::Sender<bool>,
        config: EvacuationConfig,
    ) -> Self {
        Self {
            cell_id,
            ledger,
            backend,
            store,
            health,
            trigger,
            evacuating_tx,
            drained_tx,
            config,
        }
    }

    /// Wait for a trigger, then drive the drain to completion. Evacuation
    /// ignores the shutdown signal once started; it must make progress.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = self.trigger.notify.notified() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                // Spurious wake; wait for the real trigger.
                self.trigger.notify.notified().await;
            }
        }

        info!(timeout_ms = self.config.timeout.as_millis() as u64, "evacuation requested");
        let _ = self.evacuating_tx.send(true);

        self.hand_back_workloads().await;

        let deadline = Instant::now() + self.config.timeout;
        let poll = (self.config.timeout / 20).max(Duration::from_millis(10));

        loop {
            if self.ledger.is_drained() {
                info!("evacuation drained cleanly");
                break;
            }
            if !self.health.borrow().is_healthy() {
                // An unreachable backend cannot run anything; nothing left
                // to wait for.
                warn!("cell unhealthy during evacuation, treating drain as complete");
                break;
            }
            if Instant::now() >= deadline {
                warn!("evacuation deadline expired, force-stopping survivors");
                let force = self.force_stop_survivors();
                if tokio::time::timeout(self.config.timeout, force).await.is_err() {
                    warn!("force-stop pass exceeded its budget");
                }
                break;
            }
            tokio::time::sleep(poll).await;
        }

        info!("evacuation complete");
        let _ = self.drained_tx.send(true);
    }

    /// Tell the store to re-place LRPs elsewhere and fail tasks; the
    /// workloads themselves keep running until stopped or completed.
    async fn hand_back_workloads(&self) {
        let snapshot = self.ledger.snapshot();
        for allocation in &snapshot.allocations {
            if allocation.is_completed() {
                continue;
            }
            let result = match &allocation.key {
                PlacementKey::Lrp { .. } => {
                    let (key, instance_key) = self.lrp_keys(allocation);
                    if allocation.state == crate::model::AllocationState::Running {
                        allow_conflict(
                            self.store.evacuate_running_actual_lrp(&key, &instance_key).await,
                        )
                    } else {
                        allow_conflict(
                            self.store.evacuate_claimed_actual_lrp(&key, &instance_key).await,
                        )
                    }
                }
                PlacementKey::Task { task_guid } => {
                    allow_conflict(self.store.fail_task(task_guid, "cell-evacuating").await)
                }
            };
            if let Err(e) = result {
                warn!(key = %allocation.key, error = %e, "failed to hand back workload");
            }
        }
    }

    /// Deadline path: destroy whatever is left and clear its records. Each
    /// call is individually bounded so a wedged backend cannot stall the
    /// exit.
    async fn force_stop_survivors(&self) {
        let call_budget = (self.config.timeout / 4).max(Duration::from_millis(10));
        let snapshot = self.ledger.snapshot();

        for allocation in &snapshot.allocations {
            let handle = allocation.container_handle().to_string();
            let destroy = tokio::time::timeout(call_budget, self.backend.destroy(&handle)).await;
            match destroy {
                Ok(Ok(())) | Ok(Err(crate::backend::BackendError::NotFound(_))) => {}
                Ok(Err(e)) => warn!(handle = %handle, error = %e, "force destroy failed"),
                Err(_) => warn!(handle = %handle, "force destroy timed out"),
            }

            match &allocation.key {
                PlacementKey::Lrp { .. } => {
                    let (key, instance_key) = self.lrp_keys(allocation);
                    let _ = tokio::time::timeout(
                        call_budget,
                        self.store.remove_evacuating_actual_lrp(&key, &instance_key),
                    )
                    .await;
                    let _ = tokio::time::timeout(
                        call_budget,
                        self.store.remove_actual_lrp(&key),
                    )
                    .await;
                }
                PlacementKey::Task { task_guid } => {
                    let _ = tokio::time::timeout(
                        call_budget,
                        self.store.fail_task(task_guid, "cell-evacuating"),
                    )
                    .await;
                }
            }

            self.ledger.release(&allocation.key);
        }
    }

    fn lrp_keys(&self, allocation: &Allocation) -> (ActualLrpKey, ActualLrpInstanceKey) {
        let PlacementKey::Lrp {
            process_guid,
            index,
        } = &allocation.key
        else {
            unreachable!("lrp_keys called for a task allocation");
        };
        (
            ActualLrpKey {
                process_guid: process_guid.clone(),
                index: *index,
            },
            ActualLrpInstanceKey {
                instance_guid: allocation.instance_guid.clone(),
                cell_id: self.cell_id.clone(),
            },
        )
    }
}
