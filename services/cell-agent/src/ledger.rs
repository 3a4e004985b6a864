//! Resource ledger: the single shared mutable structure in the agent.
//!
//! Tracks total capacity, the set of live allocations, and the derived
//! available pool. Batch reservation is atomic: either the whole batch is
//! committed or nothing is.

use std::collections::HashMap;
use std::sync::Mutex;

use hive_cell_api::{PlacementKey, Resources, RootFsProviders};
use tracing::debug;

use crate::model::{Allocation, AllocationState};

/// Why a reservation was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    InsufficientMemory,
    InsufficientDisk,
    InsufficientContainers,
    UnsupportedRootfs,
    DuplicateKey,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::InsufficientMemory => "insufficient-memory",
            RejectionReason::InsufficientDisk => "insufficient-disk",
            RejectionReason::InsufficientContainers => "insufficient-containers",
            RejectionReason::UnsupportedRootfs => "unsupported-rootfs",
            RejectionReason::DuplicateKey => "duplicate-key",
        }
    }
}

/// A failed batch: nothing was reserved; each genuinely infeasible item is
/// listed with its reason.
#[derive(Debug)]
pub struct BatchRejected {
    pub rejections: Vec<(PlacementKey, RejectionReason)>,
}

/// Consistent view of the ledger at one instant.
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    pub total: Resources,
    pub available: Resources,
    pub allocations: Vec<Allocation>,
}

/// Concurrent-safe account of capacity and allocations. One writer at a
/// time; readers observe consistent snapshots.
pub struct ResourceLedger {
    total: Resources,
    providers: RootFsProviders,
    allocations: Mutex<HashMap<PlacementKey, Allocation>>,
}

impl ResourceLedger {
    pub fn new(total: Resources, providers: RootFsProviders) -> Self {
        Self {
            total,
            providers,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    pub fn total(&self) -> Resources {
        self.total
    }

    pub fn providers(&self) -> &RootFsProviders {
        &self.providers
    }

    fn available_locked(&self, allocations: &HashMap<PlacementKey, Allocation>) -> Resources {
        let mut used = Resources::ZERO;
        for allocation in allocations.values() {
            if !allocation.is_completed() {
                used = used.add(&allocation.resources);
            }
        }
        self.total.saturating_sub(&used)
    }

    /// Atomically reserve a batch of allocations.
    ///
    /// The batch is processed in ascending placement-key order so that
    /// rejections are reproducible. Re-reserving a key this cell already
    /// holds is a no-op that still counts as accepted. Returns the accepted
    /// keys, or an error describing every infeasible item; on error the
    /// ledger is unchanged.
    pub fn reserve(&self, mut batch: Vec<Allocation>) -> Result<Vec<PlacementKey>, BatchRejected> {
        batch.sort_by(|a, b| a.key.cmp(&b.key));

        let mut allocations = self.allocations.lock().expect("ledger lock poisoned");
        let mut remaining = self.available_locked(&allocations);

        let mut rejections = Vec::new();
        let mut accepted = Vec::new();
        let mut to_insert = Vec::new();
        let mut seen_in_batch: Vec<&PlacementKey> = Vec::new();

        for allocation in &batch {
            let key = &allocation.key;

            if seen_in_batch.contains(&key) {
                rejections.push((key.clone(), RejectionReason::DuplicateKey));
                continue;
            }
            seen_in_batch.push(key);

            if allocations.contains_key(key) {
                // Idempotent retry from the auctioneer.
                accepted.push(key.clone());
                continue;
            }

            if !self.providers.supports(&allocation.rootfs) {
                rejections.push((key.clone(), RejectionReason::UnsupportedRootfs));
                continue;
            }

            if let Some(reason) = insufficiency(&remaining, &allocation.resources) {
                rejections.push((key.clone(), reason));
                continue;
            }

            remaining = remaining.saturating_sub(&allocation.resources);
            accepted.push(key.clone());
            to_insert.push(allocation.clone());
        }

        if !rejections.is_empty() {
            return Err(BatchRejected { rejections });
        }

        for allocation in to_insert {
            debug!(key = %allocation.key, resources = %allocation.resources, "reserved");
            allocations.insert(allocation.key.clone(), allocation);
        }

        Ok(accepted)
    }

    /// Insert an allocation discovered outside the placement path, e.g. a
    /// container found running after an agent restart.
    pub fn adopt(&self, allocation: Allocation) {
        let mut allocations = self.allocations.lock().expect("ledger lock poisoned");
        allocations.entry(allocation.key.clone()).or_insert(allocation);
    }

    /// Drop an allocation, returning it if it existed.
    pub fn release(&self, key: &PlacementKey) -> Option<Allocation> {
        let mut allocations = self.allocations.lock().expect("ledger lock poisoned");
        let released = allocations.remove(key);
        if released.is_some() {
            debug!(key = %key, "released");
        }
        released
    }

    /// Advance an allocation's state. Transitions are forward-only;
    /// attempts to move backwards are ignored.
    pub fn transition(&self, key: &PlacementKey, state: AllocationState) -> bool {
        let mut allocations = self.allocations.lock().expect("ledger lock poisoned");
        match allocations.get_mut(key) {
            Some(allocation) if allocation.state < state => {
                allocation.state = state;
                true
            }
            _ => false,
        }
    }

    /// Fast-forward an allocation to `Completed` with a failure reason.
    pub fn fail(&self, key: &PlacementKey, reason: &str) -> bool {
        let mut allocations = self.allocations.lock().expect("ledger lock poisoned");
        match allocations.get_mut(key) {
            Some(allocation) if allocation.state < AllocationState::Completed => {
                allocation.state = AllocationState::Completed;
                allocation.failure_reason = Some(reason.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: &PlacementKey) -> Option<Allocation> {
        let allocations = self.allocations.lock().expect("ledger lock poisoned");
        allocations.get(key).cloned()
    }

    /// Find the LRP allocation for a process guid + instance guid pair.
    pub fn find_lrp_instance(&self, process_guid: &str, instance_guid: &str) -> Option<Allocation> {
        let allocations = self.allocations.lock().expect("ledger lock poisoned");
        allocations
            .values()
            .find(|a| {
                a.instance_guid == instance_guid
                    && matches!(&a.key, PlacementKey::Lrp { process_guid: pg, .. } if pg == process_guid)
            })
            .cloned()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let allocations = self.allocations.lock().expect("ledger lock poisoned");
        let available = self.available_locked(&allocations);
        let mut list: Vec<Allocation> = allocations.values().cloned().collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        LedgerSnapshot {
            total: self.total,
            available,
            allocations: list,
        }
    }

    pub fn is_drained(&self) -> bool {
        let allocations = self.allocations.lock().expect("ledger lock poisoned");
        allocations.values().all(|a| a.is_completed())
    }
}

fn insufficiency(remaining: &Resources, wanted: &Resources) -> Option<RejectionReason> {
    if wanted.memory_mb > remaining.memory_mb {
        Some(RejectionReason::InsufficientMemory)
    } else if wanted.disk_mb > remaining.disk_mb {
        Some(RejectionReason::InsufficientDisk)
    } else if wanted.containers > remaining.containers {
        Some(RejectionReason::InsufficientContainers)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_cell_api::RootFs;

    fn providers() -> RootFsProviders {
        RootFsProviders {
            preloaded: vec!["trusty".to_string()],
            schemes: vec!["docker".to_string()],
        }
    }

    fn lrp(process_guid: &str, index: i32, memory_mb: u64) -> Allocation {
        Allocation::new(
            PlacementKey::Lrp {
                process_guid: process_guid.to_string(),
                index,
            },
            format!("ig-{process_guid}-{index}"),
            "apps".to_string(),
            RootFs::new("preloaded:trusty"),
            Resources::new(memory_mb, 10, 1),
        )
    }

    #[test]
    fn reserve_commits_whole_batch() {
        let ledger = ResourceLedger::new(Resources::new(1024, 2048, 3), providers());

        let accepted = ledger
            .reserve(vec![lrp("pg", 0, 100), lrp("pg", 1, 100)])
            .unwrap();
        assert_eq!(accepted.len(), 2);
        assert_eq!(ledger.snapshot().available, Resources::new(824, 2028, 1));
    }

    #[test]
    fn reserve_is_all_or_nothing() {
        let ledger = ResourceLedger::new(Resources::new(150, 2048, 3), providers());

        let err = ledger
            .reserve(vec![lrp("pg", 0, 100), lrp("pg", 1, 100)])
            .unwrap_err();
        assert_eq!(
            err.rejections,
            vec![(
                PlacementKey::Lrp {
                    process_guid: "pg".to_string(),
                    index: 1
                },
                RejectionReason::InsufficientMemory
            )]
        );
        // Ledger unchanged: the feasible item was not committed either.
        assert_eq!(ledger.snapshot().available, Resources::new(150, 2048, 3));
        assert!(ledger.snapshot().allocations.is_empty());
    }

    #[test]
    fn rejections_are_deterministic_by_key_order() {
        let ledger = ResourceLedger::new(Resources::new(100, 2048, 3), providers());

        // Submitted out of order; the lower index wins the capacity.
        let err = ledger
            .reserve(vec![lrp("pg", 1, 80), lrp("pg", 0, 80)])
            .unwrap_err();
        assert_eq!(err.rejections.len(), 1);
        assert_eq!(
            err.rejections[0].0,
            PlacementKey::Lrp {
                process_guid: "pg".to_string(),
                index: 1
            }
        );
    }

    #[test]
    fn duplicate_key_within_batch_rejected() {
        let ledger = ResourceLedger::new(Resources::new(1024, 2048, 3), providers());

        let err = ledger
            .reserve(vec![lrp("pg", 0, 10), lrp("pg", 0, 10)])
            .unwrap_err();
        assert_eq!(err.rejections[0].1, RejectionReason::DuplicateKey);
    }

    #[test]
    fn re_reserving_held_key_is_idempotent() {
        let ledger = ResourceLedger::new(Resources::new(1024, 2048, 3), providers());

        ledger.reserve(vec![lrp("pg", 0, 100)]).unwrap();
        let available = ledger.snapshot().available;

        let accepted = ledger.reserve(vec![lrp("pg", 0, 100)]).unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(ledger.snapshot().available, available);
    }

    #[test]
    fn unsupported_rootfs_rejected() {
        let ledger = ResourceLedger::new(Resources::new(1024, 2048, 3), providers());

        let mut allocation = lrp("pg", 0, 10);
        allocation.rootfs = RootFs::new("oci:///busybox");
        let err = ledger.reserve(vec![allocation]).unwrap_err();
        assert_eq!(err.rejections[0].1, RejectionReason::UnsupportedRootfs);
    }

    #[test]
    fn available_never_goes_negative() {
        let ledger = ResourceLedger::new(Resources::new(100, 100, 1), providers());

        ledger.reserve(vec![lrp("pg", 0, 100)]).unwrap();
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.available, Resources::ZERO);

        // Release twice; the second is a no-op.
        let key = PlacementKey::Lrp {
            process_guid: "pg".to_string(),
            index: 0,
        };
        assert!(ledger.release(&key).is_some());
        assert!(ledger.release(&key).is_none());
        assert_eq!(ledger.snapshot().available, Resources::new(100, 100, 1));
    }

    #[test]
    fn completed_allocations_free_resources() {
        let ledger = ResourceLedger::new(Resources::new(100, 100, 1), providers());
        ledger.reserve(vec![lrp("pg", 0, 100)]).unwrap();

        let key = PlacementKey::Lrp {
            process_guid: "pg".to_string(),
            index: 0,
        };
        ledger.fail(&key, "backend-error");
        assert_eq!(ledger.snapshot().available, Resources::new(100, 100, 1));
        assert!(ledger.is_drained());
    }

    #[test]
    fn transitions_are_forward_only() {
        let ledger = ResourceLedger::new(Resources::new(100, 100, 1), providers());
        ledger.reserve(vec![lrp("pg", 0, 10)]).unwrap();

        let key = PlacementKey::Lrp {
            process_guid: "pg".to_string(),
            index: 0,
        };
        assert!(ledger.transition(&key, AllocationState::Running));
        assert!(!ledger.transition(&key, AllocationState::Created));
        assert_eq!(ledger.get(&key).unwrap().state, AllocationState::Running);
    }
}
