//! Cell-local domain model: allocations, containers, and the tag scheme
//! that ties backend containers back to placements.

use std::collections::BTreeMap;
use std::time::Instant;

use hive_cell_api::{PlacementKey, Resources, RootFs};

/// Tag key and value marking the watchdog's probe containers. The string is
/// load-bearing: backends already in the field filter on it.
pub const HEALTHCHECK_TAG: &str = "executor-healthcheck";
pub const HEALTHCHECK_TAG_VALUE: &str = "executor-healthcheck";
/// Handle prefix for probe containers.
pub const HEALTHCHECK_HANDLE_PREFIX: &str = "executor-healthcheck-";

pub const LIFECYCLE_TAG: &str = "lifecycle";
pub const PROCESS_GUID_TAG: &str = "process-guid";
pub const INSTANCE_GUID_TAG: &str = "instance-guid";
pub const INDEX_TAG: &str = "index";
pub const TASK_GUID_TAG: &str = "task-guid";
pub const DOMAIN_TAG: &str = "domain";

/// Container tag map.
pub type Tags = BTreeMap<String, String>;

/// Lifecycle class a container belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    App,
    Task,
    Healthcheck,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::App => "app",
            Lifecycle::Task => "task",
            Lifecycle::Healthcheck => "healthcheck",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "app" => Some(Lifecycle::App),
            "task" => Some(Lifecycle::Task),
            "healthcheck" => Some(Lifecycle::Healthcheck),
            _ => None,
        }
    }
}

/// Extract the placement key from a container's tags, if it carries one.
pub fn placement_key_from_tags(tags: &Tags) -> Option<PlacementKey> {
    match tags.get(LIFECYCLE_TAG).map(String::as_str) {
        Some("app") => {
            let process_guid = tags.get(PROCESS_GUID_TAG)?.clone();
            let index = tags.get(INDEX_TAG)?.parse().ok()?;
            Some(PlacementKey::Lrp {
                process_guid,
                index,
            })
        }
        Some("task") => Some(PlacementKey::Task {
            task_guid: tags.get(TASK_GUID_TAG)?.clone(),
        }),
        _ => None,
    }
}

/// Allocation lifecycle. Forward-only; a backend failure at any stage
/// fast-forwards to `Completed` with a failure reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AllocationState {
    Reserved,
    Initializing,
    Created,
    Running,
    Completed,
}

/// Cell-local record of an intent to run one container, committed against
/// the resource ledger.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub key: PlacementKey,
    pub instance_guid: String,
    pub domain: String,
    pub rootfs: RootFs,
    pub resources: Resources,
    pub state: AllocationState,
    pub failure_reason: Option<String>,
    pub reserved_at: Instant,
}

impl Allocation {
    pub fn new(
        key: PlacementKey,
        instance_guid: String,
        domain: String,
        rootfs: RootFs,
        resources: Resources,
    ) -> Self {
        Self {
            key,
            instance_guid,
            domain,
            rootfs,
            resources,
            state: AllocationState::Reserved,
            failure_reason: None,
            reserved_at: Instant::now(),
        }
    }

    /// The backend handle this allocation's container uses: the instance
    /// guid for LRPs, the task guid for tasks.
    pub fn container_handle(&self) -> &str {
        match &self.key {
            PlacementKey::Lrp { .. } => &self.instance_guid,
            PlacementKey::Task { task_guid } => task_guid,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        match self.key {
            PlacementKey::Lrp { .. } => Lifecycle::App,
            PlacementKey::Task { .. } => Lifecycle::Task,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == AllocationState::Completed
    }

    /// Tags for the container realising this allocation.
    pub fn tags(&self) -> Tags {
        let mut tags = Tags::new();
        tags.insert(
            LIFECYCLE_TAG.to_string(),
            self.lifecycle().as_str().to_string(),
        );
        tags.insert(DOMAIN_TAG.to_string(), self.domain.clone());
        match &self.key {
            PlacementKey::Lrp {
                process_guid,
                index,
            } => {
                tags.insert(PROCESS_GUID_TAG.to_string(), process_guid.clone());
                tags.insert(INDEX_TAG.to_string(), index.to_string());
                tags.insert(INSTANCE_GUID_TAG.to_string(), self.instance_guid.clone());
            }
            PlacementKey::Task { task_guid } => {
                tags.insert(TASK_GUID_TAG.to_string(), task_guid.clone());
            }
        }
        tags
    }
}

/// Backend-side container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Stopped,
}

/// Result of a container's main process, once it has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitResult {
    pub exit_code: i32,
}

impl ExitResult {
    pub fn failed(&self) -> bool {
        self.exit_code != 0
    }
}

/// Backend-side handle for a container.
#[derive(Debug, Clone)]
pub struct Container {
    pub handle: String,
    pub tags: Tags,
    pub resources: Resources,
    pub state: ContainerState,
    pub exit_result: Option<ExitResult>,
}

impl Container {
    pub fn is_healthcheck(&self) -> bool {
        self.tags.get(HEALTHCHECK_TAG).map(String::as_str) == Some(HEALTHCHECK_TAG_VALUE)
    }

    pub fn placement_key(&self) -> Option<PlacementKey> {
        placement_key_from_tags(&self.tags)
    }

    pub fn instance_guid(&self) -> Option<&str> {
        self.tags.get(INSTANCE_GUID_TAG).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lrp_allocation() -> Allocation {
        Allocation::new(
            PlacementKey::Lrp {
                process_guid: "pg".to_string(),
                index: 2,
            },
            "ig-1234".to_string(),
            "apps".to_string(),
            RootFs::new("preloaded:trusty"),
            Resources::new(128, 256, 1),
        )
    }

    #[test]
    fn allocation_tags_round_trip_to_placement_key() {
        let allocation = lrp_allocation();
        let tags = allocation.tags();
        assert_eq!(tags.get(LIFECYCLE_TAG).unwrap(), "app");
        assert_eq!(placement_key_from_tags(&tags), Some(allocation.key.clone()));
    }

    #[test]
    fn task_allocation_handle_is_task_guid() {
        let allocation = Allocation::new(
            PlacementKey::Task {
                task_guid: "tg-1".to_string(),
            },
            "ignored".to_string(),
            "apps".to_string(),
            RootFs::new("preloaded:trusty"),
            Resources::new(64, 64, 1),
        );
        assert_eq!(allocation.container_handle(), "tg-1");
        assert_eq!(allocation.lifecycle(), Lifecycle::Task);
    }

    #[test]
    fn healthcheck_tag_is_detected() {
        let mut tags = Tags::new();
        tags.insert(
            HEALTHCHECK_TAG.to_string(),
            HEALTHCHECK_TAG_VALUE.to_string(),
        );
        let container = Container {
            handle: "executor-healthcheck-xyz".to_string(),
            tags,
            resources: Resources::ZERO,
            state: ContainerState::Running,
            exit_result: None,
        };
        assert!(container.is_healthcheck());
        assert_eq!(container.placement_key(), None);
    }
}
