//! Shared wire types for the hive cell agent.
//!
//! Everything the auctioneer and the cell exchange over HTTP lives here:
//! resource triples, root filesystem descriptors, work batches, and the
//! `CellState` snapshot. The [`client`] module provides the HTTP client the
//! auctioneer (and the CLI) use to talk to a cell.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod client;

pub use client::{Client, ClientError, ClientFactory};

/// Resource triple accounted by the cell: memory, disk, and container slots.
///
/// All fields are non-negative; subtraction saturates at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub containers: u64,
}

impl Resources {
    pub const ZERO: Resources = Resources {
        memory_mb: 0,
        disk_mb: 0,
        containers: 0,
    };

    pub fn new(memory_mb: u64, disk_mb: u64, containers: u64) -> Self {
        Self {
            memory_mb,
            disk_mb,
            containers,
        }
    }

    /// Pointwise saturating subtraction.
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            disk_mb: self.disk_mb.saturating_sub(other.disk_mb),
            containers: self.containers.saturating_sub(other.containers),
        }
    }

    pub fn add(&self, other: &Resources) -> Resources {
        Resources {
            memory_mb: self.memory_mb + other.memory_mb,
            disk_mb: self.disk_mb + other.disk_mb,
            containers: self.containers + other.containers,
        }
    }

    /// True when `r` fits inside these resources, pointwise.
    pub fn fits(&self, r: &Resources) -> bool {
        r.memory_mb <= self.memory_mb && r.disk_mb <= self.disk_mb && r.containers <= self.containers
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}MB/{}MB/{}c",
            self.memory_mb, self.disk_mb, self.containers
        )
    }
}

/// A root filesystem reference, e.g. `preloaded:trusty` or `docker:///busybox`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RootFs(pub String);

impl RootFs {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The URL scheme, if the reference has one.
    pub fn scheme(&self) -> Option<&str> {
        let idx = self.0.find(':')?;
        if idx == 0 {
            return None;
        }
        Some(&self.0[..idx])
    }

    /// For `preloaded:` references, the rootfs name.
    pub fn preloaded_name(&self) -> Option<&str> {
        let rest = self.0.strip_prefix("preloaded:")?;
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RootFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The set of root filesystems a cell can realise: preloaded images baked
/// into the backend, plus URL schemes the backend can fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFsProviders {
    #[serde(default)]
    pub preloaded: Vec<String>,
    #[serde(default)]
    pub schemes: Vec<String>,
}

impl RootFsProviders {
    pub fn supports(&self, rootfs: &RootFs) -> bool {
        if let Some(name) = rootfs.preloaded_name() {
            return self.preloaded.iter().any(|p| p == name);
        }
        match rootfs.scheme() {
            Some(scheme) => self.schemes.iter().any(|s| s == scheme),
            None => false,
        }
    }
}

/// Identity of one placement on a cell: an LRP instance or a one-shot task.
///
/// The derived ordering sorts LRPs before tasks, then by guid and index;
/// batch processing relies on this for deterministic rejections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PlacementKey {
    Lrp { process_guid: String, index: i32 },
    Task { task_guid: String },
}

impl fmt::Display for PlacementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlacementKey::Lrp {
                process_guid,
                index,
            } => write!(f, "{process_guid}/{index}"),
            PlacementKey::Task { task_guid } => f.write_str(task_guid),
        }
    }
}

/// One LRP instance the auctioneer wants placed (or that the cell reports
/// in its state snapshot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrpWork {
    pub process_guid: String,
    pub index: i32,
    #[serde(default)]
    pub domain: String,
    pub rootfs: RootFs,
    pub resources: Resources,
}

impl LrpWork {
    pub fn placement_key(&self) -> PlacementKey {
        PlacementKey::Lrp {
            process_guid: self.process_guid.clone(),
            index: self.index,
        }
    }
}

/// One task the auctioneer wants placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskWork {
    pub task_guid: String,
    #[serde(default)]
    pub domain: String,
    pub rootfs: RootFs,
    pub resources: Resources,
}

impl TaskWork {
    pub fn placement_key(&self) -> PlacementKey {
        PlacementKey::Task {
            task_guid: self.task_guid.clone(),
        }
    }
}

/// A batch of placements. `Perform` returns the subset it could not accept
/// in the same shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Work {
    #[serde(default)]
    pub lrps: Vec<LrpWork>,
    #[serde(default)]
    pub tasks: Vec<TaskWork>,
}

impl Work {
    pub fn is_empty(&self) -> bool {
        self.lrps.is_empty() && self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lrps.len() + self.tasks.len()
    }
}

/// Snapshot of a cell, produced on demand for the auctioneer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellState {
    pub cell_id: String,
    pub zone: String,
    pub rootfs_providers: RootFsProviders,
    pub available_resources: Resources,
    pub total_resources: Resources,
    #[serde(default)]
    pub lrps: Vec<LrpWork>,
    #[serde(default)]
    pub tasks: Vec<TaskWork>,
    pub evacuating: bool,
    /// Set when the snapshot is partial because the backend could not be
    /// consulted within the state deadline.
    #[serde(default)]
    pub stale: bool,
}

/// The lease record a cell maintains in coordination storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellPresence {
    pub cell_id: String,
    pub rep_address: String,
    pub zone: String,
    pub capacity: Resources,
    pub rootfs_providers: RootFsProviders,
}
