//! hive cell agent library.
//!
//! Each cell hosts a container runtime and runs one of these agents. The
//! agent advertises residual capacity to the cluster auctioneer, realises
//! placement decisions as containers, and keeps the cluster record store
//! consistent with what is actually running on the node.
//!
//! ## Architecture
//!
//! ```text
//! Supervisor
//! ├── HealthMonitor        (liveness probes against the backend)
//! ├── PresenceKeeper       (TTL lease in coordination storage)
//! ├── auction api          (State / Perform / stop / cancel / evacuate)
//! ├── BulkReconciler       (periodic three-way diff)
//! └── EvacuationController (graceful drain under a deadline)
//! ```
//!
//! The resource ledger is the only shared mutable structure; health and
//! the evacuating latch are single-writer watch channels.

pub mod api;
pub mod auction;
pub mod backend;
pub mod config;
pub mod evacuation;
pub mod health;
pub mod ledger;
pub mod model;
pub mod presence;
pub mod reconciler;
pub mod records;
pub mod supervisor;

pub use auction::AuctionCell;
pub use backend::{ContainerBackend, MockBackend};
pub use config::Config;
pub use evacuation::EvacuationTrigger;
pub use ledger::ResourceLedger;
pub use records::{InMemoryRecordStore, RecordStore};
pub use supervisor::Supervisor;
