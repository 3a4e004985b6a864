//! Supervisor: explicit bottom-up construction and lifecycle.
//!
//! Components are built in dependency order (ledger, adapters, watchdog,
//! presence, auction surface, reconciler, evacuation), each long-running
//! piece gets its own shutdown channel, and teardown walks them back down:
//! reconciler, auction surface, presence, watchdog. The agent announces
//! `started` only once the backend has passed its first health probe.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hive_cell_api::CellPresence;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{create_router, ApiState};
use crate::auction::{AuctionCell, AuctionConfig};
use crate::backend::ContainerBackend;
use crate::config::Config;
use crate::evacuation::{EvacuationConfig, EvacuationController, EvacuationTrigger};
use crate::health::{self, HealthConfig, HealthMonitor};
use crate::ledger::ResourceLedger;
use crate::presence::{PresenceConfig, PresenceKeeper};
use crate::reconciler::{BulkReconciler, ReconcilerConfig};
use crate::records::RecordStore;

/// One container slot is held back for the watchdog's probe container.
const HEALTHCHECK_CONTAINER_RESERVATION: u64 = 1;

struct Component {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct Supervisor {
    config: Config,
    backend: Arc<dyn ContainerBackend>,
    store: Arc<dyn RecordStore>,
    trigger: EvacuationTrigger,
}

impl Supervisor {
    pub fn new(
        config: Config,
        backend: Arc<dyn ContainerBackend>,
        store: Arc<dyn RecordStore>,
        trigger: EvacuationTrigger,
    ) -> Self {
        Self {
            config,
            backend,
            store,
            trigger,
        }
    }

    /// Run the agent until a shutdown signal or a completed evacuation.
    /// Both paths return `Ok`, which the binary maps to exit 0.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let providers = self.config.rootfs_provider_set()?;

        // The agent is useless without the backend; wait for it rather
        // than exiting, and do not announce anything yet.
        let Some(capacity) = self.wait_for_backend(&mut shutdown).await else {
            return Ok(());
        };
        let total = {
            let mut total = capacity.to_resources();
            total.containers = total
                .containers
                .saturating_sub(HEALTHCHECK_CONTAINER_RESERVATION);
            total
        };
        info!(
            cell_id = %self.config.cell_id,
            total = %total,
            "container backend capacity discovered"
        );

        let ledger = Arc::new(ResourceLedger::new(total, providers.clone()));

        let (evacuating_tx, evacuating_rx) = watch::channel(false);
        let (drained_tx, mut drained_rx) = watch::channel(false);

        let mut components: Vec<Component> = Vec::new();

        // Health watchdog first; everything else gates on it.
        let (monitor, health_rx) = HealthMonitor::new(
            self.backend.clone(),
            HealthConfig {
                interval: self.config.polling_interval(),
                probe_timeout: self.config.polling_interval().min(Duration::from_secs(10)),
            },
            evacuating_rx.clone(),
        );
        components.push(spawn_component("health-monitor", |shutdown_rx| {
            monitor.run(shutdown_rx)
        }));

        let listener = tokio::net::TcpListener::bind(self.config.listen_addr)
            .await
            .context("binding listen address")?;
        let local_addr = listener.local_addr()?;
        let rep_address = self
            .config
            .rep_address
            .clone()
            .unwrap_or_else(|| format!("http://{local_addr}"));

        let presence = CellPresence {
            cell_id: self.config.cell_id.clone(),
            rep_address,
            zone: self.config.zone.clone(),
            capacity: total,
            rootfs_providers: providers,
        };
        let keeper = PresenceKeeper::new(
            self.store.clone(),
            presence,
            PresenceConfig {
                ttl: self.config.presence_ttl(),
            },
            health_rx.clone(),
        );
        components.push(spawn_component("presence", |shutdown_rx| {
            keeper.run(shutdown_rx)
        }));

        let cell = AuctionCell::new(
            self.config.cell_id.clone(),
            self.config.zone.clone(),
            ledger.clone(),
            self.backend.clone(),
            self.store.clone(),
            health_rx.clone(),
            evacuating_rx.clone(),
            AuctionConfig {
                state_timeout: self.config.state_timeout(),
                ..AuctionConfig::default()
            },
        );

        let router = create_router(ApiState {
            cell,
            evacuation: self.trigger.clone(),
        });
        components.push(spawn_component("auction-api", move |mut shutdown_rx| async move {
            let served = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(e) = served.await {
                warn!(error = %e, "http server terminated");
            }
        }));
        info!(addr = %local_addr, "serving auction endpoints");

        let reconciler = BulkReconciler::new(
            self.config.cell_id.clone(),
            ledger.clone(),
            self.backend.clone(),
            self.store.clone(),
            health_rx.clone(),
            ReconcilerConfig::with_interval(self.config.polling_interval()),
        );
        components.push(spawn_component("bulk-reconciler", |shutdown_rx| {
            reconciler.run(shutdown_rx)
        }));

        let evacuation = EvacuationController::new(
            self.config.cell_id.clone(),
            ledger,
            self.backend.clone(),
            self.store.clone(),
            health_rx.clone(),
            self.trigger.clone(),
            evacuating_tx,
            drained_tx,
            EvacuationConfig {
                timeout: self.config.evacuation_timeout(),
            },
        );
        components.push(spawn_component("evacuation", |shutdown_rx| {
            evacuation.run(shutdown_rx)
        }));

        // Join the cluster only once the backend answers a probe.
        let mut announce_rx = health_rx.clone();
        let cell_id = self.config.cell_id.clone();
        tokio::spawn(async move {
            if health::wait_healthy(&mut announce_rx).await {
                info!(cell_id = %cell_id, "started");
            }
        });

        tokio::select! {
            _ = drained_rx.changed() => {
                info!("evacuation drained, shutting down");
            }
            _ = shutdown.changed() => {
                info!("shutdown signal received");
            }
        }

        // Teardown: reconciler, auction surface, presence, watchdog.
        components.reverse();
        for component in components {
            stop_component(component).await;
        }

        info!("cell agent shutdown complete");
        Ok(())
    }

    async fn wait_for_backend(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<crate::backend::BackendCapacity> {
        let mut delay = Duration::from_millis(100);
        let max_delay = Duration::from_secs(5);
        loop {
            match self.probe_backend().await {
                Ok(capacity) => return Some(capacity),
                Err(e) => {
                    warn!(error = %e, "container backend not ready, waiting");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return None;
                    }
                }
            }
            delay = (delay * 2).min(max_delay);
        }
    }

    async fn probe_backend(&self) -> Result<crate::backend::BackendCapacity, crate::backend::BackendError> {
        self.backend.ping().await?;
        self.backend.capacity().await
    }
}

fn spawn_component<F, Fut>(name: &'static str, f: F) -> Component
where
    F: FnOnce(watch::Receiver<bool>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(f(shutdown_rx));
    Component {
        name,
        shutdown_tx,
        handle,
    }
}

async fn stop_component(component: Component) {
    let _ = component.shutdown_tx.send(true);
    match tokio::time::timeout(Duration::from_secs(5), component.handle).await {
        Ok(_) => info!(component = component.name, "stopped"),
        Err(_) => warn!(component = component.name, "did not stop in time"),
    }
}
