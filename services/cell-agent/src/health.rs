//! Container-backend health watchdog.
//!
//! Periodically exercises the backend with a full create-run-destroy cycle
//! of a tagged probe container. Two consecutive failures flip the agent
//! Unhealthy; a single success flips it back. While evacuating the monitor
//! runs in strict mode and a single failure is enough to go Unhealthy.

use std::sync::Arc;
use std::time::Duration;

use hive_cell_api::{Resources, RootFs};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BackendError, ContainerBackend, ContainerSpec, ProcessSpec};
use crate::model::{Tags, HEALTHCHECK_HANDLE_PREFIX, HEALTHCHECK_TAG, HEALTHCHECK_TAG_VALUE};

/// Agent health as observed by the watchdog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// No probe has completed yet.
    Unknown,
    Healthy,
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Watchdog configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    /// Budget for one full probe cycle.
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

pub struct HealthMonitor {
    backend: Arc<dyn ContainerBackend>,
    config: HealthConfig,
    status_tx: watch::Sender<HealthStatus>,
    evacuating: watch::Receiver<bool>,
}

impl HealthMonitor {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        config: HealthConfig,
        evacuating: watch::Receiver<bool>,
    ) -> (Self, watch::Receiver<HealthStatus>) {
        let (status_tx, status_rx) = watch::channel(HealthStatus::Unknown);
        (
            Self {
                backend,
                config,
                status_tx,
                evacuating,
            },
            status_rx,
        )
    }

    /// Run probes until shutdown. The first probe fires immediately.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut tracker = FailureTracker::default();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("health monitor shutting down");
                        return;
                    }
                    continue;
                }
            }

            let probe =
                tokio::time::timeout(self.config.probe_timeout, self.probe()).await;
            let result = match probe {
                Ok(result) => result,
                Err(_) => Err(BackendError::Unreachable("probe timed out".to_string())),
            };

            match result {
                Ok(()) => {
                    tracker.success();
                    self.announce(HealthStatus::Healthy);
                }
                Err(e) => {
                    let strict = *self.evacuating.borrow();
                    let flipped = tracker.failure(strict);
                    warn!(
                        error = %e,
                        consecutive_failures = tracker.consecutive_failures,
                        "health probe failed"
                    );
                    if flipped {
                        self.announce(HealthStatus::Unhealthy {
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    fn announce(&self, status: HealthStatus) {
        let changed = *self.status_tx.borrow() != status;
        if changed {
            match &status {
                HealthStatus::Healthy => info!("cell healthy"),
                HealthStatus::Unhealthy { reason } => warn!(reason = %reason, "cell unhealthy"),
                HealthStatus::Unknown => {}
            }
        }
        // Always send: subscribers waiting on changed() wake up even when a
        // probe confirms the current status.
        let _ = self.status_tx.send(status);
    }

    /// One full probe: ping, then create-run-destroy a tagged container.
    async fn probe(&self) -> Result<(), BackendError> {
        self.backend.ping().await?;

        let handle = format!("{HEALTHCHECK_HANDLE_PREFIX}{}", Uuid::new_v4());
        let mut tags = Tags::new();
        tags.insert(
            HEALTHCHECK_TAG.to_string(),
            HEALTHCHECK_TAG_VALUE.to_string(),
        );

        self.backend
            .create(ContainerSpec {
                handle: handle.clone(),
                tags,
                rootfs: RootFs::default(),
                resources: Resources::ZERO,
            })
            .await?;

        let run_result = self
            .backend
            .run(
                &handle,
                ProcessSpec {
                    path: "true".to_string(),
                    args: vec![],
                },
            )
            .await;

        // Destroy regardless of the run outcome so probes do not leak
        // containers into the backend.
        let destroy_result = self.backend.destroy(&handle).await;

        let exit_code = run_result?;
        destroy_result?;

        if exit_code != 0 {
            return Err(BackendError::Backend(format!(
                "healthcheck process exited {exit_code}"
            )));
        }
        Ok(())
    }
}

/// Consecutive-failure counter behind the Unhealthy transition. In strict
/// mode (evacuation) a single failure is enough.
#[derive(Debug, Default)]
struct FailureTracker {
    consecutive_failures: u32,
}

impl FailureTracker {
    fn success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Record a failure; returns true when the status should flip Unhealthy.
    fn failure(&mut self, strict: bool) -> bool {
        self.consecutive_failures += 1;
        let threshold = if strict { 1 } else { 2 };
        self.consecutive_failures >= threshold
    }
}

/// Wait until the status leaves `Unknown`; used by the supervisor before
/// announcing itself started.
pub async fn first_transition(rx: &mut watch::Receiver<HealthStatus>) -> HealthStatus {
    loop {
        let status = rx.borrow().clone();
        if status != HealthStatus::Unknown {
            return status;
        }
        if rx.changed().await.is_err() {
            return HealthStatus::Unknown;
        }
    }
}

/// Wait until the status is `Healthy`.
pub async fn wait_healthy(rx: &mut watch::Receiver<HealthStatus>) -> bool {
    loop {
        if rx.borrow().is_healthy() {
            return true;
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}
