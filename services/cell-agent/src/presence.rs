//! Presence lease maintenance.
//!
//! Advertises this cell's identity and reachability under a TTL key in
//! coordination storage. The lease is acquired after the first successful
//! health probe, renewed at half the TTL, and released best-effort on
//! clean shutdown. Renewal failures back off but never exit the process.

use std::sync::Arc;
use std::time::Duration;

use hive_cell_api::CellPresence;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::health::HealthStatus;
use crate::records::RecordStore;

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
        }
    }
}

pub struct PresenceKeeper {
    store: Arc<dyn RecordStore>,
    presence: CellPresence,
    config: PresenceConfig,
    health: watch::Receiver<HealthStatus>,
}

impl PresenceKeeper {
    pub fn new(
        store: Arc<dyn RecordStore>,
        presence: CellPresence,
        config: PresenceConfig,
        health: watch::Receiver<HealthStatus>,
    ) -> Self {
        Self {
            store,
            presence,
            config,
            health,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let renew_interval = self.config.ttl / 2;
        let max_backoff = self.config.ttl / 4;
        let mut backoff = Backoff::new(renew_interval.min(Duration::from_millis(100)), max_backoff);
        let mut held = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.health.borrow().is_healthy() {
                // An unhealthy cell must not attract auction traffic.
                if held {
                    if let Err(e) = self.store.remove_cell_presence(&self.presence.cell_id).await {
                        warn!(error = %e, "failed to release presence while unhealthy");
                    }
                    held = false;
                    info!(cell_id = %self.presence.cell_id, "presence released, cell unhealthy");
                }
                tokio::select! {
                    _ = self.health.changed() => continue,
                    _ = shutdown.changed() => continue,
                }
            }

            let delay = match self
                .store
                .set_cell_presence(&self.presence, self.config.ttl)
                .await
            {
                Ok(()) => {
                    if !held {
                        info!(cell_id = %self.presence.cell_id, "presence established");
                    }
                    held = true;
                    backoff.reset();
                    renew_interval
                }
                Err(e) => {
                    let delay = backoff.next();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "presence renewal failed");
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.health.changed() => {}
                _ = shutdown.changed() => {}
            }
        }

        // Best-effort release; a dead lease expires on its own anyway.
        if held {
            debug!(cell_id = %self.presence.cell_id, "releasing presence");
            let _ = self.store.remove_cell_presence(&self.presence.cell_id).await;
        }
    }
}

/// Doubling backoff with a hard cap.
#[derive(Debug)]
struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}
