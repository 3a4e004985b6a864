//! Agent configuration: flags with environment fallbacks, plus the startup
//! validation that is allowed to kill the process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use hive_cell_api::RootFsProviders;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed-to-open-ca-cert-file {path}: {source}")]
    CaCertOpen {
        path: String,
        source: std::io::Error,
    },

    #[error("unable to load CA certificate from {path}")]
    CaCertInvalid { path: String },

    #[error("malformed preloaded rootfs {0:?}, expected name:path")]
    MalformedPreloadedRootFs(String),
}

#[derive(Debug, Clone, Parser)]
#[command(name = "cell-agent", about = "Per-node cell agent for the hive orchestrator")]
pub struct Config {
    /// Stable identity of this cell, immutable for the process lifetime.
    #[arg(long, env = "HIVE_CELL_ID")]
    pub cell_id: String,

    /// Availability zone advertised to the auctioneer.
    #[arg(long, env = "HIVE_ZONE", default_value = "z1")]
    pub zone: String,

    #[arg(long, env = "HIVE_LISTEN_ADDR", default_value = "0.0.0.0:1800")]
    pub listen_addr: SocketAddr,

    /// Address other components use to reach this agent; derived from the
    /// bound listener when unset.
    #[arg(long, env = "HIVE_REP_ADDRESS")]
    pub rep_address: Option<String>,

    #[arg(long, env = "HIVE_BACKEND_URL", default_value = "http://127.0.0.1:7777")]
    pub backend_url: String,

    #[arg(long, env = "HIVE_RECORDS_URL", default_value = "http://127.0.0.1:8889")]
    pub records_url: String,

    /// Coordination storage cluster holding cell presences.
    #[arg(long, env = "HIVE_COORDINATION_CLUSTER", default_value = "http://127.0.0.1:8500")]
    pub coordination_cluster: String,

    /// Bulk reconciliation interval.
    #[arg(long, env = "HIVE_POLLING_INTERVAL_MS", default_value_t = 30_000)]
    pub polling_interval_ms: u64,

    /// Hard deadline for evacuation.
    #[arg(long, env = "HIVE_EVACUATION_TIMEOUT_MS", default_value_t = 600_000)]
    pub evacuation_timeout_ms: u64,

    /// TTL on the presence lease.
    #[arg(long, env = "HIVE_PRESENCE_TTL_MS", default_value_t = 10_000)]
    pub presence_ttl_ms: u64,

    /// Deadline for serving a state snapshot to the auctioneer.
    #[arg(long, env = "HIVE_STATE_TIMEOUT_MS", default_value_t = 100)]
    pub state_timeout_ms: u64,

    /// Preloaded root filesystems, as name:path pairs.
    #[arg(long = "preloaded-rootfs", env = "HIVE_PRELOADED_ROOTFS", value_delimiter = ',')]
    pub preloaded_rootfs: Vec<String>,

    /// URL schemes the backend can fetch root filesystems for.
    #[arg(long = "rootfs-provider", env = "HIVE_ROOTFS_PROVIDERS", value_delimiter = ',')]
    pub rootfs_providers: Vec<String>,

    /// PEM bundle of CA certificates trusted for artifact downloads.
    #[arg(long, env = "HIVE_CA_CERTS_FOR_DOWNLOADS")]
    pub ca_certs_for_downloads: Option<PathBuf>,

    #[arg(long, env = "HIVE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Startup validation. Any error here is fatal (exit 1).
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rootfs_provider_set()?;
        if let Some(path) = &self.ca_certs_for_downloads {
            validate_ca_bundle(path)?;
        }
        Ok(())
    }

    /// The rootfs providers this cell advertises.
    pub fn rootfs_provider_set(&self) -> Result<RootFsProviders, ConfigError> {
        let mut preloaded = Vec::new();
        for pair in &self.preloaded_rootfs {
            let (name, path) = pair
                .split_once(':')
                .ok_or_else(|| ConfigError::MalformedPreloadedRootFs(pair.clone()))?;
            if name.is_empty() || path.is_empty() {
                return Err(ConfigError::MalformedPreloadedRootFs(pair.clone()));
            }
            preloaded.push(name.to_string());
        }
        Ok(RootFsProviders {
            preloaded,
            schemes: self.rootfs_providers.clone(),
        })
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn evacuation_timeout(&self) -> Duration {
        Duration::from_millis(self.evacuation_timeout_ms)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_millis(self.presence_ttl_ms)
    }

    pub fn state_timeout(&self) -> Duration {
        Duration::from_millis(self.state_timeout_ms)
    }
}

/// Check that a CA bundle file is readable and, when non-empty, contains
/// at least one PEM certificate. Surrounding whitespace is tolerated.
pub fn validate_ca_bundle(path: &std::path::Path) -> Result<(), ConfigError> {
    let contents = std::fs::read(path).map_err(|source| ConfigError::CaCertOpen {
        path: path.display().to_string(),
        source,
    })?;

    let trimmed: Vec<u8> = {
        let s = String::from_utf8_lossy(&contents);
        s.trim().as_bytes().to_vec()
    };
    if trimmed.is_empty() {
        return Ok(());
    }

    let mut reader: &[u8] = &trimmed;
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .filter_map(|item| item.ok())
        .collect();
    if certs.is_empty() {
        return Err(ConfigError::CaCertInvalid {
            path: path.display().to_string(),
        });
    }
    Ok(())
}
