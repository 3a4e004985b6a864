//! hive cell agent.
//!
//! Per-node agent for the hive workload orchestrator: advertises capacity
//! to the auctioneer, realises placements through the local container
//! backend, and reconciles the cluster record store against reality.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hive_cell_agent::backend::HttpBackend;
use hive_cell_agent::records::HttpRecordStore;
use hive_cell_agent::{Config, EvacuationTrigger, Supervisor};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::try_parse() {
        Ok(config) => config,
        Err(e) => {
            // clap's own rendering, but validation failures exit 1.
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.log_level))
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        cell_id = %config.cell_id,
        backend_url = %config.backend_url,
        records_url = %config.records_url,
        "starting cell agent"
    );

    if let Err(e) = config.validate() {
        error!(error = %e, "startup validation failed");
        return ExitCode::from(1);
    }

    let http = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to build http client");
            return ExitCode::from(1);
        }
    };

    let backend = Arc::new(HttpBackend::new(http.clone(), &config.backend_url));
    let store = Arc::new(HttpRecordStore::new(
        http,
        &config.records_url,
        &config.coordination_cluster,
    ));

    let trigger = EvacuationTrigger::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx, trigger.clone());

    let supervisor = Supervisor::new(config, backend, store, trigger);
    match supervisor.run(shutdown_rx).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "cell agent failed");
            ExitCode::from(1)
        }
    }
}

/// SIGINT/SIGTERM request a clean shutdown; SIGUSR1 requests evacuation.
fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>, trigger: EvacuationTrigger) {
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let signals = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
            signal(SignalKind::user_defined1()),
        );
        let (mut interrupt, mut terminate, mut evacuate) = match signals {
            (Ok(i), Ok(t), Ok(e)) => (i, t, e),
            _ => {
                error!("failed to install signal handlers");
                // Keep the shutdown channel open; the HTTP surface still
                // drives evacuation.
                std::future::pending::<()>().await;
                unreachable!()
            }
        };

        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    info!("interrupt received");
                    let _ = shutdown_tx.send(true);
                }
                _ = terminate.recv() => {
                    info!("terminate received");
                    let _ = shutdown_tx.send(true);
                }
                _ = evacuate.recv() => {
                    info!("evacuation signal received");
                    trigger.request();
                }
            }
        }
    });

    // Interrupt-style shutdown is not supported on Windows; hold the
    // channel open so the agent only stops via evacuation.
    #[cfg(not(unix))]
    tokio::spawn(async move {
        let _shutdown_tx = shutdown_tx;
        let _trigger = trigger;
        std::future::pending::<()>().await
    });
}
