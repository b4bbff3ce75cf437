#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::todo)]
#![warn(clippy::panic)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::print_stdout)]
#![warn(clippy::print_stderr)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(unreachable_pub)]
#![warn(missing_debug_implementations)]
#![warn(unused_qualifications)]
#![deny(unused_must_use)]

use anchor_agent::config::Config;
use anchor_agent::{AgentBuilder, telemetry};
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::Instrument;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();
    telemetry::init_telemetry(&config)?;

    anchor_agent::setup_panic_hook();

    let boot_span = tracing::info_span!("boot_agent");
    let (agent, mgmt_listener, shutdown_tx, shutdown_rx) = async {
        // Phase 1: Shutdown plumbing
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        anchor_agent::spawn_signal_handler(shutdown_tx.clone());

        // Phase 2: Component wiring (ledger, vault handshake, services)
        let agent = AgentBuilder::new(config.clone()).initialize().await?;

        // Phase 3: Management listener
        let mgmt_addr: SocketAddr = format!("{}:{}", config.metrics_host, config.metrics_port).parse()?;
        let mgmt_listener = tokio::net::TcpListener::bind(mgmt_addr).await?;
        tracing::info!(address = %mgmt_addr, "management endpoint listening");

        Ok::<_, anyhow::Error>((agent, mgmt_listener, shutdown_tx, shutdown_rx))
    }
    .instrument(boot_span)
    .await?;

    // Phase 4: Start runtime
    let status = agent.status;
    let worker_tasks = agent.workers.spawn_all(shutdown_rx.clone());

    let mut mgmt_rx = shutdown_rx;
    let mgmt_server = axum::serve(mgmt_listener, anchor_agent::api::mgmt_router(status))
        .with_graceful_shutdown(async move {
            let _ = mgmt_rx.wait_for(|&s| s).await;
        });

    if let Err(e) = mgmt_server.await {
        tracing::error!(error = %e, "Management server error");
    }

    // Phase 5: Graceful shutdown orchestration
    let _ = shutdown_tx.send(true);
    tokio::select! {
        () = async {
            futures::future::join_all(worker_tasks).await;
        } => {
            tracing::info!("Background tasks finished.");
        }
        () = tokio::time::sleep(std::time::Duration::from_secs(config.shutdown_timeout_secs)) => {
            tracing::warn!("Timeout waiting for background tasks to finish.");
        }
    }

    telemetry::shutdown_telemetry();
    Ok(())
}
