//! handoff-server: a demo HTTP server that restarts without dropping its
//! listening socket.
//!
//! Send `SIGUSR2` to start a successor that inherits the socket; this process
//! then drains and exits. `SIGINT`/`SIGTERM` drain and exit without a successor.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use handoff::{acquire, AcquireMode, Reloader, ServerRuntime, SignalCoordinator, SignalQueue};
use tracing::{info, warn};

mod config;
mod http;
mod telemetry;

pub use config::ServerConfig;

/// Demo HTTP server with zero-downtime restart on SIGUSR2
#[derive(Parser, Debug)]
#[command(name = "handoff-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Listen on the socket inherited at fd 3 (internal use only)
    #[arg(long)]
    graceful: bool,

    /// Listen address such as ":9999" or "127.0.0.1:8080" (overrides HANDOFF_LISTEN_ADDR)
    #[arg(long)]
    addr: Option<String>,

    /// Seconds to wait for in-flight connections when stopping (overrides HANDOFF_DRAIN_TIMEOUT_SECS)
    #[arg(long)]
    drain_timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry_mode = telemetry::TelemetryMode::from_env();
    telemetry::init(&telemetry_mode)
        .map_err(|e| anyhow::anyhow!("Failed to init telemetry ({:?}): {}", telemetry_mode, e))?;

    // Handlers go in first: a SIGUSR2 arriving during startup must be queued,
    // not take the default action and kill the process.
    let signals = SignalQueue::os_signals().context("Failed to install signal handlers")?;

    info!(
        args = ?std::env::args_os().collect::<Vec<_>>(),
        graceful = cli.graceful,
        pid = std::process::id(),
        "handoff-server starting"
    );
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let server_config = ServerConfig::from_env()?
        .with_overrides(cli.addr.as_deref(), cli.drain_timeout_secs)
        .context("Failed to load server configuration")?;
    let mode = AcquireMode::from_graceful_flag(cli.graceful);
    server_config.log_config(mode);

    let listener = acquire(mode, server_config.listen_addr)
        .await
        .context("Failed to acquire listener")?;
    let runtime = Arc::new(ServerRuntime::new(listener));

    let reloader =
        Reloader::for_current_process().context("Failed to determine successor command")?;
    let mut coordinator = SignalCoordinator::new(
        signals,
        Arc::clone(&runtime),
        reloader,
        server_config.drain_timeout,
    );
    let coordinator = tokio::spawn(async move { coordinator.run().await });

    let handler = http::HttpHandler::new(http::create_router());
    let result = runtime.serve(handler).await;
    info!(result = %result, "Server stopped serving");

    match coordinator.await {
        Ok(exit) => info!(?exit, "Signal coordinator finished"),
        Err(e) => warn!(error = %e, "Signal coordinator task failed"),
    }

    telemetry::shutdown();

    if result.is_listener_closed() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(result))
    }
}
