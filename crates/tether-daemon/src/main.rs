// Tether Daemon - persistent service bus
//
// This daemon provides:
// - One multiplexed unix socket per logical client
// - Request/response dispatch over registered service endpoints
// - Event subscription routing with reconnect-surviving delivery queues
// - An HTTP fallback surface for socketless callers

use std::process;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tether_daemon::lifecycle::DaemonPaths;
use tether_daemon::{http, Server};

/// Exit codes for different scenarios
mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const BIND_ERROR: i32 = 1;
    pub const RUNTIME_ERROR: i32 = 2;
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting tether daemon v{}", env!("CARGO_PKG_VERSION"));

    let paths = DaemonPaths::resolve();
    if paths.daemon_alive() {
        error!("Another daemon instance is already running");
        process::exit(exit_codes::BIND_ERROR);
    }

    if let Err(e) = paths.write_pid() {
        error!("Failed to write PID file: {}", e);
        process::exit(exit_codes::BIND_ERROR);
    }

    let result = run(&paths).await;

    paths.clear_pid();
    match result {
        Ok(()) => process::exit(exit_codes::SUCCESS),
        Err(e) => {
            error!("Daemon exited with error: {}", e);
            process::exit(exit_codes::RUNTIME_ERROR);
        }
    }
}

async fn run(paths: &DaemonPaths) -> Result<()> {
    let server = Server::bind(&paths.socket, env!("CARGO_PKG_VERSION")).await?;
    let shutdown = server.shutdown_handle();

    spawn_http_fallback(server.dispatch_hub(), shutdown.clone()).await;
    spawn_signal_handler(shutdown);

    let result = server.run().await;
    paths.remove_socket();
    result
}

/// Start the HTTP fallback when `TETHER_HTTP_ADDR` is set. The surface is
/// optional; the socket is the primary transport.
async fn spawn_http_fallback(
    hub: Arc<tether_daemon::DispatchHub>,
    shutdown: CancellationToken,
) {
    let Ok(addr) = std::env::var("TETHER_HTTP_ADDR") else {
        return;
    };

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Failed to bind HTTP fallback, continuing without it");
            return;
        }
    };

    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            result = http::serve(hub, listener) => {
                if let Err(e) = result {
                    error!("HTTP fallback failed: {}", e);
                }
            }
        }
    });
}

/// Cancel the shutdown token on SIGINT.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
            shutdown.cancel();
        }
    });
}
