//! Execution gateway - Entry point
//!
//! Parses CLI arguments, loads the server inventory, starts the MCP server
//! on stdio transport, and closes every handler on shutdown.

use clap::Parser;
use rmcp::service::ServiceExt;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use exec_gateway::config::{Args, Config};
use exec_gateway::error::{GatewayError, Result};
use exec_gateway::server::GatewayServer;

/// Resolve when the process receives SIGTERM
#[cfg(unix)]
async fn sigterm() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut signal) => {
            signal.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr (stdout is for MCP JSON-RPC)
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::from_args(args)?;

    info!("Execution gateway v{} starting...", env!("CARGO_PKG_VERSION"));
    info!(
        "{} configured server(s), default host: {}",
        config.servers.len(),
        config.default_host
    );
    info!(
        "Timeout: {}ms, Max chars: {}",
        config.settings.default_timeout.as_millis(),
        config
            .max_chars
            .map_or("unlimited".to_string(), |n| n.to_string())
    );

    let server = GatewayServer::new(config);

    info!("Execution gateway running on stdio");

    let server_for_shutdown = server.clone();

    let shutdown_handle = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm() => {
                info!("Received SIGTERM, shutting down...");
            }
        }

        server_for_shutdown.shutdown().await;
        std::process::exit(0);
    });

    match server.clone().serve(rmcp::transport::io::stdio()).await {
        Ok(running_server) => {
            info!("MCP server is serving...");
            if let Err(e) = running_server.waiting().await {
                error!("Server error: {}", e);
            }
        }
        Err(e) => {
            error!("Failed to start MCP server: {}", e);
            return Err(GatewayError::connection(e.to_string()));
        }
    }

    shutdown_handle.abort();
    server.shutdown().await;

    info!("Execution gateway stopped");

    Ok(())
}
