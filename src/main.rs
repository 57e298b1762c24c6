//! # mcp-uplink
//!
//! Outbound tunnel agent that exposes local MCP (Model Context Protocol)
//! tool servers to a remote control plane. The agent dials out over a single
//! persistent WebSocket, announces itself, and then maintains one downstream
//! connection per configured endpoint — spawned subprocesses, streamable
//! HTTP servers, or SSE servers — forwarding tool calls and reporting
//! status/tool changes upstream. No inbound port is ever opened.
//!
//! ## Architecture
//!
//! ```text
//! main.rs         — entry point, config loading, task wiring, shutdown
//! config.rs       — JSON file / env-var configuration loading
//! endpoint.rs     — endpoint/tool descriptor types and connection status
//! rpc.rs          — JSON-RPC 2.0 framing shared by all downstream transports
//! transport.rs    — subprocess stdio, streamable HTTP, and SSE transports
//! connection.rs   — per-endpoint connection state machine with reconnect
//! control.rs      — WebSocket control channel with unbounded retry
//! orchestrator.rs — endpoint map reconciliation and tool-call routing
//! ```

mod config;
mod connection;
mod control;
mod endpoint;
mod orchestrator;
mod rpc;
mod transport;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::Cli;
use control::ControlChannel;
use orchestrator::Orchestrator;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match config::load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    info!(
        "agent '{}' starting, server={}, {} local endpoint(s)",
        config.agent_name,
        config.server_url,
        config.endpoints.len()
    );

    let (control_tx, control_rx) = tokio::sync::mpsc::channel(64);
    let channel = ControlChannel::connect(&config, control_tx);

    let (mut orchestrator, conn_rx) = Orchestrator::new(channel.clone());
    orchestrator.replace_endpoints(config.endpoints.clone()).await;
    let runner = tokio::spawn(orchestrator.run(control_rx, conn_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }
    info!("shutting down");

    // Ending the control session closes the event stream, which drives the
    // orchestrator through its full teardown.
    channel.disconnect();
    let _ = runner.await;
}
