use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use voicebridge::tunnel::{TunnelConfig, TunnelManager, public_host_from_url};
use voicebridge::{AppState, ServerConfig, routes};

/// Farewell spoken on every still-active call during shutdown.
const SHUTDOWN_FAREWELL: &str = "Sorry, I have to hang up now. Talk soon.";

/// voicebridge - outbound voice-call bridge for AI agents
#[derive(Parser, Debug)]
#[command(name = "voicebridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Local HTTP port override
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,voicebridge=debug".parse().expect("valid filter")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = ServerConfig::from_env().map_err(|e| anyhow!(e.to_string()))?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    let address = config.address();
    let use_tunnel = config.use_tunnel;
    let local_port = config.port;

    let state = Arc::new(AppState::new(config).map_err(|e| anyhow!(e.to_string()))?);

    // Bring up the public ingress before anything can place a call.
    let tunnel = if use_tunnel {
        let tunnel = Arc::new(TunnelManager::new(TunnelConfig::new(local_port)));
        let url = tunnel.start().await.map_err(|e| anyhow!(e.to_string()))?;
        state.manager.set_public_host(public_host_from_url(&url));

        let manager = state.manager.clone();
        tunnel
            .clone()
            .spawn_monitor(Arc::new(move |url: String| {
                manager.set_public_host(public_host_from_url(&url));
            }))
            .await;
        Some(tunnel)
    } else {
        None
    };

    let public_host = state
        .manager
        .public_host()
        .ok_or_else(|| anyhow!("no public host available"))?;
    println!("Starting server on {address} (public host {public_host})");

    let app = routes::create_router(state.clone());

    let socket_addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow!("Invalid server address '{}': {}", address, e))?;
    let listener = TcpListener::bind(&socket_addr).await?;
    info!("server listening on http://{socket_addr}");

    let shutdown_state = state.clone();
    let shutdown_tunnel = tunnel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for shutdown signal: {e}");
                return;
            }
            info!("shutting down: ending active calls");
            shutdown_state.manager.shutdown_all(SHUTDOWN_FAREWELL).await;
            if let Some(tunnel) = shutdown_tunnel {
                tunnel.stop().await;
            }
        })
        .await?;

    Ok(())
}
