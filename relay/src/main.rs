use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod bridge;
mod config;
mod headers;
mod registry;
mod server;
mod tls;
mod tunnel;

use bridge::BridgeState;
use config::RelayConfig;
use registry::ClientRegistry;
use server::TunnelServer;

#[derive(Parser)]
#[command(name = "rtunnel-relay")]
#[command(version)]
#[command(about = "Public relay for rtunnel clients", long_about = None)]
struct Cli {
    /// Configuration file (defaults to rtunnel-relay.yml in the working or home directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "rtunnel_relay=debug,rtunnel_shared=debug"
    } else {
        "rtunnel_relay=info,rtunnel_shared=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = match cli.config.or_else(RelayConfig::find_config) {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            RelayConfig::load(&path)?
        }
        None => {
            info!("No configuration file found, using defaults");
            RelayConfig::default()
        }
    };

    let registry = Arc::new(ClientRegistry::new(config.tunnel.subdomains.clone()));
    let acceptor = tls::acceptor(&config.tunnel.tls)?;
    let tunnel_server = Arc::new(TunnelServer::new(
        registry.clone(),
        config.tunnel.domain.clone(),
        acceptor,
    ));
    let bridge_state = BridgeState::new(registry, &config.http);

    let tunnel_addr = bind_addr(&config.tunnel.host, config.tunnel.port)?;
    let http_addr = bind_addr(&config.http.host, config.http.port)?;

    let tunnel_listener = TcpListener::bind(tunnel_addr)
        .await
        .with_context(|| format!("Failed to bind tunnel listener on {}", tunnel_addr))?;
    let http_listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", http_addr))?;

    info!(
        "rtunnel relay starting (domain: {})",
        config.tunnel.domain.as_deref().unwrap_or("<none>")
    );

    let shutdown = CancellationToken::new();
    let tunnel_task = tokio::spawn(tunnel_server.serve(tunnel_listener, shutdown.clone()));
    let http_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge::serve(http_listener, bridge_state, shutdown).await {
                error!("HTTP listener failed: {}", e);
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    shutdown.cancel();

    let _ = tokio::join!(tunnel_task, http_task);
    Ok(())
}

fn bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let ip: IpAddr = host
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", host))?;
    Ok(SocketAddr::new(ip, port))
}
