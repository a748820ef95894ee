use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod executor;
mod inspector;
mod manager;
mod rewrite;
mod session;
mod tls;

use config::{ClientConfig, TunnelSetting};
use inspector::RequestLog;
use manager::TunnelManager;

#[derive(Parser)]
#[command(name = "rtunnel")]
#[command(version)]
#[command(about = "Expose local HTTP services through an rtunnel relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (defaults to rtunnel.yml in the working or home directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Expose a single local HTTP service
    Http {
        /// Local port to expose
        port: u16,

        /// Relay tunnel address (host:port or ws:// / wss:// URL)
        #[arg(short, long, default_value = "localhost:8081")]
        remote: String,

        /// Override the Host header sent to the local service
        #[arg(long)]
        host_header: Option<String>,

        /// Connect with TLS
        #[arg(long)]
        tls: bool,

        /// Accept relay certificates that fail validation
        #[arg(long)]
        allow_invalid_certificates: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "rtunnel=debug,rtunnel_shared=debug"
    } else {
        "rtunnel=info,rtunnel_shared=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = match cli.command {
        Some(Commands::Http {
            port,
            remote,
            host_header,
            tls,
            allow_invalid_certificates,
        }) => {
            let mut setting = TunnelSetting::new("http", remote, format!("http://localhost:{}", port));
            setting.host_header = host_header;
            setting.tls_enabled = tls;
            setting.allow_invalid_certificates = allow_invalid_certificates;
            let config = ClientConfig {
                tunnels: vec![setting],
                ..Default::default()
            };
            config.validate()?;
            config
        }
        None => {
            let path = cli
                .config
                .or_else(ClientConfig::find_config)
                .context("No configuration file found (try rtunnel.yml or `rtunnel http <port>`)")?;
            info!("Loading configuration from {}", path.display());
            ClientConfig::load(&path)?
        }
    };

    let shutdown = CancellationToken::new();
    let log = RequestLog::default();

    if config.inspector.enabled {
        tokio::spawn(inspector::start_inspector(
            log.clone(),
            config.inspector.port,
            shutdown.child_token(),
        ));
    }

    let mut manager = TunnelManager::new(&config, log, &shutdown)?;
    manager.start_all();

    manager.wait_for_shutdown().await;
    shutdown.cancel();
    println!("\n✓ All tunnels stopped.");
    Ok(())
}
