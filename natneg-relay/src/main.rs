use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use natneg_relay::{Config, Proxy, PublicAddress, public_address};
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::layer::Identity;

#[derive(Parser, Debug)]
#[command(version, about = "NAT-negotiation relay proxy for legacy peer-to-peer games")]
struct Cli {
    /// Address of the server-facing UDP socket.
    #[arg(long, env = "NATNEG_LISTEN_ADDR", default_value = "0.0.0.0:27901")]
    listen_addr: SocketAddr,

    /// Hostname of the upstream NatNeg server.
    #[arg(long, env = "NATNEG_SERVER_HOST", default_value = natneg_relay::DEFAULT_SERVER_HOST)]
    server_host: String,

    /// UDP port of the upstream NatNeg server.
    #[arg(long, env = "NATNEG_SERVER_PORT", default_value_t = natneg_relay::DEFAULT_PORT)]
    server_port: u16,

    /// HTTP endpoint that answers with this host's public IPv4 address.
    #[arg(long, env = "NATNEG_IP_DISCOVERY_URL", default_value = public_address::DEFAULT_DISCOVERY_URL)]
    ip_discovery_url: String,

    /// Directory for rotating log files; stdout only when unset.
    #[arg(long, env = "NATNEG_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_owned());
    let _log_handle = match &cli.log_dir {
        Some(log_dir) => {
            let (file_layer, handle) = logging::file::layer(log_dir, "natneg-relay");
            logging::setup_global_subscriber(&directives, file_layer)
                .context("Failed to set up logging")?;

            Some(handle)
        }
        None => {
            logging::setup_global_subscriber(&directives, Identity::new())
                .context("Failed to set up logging")?;

            None
        }
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "natneg-relay started");

    let public_address = Arc::new(PublicAddress::new());
    tokio::spawn(public_address::refresh_task(
        Arc::clone(&public_address),
        cli.ip_discovery_url.clone(),
    ));

    let config = Config {
        listen_addr: cli.listen_addr,
        server_host: cli.server_host.clone(),
        server_port: cli.server_port,
        ..Config::default()
    };

    let proxy = Proxy::bind(config, public_address).await?;
    let listen_addr = proxy.local_addr()?;

    tracing::info!(%listen_addr, "Listening for NatNeg traffic");

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = proxy.run() => {
            result.context("Proxy dispatcher failed")?;
        }
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for SIGINT")?;
            tracing::info!("Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }

    tracing::info!("Goodbye!");

    Ok(())
}
