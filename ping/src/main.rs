//! Demo ping service for etcd.
//!
//! `ping serve` answers `GET /ping` and keeps itself registered under a lease;
//! `ping client` discovers the registered backends and pings a random one on a
//! fixed cadence.

mod client;
mod serve;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use ping_discovery::store::EtcdStore;
use ping_discovery::{StoreConfig, DEFAULT_KEY_PREFIX};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ping", about = "Demo ping service for etcd", version)]
struct Cli {
    /// Enable debug logging
    #[arg(long, env = "PING_DEBUG", global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "PING_LOG_JSON", global = true)]
    log_json: bool,

    /// Discovery key prefix
    #[arg(long, env = "PING_DISCOVERY_KEY_PREFIX", default_value = DEFAULT_KEY_PREFIX, global = true)]
    discovery_key_prefix: String,

    /// Comma-separated etcd endpoints used for service discovery
    #[arg(
        long,
        env = "PING_DISCOVERY_ADDRESSES",
        value_delimiter = ',',
        default_value = "http://localhost:2480,http://localhost:2481,http://localhost:2482",
        global = true
    )]
    discovery_addresses: Vec<String>,

    /// Seconds to wait for the etcd connection
    #[arg(long, env = "PING_DIAL_TIMEOUT_SECS", default_value_t = 5, global = true)]
    dial_timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the liveness endpoint and register with discovery
    Serve(serve::ServeArgs),

    /// Ping a randomly chosen backend on a fixed interval
    Client(client::ClientArgs),
}

fn init_tracing(debug: bool, json: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

pub(crate) async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

/// Bind and serve `/metrics` until `shutdown` fires.
pub(crate) async fn spawn_metrics_server(
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server on {}", addr))?;
    tracing::info!(address = %addr, "Starting metrics server");

    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, ping_discovery::metrics::router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!("Metrics server failed: {}", e);
        }
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.log_json);

    let store_config = StoreConfig {
        endpoints: cli.discovery_addresses,
        dial_timeout: Duration::from_secs(cli.dial_timeout_secs),
    };
    let store = Arc::new(
        EtcdStore::connect(&store_config)
            .await
            .context("failed to create etcd client")?,
    );

    match cli.command {
        Commands::Serve(args) => serve::run(store, &cli.discovery_key_prefix, args).await,
        Commands::Client(args) => client::run(store, &cli.discovery_key_prefix, args).await,
    }
}
