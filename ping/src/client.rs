use anyhow::Context;
use clap::Args;
use ping_discovery::metrics::{Operation, Outcome, METRICS};
use ping_discovery::store::EtcdStore;
use ping_discovery::{DiscoveryClient, SyncConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{spawn_metrics_server, wait_for_shutdown_signal};

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Milliseconds between pings
    #[arg(long, env = "PING_INTERVAL_MS", default_value_t = 1000)]
    interval_ms: u64,

    /// Timeout for each ping in milliseconds
    #[arg(long, env = "PING_REQUEST_TIMEOUT_MS", default_value_t = 5000)]
    request_timeout_ms: u64,

    /// Optional listen address for metrics
    #[arg(long, env = "PING_CLIENT_METRICS_LISTEN_ADDRESS")]
    metrics_listen_address: Option<SocketAddr>,
}

pub async fn run(store: Arc<EtcdStore>, key_prefix: &str, args: ClientArgs) -> anyhow::Result<()> {
    let mut config = SyncConfig::new(key_prefix);
    config.request_timeout = Duration::from_millis(args.request_timeout_ms);

    let client = DiscoveryClient::start(store, &config)
        .await
        .context("failed to get existing backends")?;

    let shutdown = CancellationToken::new();
    let metrics_handle = match args.metrics_listen_address {
        Some(addr) => Some(spawn_metrics_server(addr, shutdown.child_token()).await?),
        None => None,
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let signal = wait_for_shutdown_signal();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            _ = &mut signal => break,
            _ = ticker.tick() => ping_once(&client).await,
        }
    }

    shutdown.cancel();
    client.shutdown().await;
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }
    Ok(())
}

async fn ping_once(client: &DiscoveryClient) {
    let Some(backend) = client.pick() else {
        METRICS.observe_request(Operation::Ping, Outcome::Miss, Duration::ZERO);
        tracing::error!("No backend available");
        return;
    };

    let start = Instant::now();
    let result = backend.ping().await;
    let elapsed = start.elapsed();

    match result {
        Ok(()) => {
            METRICS.observe_request(Operation::Ping, Outcome::Ok, elapsed);
            tracing::info!(
                addr = %backend.address(),
                latency_ms = elapsed.as_millis() as u64,
                "Pinged backend"
            );
        }
        Err(e) => {
            let outcome = if e.is_timeout() {
                Outcome::Timeout
            } else {
                Outcome::Error
            };
            METRICS.observe_request(Operation::Ping, outcome, elapsed);
            tracing::error!(addr = %backend.address(), "Failed to ping backend: {}", e);
        }
    }
}
