use anyhow::Context;
use clap::Args;
use ping_discovery::store::EtcdStore;
use ping_discovery::{liveness, BackendRegistrar, RegistrarConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{spawn_metrics_server, wait_for_shutdown_signal};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Listen address for the ping endpoint
    #[arg(long, env = "PING_LISTEN_ADDRESS", default_value = "0.0.0.0:8200")]
    listen_address: SocketAddr,

    /// Address clients use to reach this backend
    #[arg(long, env = "PING_EXTERNAL_ADDRESS", default_value = "http://localhost:8200")]
    external_address: String,

    /// Listen address for metrics
    #[arg(long, env = "PING_METRICS_LISTEN_ADDRESS", default_value = "0.0.0.0:8300")]
    metrics_listen_address: SocketAddr,

    /// Registration lease TTL in seconds
    #[arg(long, env = "PING_LEASE_TTL_SECS", default_value_t = 5)]
    lease_ttl_secs: u64,

    /// Seconds between lease renewals
    #[arg(long, env = "PING_RENEW_INTERVAL_SECS", default_value_t = 2)]
    renew_interval_secs: u64,

    /// Overall shutdown deadline; half goes to draining requests, the rest to
    /// revoking the lease
    #[arg(long, env = "PING_SHUTDOWN_TIMEOUT_SECS", default_value_t = 5)]
    shutdown_timeout_secs: u64,
}

pub async fn run(store: Arc<EtcdStore>, key_prefix: &str, args: ServeArgs) -> anyhow::Result<()> {
    let mut config = RegistrarConfig::new(key_prefix, &args.external_address);
    config.lease_ttl = Duration::from_secs(args.lease_ttl_secs);
    config.renew_interval = Duration::from_secs(args.renew_interval_secs);
    let shutdown_timeout = Duration::from_secs(args.shutdown_timeout_secs);

    // Bind before registering so clients never see an address nobody serves
    let listener = TcpListener::bind(args.listen_address)
        .await
        .with_context(|| format!("failed to bind ping server on {}", args.listen_address))?;

    let shutdown = CancellationToken::new();
    let metrics_handle =
        spawn_metrics_server(args.metrics_listen_address, shutdown.child_token()).await?;

    let ping_shutdown = shutdown.child_token();
    tracing::info!(address = %args.listen_address, "Starting ping server");
    let mut ping_handle = tokio::spawn(async move {
        axum::serve(listener, liveness::router())
            .with_graceful_shutdown(async move { ping_shutdown.cancelled().await })
            .await
    });

    tracing::info!(address = %args.external_address, "Registering with discovery service");
    let registrar = BackendRegistrar::start(store, &config)
        .await
        .context("failed to register with discovery service")?;

    let server_exit = tokio::select! {
        _ = wait_for_shutdown_signal() => None,
        result = &mut ping_handle => Some(result),
    };

    let budget = ShutdownBudget::start(shutdown_timeout);
    let drain_timeout = budget.drain();

    // 1. Stop taking liveness requests
    shutdown.cancel();
    match server_exit {
        Some(result) => match result {
            Ok(Ok(())) => tracing::info!("Ping server closed, exiting"),
            Ok(Err(e)) => tracing::error!("Ping server failed: {}", e),
            Err(e) => tracing::error!("Ping server task error: {:?}", e),
        },
        None => match tokio::time::timeout(drain_timeout, ping_handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::warn!("Ping server error during drain: {}", e),
            Ok(Err(e)) => tracing::warn!("Ping server task error: {:?}", e),
            Err(_) => tracing::warn!(
                timeout_ms = drain_timeout.as_millis() as u64,
                "Ping server drain timed out"
            ),
        },
    }

    // 2. Revoke the lease so clients drop us now rather than after the TTL
    tracing::info!("Revoking lease on shutdown");
    let revoke_timeout = budget.remaining_at(Instant::now());
    if let Err(e) = registrar.shutdown(revoke_timeout).await {
        tracing::error!("Failed to revoke lease: {}", e);
    }

    let _ = metrics_handle.await;
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// One shutdown deadline shared by the drain and the lease revoke.
struct ShutdownBudget {
    started: Instant,
    total: Duration,
}

impl ShutdownBudget {
    fn start(total: Duration) -> Self {
        Self {
            started: Instant::now(),
            total,
        }
    }

    fn drain(&self) -> Duration {
        self.total / 2
    }

    fn remaining_at(&self, now: Instant) -> Duration {
        (self.started + self.total).saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_and_revoke_share_one_deadline() {
        let budget = ShutdownBudget::start(Duration::from_secs(5));
        assert_eq!(budget.drain(), Duration::from_millis(2500));

        // A drain that uses its whole share leaves the rest for the revoke
        let after_drain = budget.started + budget.drain();
        assert_eq!(
            budget.drain() + budget.remaining_at(after_drain),
            Duration::from_secs(5)
        );

        let past_deadline = budget.started + Duration::from_secs(6);
        assert_eq!(budget.remaining_at(past_deadline), Duration::ZERO);
    }
}
