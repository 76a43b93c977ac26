use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::metrics::METRICS;
use crate::store::{CoordinationStore, LeaseId};
use crate::{Error, KeyLayout, RegistrarConfig};

/// A lease granted to one backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl: Duration,
}

/// Keeps one backend registered for the lifetime of the process.
///
/// The registration key is bound to a lease that a background task renews on
/// a fixed cadence. `shutdown` revokes the lease so clients drop the backend
/// immediately; dropping the registrar instead stops renewal and lets the
/// key expire with the TTL.
pub struct BackendRegistrar {
    store: Arc<dyn CoordinationStore>,
    instance_id: String,
    key: String,
    lease: Lease,
    cancel_token: CancellationToken,
    renewal_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for BackendRegistrar {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        if self.renewal_handle.is_some() {
            tracing::debug!(
                instance_id = %self.instance_id,
                "BackendRegistrar dropped (shutdown should be called explicitly)"
            );
        }
    }
}

impl BackendRegistrar {
    /// Grant a lease, write the registration key and start renewing.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the store does not
    /// accept the lease or the registration within the request timeout.
    pub async fn start(
        store: Arc<dyn CoordinationStore>,
        config: &RegistrarConfig,
    ) -> Result<Self, Error> {
        config.validate()?;

        let instance_id = Uuid::new_v4().to_string();
        let key = KeyLayout::new(&config.key_prefix).key_for(&instance_id);

        let lease_id = with_deadline(
            "lease grant",
            config.request_timeout,
            store.grant_lease(config.lease_ttl),
        )
        .await?;
        let lease = Lease {
            id: lease_id,
            ttl: config.lease_ttl,
        };

        let registered = with_deadline(
            "registration put",
            config.request_timeout,
            store.put(&key, &config.external_address, Some(lease_id)),
        )
        .await;
        if let Err(e) = registered {
            // Best effort; the TTL cleans up if this fails too
            if let Err(revoke_err) =
                with_deadline("lease revoke", config.request_timeout, store.revoke(lease_id)).await
            {
                tracing::warn!(lease = %lease_id, "Failed to revoke unused lease: {}", revoke_err);
            }
            return Err(e);
        }

        tracing::info!(
            %instance_id,
            %key,
            lease = %lease_id,
            ttl_secs = config.lease_ttl.as_secs(),
            address = %config.external_address,
            "Registered backend"
        );

        let cancel_token = CancellationToken::new();
        let renewal_handle = Self::spawn_renewal_task(
            store.clone(),
            lease_id,
            config.renew_interval,
            config.request_timeout,
            cancel_token.clone(),
        );

        Ok(Self {
            store,
            instance_id,
            key,
            lease,
            cancel_token,
            renewal_handle: Some(renewal_handle),
        })
    }

    fn spawn_renewal_task(
        store: Arc<dyn CoordinationStore>,
        lease: LeaseId,
        renew_interval: Duration,
        request_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + renew_interval;
            let mut interval = tokio::time::interval_at(start, renew_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!(lease = %lease, "Lease renewal task shutting down");
                        break;
                    }

                    _ = interval.tick() => {
                        let renewal = with_deadline(
                            "lease keep-alive",
                            request_timeout,
                            store.keep_alive_once(lease),
                        );
                        // Cancellation wins over an in-flight renewal
                        let result = tokio::select! {
                            _ = cancel_token.cancelled() => break,
                            result = renewal => result,
                        };

                        match result {
                            Ok(()) => {
                                if consecutive_failures > 0 {
                                    tracing::info!(
                                        lease = %lease,
                                        failures = consecutive_failures,
                                        "Lease renewal recovered"
                                    );
                                }
                                consecutive_failures = 0;
                                METRICS.inc_renewal_ok();
                                tracing::trace!(lease = %lease, "Lease renewed");
                            }
                            Err(e) => {
                                consecutive_failures += 1;
                                METRICS.inc_renewal_failed();
                                tracing::error!(
                                    lease = %lease,
                                    failures = consecutive_failures,
                                    "Lease renewal failed: {}, retrying next tick",
                                    e
                                );
                            }
                        }
                    }
                }
            }
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Registration key written to the store.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lease(&self) -> Lease {
        self.lease
    }

    /// Stop renewing and revoke the lease, removing the registration now.
    ///
    /// # Errors
    ///
    /// Returns an error if the revoke fails or does not finish within
    /// `deadline`. The key then disappears once the TTL runs out.
    pub async fn shutdown(mut self, deadline: Duration) -> Result<(), Error> {
        // 1. Stop renewals first so nothing extends the lease after revoke
        self.cancel_token.cancel();
        if let Some(handle) = self.renewal_handle.take() {
            let _ = handle.await;
        }

        // 2. Revoke within the shutdown deadline
        with_deadline("lease revoke", deadline, self.store.revoke(self.lease.id)).await?;

        tracing::info!(
            instance_id = %self.instance_id,
            lease = %self.lease.id,
            "Revoked lease, backend deregistered"
        );
        Ok(())
    }
}

async fn with_deadline<T>(
    operation: &'static str,
    timeout: Duration,
    fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::Timeout { operation, timeout })?
}
