use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::metrics::METRICS;
use crate::store::CoordinationStore;
use crate::synchronizer::{MembershipSynchronizer, SyncExit};
use crate::{
    http_client, BackendHandle, BackendSelector, Error, KeyLayout, MembershipEvent,
    MembershipTable, SyncConfig,
};

/// A watch that stays open this long counts as healthy even without events.
const STABLE_WATCH: Duration = Duration::from_secs(10);

/// Client-side view of the backend pool.
///
/// Loads the current registrations, then keeps the table current from the
/// change stream in a background task. Callers pick backends with
/// [`DiscoveryClient::pick`] and never block on the store.
pub struct DiscoveryClient {
    table: Arc<MembershipTable>,
    selector: BackendSelector,
    cancel_token: CancellationToken,
    sync_handle: Option<tokio::task::JoinHandle<()>>,
    event_tx: broadcast::Sender<MembershipEvent>,
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl DiscoveryClient {
    /// Bootstrap the membership table and start following changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the initial
    /// snapshot read fails.
    pub async fn start(
        store: Arc<dyn CoordinationStore>,
        config: &SyncConfig,
    ) -> Result<Self, Error> {
        let http = http_client(config.request_timeout, config.max_idle_per_backend)?;
        let table = Arc::new(MembershipTable::new());
        let (event_tx, _) = broadcast::channel(64);

        let mut sync = MembershipSynchronizer::new(
            store,
            KeyLayout::new(&config.key_prefix),
            table.clone(),
            http,
            event_tx.clone(),
        );
        let snapshot = sync.bootstrap().await?;
        tracing::info!(
            backends = snapshot.records.len(),
            revision = snapshot.revision,
            prefix = %config.key_prefix,
            "Discovered backends"
        );

        let cancel_token = CancellationToken::new();
        let sync_handle =
            Self::spawn_sync_task(sync, config.resync_on_stream_loss, cancel_token.clone());

        Ok(Self {
            selector: BackendSelector::new(table.clone()),
            table,
            cancel_token,
            sync_handle: Some(sync_handle),
            event_tx,
        })
    }

    fn spawn_sync_task(
        mut sync: MembershipSynchronizer,
        resync: bool,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            // Failed attempts since the last healthy watch
            let mut failures: u32 = 0;

            loop {
                let cursor = sync.cursor();
                let opened = tokio::time::Instant::now();
                match sync.run(&cancel_token).await {
                    Ok(SyncExit::Cancelled) => break,
                    Ok(SyncExit::StreamClosed) => {}
                    Err(e) => tracing::warn!("Failed to watch membership: {}", e),
                }

                if sync.cursor() > cursor || opened.elapsed() >= STABLE_WATCH {
                    failures = 0;
                }

                if !resync {
                    tracing::error!(
                        backends = sync.table().len(),
                        "Change stream lost, membership view is no longer updated"
                    );
                    break;
                }

                if !Self::resync(&mut sync, &mut failures, &cancel_token).await {
                    break;
                }
            }
            tracing::debug!("Membership sync task shutting down");
        })
    }

    /// Re-read the snapshot until it succeeds. Returns false if cancelled.
    ///
    /// `failures` carries across watch attempts, so a watch that keeps
    /// failing right after a good snapshot still backs off.
    async fn resync(
        sync: &mut MembershipSynchronizer,
        failures: &mut u32,
        cancel_token: &CancellationToken,
    ) -> bool {
        loop {
            *failures += 1;
            let backoff_ms = 100 * 2u64.pow((*failures).min(6));
            tokio::select! {
                _ = cancel_token.cancelled() => return false,
                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
            }

            match sync.bootstrap().await {
                Ok(snapshot) => {
                    METRICS.inc_resync();
                    tracing::info!(
                        backends = snapshot.records.len(),
                        revision = snapshot.revision,
                        failures = *failures,
                        "Membership resynchronized"
                    );
                    return true;
                }
                Err(e) => {
                    tracing::error!(
                        failures = *failures,
                        backoff_ms,
                        "Membership resync failed: {}, backing off",
                        e
                    );
                }
            }
        }
    }

    /// Pick a backend uniformly at random, or `None` when none are known.
    pub fn pick(&self) -> Option<Arc<BackendHandle>> {
        self.selector.pick()
    }

    pub fn selector(&self) -> BackendSelector {
        self.selector.clone()
    }

    pub fn table(&self) -> Arc<MembershipTable> {
        self.table.clone()
    }

    pub fn backend_count(&self) -> usize {
        self.table.len()
    }

    /// Subscribe to membership change events.
    ///
    /// Events are broadcast AFTER the table has been updated.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.event_tx.subscribe()
    }

    /// Whether the background task is still following the store.
    pub fn is_syncing(&self) -> bool {
        self.sync_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop following membership changes. The table keeps its last contents.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.sync_handle.take() {
            let _ = handle.await;
        }
        tracing::debug!("Discovery client stopped");
    }
}
