use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions, WatchStream, Watcher,
};
use std::collections::VecDeque;
use std::time::Duration;

use super::{CoordinationStore, EventStream, KeyValue, LeaseId, RangeSnapshot, WatchEvent};
use crate::config::StoreConfig;
use crate::Error;

/// [`CoordinationStore`] backed by an etcd v3 cluster.
///
/// The underlying client multiplexes over one channel and is cheap to clone,
/// so every call works on its own clone.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to the configured endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint can be dialed within the dial timeout.
    pub async fn connect(config: &StoreConfig) -> Result<Self, Error> {
        config.validate()?;

        let options = ConnectOptions::new().with_connect_timeout(config.dial_timeout);
        let client = tokio::time::timeout(
            config.dial_timeout,
            Client::connect(&config.endpoints, Some(options)),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: "etcd dial",
            timeout: config.dial_timeout,
        })??;

        tracing::info!(endpoints = ?config.endpoints, "Connected to etcd");
        Ok(Self { client })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get_prefix(&self, prefix: &str) -> Result<RangeSnapshot, Error> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let revision = resp
            .header()
            .map(|h| h.revision())
            .ok_or_else(|| Error::Connection("range response without header".to_string()))?;

        let mut entries = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match (kv.key_str(), kv.value_str()) {
                (Ok(key), Ok(value)) => entries.push(KeyValue {
                    key: key.to_string(),
                    value: value.to_string(),
                }),
                _ => tracing::warn!("Skipping non UTF-8 key or value under {}", prefix),
            }
        }

        Ok(RangeSnapshot { entries, revision })
    }

    async fn watch_prefix(&self, prefix: &str, from_revision: i64) -> Result<EventStream, Error> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(from_revision);
        let (watcher, stream) = client.watch(prefix, Some(options)).await?;

        tracing::debug!(prefix, from_revision, watch_id = watcher.watch_id(), "Opened etcd watch");

        let state = WatchState {
            _watcher: watcher,
            stream,
            pending: VecDeque::new(),
            done: false,
        };

        Ok(Box::pin(futures_util::stream::unfold(state, next_event)))
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, Error> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(lease_ttl_secs(ttl), None).await?;
        Ok(LeaseId(resp.id()))
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), Error> {
        let mut client = self.client.clone();
        let options = lease.map(|lease| PutOptions::new().with_lease(lease.0));
        client.put(key, value, options).await?;
        Ok(())
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<(), Error> {
        let mut client = self.client.clone();
        // Opening the keeper sends one keep-alive and waits for its response.
        match client.lease_keep_alive(lease.0).await {
            Ok(_) => Ok(()),
            Err(etcd_client::Error::LeaseKeepAliveError(reason)) => {
                tracing::debug!(lease = %lease, %reason, "Keep-alive rejected");
                Err(Error::LeaseExpired(lease.0))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), Error> {
        let mut client = self.client.clone();
        match client.lease_revoke(lease.0).await {
            Ok(_) => Ok(()),
            Err(etcd_client::Error::GRpcStatus(status))
                if status.message().contains("lease not found") =>
            {
                tracing::debug!(lease = %lease, "Lease already gone, nothing to revoke");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// etcd grants whole seconds; round up so the granted TTL is never shorter
/// than the requested one.
fn lease_ttl_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1) as i64
}

struct WatchState {
    // Dropping the watcher cancels the server-side watch.
    _watcher: Watcher,
    stream: WatchStream,
    pending: VecDeque<WatchEvent>,
    done: bool,
}

async fn next_event(mut state: WatchState) -> Option<(Result<WatchEvent, Error>, WatchState)> {
    loop {
        if let Some(event) = state.pending.pop_front() {
            return Some((Ok(event), state));
        }
        if state.done {
            return None;
        }

        match state.stream.message().await {
            Ok(Some(resp)) => {
                if resp.canceled() {
                    state.done = true;
                    let reason = format!(
                        "watch canceled by server (compact revision {})",
                        resp.compact_revision()
                    );
                    return Some((Err(Error::Connection(reason)), state));
                }
                for event in resp.events() {
                    if let Some(event) = convert_event(event) {
                        state.pending.push_back(event);
                    }
                }
            }
            Ok(None) => return None,
            Err(e) => {
                state.done = true;
                return Some((Err(e.into()), state));
            }
        }
    }
}

fn convert_event(event: &etcd_client::Event) -> Option<WatchEvent> {
    let kv = event.kv()?;
    let key = match kv.key_str() {
        Ok(key) => key.to_string(),
        Err(e) => {
            tracing::warn!("Skipping watch event with non UTF-8 key: {}", e);
            return None;
        }
    };
    let revision = kv.mod_revision();

    match event.event_type() {
        EventType::Put => match kv.value_str() {
            Ok(value) => Some(WatchEvent::Put {
                key,
                value: value.to_string(),
                revision,
            }),
            Err(e) => {
                tracing::warn!(%key, "Skipping PUT with non UTF-8 value: {}", e);
                None
            }
        },
        EventType::Delete => Some(WatchEvent::Delete { key, revision }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_ttl_rounds_up_to_whole_seconds() {
        assert_eq!(lease_ttl_secs(Duration::from_secs(5)), 5);
        assert_eq!(lease_ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(lease_ttl_secs(Duration::from_millis(200)), 1);
    }
}
