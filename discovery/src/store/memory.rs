use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{CoordinationStore, EventStream, KeyValue, LeaseId, RangeSnapshot, WatchEvent};
use crate::Error;

const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// In-process coordination store with etcd-like revision, lease and watch
/// semantics.
///
/// Leases expire lazily on every operation and, optionally, from a reaper
/// task (see [`MemoryStore::spawn_reaper`]). Time comes from
/// `tokio::time`, so paused-clock tests control expiry exactly.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<State>>,
}

struct State {
    revision: i64,
    next_lease: i64,
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<i64, LeaseState>,
    history: Vec<WatchEvent>,
    events: broadcast::Sender<WatchEvent>,
}

struct Entry {
    value: String,
    lease: Option<i64>,
}

struct LeaseState {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(State {
                revision: 1,
                next_lease: 1,
                kvs: BTreeMap::new(),
                leases: HashMap::new(),
                history: Vec::new(),
                events,
            })),
        }
    }

    /// Current store revision.
    pub fn revision(&self) -> i64 {
        self.inner.lock().revision
    }

    /// Delete a key outright, as an operator would with `etcdctl del`.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.inner.lock();
        state.expire(Instant::now());
        state.delete_key(key)
    }

    /// Expire every lease whose deadline has passed. Returns how many expired.
    pub fn expire_leases(&self) -> usize {
        self.inner.lock().expire(Instant::now())
    }

    /// Number of leases currently alive.
    pub fn lease_count(&self) -> usize {
        let mut state = self.inner.lock();
        state.expire(Instant::now());
        state.leases.len()
    }

    /// Close every open watch stream, as a dropped connection would.
    ///
    /// Later watches work normally.
    pub fn disconnect_watchers(&self) {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        self.inner.lock().events = events;
    }

    /// Periodically expire leases so watchers observe TTL deletions without
    /// anyone reading the store.
    pub fn spawn_reaper(
        &self,
        period: Duration,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = interval.tick() => {
                        let expired = store.expire_leases();
                        if expired > 0 {
                            tracing::debug!(expired, "Expired leases");
                        }
                    }
                }
            }
        })
    }
}

impl State {
    fn bump(&mut self) -> i64 {
        self.revision += 1;
        self.revision
    }

    fn emit(&mut self, event: WatchEvent) {
        self.history.push(event.clone());
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn delete_key(&mut self, key: &str) -> bool {
        let Some(entry) = self.kvs.remove(key) else {
            return false;
        };
        if let Some(lease) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }
        let revision = self.bump();
        self.emit(WatchEvent::Delete {
            key: key.to_string(),
            revision,
        });
        true
    }

    fn drop_lease(&mut self, id: i64) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        let mut keys: Vec<String> = lease.keys.into_iter().collect();
        keys.sort();
        for key in keys {
            self.delete_key(&key);
        }
        true
    }

    fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<i64> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            tracing::trace!(lease = id, "Lease expired");
            self.drop_lease(*id);
        }
        expired.len()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get_prefix(&self, prefix: &str) -> Result<RangeSnapshot, Error> {
        let mut state = self.inner.lock();
        state.expire(Instant::now());

        let entries = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect();

        Ok(RangeSnapshot {
            entries,
            revision: state.revision,
        })
    }

    async fn watch_prefix(&self, prefix: &str, from_revision: i64) -> Result<EventStream, Error> {
        // Subscribe and copy history under one lock so no event is missed or
        // delivered twice.
        let (backlog, rx) = {
            let mut state = self.inner.lock();
            state.expire(Instant::now());
            let rx = state.events.subscribe();
            let backlog: Vec<WatchEvent> = state
                .history
                .iter()
                .filter(|e| e.revision() >= from_revision && e.key().starts_with(prefix))
                .cloned()
                .collect();
            (backlog, rx)
        };

        let prefix = prefix.to_string();
        let live = futures_util::stream::unfold(Some(rx), move |rx| {
            let prefix = prefix.clone();
            async move {
                let mut rx = rx?;
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            if event.revision() >= from_revision && event.key().starts_with(&prefix)
                            {
                                return Some((Ok(event), Some(rx)));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            let err = Error::Connection(format!("watch fell behind by {n} events"));
                            return Some((Err(err), None));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        let backlog = futures_util::stream::iter(backlog.into_iter().map(Ok));
        Ok(Box::pin(futures_util::StreamExt::chain(backlog, live)))
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, Error> {
        let mut state = self.inner.lock();
        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            id,
            LeaseState {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(LeaseId(id))
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), Error> {
        let mut state = self.inner.lock();
        state.expire(Instant::now());

        if let Some(LeaseId(id)) = lease {
            let attached = state.leases.get_mut(&id).ok_or(Error::LeaseExpired(id))?;
            attached.keys.insert(key.to_string());
        }

        let previous = state.kvs.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease: lease.map(|l| l.0),
            },
        );
        if let Some(old_lease) = previous.and_then(|e| e.lease) {
            if Some(old_lease) != lease.map(|l| l.0) {
                if let Some(old) = state.leases.get_mut(&old_lease) {
                    old.keys.remove(key);
                }
            }
        }

        let revision = state.bump();
        state.emit(WatchEvent::Put {
            key: key.to_string(),
            value: value.to_string(),
            revision,
        });
        Ok(())
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<(), Error> {
        let mut state = self.inner.lock();
        let now = Instant::now();
        state.expire(now);

        let entry = state
            .leases
            .get_mut(&lease.0)
            .ok_or(Error::LeaseExpired(lease.0))?;
        entry.deadline = now + entry.ttl;
        Ok(())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), Error> {
        let mut state = self.inner.lock();
        state.expire(Instant::now());
        if !state.drop_lease(lease.0) {
            tracing::debug!(lease = %lease, "Lease already gone, nothing to revoke");
        }
        Ok(())
    }
}
