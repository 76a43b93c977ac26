use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::metrics::METRICS;
use crate::store::{CoordinationStore, WatchEvent};
use crate::{BackendHandle, BackendRecord, Error, KeyLayout, MembershipEvent, MembershipTable};

/// Full membership read at one store revision.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub records: Vec<BackendRecord>,
    pub revision: i64,
}

/// Why [`MembershipSynchronizer::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncExit {
    /// The cancellation token fired.
    Cancelled,
    /// The change stream ended or failed; the table stops tracking the store.
    StreamClosed,
}

/// Keeps a [`MembershipTable`] in step with the registrations in the store.
///
/// `bootstrap` loads a snapshot and positions the watch cursor right after
/// it; `run` then applies the change stream from that cursor. Events are
/// applied strictly in delivery order, which preserves the store's per-key
/// ordering.
pub struct MembershipSynchronizer {
    store: Arc<dyn CoordinationStore>,
    layout: KeyLayout,
    table: Arc<MembershipTable>,
    http: reqwest::Client,
    event_tx: broadcast::Sender<MembershipEvent>,
    /// Next revision to watch from. Only moves forward.
    cursor: i64,
}

impl MembershipSynchronizer {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        layout: KeyLayout,
        table: Arc<MembershipTable>,
        http: reqwest::Client,
        event_tx: broadcast::Sender<MembershipEvent>,
    ) -> Self {
        Self {
            store,
            layout,
            table,
            http,
            event_tx,
            cursor: 0,
        }
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    pub fn table(&self) -> &Arc<MembershipTable> {
        &self.table
    }

    /// Read every registration and make the table match it exactly.
    ///
    /// # Errors
    ///
    /// Returns an error if the range read fails; the table is left untouched.
    pub async fn bootstrap(&mut self) -> Result<Snapshot, Error> {
        let range = self
            .store
            .get_prefix(self.layout.registration_prefix())
            .await?;

        let mut records = Vec::with_capacity(range.entries.len());
        for kv in range.entries {
            match self.layout.record(&kv.key, &kv.value) {
                Some(record) => records.push(record),
                None => tracing::warn!(key = %kv.key, "Ignoring malformed registration key"),
            }
        }

        let handles = records
            .iter()
            .map(|record| BackendHandle::new(record.clone(), self.http.clone()))
            .collect();
        let (joined, left) = self.table.reconcile(handles);

        for record in joined {
            tracing::info!(id = %record.instance_id, addr = %record.address, "Adding existing backend");
            let _ = self.event_tx.send(MembershipEvent::Joined(record));
        }
        for id in left {
            tracing::info!(%id, "Removing backend missing from snapshot");
            let _ = self.event_tx.send(MembershipEvent::Left(id));
        }
        METRICS.set_backend_count(self.table.len());

        self.cursor = self.cursor.max(range.revision + 1);
        tracing::debug!(
            count = records.len(),
            revision = range.revision,
            cursor = self.cursor,
            "Membership bootstrapped"
        );

        Ok(Snapshot {
            records,
            revision: range.revision,
        })
    }

    /// Apply the change stream from the cursor until it closes or `cancel_token`
    /// fires.
    ///
    /// # Errors
    ///
    /// Returns an error if called before `bootstrap` or if the watch cannot be
    /// opened.
    pub async fn run(&mut self, cancel_token: &CancellationToken) -> Result<SyncExit, Error> {
        if self.cursor == 0 {
            return Err(Error::Config(
                "membership must be bootstrapped before watching".into(),
            ));
        }

        let mut stream = self
            .store
            .watch_prefix(self.layout.registration_prefix(), self.cursor)
            .await?;
        tracing::debug!(cursor = self.cursor, "Watching for membership changes");

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    tracing::debug!("Membership synchronizer shutting down");
                    return Ok(SyncExit::Cancelled);
                }

                next = stream.next() => match next {
                    Some(Ok(event)) => self.apply(&event),
                    Some(Err(e)) => {
                        tracing::warn!(cursor = self.cursor, "Change stream failed: {}", e);
                        return Ok(SyncExit::StreamClosed);
                    }
                    None => {
                        tracing::warn!(cursor = self.cursor, "Change stream ended");
                        return Ok(SyncExit::StreamClosed);
                    }
                },
            }
        }
    }

    /// Apply one change event to the table.
    pub fn apply(&mut self, event: &WatchEvent) {
        match event {
            WatchEvent::Put { key, value, .. } => {
                METRICS.inc_put_event();
                let Some(record) = self.layout.record(key, value) else {
                    tracing::warn!(%key, "Ignoring PUT for malformed registration key");
                    self.advance(event);
                    return;
                };

                let handle = BackendHandle::new(record.clone(), self.http.clone());
                let previous = self.table.insert(handle);
                let changed = previous.map_or(true, |p| p.record() != &record);
                if changed {
                    tracing::info!(id = %record.instance_id, addr = %record.address, "Adding new backend");
                    let _ = self.event_tx.send(MembershipEvent::Joined(record));
                }
            }
            WatchEvent::Delete { key, .. } => {
                METRICS.inc_delete_event();
                let Some(id) = self.layout.instance_id(key) else {
                    tracing::warn!(%key, "Ignoring DELETE for malformed registration key");
                    self.advance(event);
                    return;
                };

                if self.table.remove(id).is_some() {
                    tracing::info!(%id, "Removing backend");
                    let _ = self.event_tx.send(MembershipEvent::Left(id.to_string()));
                } else {
                    tracing::debug!(%id, "DELETE for unknown backend");
                }
            }
        }

        METRICS.set_backend_count(self.table.len());
        self.advance(event);
    }

    fn advance(&mut self, event: &WatchEvent) {
        self.cursor = self.cursor.max(event.revision() + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::{BTreeMap, HashMap};
    use std::time::Duration;

    const PREFIX: &str = "svc";

    fn synchronizer(store: &MemoryStore) -> MembershipSynchronizer {
        let (event_tx, _) = broadcast::channel(64);
        MembershipSynchronizer::new(
            Arc::new(store.clone()),
            KeyLayout::new(PREFIX),
            Arc::new(MembershipTable::new()),
            reqwest::Client::new(),
            event_tx,
        )
    }

    fn key(id: &str) -> String {
        KeyLayout::new(PREFIX).key_for(id)
    }

    fn contents(table: &MembershipTable) -> BTreeMap<String, String> {
        table
            .records()
            .into_iter()
            .map(|r| (r.instance_id, r.address))
            .collect()
    }

    #[tokio::test]
    async fn test_bootstrap_loads_every_registration() {
        let store = MemoryStore::new();
        for i in 0..10 {
            store
                .put(&key(&format!("b{i}")), &format!("http://h{i}:80"), None)
                .await
                .unwrap();
        }
        store.put("svc/other", "ignored", None).await.unwrap();
        store.put("svc/backend/bad/id", "ignored", None).await.unwrap();

        let mut sync = synchronizer(&store);
        let snapshot = sync.bootstrap().await.unwrap();

        assert_eq!(snapshot.records.len(), 10);
        assert_eq!(snapshot.revision, store.revision());
        assert_eq!(sync.cursor(), store.revision() + 1);

        let table = contents(sync.table());
        assert_eq!(table.len(), 10);
        for i in 0..10 {
            assert_eq!(table[&format!("b{i}")], format!("http://h{i}:80"));
        }
    }

    #[tokio::test]
    async fn test_run_before_bootstrap_is_rejected() {
        let store = MemoryStore::new();
        let mut sync = synchronizer(&store);
        let result = sync.run(&CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_duplicate_put_replaces_and_delete_is_idempotent() {
        let store = MemoryStore::new();
        let mut sync = synchronizer(&store);
        sync.bootstrap().await.unwrap();

        let put = |value: &str, revision| WatchEvent::Put {
            key: key("a"),
            value: value.to_string(),
            revision,
        };
        sync.apply(&put("http://h1:80", 10));
        sync.apply(&put("http://h1:81", 11));
        assert_eq!(sync.table().len(), 1);
        assert_eq!(sync.table().get("a").unwrap().address(), "http://h1:81");

        let delete = WatchEvent::Delete {
            key: key("a"),
            revision: 12,
        };
        sync.apply(&delete);
        sync.apply(&WatchEvent::Delete {
            key: key("never-seen"),
            revision: 13,
        });
        assert!(sync.table().is_empty());
        assert_eq!(sync.cursor(), 14);
    }

    #[tokio::test]
    async fn test_cursor_never_rewinds() {
        let store = MemoryStore::new();
        let mut sync = synchronizer(&store);
        sync.bootstrap().await.unwrap();

        sync.apply(&WatchEvent::Put {
            key: key("a"),
            value: "x".into(),
            revision: 50,
        });
        sync.apply(&WatchEvent::Delete {
            key: key("b"),
            revision: 20,
        });
        assert_eq!(sync.cursor(), 51);
    }

    #[test]
    fn test_interleavings_converge_to_replayed_state() {
        // Per-key event sequences; interleave across keys at random while
        // keeping each key's own order.
        let mut rng = StdRng::seed_from_u64(7);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        for _round in 0..50 {
            let mut per_key: Vec<Vec<WatchEvent>> = Vec::new();
            let mut expected: BTreeMap<String, String> = BTreeMap::new();
            let mut revision = 100;

            // Bootstrap snapshot
            let store = MemoryStore::new();
            for i in 0..4 {
                let id = format!("s{i}");
                rt.block_on(store.put(&key(&id), "http://boot", None)).unwrap();
                expected.insert(id, "http://boot".into());
            }

            for k in 0..8 {
                let id = format!("s{}", k % 6);
                let mut seq = Vec::new();
                for step in 0..rng.gen_range(1..6) {
                    revision += 1;
                    if rng.gen_bool(0.6) {
                        let value = format!("http://{id}-{step}");
                        seq.push(WatchEvent::Put {
                            key: key(&id),
                            value,
                            revision,
                        });
                    } else {
                        seq.push(WatchEvent::Delete {
                            key: key(&id),
                            revision,
                        });
                    }
                }
                per_key.push(seq);
            }

            // Merge sequences for the same key to keep per-key order intact
            let mut by_key: HashMap<String, Vec<WatchEvent>> = HashMap::new();
            for seq in per_key {
                for event in seq {
                    by_key.entry(event.key().to_string()).or_default().push(event);
                }
            }
            for events in by_key.values() {
                for event in events {
                    let id = KeyLayout::new(PREFIX).instance_id(event.key()).unwrap().to_string();
                    match event {
                        WatchEvent::Put { value, .. } => {
                            expected.insert(id, value.clone());
                        }
                        WatchEvent::Delete { .. } => {
                            expected.remove(&id);
                        }
                    }
                }
            }

            let mut queues: Vec<Vec<WatchEvent>> = by_key
                .into_values()
                .map(|mut v| {
                    v.reverse();
                    v
                })
                .collect();
            let mut interleaved = Vec::new();
            while !queues.is_empty() {
                queues.shuffle(&mut rng);
                let queue = &mut queues[0];
                interleaved.push(queue.pop().unwrap());
                queues.retain(|q| !q.is_empty());
            }

            let mut sync = synchronizer(&store);
            rt.block_on(sync.bootstrap()).unwrap();
            for event in &interleaved {
                sync.apply(event);
            }

            assert_eq!(contents(sync.table()), expected);
        }
    }

    #[tokio::test]
    async fn test_end_to_end_membership_scenario() {
        let store = MemoryStore::new();
        store.put(&key("a"), "http://h1:80", None).await.unwrap();

        let mut sync = synchronizer(&store);
        let mut events = sync.event_tx.subscribe();
        sync.bootstrap().await.unwrap();
        assert_eq!(
            sync.table().records(),
            vec![BackendRecord::new("a", "http://h1:80")]
        );
        assert_eq!(
            events.recv().await.unwrap(),
            MembershipEvent::Joined(BackendRecord::new("a", "http://h1:80"))
        );

        let table = sync.table().clone();
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { sync.run(&cancel).await })
        };

        store.put(&key("b"), "http://h2:80", None).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            MembershipEvent::Joined(BackendRecord::new("b", "http://h2:80"))
        );
        assert_eq!(table.len(), 2);

        store.delete(&key("a"));
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::Left("a".into()));
        assert_eq!(table.records(), vec![BackendRecord::new("b", "http://h2:80")]);

        let selector = crate::BackendSelector::new(table);
        for _ in 0..100 {
            assert_eq!(selector.pick().unwrap().instance_id(), "b");
        }

        cancel.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, SyncExit::Cancelled);
    }

    #[tokio::test]
    async fn test_stream_loss_is_distinguished_from_cancel() {
        let store = MemoryStore::new();
        let mut sync = synchronizer(&store);
        sync.bootstrap().await.unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(async move { sync.run(&cancel).await });
        tokio::task::yield_now().await;
        // Give the watch a moment to open before cutting it
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.disconnect_watchers();

        let exit = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, SyncExit::StreamClosed);
    }
}
