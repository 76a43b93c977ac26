//! Multi-instance simulation tests for ping-discovery.
//!
//! These run registrars and discovery clients against the in-process store,
//! covering scale up/down, crashes and rolling restarts without an etcd
//! cluster.

use ping_discovery::store::{CoordinationStore, MemoryStore};
use ping_discovery::{
    liveness, BackendRegistrar, DiscoveryClient, MembershipEvent, RegistrarConfig, SyncConfig,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const PREFIX: &str = "sim";

fn registrar_config(address: &str) -> RegistrarConfig {
    RegistrarConfig::new(PREFIX, address)
}

async fn wait_for_count(client: &DiscoveryClient, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.backend_count() != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {} backends, have {}",
            expected,
            client.backend_count()
        );
        sleep(Duration::from_millis(10)).await;
    }
}

/// Serve the liveness router on an ephemeral port and return its base URL.
async fn spawn_liveness_server(cancel: CancellationToken) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, liveness::router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_scale_up_from_1_to_5_backends() {
    let store = Arc::new(MemoryStore::new());
    let client = DiscoveryClient::start(store.clone(), &SyncConfig::new(PREFIX))
        .await
        .unwrap();

    let mut registrars = Vec::new();
    for i in 0..5 {
        let registrar =
            BackendRegistrar::start(store.clone(), &registrar_config(&format!("http://h{i}:80")))
                .await
                .unwrap();
        registrars.push(registrar);
        wait_for_count(&client, i + 1).await;
    }

    // Every backend gets a fair share of picks
    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..5000 {
        let backend = client.pick().unwrap();
        *counts.entry(backend.instance_id().to_string()).or_default() += 1;
    }
    assert_eq!(counts.len(), 5);
    for (id, count) in &counts {
        assert!(
            (700..=1300).contains(count),
            "Backend {} picked {} times (expected ~1000)",
            id,
            count
        );
    }

    for registrar in registrars {
        registrar.shutdown(Duration::from_secs(1)).await.unwrap();
    }
    wait_for_count(&client, 0).await;
    assert!(client.pick().is_none());

    client.shutdown().await;
}

#[tokio::test]
async fn test_scale_down_gracefully() {
    let store = Arc::new(MemoryStore::new());
    let client = DiscoveryClient::start(store.clone(), &SyncConfig::new(PREFIX))
        .await
        .unwrap();
    let mut events = client.subscribe();

    let r1 = BackendRegistrar::start(store.clone(), &registrar_config("http://h1:80"))
        .await
        .unwrap();
    let r2 = BackendRegistrar::start(store.clone(), &registrar_config("http://h2:80"))
        .await
        .unwrap();
    let r3 = BackendRegistrar::start(store.clone(), &registrar_config("http://h3:80"))
        .await
        .unwrap();
    wait_for_count(&client, 3).await;

    let gone = r2.instance_id().to_string();
    r2.shutdown(Duration::from_secs(1)).await.unwrap();

    // The revoke shows up as a DELETE right away, not after the TTL
    let left = tokio::time::timeout(Duration::from_millis(500), async {
        loop {
            if let MembershipEvent::Left(id) = events.recv().await.unwrap() {
                return id;
            }
        }
    })
    .await
    .expect("graceful shutdown should be observed immediately");
    assert_eq!(left, gone);

    for _ in 0..500 {
        assert_ne!(client.pick().unwrap().instance_id(), gone);
    }

    r1.shutdown(Duration::from_secs(1)).await.unwrap();
    r3.shutdown(Duration::from_secs(1)).await.unwrap();
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_crashed_backend_expires_within_ttl() {
    let store = MemoryStore::new();
    let reaper_cancel = CancellationToken::new();
    let reaper = store.spawn_reaper(Duration::from_millis(100), reaper_cancel.clone());
    let store = Arc::new(store);

    let client = DiscoveryClient::start(store.clone(), &SyncConfig::new(PREFIX))
        .await
        .unwrap();
    let mut events = client.subscribe();

    let survivor = BackendRegistrar::start(store.clone(), &registrar_config("http://h1:80"))
        .await
        .unwrap();
    let victim = BackendRegistrar::start(store.clone(), &registrar_config("http://h2:80"))
        .await
        .unwrap();
    let victim_id = victim.instance_id().to_string();
    wait_for_count(&client, 2).await;

    // Both stay registered across many renewal intervals
    sleep(Duration::from_secs(15)).await;
    assert_eq!(client.backend_count(), 2);

    let crashed_at = tokio::time::Instant::now();
    drop(victim);

    let left = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let MembershipEvent::Left(id) = events.recv().await.unwrap() {
                return id;
            }
        }
    })
    .await
    .expect("crashed backend should expire");
    assert_eq!(left, victim_id);

    // Lease TTL 5s, renewal every 2s
    let elapsed = crashed_at.elapsed();
    assert!(
        elapsed <= Duration::from_secs(7),
        "expiry took {:?}, expected at most TTL + renew interval",
        elapsed
    );
    assert_eq!(client.backend_count(), 1);
    assert_eq!(client.pick().unwrap().instance_id(), survivor.instance_id());

    survivor.shutdown(Duration::from_secs(1)).await.unwrap();
    client.shutdown().await;
    reaper_cancel.cancel();
    reaper.await.unwrap();
}

#[tokio::test]
async fn test_rolling_restart_never_empties_pool() {
    let store = Arc::new(MemoryStore::new());
    let client = DiscoveryClient::start(store.clone(), &SyncConfig::new(PREFIX))
        .await
        .unwrap();

    let mut registrars = Vec::new();
    for i in 0..3 {
        registrars.push(
            BackendRegistrar::start(store.clone(), &registrar_config(&format!("http://old{i}:80")))
                .await
                .unwrap(),
        );
    }
    wait_for_count(&client, 3).await;

    // Replace each backend: start the new one before stopping the old
    for i in 0..3 {
        let replacement =
            BackendRegistrar::start(store.clone(), &registrar_config(&format!("http://new{i}:80")))
                .await
                .unwrap();
        wait_for_count(&client, 4).await;

        let old = registrars.remove(0);
        old.shutdown(Duration::from_secs(1)).await.unwrap();
        registrars.push(replacement);

        for _ in 0..50 {
            assert!(client.pick().is_some(), "pool emptied during restart {}", i);
            sleep(Duration::from_millis(1)).await;
        }
        wait_for_count(&client, 3).await;
    }

    let addresses: Vec<String> = client
        .table()
        .records()
        .into_iter()
        .map(|r| r.address)
        .collect();
    assert!(addresses.iter().all(|a| a.starts_with("http://new")));

    for registrar in registrars {
        registrar.shutdown(Duration::from_secs(1)).await.unwrap();
    }
    client.shutdown().await;
}

#[tokio::test]
async fn test_clients_recover_from_stream_loss() {
    let store = Arc::new(MemoryStore::new());
    let client = DiscoveryClient::start(store.clone(), &SyncConfig::new(PREFIX))
        .await
        .unwrap();

    let r1 = BackendRegistrar::start(store.clone(), &registrar_config("http://h1:80"))
        .await
        .unwrap();
    wait_for_count(&client, 1).await;

    store.disconnect_watchers();
    let r2 = BackendRegistrar::start(store.clone(), &registrar_config("http://h2:80"))
        .await
        .unwrap();

    // Missed while disconnected, picked up by the resync
    wait_for_count(&client, 2).await;
    assert!(client.is_syncing());

    // And the new stream keeps delivering
    r1.shutdown(Duration::from_secs(1)).await.unwrap();
    wait_for_count(&client, 1).await;

    r2.shutdown(Duration::from_secs(1)).await.unwrap();
    client.shutdown().await;
}

#[tokio::test]
async fn test_end_to_end_ping_over_http() {
    let store = Arc::new(MemoryStore::new());
    let servers = CancellationToken::new();

    let mut registrars = Vec::new();
    for _ in 0..3 {
        let address = spawn_liveness_server(servers.child_token()).await;
        registrars.push(
            BackendRegistrar::start(store.clone(), &registrar_config(&address))
                .await
                .unwrap(),
        );
    }

    let client = DiscoveryClient::start(store.clone(), &SyncConfig::new(PREFIX))
        .await
        .unwrap();
    assert_eq!(client.backend_count(), 3);

    for _ in 0..30 {
        let backend = client.pick().unwrap();
        backend
            .ping()
            .await
            .unwrap_or_else(|e| panic!("ping to {} failed: {}", backend.address(), e));
    }

    // Stop one backend gracefully; it must disappear before its server does
    let stopped = registrars.pop().unwrap();
    let stopped_id = stopped.instance_id().to_string();
    stopped.shutdown(Duration::from_secs(1)).await.unwrap();
    wait_for_count(&client, 2).await;

    for _ in 0..30 {
        let backend = client.pick().unwrap();
        assert_ne!(backend.instance_id(), stopped_id);
        backend.ping().await.unwrap();
    }

    for registrar in registrars {
        registrar.shutdown(Duration::from_secs(1)).await.unwrap();
    }
    servers.cancel();
    client.shutdown().await;

    // Nothing left behind in the store
    let remaining = store
        .get_prefix(ping_discovery::KeyLayout::new(PREFIX).registration_prefix())
        .await
        .unwrap();
    assert!(remaining.entries.is_empty());
}
