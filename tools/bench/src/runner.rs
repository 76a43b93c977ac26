use crate::metrics::{BenchMetadata, Metrics};
use crate::RunArgs;
use anyhow::{Context, Result};
use ping_discovery::metrics::{Operation, Outcome, METRICS};
use ping_discovery::store::EtcdStore;
use ping_discovery::{BackendSelector, DiscoveryClient, StoreConfig, SyncConfig};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Pause after a pick finds no backend, so an empty pool does not spin.
const MISS_PAUSE: Duration = Duration::from_millis(10);

pub async fn run_bench(args: RunArgs) -> Result<()> {
    let concurrency = args.concurrency.unwrap_or_else(|| num_cpus::get() * 2).max(1);

    let store = Arc::new(
        EtcdStore::connect(&StoreConfig::new(args.discovery_addresses.clone()))
            .await
            .context("failed to connect to etcd")?,
    );

    let mut config = SyncConfig::new(&args.discovery_key_prefix);
    config.request_timeout = Duration::from_millis(args.request_timeout_ms);
    config.max_idle_per_backend = concurrency;
    let client = DiscoveryClient::start(store, &config)
        .await
        .context("failed to discover backends")?;
    let backends_at_start = client.backend_count();

    tracing::info!(
        "Starting bench against {} backends under {}",
        backends_at_start,
        args.discovery_key_prefix
    );
    tracing::info!(
        "Concurrency: {}, Duration: {}s, Requests: {}",
        concurrency,
        args.duration,
        args.requests
    );
    if backends_at_start == 0 {
        tracing::warn!("No backends registered yet; requests will count as misses until one joins");
    }

    let shutdown = CancellationToken::new();
    let metrics_handle = match args.metrics_listen_address {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind metrics server on {}", addr))?;
            tracing::info!("Serving metrics on {}", addr);
            let shutdown = shutdown.child_token();
            Some(tokio::spawn(async move {
                let _ = axum::serve(listener, ping_discovery::metrics::router())
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await;
            }))
        }
        None => None,
    };

    let metrics = Arc::new(Metrics::new()?);
    let running = Arc::new(AtomicBool::new(true));
    let request_counter = Arc::new(AtomicUsize::new(0));

    let duration = Duration::from_secs(args.duration);
    let ramp_up = Duration::from_secs(args.ramp_up);
    let start = Instant::now();

    // Spawn progress reporter
    let progress_metrics = metrics.clone();
    let progress_running = running.clone();
    let report_interval = args.report_interval.max(1);
    let progress_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(report_interval));
        interval.tick().await;
        while progress_running.load(Ordering::Relaxed) {
            interval.tick().await;
            progress_metrics.add_timeline_point();
            let snapshot = progress_metrics.snapshot();
            let rps = if snapshot.elapsed_secs > 0.0 {
                snapshot.requests_total as f64 / snapshot.elapsed_secs
            } else {
                0.0
            };
            tracing::info!(
                "Progress: {} req, {:.1} req/s, p50={:.1}ms, p99={:.1}ms, failed={}",
                snapshot.requests_total,
                rps,
                snapshot.latency_p50_ms,
                snapshot.latency_p99_ms,
                snapshot.requests_failed
            );
        }
    });

    // Spawn worker tasks
    let mut handles = Vec::new();
    for worker_id in 0..concurrency {
        let selector = client.selector();
        let metrics = metrics.clone();
        let running = running.clone();
        let counter = request_counter.clone();
        let max_requests = args.requests;

        // Calculate ramp-up delay for this worker
        let worker_delay = if concurrency > 1 {
            ramp_up.as_millis() as u64 * worker_id as u64 / (concurrency - 1) as u64
        } else {
            0
        };

        let handle = tokio::spawn(async move {
            // Ramp-up delay
            if worker_delay > 0 {
                tokio::time::sleep(Duration::from_millis(worker_delay)).await;
            }

            loop {
                // Check termination conditions
                if !duration.is_zero() && start.elapsed() > duration {
                    break;
                }
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                let request_num = counter.fetch_add(1, Ordering::Relaxed);
                if max_requests > 0 && request_num >= max_requests {
                    break;
                }

                ping_once(&selector, &metrics, request_num).await;
            }
        });

        handles.push(handle);
    }

    // Wait for all workers
    for handle in handles {
        let _ = handle.await;
    }

    // Stop progress reporter
    running.store(false, Ordering::Relaxed);
    progress_handle.abort();
    let _ = progress_handle.await;

    client.shutdown().await;
    shutdown.cancel();
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    // Finalize metrics
    metrics.finish();
    metrics.add_timeline_point();

    let metadata = BenchMetadata {
        key_prefix: args.discovery_key_prefix.clone(),
        endpoints: args.discovery_addresses.clone(),
        concurrency,
        duration_secs: args.duration,
        request_timeout_ms: args.request_timeout_ms,
        backends_at_start,
        timestamp: chrono::Utc::now(),
    };

    let results = metrics.to_results(metadata);

    // Print summary
    println!("\n{}", results.format_text());

    // Save to file
    let json = serde_json::to_string_pretty(&results)?;
    std::fs::write(&args.output, &json)?;
    tracing::info!("Results saved to {:?}", args.output);

    Ok(())
}

/// One request, no retries: a failure is recorded and the worker moves on.
async fn ping_once(selector: &BackendSelector, metrics: &Metrics, request_num: usize) {
    let Some(backend) = selector.pick() else {
        metrics.record_request(None, Outcome::Miss, Duration::ZERO);
        METRICS.observe_request(Operation::Ping, Outcome::Miss, Duration::ZERO);
        tokio::time::sleep(MISS_PAUSE).await;
        return;
    };

    let started = Instant::now();
    let result = backend.ping().await;
    let elapsed = started.elapsed();

    let outcome = match &result {
        Ok(()) => Outcome::Ok,
        Err(e) if e.is_timeout() => Outcome::Timeout,
        Err(_) => Outcome::Error,
    };

    // Log first few errors for debugging
    if let Err(e) = &result {
        if request_num < 3 {
            tracing::warn!("Request {} failed: {}", request_num, e);
        }
    }

    metrics.record_request(Some(backend.instance_id()), outcome, elapsed);
    METRICS.observe_request(Operation::Ping, outcome, elapsed);
}
