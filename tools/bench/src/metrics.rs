use hdrhistogram::Histogram;
use ping_discovery::metrics::Outcome;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics collector for bench results
pub struct Metrics {
    /// Latency histogram (microseconds), requests that reached a backend
    latency: parking_lot::Mutex<Histogram<u64>>,

    /// Request counters
    requests_total: AtomicU64,
    requests_ok: AtomicU64,
    requests_miss: AtomicU64,
    requests_timeout: AtomicU64,
    requests_error: AtomicU64,

    /// Requests per backend instance id
    per_backend: parking_lot::Mutex<HashMap<String, u64>>,

    /// Timing
    start_time: Instant,
    end_time: parking_lot::Mutex<Option<Instant>>,

    /// Timeline snapshots
    timeline: parking_lot::Mutex<Vec<TimelinePoint>>,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            latency: parking_lot::Mutex::new(Histogram::new_with_bounds(1, 600_000_000, 3)?), // 1μs to 10min
            requests_total: AtomicU64::new(0),
            requests_ok: AtomicU64::new(0),
            requests_miss: AtomicU64::new(0),
            requests_timeout: AtomicU64::new(0),
            requests_error: AtomicU64::new(0),
            per_backend: parking_lot::Mutex::new(HashMap::new()),
            start_time: Instant::now(),
            end_time: parking_lot::Mutex::new(None),
            timeline: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn record_request(&self, backend: Option<&str>, outcome: Outcome, duration: Duration) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let counter = match outcome {
            Outcome::Ok => &self.requests_ok,
            Outcome::Miss => &self.requests_miss,
            Outcome::Timeout => &self.requests_timeout,
            Outcome::Error => &self.requests_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if let Some(id) = backend {
            let micros = duration.as_micros().min(u64::MAX as u128) as u64;
            let _ = self.latency.lock().record(micros.max(1));
            *self.per_backend.lock().entry(id.to_string()).or_default() += 1;
        }
    }

    fn failures(&self) -> u64 {
        self.requests_miss.load(Ordering::Relaxed)
            + self.requests_timeout.load(Ordering::Relaxed)
            + self.requests_error.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TimelinePoint {
        let hist = self.latency.lock();
        TimelinePoint {
            elapsed_secs: self.start_time.elapsed().as_secs_f64(),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_ok: self.requests_ok.load(Ordering::Relaxed),
            requests_failed: self.failures(),
            latency_p50_ms: hist.value_at_quantile(0.50) as f64 / 1000.0,
            latency_p99_ms: hist.value_at_quantile(0.99) as f64 / 1000.0,
        }
    }

    pub fn add_timeline_point(&self) {
        let point = self.snapshot();
        self.timeline.lock().push(point);
    }

    pub fn finish(&self) {
        *self.end_time.lock() = Some(Instant::now());
    }

    pub fn summary(&self) -> MetricsSummary {
        let duration = self.end_time.lock().unwrap_or(Instant::now()) - self.start_time;
        let total = self.requests_total.load(Ordering::Relaxed);
        let failed = self.failures();
        let hist = self.latency.lock();

        MetricsSummary {
            duration_secs: duration.as_secs_f64(),
            requests_per_second: if duration.as_secs_f64() > 0.0 {
                total as f64 / duration.as_secs_f64()
            } else {
                0.0
            },
            total_requests: total,
            successful_requests: self.requests_ok.load(Ordering::Relaxed),
            misses: self.requests_miss.load(Ordering::Relaxed),
            timeouts: self.requests_timeout.load(Ordering::Relaxed),
            errors: self.requests_error.load(Ordering::Relaxed),
            latency_min_ms: hist.min() as f64 / 1000.0,
            latency_p50_ms: hist.value_at_quantile(0.50) as f64 / 1000.0,
            latency_p95_ms: hist.value_at_quantile(0.95) as f64 / 1000.0,
            latency_p99_ms: hist.value_at_quantile(0.99) as f64 / 1000.0,
            latency_max_ms: hist.max() as f64 / 1000.0,
            error_rate: if total > 0 {
                failed as f64 / total as f64
            } else {
                0.0
            },
            per_backend: self
                .per_backend
                .lock()
                .iter()
                .map(|(id, count)| (id.clone(), *count))
                .collect(),
        }
    }

    pub fn to_results(&self, metadata: BenchMetadata) -> BenchResults {
        BenchResults {
            metadata,
            summary: self.summary(),
            timeline: self.timeline.lock().clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchMetadata {
    pub key_prefix: String,
    pub endpoints: Vec<String>,
    pub concurrency: usize,
    pub duration_secs: u64,
    pub request_timeout_ms: u64,
    /// Backends known when the run started
    pub backends_at_start: usize,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub duration_secs: f64,
    pub requests_per_second: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub misses: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub latency_min_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_max_ms: f64,
    pub error_rate: f64,
    pub per_backend: BTreeMap<String, u64>,
}

impl MetricsSummary {
    /// Busiest backend's share divided by the quietest's; 1.0 is perfectly even.
    pub fn spread(&self) -> f64 {
        let max = self.per_backend.values().copied().max().unwrap_or(0);
        let min = self.per_backend.values().copied().min().unwrap_or(0);
        if min == 0 {
            return 0.0;
        }
        max as f64 / min as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelinePoint {
    pub elapsed_secs: f64,
    pub requests_total: u64,
    pub requests_ok: u64,
    pub requests_failed: u64,
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchResults {
    pub metadata: BenchMetadata,
    pub summary: MetricsSummary,
    pub timeline: Vec<TimelinePoint>,
}

impl BenchResults {
    pub fn format_text(&self) -> String {
        let s = &self.summary;
        let mut backends = String::new();
        for (id, count) in &s.per_backend {
            let share = if s.total_requests > 0 {
                *count as f64 / s.total_requests as f64 * 100.0
            } else {
                0.0
            };
            backends.push_str(&format!("\n  {}  {} ({:.1}%)", id, count, share));
        }

        format!(
            r#"Ping Bench Results
==================
Prefix:        {}
Endpoints:     {}
Concurrency:   {}
Duration:      {:.1}s
Backends:      {} at start

Summary:
  Requests:      {}
  Throughput:    {:.1} req/s
  Success Rate:  {:.1}%

Latency (ms):
  Min:   {:.1}
  p50:   {:.1}
  p95:   {:.1}
  p99:   {:.1}
  Max:   {:.1}

Failures:
  Miss:    {}
  Timeout: {}
  Error:   {}

Backends (spread {:.2}):{}"#,
            self.metadata.key_prefix,
            self.metadata.endpoints.join(","),
            self.metadata.concurrency,
            s.duration_secs,
            self.metadata.backends_at_start,
            s.total_requests,
            s.requests_per_second,
            (1.0 - s.error_rate) * 100.0,
            s.latency_min_ms,
            s.latency_p50_ms,
            s.latency_p95_ms,
            s.latency_p99_ms,
            s.latency_max_ms,
            s.misses,
            s.timeouts,
            s.errors,
            s.spread(),
            backends,
        )
    }

    pub fn format_csv(&self) -> String {
        let s = &self.summary;
        format!(
            "prefix,concurrency,duration_secs,backends,total_requests,rps,success_rate,p50_ms,p95_ms,p99_ms,misses,timeouts,errors\n{},{},{:.1},{},{},{:.1},{:.1},{:.1},{:.1},{:.1},{},{},{}",
            self.metadata.key_prefix,
            self.metadata.concurrency,
            s.duration_secs,
            self.metadata.backends_at_start,
            s.total_requests,
            s.requests_per_second,
            (1.0 - s.error_rate) * 100.0,
            s.latency_p50_ms,
            s.latency_p95_ms,
            s.latency_p99_ms,
            s.misses,
            s.timeouts,
            s.errors,
        )
    }

    pub fn compare(&self, other: &BenchResults) -> String {
        let s1 = &self.summary;
        let s2 = &other.summary;

        let change = |current: f64, baseline: f64| {
            if baseline == 0.0 {
                0.0
            } else {
                (current - baseline) / baseline * 100.0
            }
        };

        format!(
            r#"Comparison
==========
                    Current     Baseline    Change
Throughput (rps):   {:.1}       {:.1}       {:+.1}%
Latency p50 (ms):   {:.1}       {:.1}       {:+.1}%
Latency p99 (ms):   {:.1}       {:.1}       {:+.1}%"#,
            s1.requests_per_second,
            s2.requests_per_second,
            change(s1.requests_per_second, s2.requests_per_second),
            s1.latency_p50_ms,
            s2.latency_p50_ms,
            change(s1.latency_p50_ms, s2.latency_p50_ms),
            s1.latency_p99_ms,
            s2.latency_p99_ms,
            change(s1.latency_p99_ms, s2.latency_p99_ms),
        )
    }
}
