//! Process-global counters exposed in Prometheus text format.
//!
//! Everything is atomics so hot paths never lock and a scrape never blocks
//! request traffic.

use axum::{http::header, response::IntoResponse, routing::get, Router};
use once_cell::sync::Lazy;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram buckets: 100µs doubling 20 times (up to ~52s).
const BUCKET_COUNT: usize = 20;
const FIRST_BUCKET_MICROS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Ping,
}

impl Operation {
    const ALL: [Operation; 1] = [Operation::Ping];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
        }
    }
}

/// Outcome of one outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    /// No backend was available to take the request.
    Miss,
    Timeout,
    Error,
}

impl Outcome {
    const ALL: [Outcome; 4] = [Outcome::Ok, Outcome::Miss, Outcome::Timeout, Outcome::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Miss => "miss",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::Ok => 0,
            Self::Miss => 1,
            Self::Timeout => 2,
            Self::Error => 3,
        }
    }
}

struct LatencyHistogram {
    buckets: [AtomicU64; BUCKET_COUNT],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    fn bound_micros(index: usize) -> u64 {
        FIRST_BUCKET_MICROS << index
    }

    fn observe(&self, elapsed: Duration) {
        let micros = elapsed.as_micros().min(u64::MAX as u128) as u64;
        if let Some(index) = (0..BUCKET_COUNT).find(|&i| micros <= Self::bound_micros(i)) {
            self.buckets[index].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

/// Global metrics accessible from any task.
pub struct Metrics {
    requests: [[LatencyHistogram; 4]; 1],

    /// Current number of entries in the membership table
    pub discovery_backends: AtomicU64,
    pub discovery_put_events: AtomicU64,
    pub discovery_delete_events: AtomicU64,
    /// Snapshot re-reads after a lost change stream
    pub discovery_resyncs: AtomicU64,

    pub lease_renewals_ok: AtomicU64,
    pub lease_renewals_failed: AtomicU64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            requests: [std::array::from_fn(|_| LatencyHistogram::new())],
            discovery_backends: AtomicU64::new(0),
            discovery_put_events: AtomicU64::new(0),
            discovery_delete_events: AtomicU64::new(0),
            discovery_resyncs: AtomicU64::new(0),
            lease_renewals_ok: AtomicU64::new(0),
            lease_renewals_failed: AtomicU64::new(0),
        }
    }

    fn histogram(&self, operation: Operation, outcome: Outcome) -> &LatencyHistogram {
        let op = match operation {
            Operation::Ping => 0,
        };
        &self.requests[op][outcome.index()]
    }

    pub fn observe_request(&self, operation: Operation, outcome: Outcome, elapsed: Duration) {
        self.histogram(operation, outcome).observe(elapsed);
    }

    pub fn request_count(&self, operation: Operation, outcome: Outcome) -> u64 {
        self.histogram(operation, outcome)
            .count
            .load(Ordering::Relaxed)
    }

    pub fn set_backend_count(&self, count: usize) {
        self.discovery_backends.store(count as u64, Ordering::Relaxed);
    }

    pub fn inc_put_event(&self) {
        self.discovery_put_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_delete_event(&self) {
        self.discovery_delete_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resync(&self) {
        self.discovery_resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_renewal_ok(&self) {
        self.lease_renewals_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_renewal_failed(&self) {
        self.lease_renewals_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Format all metrics as Prometheus text
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP ping_requests_total Outbound requests by operation and result\n");
        output.push_str("# TYPE ping_requests_total counter\n");
        for operation in Operation::ALL {
            for outcome in Outcome::ALL {
                let _ = writeln!(
                    output,
                    "ping_requests_total{{operation=\"{}\",result=\"{}\"}} {}",
                    operation.as_str(),
                    outcome.as_str(),
                    self.request_count(operation, outcome)
                );
            }
        }

        output.push_str(
            "\n# HELP ping_request_duration_seconds Duration of outbound requests\n",
        );
        output.push_str("# TYPE ping_request_duration_seconds histogram\n");
        for operation in Operation::ALL {
            for outcome in Outcome::ALL {
                let hist = self.histogram(operation, outcome);
                let labels = format!(
                    "operation=\"{}\",result=\"{}\"",
                    operation.as_str(),
                    outcome.as_str()
                );
                let mut cumulative = 0;
                for (i, bucket) in hist.buckets.iter().enumerate() {
                    cumulative += bucket.load(Ordering::Relaxed);
                    let le = LatencyHistogram::bound_micros(i) as f64 / 1_000_000.0;
                    let _ = writeln!(
                        output,
                        "ping_request_duration_seconds_bucket{{{labels},le=\"{le}\"}} {cumulative}"
                    );
                }
                let count = hist.count.load(Ordering::Relaxed);
                let sum = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
                let _ = writeln!(
                    output,
                    "ping_request_duration_seconds_bucket{{{labels},le=\"+Inf\"}} {count}"
                );
                let _ = writeln!(output, "ping_request_duration_seconds_sum{{{labels}}} {sum}");
                let _ = writeln!(output, "ping_request_duration_seconds_count{{{labels}}} {count}");
            }
        }

        output.push_str("\n# HELP ping_discovery_backends Backends currently in the membership table\n");
        output.push_str("# TYPE ping_discovery_backends gauge\n");
        let _ = writeln!(
            output,
            "ping_discovery_backends {}",
            self.discovery_backends.load(Ordering::Relaxed)
        );

        output.push_str("\n# HELP ping_discovery_events_total Change stream events applied\n");
        output.push_str("# TYPE ping_discovery_events_total counter\n");
        let _ = writeln!(
            output,
            "ping_discovery_events_total{{type=\"put\"}} {}",
            self.discovery_put_events.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            output,
            "ping_discovery_events_total{{type=\"delete\"}} {}",
            self.discovery_delete_events.load(Ordering::Relaxed)
        );

        output.push_str("\n# HELP ping_discovery_resyncs_total Membership snapshots re-read after a lost change stream\n");
        output.push_str("# TYPE ping_discovery_resyncs_total counter\n");
        let _ = writeln!(
            output,
            "ping_discovery_resyncs_total {}",
            self.discovery_resyncs.load(Ordering::Relaxed)
        );

        output.push_str("\n# HELP ping_lease_renewals_total Lease keep-alive attempts by result\n");
        output.push_str("# TYPE ping_lease_renewals_total counter\n");
        let _ = writeln!(
            output,
            "ping_lease_renewals_total{{result=\"ok\"}} {}",
            self.lease_renewals_ok.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            output,
            "ping_lease_renewals_total{{result=\"error\"}} {}",
            self.lease_renewals_failed.load(Ordering::Relaxed)
        );

        output
    }
}

/// Global metrics instance
pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// GET /metrics - Prometheus-formatted metrics endpoint
///
/// Renders the in-memory counters; a scrape never touches the store.
pub async fn handler() -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        METRICS.to_prometheus(),
    )
}

/// Router serving `GET /metrics`.
pub fn router() -> Router {
    Router::new().route("/metrics", get(handler))
}
