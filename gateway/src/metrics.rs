//! In-process metrics rendered in the Prometheus text format.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use parking_lot::Mutex;

use crate::config::MetricType;

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];
const BATCH_BUCKETS: &[f64] = &[1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0];

#[derive(Debug, Clone)]
struct Histogram {
    bounds: &'static [f64],
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            counts: vec![0; bounds.len()],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        if let Some(i) = self.bounds.iter().position(|b| value <= *b) {
            self.counts[i] += 1;
        }
        self.sum += value;
        self.count += 1;
    }

    fn render(&self, out: &mut String, name: &str, labels: &str) {
        let mut cumulative = 0;
        for (bound, count) in self.bounds.iter().zip(&self.counts) {
            cumulative += count;
            let _ = writeln!(out, "{}_bucket{{{},le=\"{}\"}} {}", name, labels, bound, cumulative);
        }
        let _ = writeln!(out, "{}_bucket{{{},le=\"+Inf\"}} {}", name, labels, self.count);
        let _ = writeln!(out, "{}_sum{{{}}} {}", name, labels, self.sum);
        let _ = writeln!(out, "{}_count{{{}}} {}", name, labels, self.count);
    }
}

/// Counters, gauges and histograms shared by the dispatcher, the stages and
/// the backend pools.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Families to render. Empty means all of them.
    enabled: Vec<MetricType>,
    requests: Mutex<BTreeMap<(String, &'static str), u64>>,
    latency: Mutex<BTreeMap<String, Histogram>>,
    queues: Mutex<BTreeMap<String, Arc<AtomicUsize>>>,
    batches: Mutex<BTreeMap<String, Histogram>>,
    stages: Mutex<BTreeMap<String, Histogram>>,
}

impl Metrics {
    pub fn new(enabled: &[MetricType]) -> Self {
        Self {
            enabled: enabled.to_vec(),
            ..Default::default()
        }
    }

    pub fn is_enabled(&self, metric: MetricType) -> bool {
        self.enabled.is_empty() || self.enabled.contains(&metric)
    }

    pub fn record_request(&self, route: &str, status: u16, elapsed: Duration) {
        let class = match status {
            100..=199 => "1xx",
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            _ => "5xx",
        };
        *self.requests.lock().entry((route.to_string(), class)).or_insert(0) += 1;
        self.latency
            .lock()
            .entry(route.to_string())
            .or_insert_with(|| Histogram::new(LATENCY_BUCKETS))
            .observe(elapsed.as_secs_f64());
    }

    /// The depth gauge of the named backend queue, created on first use.
    pub fn queue_gauge(&self, pool: &str) -> Arc<AtomicUsize> {
        self.queues
            .lock()
            .entry(pool.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }

    pub fn queue_depth(&self, pool: &str) -> Option<usize> {
        self.queues.lock().get(pool).map(|g| g.load(Ordering::SeqCst))
    }

    pub fn record_batch(&self, pool: &str, size: usize) {
        self.batches
            .lock()
            .entry(pool.to_string())
            .or_insert_with(|| Histogram::new(BATCH_BUCKETS))
            .observe(size as f64);
    }

    pub fn record_stage(&self, stage: &str, elapsed: Duration) {
        self.stages
            .lock()
            .entry(stage.to_string())
            .or_insert_with(|| Histogram::new(LATENCY_BUCKETS))
            .observe(elapsed.as_secs_f64());
    }

    /// Render every enabled family as Prometheus text exposition 0.0.4.
    pub fn render(&self) -> String {
        let mut out = format!(
            "# HELP modelgate_up Whether the service is up\n\
             # TYPE modelgate_up gauge\n\
             modelgate_up 1\n\
             # HELP modelgate_info Service information\n\
             # TYPE modelgate_info gauge\n\
             modelgate_info{{version=\"{}\"}} 1\n",
            env!("CARGO_PKG_VERSION")
        );

        if self.is_enabled(MetricType::Requests) {
            out.push_str("# HELP modelgate_requests_total Requests served per route and status class\n");
            out.push_str("# TYPE modelgate_requests_total counter\n");
            for ((route, class), count) in self.requests.lock().iter() {
                let _ = writeln!(
                    out,
                    "modelgate_requests_total{{route=\"{}\",status=\"{}\"}} {}",
                    route, class, count
                );
            }
        }

        if self.is_enabled(MetricType::Latency) {
            out.push_str("# HELP modelgate_request_duration_seconds Request latency per route\n");
            out.push_str("# TYPE modelgate_request_duration_seconds histogram\n");
            for (route, histogram) in self.latency.lock().iter() {
                histogram.render(
                    &mut out,
                    "modelgate_request_duration_seconds",
                    &format!("route=\"{}\"", route),
                );
            }
        }

        if self.is_enabled(MetricType::Queue) {
            out.push_str("# HELP modelgate_queue_depth Jobs waiting for a backend worker\n");
            out.push_str("# TYPE modelgate_queue_depth gauge\n");
            for (pool, gauge) in self.queues.lock().iter() {
                let _ = writeln!(
                    out,
                    "modelgate_queue_depth{{pool=\"{}\"}} {}",
                    pool,
                    gauge.load(Ordering::SeqCst)
                );
            }
        }

        if self.is_enabled(MetricType::Batch) {
            out.push_str("# HELP modelgate_batch_size Jobs per backend invocation\n");
            out.push_str("# TYPE modelgate_batch_size histogram\n");
            for (pool, histogram) in self.batches.lock().iter() {
                histogram.render(&mut out, "modelgate_batch_size", &format!("pool=\"{}\"", pool));
            }
        }

        if self.is_enabled(MetricType::Stages) {
            out.push_str("# HELP modelgate_stage_duration_seconds Wall time per pipeline stage\n");
            out.push_str("# TYPE modelgate_stage_duration_seconds histogram\n");
            for (stage, histogram) in self.stages.lock().iter() {
                histogram.render(
                    &mut out,
                    "modelgate_stage_duration_seconds",
                    &format!("stage=\"{}\"", stage),
                );
            }
        }

        out
    }
}

/// Route-level middleware counting requests and observing their latency.
pub async fn track_requests(
    State(metrics): State<Arc<Metrics>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let response = next.run(request).await;

    metrics.record_request(&route, response.status().as_u16(), start.elapsed());
    response
}
