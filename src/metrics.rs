//! # MetricsRegistry
//!
//! ## Responsibility
//! Thread-safe request counters, a latency histogram, an in-flight gauge,
//! and a bounded rolling window of request samples from which windowed
//! rates and latency percentiles are derived.
//!
//! ## Guarantees
//! - Per-instance: each registry owns a private Prometheus [`Registry`], so
//!   independent instances never collide (tests may build many in parallel).
//! - Bounded: the sample window is capped both by count and by age.
//! - Deterministic percentiles: nearest-rank over the sorted window, so
//!   identical sample sets always produce identical results.
//! - Non-blocking recording: `record_*` takes one short-held lock at most.
//!
//! ## NOT Responsible For
//! - Threshold evaluation or alerting (see `monitor`)
//! - Cache or balancer statistics (see `cache`, `balancer`)
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `gen_optimizer_requests_total` | Counter | `outcome` |
//! | `gen_optimizer_cache_lookups_total` | Counter | `result` |
//! | `gen_optimizer_optimized_total` | Counter | |
//! | `gen_optimizer_rejections_total` | Counter | |
//! | `gen_optimizer_request_duration_seconds` | Histogram | |
//! | `gen_optimizer_in_flight_requests` | Gauge | |

use parking_lot::Mutex;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Latency histogram buckets in seconds, tuned for generation backends.
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Errors produced while building a registry.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Metric construction or registration failed.
    #[error("metrics registration failed: {0}")]
    Registration(#[from] prometheus::Error),
}

// ── RollingWindow ──────────────────────────────────────────────────────

/// A FIFO window of timestamped samples bounded by count and by age.
///
/// Old samples are aged out by whichever bound is hit first.
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
    samples: VecDeque<(Instant, T)>,
    max_len: usize,
    max_age: Duration,
}

impl<T> RollingWindow<T> {
    /// Create an empty window. A `max_len` of zero is treated as one.
    pub fn new(max_len: usize, max_age: Duration) -> Self {
        let max_len = max_len.max(1);
        Self {
            samples: VecDeque::with_capacity(max_len.min(4096)),
            max_len,
            max_age,
        }
    }

    /// Append a sample taken at `now`, then enforce both bounds.
    pub fn push(&mut self, now: Instant, value: T) {
        self.samples.push_back((now, value));
        while self.samples.len() > self.max_len {
            self.samples.pop_front();
        }
        self.prune(now);
    }

    /// Drop samples older than `max_age` relative to `now`.
    pub fn prune(&mut self, now: Instant) {
        while let Some((ts, _)) = self.samples.front() {
            if now.saturating_duration_since(*ts) > self.max_age {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Iterate the retained values, oldest first.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.samples.iter().map(|(_, v)| v)
    }

    /// The most recent value, if any.
    pub fn latest(&self) -> Option<&T> {
        self.samples.back().map(|(_, v)| v)
    }

    /// Time covered by the retained samples.
    pub fn span(&self) -> Duration {
        match (self.samples.front(), self.samples.back()) {
            (Some((first, _)), Some((last, _))) => last.saturating_duration_since(*first),
            _ => Duration::ZERO,
        }
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// `true` when no samples are retained.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

// ── Samples & snapshots ────────────────────────────────────────────────

/// One completed request: immutable once recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSample {
    /// Whether the request succeeded.
    pub success: bool,
    /// End-to-end latency.
    pub latency: Duration,
}

/// Windowed request counts and rates. Derived on read.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestMetrics {
    /// Requests in the window.
    pub total: u64,
    /// Successful requests in the window.
    pub successful: u64,
    /// Failed requests in the window.
    pub failed: u64,
    /// `failed / total`, or 0 when the window is empty.
    pub error_rate: f64,
    /// Requests per second across the window span (0 for a single sample).
    pub requests_per_second: f64,
}

/// Windowed latency distribution in milliseconds. Derived on read.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyMetrics {
    /// Samples in the window.
    pub count: u64,
    /// Arithmetic mean.
    pub mean_ms: f64,
    /// Median (nearest-rank).
    pub p50_ms: f64,
    /// 95th percentile (nearest-rank).
    pub p95_ms: f64,
    /// 99th percentile (nearest-rank).
    pub p99_ms: f64,
    /// Smallest sample.
    pub min_ms: f64,
    /// Largest sample.
    pub max_ms: f64,
}

impl LatencyMetrics {
    /// Summarise a set of latency samples given in milliseconds.
    pub fn from_millis(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        let sum: f64 = sorted.iter().sum();
        Self {
            count: sorted.len() as u64,
            mean_ms: sum / sorted.len() as f64,
            p50_ms: nearest_rank(&sorted, 50.0),
            p95_ms: nearest_rank(&sorted, 95.0),
            p99_ms: nearest_rank(&sorted, 99.0),
            min_ms: sorted[0],
            max_ms: sorted[sorted.len() - 1],
        }
    }
}

/// Nearest-rank percentile over an already sorted slice.
///
/// `rank = ceil(p / 100 * n)`, clamped to `[1, n]`. Returns 0.0 when empty.
pub fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[idx]
}

/// Lifetime counter totals read back from the Prometheus metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryTotals {
    /// Successful requests since construction.
    pub succeeded: u64,
    /// Failed requests since construction.
    pub failed: u64,
    /// Cache lookups that hit.
    pub cache_hits: u64,
    /// Cache lookups that missed.
    pub cache_misses: u64,
    /// Requests served on an optimized path (cache or sticky worker).
    pub optimized: u64,
    /// Requests turned away for lack of worker capacity.
    pub rejections: u64,
}

impl RegistryTotals {
    /// Total requests recorded.
    pub fn requests(&self) -> u64 {
        self.succeeded + self.failed
    }
}

// ── MetricsRegistry ────────────────────────────────────────────────────

/// Per-instance request metrics.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tokio_generation_optimizer::MetricsRegistry;
///
/// let registry = MetricsRegistry::new(1000, Duration::from_secs(300)).unwrap();
/// registry.record_request(true, Duration::from_millis(42));
/// assert_eq!(registry.request_metrics().total, 1);
/// ```
pub struct MetricsRegistry {
    registry: Registry,
    requests_total: IntCounterVec,
    cache_lookups: IntCounterVec,
    optimized_total: IntCounter,
    rejections_total: IntCounter,
    request_duration: Histogram,
    in_flight: IntGauge,
    window: Mutex<RollingWindow<MetricSample>>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("totals", &self.totals())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl MetricsRegistry {
    /// Build a registry whose sample window keeps at most `window_size`
    /// samples no older than `window_max_age`.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Registration`] if a metric descriptor is
    /// rejected by Prometheus.
    pub fn new(window_size: usize, window_max_age: Duration) -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("gen_optimizer_requests_total", "Completed requests by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let cache_lookups = IntCounterVec::new(
            Opts::new("gen_optimizer_cache_lookups_total", "Cache lookups by result"),
            &["result"],
        )?;
        registry.register(Box::new(cache_lookups.clone()))?;

        let optimized_total = IntCounter::new(
            "gen_optimizer_optimized_total",
            "Requests served from cache or a sticky worker",
        )?;
        registry.register(Box::new(optimized_total.clone()))?;

        let rejections_total = IntCounter::new(
            "gen_optimizer_rejections_total",
            "Requests rejected for lack of worker capacity",
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "gen_optimizer_request_duration_seconds",
                "End-to-end request latency",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let in_flight = IntGauge::new(
            "gen_optimizer_in_flight_requests",
            "Requests currently being optimized",
        )?;
        registry.register(Box::new(in_flight.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            cache_lookups,
            optimized_total,
            rejections_total,
            request_duration,
            in_flight,
            window: Mutex::new(RollingWindow::new(window_size, window_max_age)),
        })
    }

    /// Record one completed request.
    pub fn record_request(&self, success: bool, latency: Duration) {
        let outcome = if success { "success" } else { "failure" };
        self.requests_total.with_label_values(&[outcome]).inc();
        self.request_duration.observe(latency.as_secs_f64());
        self.window
            .lock()
            .push(Instant::now(), MetricSample { success, latency });
    }

    /// Record a cache lookup result.
    pub fn record_cache_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups.with_label_values(&[result]).inc();
    }

    /// Record a request served on an optimized path.
    pub fn record_optimized(&self) {
        self.optimized_total.inc();
    }

    /// Record a capacity rejection.
    pub fn record_rejection(&self) {
        self.rejections_total.inc();
    }

    /// Mark a request as in flight until the returned guard is dropped.
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.inc();
        InFlightGuard {
            gauge: self.in_flight.clone(),
        }
    }

    /// Requests currently in flight.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.get().max(0) as u64
    }

    /// Windowed request counts and rates.
    pub fn request_metrics(&self) -> RequestMetrics {
        let mut window = self.window.lock();
        window.prune(Instant::now());

        let total = window.len() as u64;
        let successful = window.values().filter(|s| s.success).count() as u64;
        let failed = total - successful;
        let span = window.span().as_secs_f64();
        RequestMetrics {
            total,
            successful,
            failed,
            error_rate: if total == 0 {
                0.0
            } else {
                failed as f64 / total as f64
            },
            requests_per_second: if span > 0.0 { total as f64 / span } else { 0.0 },
        }
    }

    /// Windowed latency percentiles.
    pub fn latency_metrics(&self) -> LatencyMetrics {
        let samples: Vec<f64> = {
            let mut window = self.window.lock();
            window.prune(Instant::now());
            window
                .values()
                .map(|s| s.latency.as_secs_f64() * 1000.0)
                .collect()
        };
        LatencyMetrics::from_millis(&samples)
    }

    /// Lifetime counter totals.
    pub fn totals(&self) -> RegistryTotals {
        RegistryTotals {
            succeeded: self.requests_total.with_label_values(&["success"]).get(),
            failed: self.requests_total.with_label_values(&["failure"]).get(),
            cache_hits: self.cache_lookups.with_label_values(&["hit"]).get(),
            cache_misses: self.cache_lookups.with_label_values(&["miss"]).get(),
            optimized: self.optimized_total.get(),
            rejections: self.rejections_total.get(),
        }
    }

    /// Encode every metric in the Prometheus text exposition format.
    ///
    /// Returns an empty string if encoding fails; observability degrades
    /// gracefully rather than failing the caller.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// RAII guard that decrements the in-flight gauge on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    gauge: IntGauge,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MetricsRegistry {
        MetricsRegistry::new(100, Duration::from_secs(60)).expect("registry must build")
    }

    #[test]
    fn test_nearest_rank_on_ten_samples() {
        let sorted: Vec<f64> = (1..=10).map(|i| f64::from(i) * 10.0).collect();
        assert_eq!(nearest_rank(&sorted, 50.0), 50.0);
        assert_eq!(nearest_rank(&sorted, 95.0), 100.0);
        assert_eq!(nearest_rank(&sorted, 99.0), 100.0);
        assert_eq!(nearest_rank(&sorted, 0.0), 10.0);
    }

    #[test]
    fn test_nearest_rank_empty_is_zero() {
        assert_eq!(nearest_rank(&[], 99.0), 0.0);
    }

    #[test]
    fn test_latency_metrics_is_order_independent() {
        let a = LatencyMetrics::from_millis(&[30.0, 10.0, 20.0]);
        let b = LatencyMetrics::from_millis(&[10.0, 20.0, 30.0]);
        assert_eq!(a, b);
        assert_eq!(a.min_ms, 10.0);
        assert_eq!(a.max_ms, 30.0);
        assert!((a.mean_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_rolling_window_caps_by_count() {
        let now = Instant::now();
        let mut window = RollingWindow::new(3, Duration::from_secs(60));
        for i in 0..5 {
            window.push(now, i);
        }
        assert_eq!(window.values().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_window_ages_out_old_samples() {
        let mut window = RollingWindow::new(100, Duration::from_secs(10));
        window.push(Instant::now(), "old");
        tokio::time::advance(Duration::from_secs(11)).await;
        window.push(Instant::now(), "new");
        assert_eq!(window.len(), 1);
        assert_eq!(window.latest(), Some(&"new"));
    }

    #[test]
    fn test_zero_length_window_keeps_one_sample() {
        let now = Instant::now();
        let mut window = RollingWindow::new(0, Duration::from_secs(1));
        window.push(now, 1);
        window.push(now, 2);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_request_metrics_error_rate() {
        let r = registry();
        r.record_request(true, Duration::from_millis(5));
        r.record_request(true, Duration::from_millis(5));
        r.record_request(true, Duration::from_millis(5));
        r.record_request(false, Duration::from_millis(5));
        let m = r.request_metrics();
        assert_eq!(m.total, 4);
        assert_eq!(m.failed, 1);
        assert!((m.error_rate - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_registry_reports_zeroes() {
        let r = registry();
        assert_eq!(r.request_metrics(), RequestMetrics::default());
        assert_eq!(r.latency_metrics(), LatencyMetrics::default());
        assert_eq!(r.totals().requests(), 0);
    }

    #[test]
    fn test_in_flight_guard_decrements_on_drop() {
        let r = registry();
        let g1 = r.in_flight_guard();
        let g2 = r.in_flight_guard();
        assert_eq!(r.in_flight(), 2);
        drop(g1);
        assert_eq!(r.in_flight(), 1);
        drop(g2);
        assert_eq!(r.in_flight(), 0);
    }

    #[test]
    fn test_totals_track_counters() {
        let r = registry();
        r.record_cache_lookup(true);
        r.record_cache_lookup(false);
        r.record_cache_lookup(false);
        r.record_optimized();
        r.record_rejection();
        let t = r.totals();
        assert_eq!(t.cache_hits, 1);
        assert_eq!(t.cache_misses, 2);
        assert_eq!(t.optimized, 1);
        assert_eq!(t.rejections, 1);
    }

    #[test]
    fn test_independent_registries_do_not_share_counters() {
        let a = registry();
        let b = registry();
        a.record_request(true, Duration::from_millis(1));
        assert_eq!(a.totals().succeeded, 1);
        assert_eq!(b.totals().succeeded, 0);
    }

    #[test]
    fn test_render_contains_request_counter() {
        let r = registry();
        r.record_request(true, Duration::from_millis(3));
        let text = r.render();
        assert!(text.contains("gen_optimizer_requests_total"));
        assert!(text.contains("gen_optimizer_request_duration_seconds"));
    }
}
