//! # PerformanceMonitor
//!
//! ## Responsibility
//! Collect request, cache, and system samples into bounded rolling windows,
//! aggregate them into a [`SystemPerformanceReport`], evaluate alert
//! thresholds on a single periodic task, and fan alerts out to handlers.
//!
//! ## Guarantees
//! - Non-blocking recording: every `record_*` call is a short lock and push.
//! - Deterministic percentiles (nearest-rank, see `metrics`).
//! - Cooldown: a sustained breach fires once per cooldown window per
//!   (metric, severity), however many ticks observe it.
//! - Isolation: handlers run on their own tasks with no monitor lock held;
//!   one failing or panicking handler does not stop the others.
//! - Bounded delivery: each handler call is cut off after the configured
//!   handler timeout, and stopping the loop never waits on a handler.
//! - Atomic threshold swaps take effect at the next evaluation.
//!
//! ## NOT Responsible For
//! - Measuring CPU or memory (callers push [`SystemSample`]s)
//! - Exposing an HTTP endpoint

use super::alert::{Alert, AlertHandler, AlertMetric, AlertSeverity, AlertState};
use super::MonitorError;
use crate::config::validation::{validate_thresholds, ConfigError};
use crate::config::{AlertThresholds, MonitorConfig};
use crate::metrics::{LatencyMetrics, MetricsRegistry, RequestMetrics, RollingWindow};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

// ── Samples ────────────────────────────────────────────────────────────

/// One cache statistics sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheSample {
    /// Hits observed.
    pub hits: u64,
    /// Misses observed.
    pub misses: u64,
    /// Entries held.
    pub size: usize,
    /// Evictions so far.
    pub evictions: u64,
    /// Mean entry age.
    pub average_age: Duration,
}

impl CacheSample {
    /// `hits / (hits + misses)`, or `None` without lookups.
    pub fn hit_rate(&self) -> Option<f64> {
        let lookups = self.hits + self.misses;
        (lookups > 0).then(|| self.hits as f64 / lookups as f64)
    }
}

/// One host sample. Usage values are percentages in `[0, 100]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SystemSample {
    /// CPU usage percentage.
    pub cpu_usage: f64,
    /// Memory usage percentage.
    pub memory_usage: f64,
    /// Workers online.
    pub worker_count: usize,
    /// Heap size in bytes.
    pub heap_size: u64,
    /// Most recent collector pause.
    pub gc_pause: Duration,
}

/// A sample produced by a [`MetricsProbe`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeSample {
    /// Cache statistics.
    Cache(CacheSample),
    /// Host statistics.
    System(SystemSample),
}

/// A component sampled at the start of every monitoring tick.
pub trait MetricsProbe: Send + Sync {
    /// Produce zero or more samples.
    fn sample(&self) -> Vec<ProbeSample>;
}

// ── Report ─────────────────────────────────────────────────────────────

/// Point-in-time aggregation across every rolling window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemPerformanceReport {
    /// Wall-clock time of the report, in Unix milliseconds.
    pub generated_at_ms: u64,
    /// Time since the monitor was built.
    pub uptime: Duration,
    /// Windowed request counts.
    pub requests: RequestMetrics,
    /// Windowed latency distribution.
    pub latency: LatencyMetrics,
    /// Requests in flight right now.
    pub in_flight: u64,
    /// Latest cache sample.
    pub cache: Option<CacheSample>,
    /// Mean hit rate over cache samples that saw lookups.
    pub average_cache_hit_rate: f64,
    /// Latest system sample.
    pub system: Option<SystemSample>,
    /// Mean CPU usage over the system window.
    pub average_cpu_usage: f64,
    /// Mean memory usage over the system window.
    pub average_memory_usage: f64,
    /// Longest collector pause in the system window.
    pub peak_gc_pause: Duration,
    /// Thresholds in force.
    pub thresholds: AlertThresholds,
    /// Alerts fired since construction.
    pub alerts_fired: u64,
}

// ── Monitor ────────────────────────────────────────────────────────────

type HandlerList = Vec<(String, Arc<dyn AlertHandler>)>;

struct Breach {
    metric: AlertMetric,
    observed: f64,
    threshold: f64,
    upper_bound: bool,
}

/// Rolling-window performance monitor with cooldown-limited alerting.
pub struct PerformanceMonitor {
    registry: Arc<MetricsRegistry>,
    cache_window: Mutex<RollingWindow<CacheSample>>,
    system_window: Mutex<RollingWindow<SystemSample>>,
    thresholds: watch::Sender<AlertThresholds>,
    cooldown: Duration,
    handler_timeout: Duration,
    critical_factor: f64,
    handlers: RwLock<HandlerList>,
    alert_states: Mutex<HashMap<(AlertMetric, AlertSeverity), AlertState>>,
    probes: RwLock<Vec<Arc<dyn MetricsProbe>>>,
    started_at: Instant,
    alerts_fired: AtomicU64,
}

impl std::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("thresholds", &*self.thresholds.borrow())
            .field("cooldown", &self.cooldown)
            .field("handlers", &self.handlers.read().len())
            .field("alerts_fired", &self.alerts_fired.load(Ordering::Relaxed))
            .finish()
    }
}

impl PerformanceMonitor {
    /// Build a monitor over `registry`.
    ///
    /// # Errors
    ///
    /// [`MonitorError::InvalidThresholds`] if the configured thresholds are
    /// out of range.
    pub fn new(config: &MonitorConfig, registry: Arc<MetricsRegistry>) -> Result<Self, MonitorError> {
        validate_thresholds(&config.alert_thresholds).map_err(ConfigError::from_violations)?;
        let (thresholds, _) = watch::channel(config.alert_thresholds.clone());
        Ok(Self {
            registry,
            cache_window: Mutex::new(RollingWindow::new(
                config.window_size,
                config.window_max_age(),
            )),
            system_window: Mutex::new(RollingWindow::new(
                config.window_size,
                config.window_max_age(),
            )),
            thresholds,
            cooldown: config.alert_cooldown(),
            handler_timeout: config.handler_timeout(),
            critical_factor: config.critical_factor.max(1.0),
            handlers: RwLock::new(Vec::new()),
            alert_states: Mutex::new(HashMap::new()),
            probes: RwLock::new(Vec::new()),
            started_at: Instant::now(),
            alerts_fired: AtomicU64::new(0),
        })
    }

    /// The registry this monitor reads request metrics from.
    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    // ── Recording ──────────────────────────────────────────────────────

    /// Record one completed request.
    pub fn record_request(&self, success: bool, latency: Duration) {
        self.registry.record_request(success, latency);
    }

    /// Record a cache statistics sample.
    pub fn record_cache_metrics(&self, sample: CacheSample) {
        self.cache_window.lock().push(Instant::now(), sample);
    }

    /// Record a host sample.
    pub fn record_system_metrics(&self, sample: SystemSample) {
        self.system_window.lock().push(Instant::now(), sample);
    }

    // ── Configuration ──────────────────────────────────────────────────

    /// Register (or replace) a named alert handler.
    pub fn register_alert_handler(&self, name: impl Into<String>, handler: Arc<dyn AlertHandler>) {
        let name = name.into();
        let mut handlers = self.handlers.write();
        handlers.retain(|(existing, _)| existing != &name);
        handlers.push((name.clone(), handler));
        debug!(handler = %name, "alert handler registered");
    }

    /// Remove a handler. Returns `true` if it was registered.
    pub fn unregister_alert_handler(&self, name: &str) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| existing != name);
        handlers.len() != before
    }

    /// Add a probe sampled at the start of every evaluation.
    pub fn register_probe(&self, probe: Arc<dyn MetricsProbe>) {
        self.probes.write().push(probe);
    }

    /// Swap the threshold set. Applies from the next evaluation.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Validation`] if any threshold is out of range; the
    /// previous set stays in force.
    pub fn set_thresholds(&self, thresholds: AlertThresholds) -> Result<(), ConfigError> {
        validate_thresholds(&thresholds).map_err(ConfigError::from_violations)?;
        self.thresholds.send_replace(thresholds);
        info!("alert thresholds updated");
        Ok(())
    }

    /// Thresholds in force.
    pub fn thresholds(&self) -> AlertThresholds {
        self.thresholds.borrow().clone()
    }

    /// Cooldown state of every (metric, severity) pair that has fired.
    pub fn alert_states(&self) -> Vec<(AlertMetric, AlertSeverity, AlertState)> {
        let mut states: Vec<_> = self
            .alert_states
            .lock()
            .iter()
            .map(|((m, s), state)| (*m, *s, *state))
            .collect();
        states.sort_by_key(|(m, s, _)| (*m, *s));
        states
    }

    // ── Reporting ──────────────────────────────────────────────────────

    /// Aggregate every window into a report.
    pub fn report(&self) -> SystemPerformanceReport {
        let now = Instant::now();
        let (cache, average_cache_hit_rate) = {
            let mut window = self.cache_window.lock();
            window.prune(now);
            let rates: Vec<f64> = window.values().filter_map(CacheSample::hit_rate).collect();
            (window.latest().copied(), mean(&rates))
        };
        let (system, average_cpu_usage, average_memory_usage, peak_gc_pause) = {
            let mut window = self.system_window.lock();
            window.prune(now);
            let cpu: Vec<f64> = window.values().map(|s| s.cpu_usage).collect();
            let mem: Vec<f64> = window.values().map(|s| s.memory_usage).collect();
            let peak = window.values().map(|s| s.gc_pause).max().unwrap_or_default();
            (window.latest().copied(), mean(&cpu), mean(&mem), peak)
        };

        SystemPerformanceReport {
            generated_at_ms: crate::unix_millis(),
            uptime: now.saturating_duration_since(self.started_at),
            requests: self.registry.request_metrics(),
            latency: self.registry.latency_metrics(),
            in_flight: self.registry.in_flight(),
            cache,
            average_cache_hit_rate,
            system,
            average_cpu_usage,
            average_memory_usage,
            peak_gc_pause,
            thresholds: self.thresholds(),
            alerts_fired: self.alerts_fired.load(Ordering::Relaxed),
        }
    }

    // ── Evaluation ─────────────────────────────────────────────────────

    fn run_probes(&self) {
        let probes: Vec<_> = self.probes.read().iter().cloned().collect();
        for probe in probes {
            for sample in probe.sample() {
                match sample {
                    ProbeSample::Cache(s) => self.record_cache_metrics(s),
                    ProbeSample::System(s) => self.record_system_metrics(s),
                }
            }
        }
    }

    fn breaches(&self, t: &AlertThresholds) -> Vec<Breach> {
        let mut out = Vec::new();
        let now = Instant::now();

        let latency = self.registry.latency_metrics();
        if latency.count > 0 && latency.p95_ms > t.max_response_time_ms {
            out.push(Breach {
                metric: AlertMetric::ResponseTime,
                observed: latency.p95_ms,
                threshold: t.max_response_time_ms,
                upper_bound: true,
            });
        }

        let hit_rate = {
            let mut window = self.cache_window.lock();
            window.prune(now);
            window.values().filter_map(CacheSample::hit_rate).last()
        };
        if let Some(rate) = hit_rate {
            if rate < t.min_cache_hit_rate {
                out.push(Breach {
                    metric: AlertMetric::CacheHitRate,
                    observed: rate,
                    threshold: t.min_cache_hit_rate,
                    upper_bound: false,
                });
            }
        }

        let requests = self.registry.request_metrics();
        if requests.total > 0 && requests.error_rate > t.max_error_rate {
            out.push(Breach {
                metric: AlertMetric::ErrorRate,
                observed: requests.error_rate,
                threshold: t.max_error_rate,
                upper_bound: true,
            });
        }

        let in_flight = self.registry.in_flight();
        if in_flight > t.max_concurrent_requests {
            out.push(Breach {
                metric: AlertMetric::ConcurrentRequests,
                observed: in_flight as f64,
                threshold: t.max_concurrent_requests as f64,
                upper_bound: true,
            });
        }

        let system = {
            let mut window = self.system_window.lock();
            window.prune(now);
            window.latest().copied()
        };
        if let Some(s) = system {
            if s.cpu_usage > t.max_cpu_usage {
                out.push(Breach {
                    metric: AlertMetric::CpuUsage,
                    observed: s.cpu_usage,
                    threshold: t.max_cpu_usage,
                    upper_bound: true,
                });
            }
            if s.memory_usage > t.max_memory_usage {
                out.push(Breach {
                    metric: AlertMetric::MemoryUsage,
                    observed: s.memory_usage,
                    threshold: t.max_memory_usage,
                    upper_bound: true,
                });
            }
        }
        out
    }

    fn severity(&self, breach: &Breach) -> AlertSeverity {
        let critical = if breach.upper_bound {
            breach.observed >= breach.threshold * self.critical_factor
        } else {
            breach.observed <= breach.threshold / self.critical_factor
        };
        if critical {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        }
    }

    /// Run one monitoring tick: sample probes, check thresholds, fire alerts
    /// whose cooldown has passed, and deliver them to every handler.
    ///
    /// Returns the alerts fired by this tick.
    pub async fn evaluate(&self) -> Vec<Alert> {
        self.run_probes();
        let thresholds = self.thresholds();
        let breaches = self.breaches(&thresholds);
        if breaches.is_empty() {
            return Vec::new();
        }

        let now = Instant::now();
        let fired: Vec<Alert> = {
            let mut states = self.alert_states.lock();
            breaches
                .into_iter()
                .filter_map(|breach| {
                    let severity = self.severity(&breach);
                    let state = states.entry((breach.metric, severity)).or_default();
                    if !state.can_fire(now) {
                        debug!(metric = %breach.metric, %severity, "alert suppressed by cooldown");
                        return None;
                    }
                    state.fire(now, self.cooldown);
                    let direction = if breach.upper_bound { "above" } else { "below" };
                    Some(Alert {
                        metric: breach.metric,
                        severity,
                        observed: breach.observed,
                        threshold: breach.threshold,
                        message: format!(
                            "{} {:.3} {direction} threshold {:.3}",
                            breach.metric, breach.observed, breach.threshold
                        ),
                        fired_at_ms: crate::unix_millis(),
                    })
                })
                .collect()
        };
        if fired.is_empty() {
            return fired;
        }
        self.alerts_fired
            .fetch_add(fired.len() as u64, Ordering::Relaxed);

        let handlers: HandlerList = self.handlers.read().clone();
        let limit = self.handler_timeout;
        let deliveries = fired.iter().flat_map(|alert| {
            handlers.iter().map(move |(name, handler)| {
                let name = name.clone();
                let handler = Arc::clone(handler);
                let alert = alert.clone();
                let task = tokio::spawn(async move {
                    tokio::time::timeout(limit, handler.handle(&alert)).await
                });
                async move { (name, task.await) }
            })
        });
        for (name, outcome) in join_all(deliveries).await {
            match outcome {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(handler = %name, error = %e, "alert handler failed"),
                Ok(Err(_)) => warn!(
                    handler = %name,
                    timeout_ms = limit.as_millis() as u64,
                    "alert handler timed out"
                ),
                Err(e) => error!(handler = %name, error = %e, "alert handler panicked"),
            }
        }
        fired
    }

    /// Start the single periodic monitoring task.
    ///
    /// The task evaluates once per `interval` until the returned handle is
    /// stopped. A stop request interrupts an evaluation still waiting on
    /// handlers; deliveries already spawned finish on their own.
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration) -> MonitoringHandle {
        let (shutdown_tx, mut shutdown) = watch::channel(false);
        let monitor = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "performance monitoring started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tokio::select! {
                            fired = monitor.evaluate() => {
                                if !fired.is_empty() {
                                    debug!(alerts = fired.len(), "monitoring tick fired alerts");
                                }
                            }
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    info!("performance monitoring stopped during evaluation");
                                    break;
                                }
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("performance monitoring stopped");
                            break;
                        }
                    }
                }
            }
        });
        MonitoringHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Owns the monitoring task started by
/// [`PerformanceMonitor::start_monitoring`].
#[derive(Debug)]
pub struct MonitoringHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitoringHandle {
    /// Signal the task to stop and wait for it to finish.
    ///
    /// # Errors
    ///
    /// [`MonitorError::Join`] if the task panicked.
    pub async fn stop(self) -> Result<(), MonitorError> {
        self.shutdown.send_replace(true);
        self.task
            .await
            .map_err(|e| MonitorError::Join(e.to_string()))
    }

    /// `true` once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
