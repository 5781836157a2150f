//! # RequestOptimizer
//!
//! ## Responsibility
//! Drive each request through
//! `CACHE_LOOKUP -> {hit: return} | {miss: AWAIT_SLOT -> GENERATE -> STORE -> RELEASE_SLOT -> return}`
//! and own the lifecycle of the background tasks behind it.
//!
//! ## Guarantees
//! - At most one backend attempt per call; retries belong to the caller.
//! - Failed, timed-out, cancelled, truncated, or filtered generations are
//!   never cached.
//! - A held slot is released on every exit path, including timeout and
//!   cancellation.
//! - Every call records exactly one request sample.
//! - Failures are typed ([`OptimizeError`]) and classified
//!   ([`FailureKind`]) so callers can tell capacity from transient faults.
//!
//! ## NOT Responsible For
//! - Retrying failed generations
//! - Interpreting generated text

use crate::backend::{BackendError, FinishReason, GenerationBackend, GenerationOptions};
use crate::balancer::{
    BalancerError, LoadBalancingMetrics, Rejection, SessionLoadBalancer, WorkerId,
};
use crate::cache::{CacheStatistics, CacheStore, WarmReport, WarmSeed};
use crate::config::validation::{self, ConfigError};
use crate::config::OptimizerConfig;
use crate::metrics::MetricsRegistry;
use crate::monitor::{
    CacheSample, MetricsProbe, MonitoringHandle, PerformanceMonitor, ProbeSample,
    SystemPerformanceReport,
};
use crate::quality::QualityEstimator;
use crate::{OptimizerError, SessionId};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

// ── Requests & results ─────────────────────────────────────────────────

/// One generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Correlation id for logs. Defaults to a UUID v4.
    pub request_id: String,
    /// Session used for sticky worker assignment.
    pub session: SessionId,
    /// Analysis type; part of the cache key.
    pub analysis_type: String,
    /// Prompt content; part of the cache key.
    pub content: String,
    /// Options passed to the backend.
    pub options: GenerationOptions,
    /// Worker to try first.
    pub preferred_worker: Option<WorkerId>,
    /// Specialization tags; a worker must carry at least one.
    pub required_tags: Vec<String>,
    /// Backend timeout override.
    pub timeout: Option<Duration>,
    /// Skip the cache lookup and regenerate. The fresh result is still stored.
    pub bypass_cache: bool,
}

impl GenerationRequest {
    /// A request with default options.
    pub fn new(
        session: impl Into<SessionId>,
        analysis_type: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            session: session.into(),
            analysis_type: analysis_type.into(),
            content: content.into(),
            options: GenerationOptions::default(),
            preferred_worker: None,
            required_tags: Vec::new(),
            timeout: None,
            bypass_cache: false,
        }
    }

    /// Set the backend options.
    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    /// Prefer a specific worker.
    pub fn with_preferred_worker(mut self, worker: impl Into<WorkerId>) -> Self {
        self.preferred_worker = Some(worker.into());
        self
    }

    /// Require workers carrying any of `tags`.
    pub fn with_required_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Override the backend timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Skip the cache lookup.
    pub fn bypass_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }
}

/// A successful optimization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationResult {
    /// Correlation id of the request.
    pub request_id: String,
    /// Generated (or cached) text.
    pub content: String,
    /// Tokens the generation consumed.
    pub tokens_used: u32,
    /// End-to-end time spent in the optimizer.
    pub response_time: Duration,
    /// `true` when served from cache.
    pub cache_hit: bool,
    /// `true` when served from cache or by the session's sticky worker.
    pub optimized: bool,
    /// Worker that generated the result; `None` on a cache hit.
    pub worker: Option<WorkerId>,
    /// Quality score in `[0, 1]`.
    pub quality: f64,
}

// ── Errors ─────────────────────────────────────────────────────────────

/// Coarse failure classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    /// No worker slot; back off or queue.
    Capacity,
    /// Worth retrying as-is.
    Transient,
    /// Retrying the same request will not help.
    Fatal,
}

/// Per-request failures.
#[derive(Debug, Error)]
pub enum OptimizeError {
    /// No worker slot became available.
    #[error("no worker capacity: {reason} (waited {waited:?})")]
    Capacity {
        /// Why the last assignment attempt was refused.
        reason: Rejection,
        /// Time spent waiting for a slot.
        waited: Duration,
    },

    /// The backend exceeded the generation timeout.
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    /// The backend returned an error.
    #[error("generation failed: {0}")]
    Backend(#[from] BackendError),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The request itself is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Any other balancer failure.
    #[error(transparent)]
    Balancer(BalancerError),
}

impl OptimizeError {
    /// Classify the failure.
    ///
    /// A missing tagged worker is a capacity rejection in form but
    /// configuration in substance, so it is fatal.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Capacity {
                reason: Rejection::NoCapacity,
                ..
            } => FailureKind::Capacity,
            Self::Capacity { .. } => FailureKind::Fatal,
            Self::Timeout(_) => FailureKind::Transient,
            Self::Backend(e) if e.is_transient() => FailureKind::Transient,
            Self::Backend(_) | Self::Cancelled | Self::InvalidRequest(_) | Self::Balancer(_) => {
                FailureKind::Fatal
            }
        }
    }
}

impl From<BalancerError> for OptimizeError {
    fn from(err: BalancerError) -> Self {
        match err {
            BalancerError::Capacity { reason, waited, .. } => Self::Capacity { reason, waited },
            other => Self::Balancer(other),
        }
    }
}

// ── Roll-up metrics ────────────────────────────────────────────────────

/// Read-only roll-up composed from the registry, cache, and balancer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceOptimizationMetrics {
    /// Requests handled since construction.
    pub total_requests: u64,
    /// Cache hit rate since construction.
    pub cache_hit_rate: f64,
    /// Share of requests served on an optimized path.
    pub optimization_rate: f64,
    /// Sessions currently bound to a worker.
    pub active_sessions: usize,
    /// Mean response time over the rolling window.
    pub average_response_time: Duration,
    /// Share of requests that failed since construction.
    pub error_rate: f64,
}

// ── Cache probe ────────────────────────────────────────────────────────

/// Feeds per-tick cache deltas into the monitor.
struct CacheProbe {
    cache: Arc<CacheStore>,
    last: Mutex<(u64, u64)>,
}

impl MetricsProbe for CacheProbe {
    fn sample(&self) -> Vec<ProbeSample> {
        let stats = self.cache.stats();
        let mut last = self.last.lock();
        let hits = stats.hits.saturating_sub(last.0);
        let misses = stats.misses.saturating_sub(last.1);
        *last = (stats.hits, stats.misses);
        vec![ProbeSample::Cache(CacheSample {
            hits,
            misses,
            size: stats.size,
            evictions: stats.evictions,
            average_age: stats.average_entry_age,
        })]
    }
}

// ── Optimizer ──────────────────────────────────────────────────────────

struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    monitoring: MonitoringHandle,
    tuner: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

/// Cache-first, capacity-aware front door to a generation backend.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tokio_generation_optimizer::{
///     EchoBackend, GenerationRequest, OptimizerConfig, RequestOptimizer,
/// };
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let optimizer = RequestOptimizer::new(OptimizerConfig::default(), Arc::new(EchoBackend::new()))?;
/// optimizer.start();
///
/// let result = optimizer
///     .optimize(GenerationRequest::new("session-1", "summary", "Summarise this text."))
///     .await?;
/// println!("{} (cache hit: {})", result.content, result.cache_hit);
///
/// optimizer.shutdown().await?;
/// # Ok(()) }
/// ```
pub struct RequestOptimizer {
    config: OptimizerConfig,
    cache: Arc<CacheStore>,
    balancer: Arc<SessionLoadBalancer>,
    registry: Arc<MetricsRegistry>,
    monitor: Arc<PerformanceMonitor>,
    backend: Arc<dyn GenerationBackend>,
    quality: QualityEstimator,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl std::fmt::Debug for RequestOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptimizer")
            .field("cache", &self.cache.len())
            .field("workers", &self.balancer.worker_count())
            .field("running", &self.is_running())
            .finish()
    }
}

impl RequestOptimizer {
    /// Build every component from `config`.
    ///
    /// # Errors
    ///
    /// - [`OptimizerError::Config`] if the configuration is invalid; nothing
    ///   is built.
    /// - [`OptimizerError::Metrics`] or [`OptimizerError::Balancer`] if a
    ///   component cannot be constructed.
    pub fn new(
        config: OptimizerConfig,
        backend: Arc<dyn GenerationBackend>,
    ) -> Result<Self, OptimizerError> {
        validation::validate(&config).map_err(ConfigError::from_violations)?;

        let registry = Arc::new(MetricsRegistry::new(
            config.monitor.window_size,
            config.monitor.window_max_age(),
        )?);
        let cache = Arc::new(CacheStore::new(&config.cache));
        let balancer = Arc::new(SessionLoadBalancer::new(&config.balancer)?);
        let monitor = Arc::new(PerformanceMonitor::new(
            &config.monitor,
            Arc::clone(&registry),
        )?);
        monitor.register_probe(Arc::new(CacheProbe {
            cache: Arc::clone(&cache),
            last: Mutex::new((0, 0)),
        }));

        info!(
            cache_capacity = config.cache.max_size,
            workers = balancer.worker_count(),
            "request optimizer built"
        );
        Ok(Self {
            quality: QualityEstimator::new(config.request.quality.clone()),
            config,
            cache,
            balancer,
            registry,
            monitor,
            backend,
            tasks: Mutex::new(None),
        })
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Start the monitoring loop, the cache strategy tuner, and the session
    /// sweeper. Calling `start` on a running optimizer does nothing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            debug!("optimizer already running");
            return;
        }
        let (shutdown, rx) = watch::channel(false);
        let monitoring = self
            .monitor
            .start_monitoring(self.config.monitor.monitoring_interval());
        let tuner = self
            .cache
            .spawn_strategy_tuner(self.config.cache.strategy_interval(), rx.clone());
        let cleanup = self.balancer.spawn_cleanup(
            self.config.balancer.cleanup_interval(),
            self.config.balancer.inactivity_threshold(),
            rx,
        );
        *tasks = Some(BackgroundTasks {
            shutdown,
            monitoring,
            tuner,
            cleanup,
        });
        info!("request optimizer started");
    }

    /// `true` between [`start`](Self::start) and [`shutdown`](Self::shutdown).
    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Stop and join every background task. A stopped optimizer may be
    /// started again.
    ///
    /// # Errors
    ///
    /// [`OptimizerError::Monitor`] or [`OptimizerError::Other`] if a task
    /// panicked.
    pub async fn shutdown(&self) -> Result<(), OptimizerError> {
        let Some(tasks) = self.tasks.lock().take() else {
            return Ok(());
        };
        tasks.shutdown.send_replace(true);
        tasks.monitoring.stop().await?;
        tasks
            .tuner
            .await
            .map_err(|e| OptimizerError::Other(format!("cache tuner task failed: {e}")))?;
        tasks
            .cleanup
            .await
            .map_err(|e| OptimizerError::Other(format!("session cleanup task failed: {e}")))?;
        info!("request optimizer stopped");
        Ok(())
    }

    /// Pre-populate the cache on a background task.
    pub fn warm(&self, seeds: Vec<WarmSeed>) -> JoinHandle<WarmReport> {
        self.cache.warm(seeds)
    }

    // ── Request path ───────────────────────────────────────────────────

    /// Optimize one request.
    ///
    /// # Errors
    ///
    /// See [`OptimizeError`]; [`OptimizeError::kind`] classifies it.
    pub async fn optimize(
        &self,
        request: GenerationRequest,
    ) -> Result<OptimizationResult, OptimizeError> {
        self.optimize_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Optimize one request, aborting with [`OptimizeError::Cancelled`] when
    /// `cancel` fires. A held slot is released before returning.
    ///
    /// # Errors
    ///
    /// See [`OptimizeError`].
    pub async fn optimize_with_cancel(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<OptimizationResult, OptimizeError> {
        let span = info_span!(
            "optimize",
            request_id = %request.request_id,
            session = %request.session,
            analysis_type = %request.analysis_type,
        );
        async move {
            let started = Instant::now();
            let _in_flight = self.registry.in_flight_guard();

            let outcome = self.run(&request, &cancel, started).await;
            let elapsed = started.elapsed();
            match &outcome {
                Ok(result) => {
                    self.registry.record_request(true, elapsed);
                    debug!(
                        cache_hit = result.cache_hit,
                        optimized = result.optimized,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "request optimized"
                    );
                }
                Err(e) => {
                    self.registry.record_request(false, elapsed);
                    if e.kind() == FailureKind::Capacity {
                        self.registry.record_rejection();
                    }
                    warn!(error = %e, kind = ?e.kind(), "request failed");
                }
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<OptimizationResult, OptimizeError> {
        if request.analysis_type.trim().is_empty() {
            return Err(OptimizeError::InvalidRequest(
                "analysis_type must not be empty".into(),
            ));
        }
        if request.content.trim().is_empty() {
            return Err(OptimizeError::InvalidRequest("content must not be empty".into()));
        }
        if cancel.is_cancelled() {
            return Err(OptimizeError::Cancelled);
        }

        // CACHE_LOOKUP
        if !request.bypass_cache {
            let hit = self.cache.lookup(&request.analysis_type, &request.content);
            self.registry.record_cache_lookup(hit.is_some());
            if let Some(hit) = hit {
                self.registry.record_optimized();
                self.balancer.touch(&request.session);
                return Ok(OptimizationResult {
                    request_id: request.request_id.clone(),
                    content: hit.content,
                    tokens_used: hit.tokens_used,
                    response_time: started.elapsed(),
                    cache_hit: true,
                    optimized: true,
                    worker: None,
                    quality: hit.quality,
                });
            }
        }

        // AWAIT_SLOT
        let acquire = self.balancer.acquire(
            &request.session,
            request.preferred_worker.as_ref(),
            &request.required_tags,
            self.config.request.slot_wait_timeout(),
        );
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OptimizeError::Cancelled),
            acquired = acquire => acquired?,
        };

        // GENERATE
        let timeout = request
            .timeout
            .unwrap_or_else(|| self.config.request.generation_timeout());
        let generate = tokio::time::timeout(
            timeout,
            self.backend.generate(&request.content, &request.options),
        );
        let generated = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                guard.release();
                return Err(OptimizeError::Cancelled);
            }
            generated = generate => generated,
        };
        let generation = match generated {
            Ok(Ok(generation)) => generation,
            Ok(Err(e)) => {
                guard.release();
                return Err(OptimizeError::Backend(e));
            }
            Err(_) => {
                guard.release();
                return Err(OptimizeError::Timeout(timeout));
            }
        };

        // STORE
        let estimate = self.quality.estimate(&request.content, &generation);
        let cacheable =
            generation.finish_reason == FinishReason::Stop && !generation.text.trim().is_empty();
        if cacheable {
            if let Err(e) = self.cache.store(
                &request.analysis_type,
                &request.content,
                &generation.text,
                generation.tokens_used,
                estimate.overall,
            ) {
                warn!(error = %e, "generated result not cached");
            }
        } else {
            debug!(finish_reason = ?generation.finish_reason, "generation not cacheable");
        }

        // RELEASE_SLOT
        let worker = guard.worker().clone();
        let sticky = guard.is_sticky();
        guard.release();
        if sticky {
            self.registry.record_optimized();
        }

        Ok(OptimizationResult {
            request_id: request.request_id.clone(),
            content: generation.text,
            tokens_used: generation.tokens_used,
            response_time: started.elapsed(),
            cache_hit: false,
            optimized: sticky,
            worker: Some(worker),
            quality: estimate.overall,
        })
    }

    // ── Observability ──────────────────────────────────────────────────

    /// Roll-up of the component statistics.
    pub fn metrics(&self) -> PerformanceOptimizationMetrics {
        let totals = self.registry.totals();
        let total = totals.requests();
        let ratio = |n: u64| {
            if total == 0 {
                0.0
            } else {
                (n as f64 / total as f64).min(1.0)
            }
        };
        let mean_ms = self.registry.latency_metrics().mean_ms;
        PerformanceOptimizationMetrics {
            total_requests: total,
            cache_hit_rate: self.cache.stats().hit_rate,
            optimization_rate: ratio(totals.optimized),
            active_sessions: self.balancer.active_session_count(),
            average_response_time: Duration::try_from_secs_f64(mean_ms / 1000.0)
                .unwrap_or_default(),
            error_rate: ratio(totals.failed),
        }
    }

    /// Monitor report.
    pub fn report(&self) -> SystemPerformanceReport {
        self.monitor.report()
    }

    /// Cache statistics.
    pub fn cache_statistics(&self) -> CacheStatistics {
        self.cache.stats()
    }

    /// Balancer statistics.
    pub fn load_balancing_metrics(&self) -> LoadBalancingMetrics {
        self.balancer.metrics()
    }

    /// Prometheus text exposition of the request metrics.
    pub fn render_metrics(&self) -> String {
        self.registry.render()
    }

    /// The result cache.
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// The session balancer.
    pub fn balancer(&self) -> &Arc<SessionLoadBalancer> {
        &self.balancer
    }

    /// The request metrics registry.
    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    /// The performance monitor.
    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// The configuration this optimizer was built with.
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }
}
