//! # Optimizer Configuration
//!
//! ## Responsibility
//! Define, parse, and validate every tuneable of the optimization layer:
//! cache sizing and policy weights, worker pool shape, monitoring
//! thresholds, and per-request timeouts.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `OptimizerConfig`
//! - Complete defaults: an empty TOML document is a valid configuration
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building components from config (that belongs to `optimizer`)
//! - Hot-swapping thresholds at runtime (that belongs to `monitor`)

pub mod loader;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Default value functions ──────────────────────────────────────────────

fn default_cache_max_size() -> usize {
    10_000
}

fn default_base_ttl_secs() -> u64 {
    3600
}

/// Default TTL ceiling: 24 hours.
fn default_max_ttl_secs() -> u64 {
    86_400
}

/// Default compression threshold: 4 KiB.
fn default_compression_threshold() -> usize {
    4096
}

fn default_shard_count() -> usize {
    16
}

fn default_strategy_interval_secs() -> u64 {
    300
}

fn default_decay_half_life_secs() -> u64 {
    600
}

fn default_worker_count() -> usize {
    4
}

fn default_worker_capacity() -> usize {
    8
}

/// Default inactivity threshold: 30 minutes.
fn default_inactivity_threshold_secs() -> u64 {
    1800
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_monitoring_interval_ms() -> u64 {
    30_000
}

/// Default alert cooldown: 5 minutes.
fn default_alert_cooldown_secs() -> u64 {
    300
}

fn default_handler_timeout_ms() -> u64 {
    5_000
}

fn default_window_size() -> usize {
    1000
}

fn default_window_max_age_secs() -> u64 {
    300
}

fn default_critical_factor() -> f64 {
    1.5
}

fn default_generation_timeout_ms() -> u64 {
    30_000
}

fn default_slot_wait_timeout_ms() -> u64 {
    5_000
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for an optimizer instance.
///
/// Every section defaults independently, so a TOML file only needs to name
/// the values it overrides.
///
/// # Example
///
/// ```toml
/// [cache]
/// max_size = 5000
/// base_ttl_secs = 1800
///
/// [balancer]
/// worker_count = 2
/// worker_capacity = 4
///
/// [monitor.alert_thresholds]
/// min_cache_hit_rate = 0.5
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OptimizerConfig {
    /// Result cache sizing and policy.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Worker pool and session handling.
    #[serde(default)]
    pub balancer: BalancerConfig,
    /// Performance monitoring and alerting.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Per-request limits and quality scoring.
    #[serde(default)]
    pub request: RequestConfig,
}

// ── Cache ────────────────────────────────────────────────────────────────

/// Cache sizing, TTL policy, and eviction weights.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CacheConfig {
    /// Maximum number of live entries before eviction kicks in.
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
    /// TTL given to an entry of zero quality for a never-hit analysis type.
    #[serde(default = "default_base_ttl_secs")]
    pub base_ttl_secs: u64,
    /// Upper bound on any computed TTL.
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,
    /// Results larger than this many bytes are stored gzip-compressed.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    /// Number of independently locked partitions of the keyspace.
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
    /// Interval between background strategy retunes.
    #[serde(default = "default_strategy_interval_secs")]
    pub strategy_interval_secs: u64,
    /// Idle time after which an entry's recency contribution halves.
    #[serde(default = "default_decay_half_life_secs")]
    pub decay_half_life_secs: u64,
    /// Eviction score weights.
    #[serde(default)]
    pub eviction: EvictionWeights,
    /// TTL scaling weights (the starting point for self-tuning).
    #[serde(default)]
    pub ttl: TtlWeights,
    /// Bounds on how `optimize_strategy` may move the TTL weights.
    #[serde(default)]
    pub tuning: TuningConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            base_ttl_secs: default_base_ttl_secs(),
            max_ttl_secs: default_max_ttl_secs(),
            compression_threshold: default_compression_threshold(),
            shard_count: default_shard_count(),
            strategy_interval_secs: default_strategy_interval_secs(),
            decay_half_life_secs: default_decay_half_life_secs(),
            eviction: EvictionWeights::default(),
            ttl: TtlWeights::default(),
            tuning: TuningConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Base TTL as a [`Duration`].
    pub fn base_ttl(&self) -> Duration {
        Duration::from_secs(self.base_ttl_secs)
    }

    /// TTL ceiling as a [`Duration`].
    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }

    /// Strategy retune interval as a [`Duration`].
    pub fn strategy_interval(&self) -> Duration {
        Duration::from_secs(self.strategy_interval_secs)
    }

    /// Recency half-life as a [`Duration`].
    pub fn decay_half_life(&self) -> Duration {
        Duration::from_secs(self.decay_half_life_secs)
    }
}

/// Weights of the hybrid recency / frequency / quality eviction score.
///
/// `score = recency * age_decay + frequency * ln(1 + access_count) + quality * quality`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EvictionWeights {
    /// Weight of the idle-time decay term.
    pub recency: f64,
    /// Weight of the log access-count term.
    pub frequency: f64,
    /// Weight of the quality term.
    pub quality: f64,
}

impl Default for EvictionWeights {
    fn default() -> Self {
        Self {
            recency: 0.4,
            frequency: 0.35,
            quality: 0.25,
        }
    }
}

/// TTL scaling weights.
///
/// `ttl = min(max_ttl, base_ttl * (1 + quality_weight * q + frequency_weight * ln(1 + type_hits)))`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TtlWeights {
    /// How strongly result quality extends the TTL.
    pub quality_weight: f64,
    /// How strongly historical hits on the analysis type extend the TTL.
    pub frequency_weight: f64,
}

impl Default for TtlWeights {
    fn default() -> Self {
        Self {
            quality_weight: 1.0,
            frequency_weight: 0.5,
        }
    }
}

/// Bounds for the self-tuning TTL strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TuningConfig {
    /// Minimum observed lookups + stores before a retune is attempted.
    pub min_samples: u64,
    /// Fraction of the distance to the target share moved per retune, in (0, 1].
    pub learning_rate: f64,
    /// Lowest share of the weight budget the frequency term may hold.
    pub min_frequency_share: f64,
    /// Highest share of the weight budget the frequency term may hold.
    pub max_frequency_share: f64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            min_samples: 50,
            learning_rate: 0.25,
            min_frequency_share: 0.1,
            max_frequency_share: 0.9,
        }
    }
}

// ── Balancer ─────────────────────────────────────────────────────────────

/// Worker pool and session lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BalancerConfig {
    /// Number of workers generated when `workers` is empty.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Concurrent sessions each worker accepts unless overridden.
    #[serde(default = "default_worker_capacity")]
    pub worker_capacity: usize,
    /// Explicit worker definitions; replaces the generated pool when non-empty.
    #[serde(default)]
    pub workers: Vec<WorkerSpec>,
    /// Idle time after which a session binding is reclaimed.
    #[serde(default = "default_inactivity_threshold_secs")]
    pub inactivity_threshold_secs: u64,
    /// Interval between background expiry sweeps.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            worker_capacity: default_worker_capacity(),
            workers: Vec::new(),
            inactivity_threshold_secs: default_inactivity_threshold_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl BalancerConfig {
    /// Inactivity threshold as a [`Duration`].
    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.inactivity_threshold_secs)
    }

    /// Cleanup interval as a [`Duration`].
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Resolve the effective worker list.
    ///
    /// Explicit `workers` win; otherwise `worker_count` workers named
    /// `worker-0 .. worker-N` are generated. Missing capacities fall back to
    /// `worker_capacity`.
    pub fn resolved_workers(&self) -> Vec<WorkerSpec> {
        if self.workers.is_empty() {
            return (0..self.worker_count)
                .map(|i| WorkerSpec {
                    id: format!("worker-{i}"),
                    capacity: Some(self.worker_capacity),
                    tags: Vec::new(),
                })
                .collect();
        }
        self.workers
            .iter()
            .map(|w| WorkerSpec {
                id: w.id.clone(),
                capacity: Some(w.capacity.unwrap_or(self.worker_capacity)),
                tags: w.tags.clone(),
            })
            .collect()
    }
}

/// A single worker definition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Unique worker identifier.
    pub id: String,
    /// Concurrent session capacity. `None` uses `balancer.worker_capacity`.
    #[serde(default)]
    pub capacity: Option<usize>,
    /// Specialization tags (e.g. analysis types this worker is tuned for).
    #[serde(default)]
    pub tags: Vec<String>,
}

impl WorkerSpec {
    /// Build a spec with an explicit capacity and no tags.
    pub fn new(id: impl Into<String>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            capacity: Some(capacity),
            tags: Vec::new(),
        }
    }

    /// Attach specialization tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

// ── Monitor ──────────────────────────────────────────────────────────────

/// Monitoring cadence, rolling-window bounds, and alert thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MonitorConfig {
    /// Threshold set evaluated on every monitoring tick.
    #[serde(default)]
    pub alert_thresholds: AlertThresholds,
    /// Interval between monitoring ticks.
    #[serde(default = "default_monitoring_interval_ms")]
    pub monitoring_interval_ms: u64,
    /// Minimum time between two alerts for the same (metric, severity).
    #[serde(default = "default_alert_cooldown_secs")]
    pub alert_cooldown_secs: u64,
    /// Upper bound on a single alert handler delivery.
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
    /// Maximum samples kept per rolling window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Maximum sample age kept per rolling window.
    #[serde(default = "default_window_max_age_secs")]
    pub window_max_age_secs: u64,
    /// Breach magnitude (as a multiple of the threshold) that escalates to critical.
    #[serde(default = "default_critical_factor")]
    pub critical_factor: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            alert_thresholds: AlertThresholds::default(),
            monitoring_interval_ms: default_monitoring_interval_ms(),
            alert_cooldown_secs: default_alert_cooldown_secs(),
            handler_timeout_ms: default_handler_timeout_ms(),
            window_size: default_window_size(),
            window_max_age_secs: default_window_max_age_secs(),
            critical_factor: default_critical_factor(),
        }
    }
}

impl MonitorConfig {
    /// Monitoring interval as a [`Duration`].
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_interval_ms)
    }

    /// Alert cooldown as a [`Duration`].
    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown_secs)
    }

    /// Per-delivery handler timeout as a [`Duration`].
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    /// Rolling-window age bound as a [`Duration`].
    pub fn window_max_age(&self) -> Duration {
        Duration::from_secs(self.window_max_age_secs)
    }
}

/// Alert thresholds, swapped atomically at runtime via
/// `PerformanceMonitor::set_thresholds`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct AlertThresholds {
    /// p95 response time above which an alert fires, in milliseconds.
    pub max_response_time_ms: f64,
    /// Cache hit rate (0–1) below which an alert fires.
    pub min_cache_hit_rate: f64,
    /// Error rate (0–1) above which an alert fires.
    pub max_error_rate: f64,
    /// In-flight request count above which an alert fires.
    pub max_concurrent_requests: u64,
    /// CPU usage percentage above which an alert fires.
    pub max_cpu_usage: f64,
    /// Memory usage percentage above which an alert fires.
    pub max_memory_usage: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_response_time_ms: 5000.0,
            min_cache_hit_rate: 0.3,
            max_error_rate: 0.05,
            max_concurrent_requests: 100,
            max_cpu_usage: 80.0,
            max_memory_usage: 85.0,
        }
    }
}

// ── Request ──────────────────────────────────────────────────────────────

/// Per-request limits applied by the optimizer.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RequestConfig {
    /// Default timeout for one backend generation call.
    #[serde(default = "default_generation_timeout_ms")]
    pub generation_timeout_ms: u64,
    /// How long a request may wait for a worker slot before failing with a
    /// capacity error. `0` rejects immediately when the pool is full.
    #[serde(default = "default_slot_wait_timeout_ms")]
    pub slot_wait_timeout_ms: u64,
    /// Heuristic quality scoring weights.
    #[serde(default)]
    pub quality: QualityConfig,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            generation_timeout_ms: default_generation_timeout_ms(),
            slot_wait_timeout_ms: default_slot_wait_timeout_ms(),
            quality: QualityConfig::default(),
        }
    }
}

impl RequestConfig {
    /// Generation timeout as a [`Duration`].
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }

    /// Slot wait timeout as a [`Duration`].
    pub fn slot_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.slot_wait_timeout_ms)
    }
}

/// Weights for the heuristic quality estimator.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct QualityConfig {
    /// Responses shorter than this many bytes score zero coherence.
    pub min_response_len: usize,
    /// Weight of the coherence signal.
    pub coherence_weight: f64,
    /// Weight of the completeness signal.
    pub completeness_weight: f64,
    /// Weight of the length-based confidence signal.
    pub confidence_weight: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_response_len: 10,
            coherence_weight: 0.4,
            completeness_weight: 0.4,
            confidence_weight: 0.2,
        }
    }
}

/// Export the JSON Schema for [`OptimizerConfig`].
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails (should not
/// happen with well-formed derive macros).
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(OptimizerConfig);
    serde_json::to_string_pretty(&schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cache_ttl_ceiling_exceeds_base() {
        let cache = CacheConfig::default();
        assert!(cache.max_ttl() > cache.base_ttl());
    }

    #[test]
    fn test_empty_toml_yields_default_config() {
        let config: OptimizerConfig = toml::from_str("").expect("empty toml must parse");
        assert_eq!(config, OptimizerConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: OptimizerConfig = toml::from_str(
            r#"
[cache]
max_size = 42

[monitor.alert_thresholds]
min_cache_hit_rate = 0.5
"#,
        )
        .expect("partial toml must parse");
        assert_eq!(config.cache.max_size, 42);
        assert_eq!(config.cache.base_ttl_secs, 3600);
        assert!((config.monitor.alert_thresholds.min_cache_hit_rate - 0.5).abs() < f64::EPSILON);
        assert!((config.monitor.alert_thresholds.max_error_rate - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_resolved_workers_generates_named_pool() {
        let balancer = BalancerConfig {
            worker_count: 3,
            worker_capacity: 5,
            ..BalancerConfig::default()
        };
        let workers = balancer.resolved_workers();
        assert_eq!(workers.len(), 3);
        assert_eq!(workers[2].id, "worker-2");
        assert!(workers.iter().all(|w| w.capacity == Some(5)));
    }

    #[test]
    fn test_resolved_workers_explicit_list_fills_missing_capacity() {
        let balancer = BalancerConfig {
            worker_capacity: 7,
            workers: vec![
                WorkerSpec {
                    id: "gpu".into(),
                    capacity: None,
                    tags: vec!["summary".into()],
                },
                WorkerSpec::new("cpu", 2),
            ],
            ..BalancerConfig::default()
        };
        let workers = balancer.resolved_workers();
        assert_eq!(workers[0].capacity, Some(7));
        assert_eq!(workers[0].tags, vec!["summary".to_string()]);
        assert_eq!(workers[1].capacity, Some(2));
    }

    #[test]
    fn test_duration_accessors_convert_units() {
        let monitor = MonitorConfig {
            monitoring_interval_ms: 250,
            alert_cooldown_secs: 9,
            handler_timeout_ms: 40,
            ..MonitorConfig::default()
        };
        assert_eq!(monitor.monitoring_interval(), Duration::from_millis(250));
        assert_eq!(monitor.alert_cooldown(), Duration::from_secs(9));
        assert_eq!(monitor.handler_timeout(), Duration::from_millis(40));
    }

    #[test]
    fn test_export_schema_names_top_level_sections() {
        let schema = export_schema().expect("schema export must succeed");
        assert!(schema.contains("cache"));
        assert!(schema.contains("alert_thresholds"));
    }
}
