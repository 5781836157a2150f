//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`OptimizerConfig`] that cannot
//! be expressed through the type system alone (range checks, cross-field
//! invariants, uniqueness).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use std::collections::HashSet;

use super::{AlertThresholds, OptimizerConfig};

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "cache.max_size").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Fold a list of violations into a single [`ConfigError::Validation`].
    pub fn from_violations(errors: Vec<ConfigError>) -> Self {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Longest accepted alert cooldown: 7 days.
pub const MAX_ALERT_COOLDOWN_SECS: u64 = 7 * 24 * 60 * 60;

/// Longest accepted millisecond timeout or interval: 1 day.
pub const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

fn is_unit_interval(v: f64) -> bool {
    (0.0..=1.0).contains(&v)
}

fn is_non_negative(v: f64) -> bool {
    v.is_finite() && v >= 0.0
}

/// Validate all semantic constraints on an [`OptimizerConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
pub fn validate(config: &OptimizerConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Cache sizing ─────────────────────────────────────────────────
    let cache = &config.cache;
    if cache.max_size == 0 {
        errors.push(invalid("cache.max_size", 0, "must be at least 1"));
    }
    if cache.base_ttl_secs == 0 {
        errors.push(invalid("cache.base_ttl_secs", 0, "must be at least 1 second"));
    }
    if cache.max_ttl_secs < cache.base_ttl_secs {
        errors.push(invalid(
            "cache.max_ttl_secs",
            cache.max_ttl_secs,
            "must be \u{2265} base_ttl_secs",
        ));
    }
    if cache.shard_count == 0 {
        errors.push(invalid("cache.shard_count", 0, "must be at least 1"));
    }
    if cache.strategy_interval_secs == 0 {
        errors.push(invalid(
            "cache.strategy_interval_secs",
            0,
            "must be at least 1 second",
        ));
    }
    if cache.decay_half_life_secs == 0 {
        errors.push(invalid(
            "cache.decay_half_life_secs",
            0,
            "must be at least 1 second",
        ));
    }

    // ── Cache weights ────────────────────────────────────────────────
    let ev = &cache.eviction;
    for (field, v) in [
        ("cache.eviction.recency", ev.recency),
        ("cache.eviction.frequency", ev.frequency),
        ("cache.eviction.quality", ev.quality),
        ("cache.ttl.quality_weight", cache.ttl.quality_weight),
        ("cache.ttl.frequency_weight", cache.ttl.frequency_weight),
    ] {
        if !is_non_negative(v) {
            errors.push(invalid(field, v, "must be a finite value \u{2265} 0"));
        }
    }
    if ev.recency + ev.frequency + ev.quality <= 0.0 {
        errors.push(invalid(
            "cache.eviction",
            ev.recency + ev.frequency + ev.quality,
            "weights must sum to > 0",
        ));
    }

    // ── Tuning bounds ────────────────────────────────────────────────
    let tuning = &cache.tuning;
    if !(tuning.learning_rate > 0.0 && tuning.learning_rate <= 1.0) {
        errors.push(invalid(
            "cache.tuning.learning_rate",
            tuning.learning_rate,
            "must be in (0.0, 1.0]",
        ));
    }
    if !is_unit_interval(tuning.min_frequency_share)
        || !is_unit_interval(tuning.max_frequency_share)
        || tuning.min_frequency_share > tuning.max_frequency_share
    {
        errors.push(invalid(
            "cache.tuning.min_frequency_share",
            format!(
                "{}..{}",
                tuning.min_frequency_share, tuning.max_frequency_share
            ),
            "shares must lie in [0.0, 1.0] with min \u{2264} max",
        ));
    }

    // ── Balancer ─────────────────────────────────────────────────────
    let balancer = &config.balancer;
    let workers = balancer.resolved_workers();
    if workers.is_empty() {
        errors.push(invalid(
            "balancer.worker_count",
            0,
            "at least one worker is required",
        ));
    }
    let mut seen = HashSet::new();
    for (i, worker) in workers.iter().enumerate() {
        if worker.id.trim().is_empty() {
            errors.push(invalid(
                &format!("balancer.workers[{i}].id"),
                "",
                "worker id must not be empty",
            ));
        } else if !seen.insert(worker.id.as_str()) {
            errors.push(invalid(
                &format!("balancer.workers[{i}].id"),
                &worker.id,
                "worker ids must be unique",
            ));
        }
        if worker.capacity == Some(0) {
            errors.push(invalid(
                &format!("balancer.workers[{i}].capacity"),
                0,
                "capacity must be at least 1",
            ));
        }
    }
    if balancer.inactivity_threshold_secs == 0 {
        errors.push(invalid(
            "balancer.inactivity_threshold_secs",
            0,
            "must be at least 1 second",
        ));
    }
    if balancer.cleanup_interval_secs == 0 {
        errors.push(invalid(
            "balancer.cleanup_interval_secs",
            0,
            "must be at least 1 second",
        ));
    }

    // ── Monitor ──────────────────────────────────────────────────────
    let monitor = &config.monitor;
    if let Err(mut threshold_errors) = validate_thresholds(&monitor.alert_thresholds) {
        errors.append(&mut threshold_errors);
    }
    if monitor.monitoring_interval_ms == 0 {
        errors.push(invalid(
            "monitor.monitoring_interval_ms",
            0,
            "must be at least 1ms",
        ));
    }
    if monitor.monitoring_interval_ms > MAX_TIMEOUT_MS {
        errors.push(invalid(
            "monitor.monitoring_interval_ms",
            monitor.monitoring_interval_ms,
            "must be at most 1 day",
        ));
    }
    if monitor.alert_cooldown_secs > MAX_ALERT_COOLDOWN_SECS {
        errors.push(invalid(
            "monitor.alert_cooldown_secs",
            monitor.alert_cooldown_secs,
            "must be at most 7 days",
        ));
    }
    if monitor.handler_timeout_ms == 0 || monitor.handler_timeout_ms > MAX_TIMEOUT_MS {
        errors.push(invalid(
            "monitor.handler_timeout_ms",
            monitor.handler_timeout_ms,
            "must be between 1ms and 1 day",
        ));
    }
    if monitor.window_size == 0 {
        errors.push(invalid("monitor.window_size", 0, "must be at least 1"));
    }
    if monitor.window_max_age_secs == 0 {
        errors.push(invalid(
            "monitor.window_max_age_secs",
            0,
            "must be at least 1 second",
        ));
    }
    if !(monitor.critical_factor.is_finite() && monitor.critical_factor >= 1.0) {
        errors.push(invalid(
            "monitor.critical_factor",
            monitor.critical_factor,
            "must be a finite value \u{2265} 1.0",
        ));
    }

    // ── Request ──────────────────────────────────────────────────────
    let request = &config.request;
    if request.generation_timeout_ms == 0 || request.generation_timeout_ms > MAX_TIMEOUT_MS {
        errors.push(invalid(
            "request.generation_timeout_ms",
            request.generation_timeout_ms,
            "must be between 1ms and 1 day",
        ));
    }
    if request.slot_wait_timeout_ms > MAX_TIMEOUT_MS {
        errors.push(invalid(
            "request.slot_wait_timeout_ms",
            request.slot_wait_timeout_ms,
            "must be at most 1 day",
        ));
    }
    let q = &request.quality;
    for (field, v) in [
        ("request.quality.coherence_weight", q.coherence_weight),
        ("request.quality.completeness_weight", q.completeness_weight),
        ("request.quality.confidence_weight", q.confidence_weight),
    ] {
        if !is_non_negative(v) {
            errors.push(invalid(field, v, "must be a finite value \u{2265} 0"));
        }
    }
    let quality_sum = q.coherence_weight + q.completeness_weight + q.confidence_weight;
    if (quality_sum - 1.0).abs() > 1e-6 {
        errors.push(invalid(
            "request.quality",
            quality_sum,
            "quality weights must sum to 1.0",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate an [`AlertThresholds`] set on its own.
///
/// Used both by [`validate`] and when thresholds are swapped at runtime.
pub fn validate_thresholds(thresholds: &AlertThresholds) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    if !(thresholds.max_response_time_ms.is_finite() && thresholds.max_response_time_ms > 0.0) {
        errors.push(invalid(
            "monitor.alert_thresholds.max_response_time_ms",
            thresholds.max_response_time_ms,
            "must be > 0",
        ));
    }
    if !is_unit_interval(thresholds.min_cache_hit_rate) {
        errors.push(invalid(
            "monitor.alert_thresholds.min_cache_hit_rate",
            thresholds.min_cache_hit_rate,
            "must be between 0.0 and 1.0",
        ));
    }
    if !is_unit_interval(thresholds.max_error_rate) {
        errors.push(invalid(
            "monitor.alert_thresholds.max_error_rate",
            thresholds.max_error_rate,
            "must be between 0.0 and 1.0",
        ));
    }
    if thresholds.max_concurrent_requests == 0 {
        errors.push(invalid(
            "monitor.alert_thresholds.max_concurrent_requests",
            0,
            "must be at least 1",
        ));
    }
    for (field, v) in [
        ("monitor.alert_thresholds.max_cpu_usage", thresholds.max_cpu_usage),
        (
            "monitor.alert_thresholds.max_memory_usage",
            thresholds.max_memory_usage,
        ),
    ] {
        if !(v > 0.0 && v <= 100.0) {
            errors.push(invalid(field, v, "must be a percentage in (0, 100]"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;

    fn valid_config() -> OptimizerConfig {
        OptimizerConfig::default()
    }

    fn fields(errors: &[ConfigError]) -> Vec<String> {
        errors
            .iter()
            .filter_map(|e| match e {
                ConfigError::InvalidField { field, .. } => Some(field.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_zero_cache_size_rejected() {
        let mut config = valid_config();
        config.cache.max_size = 0;
        let errors = validate(&config).expect_err("must fail");
        assert!(fields(&errors).contains(&"cache.max_size".to_string()));
    }

    #[test]
    fn test_ttl_ceiling_below_base_rejected() {
        let mut config = valid_config();
        config.cache.base_ttl_secs = 100;
        config.cache.max_ttl_secs = 50;
        let errors = validate(&config).expect_err("must fail");
        assert!(fields(&errors).contains(&"cache.max_ttl_secs".to_string()));
    }

    #[test]
    fn test_zero_base_ttl_and_shards_rejected() {
        let mut config = valid_config();
        config.cache.base_ttl_secs = 0;
        config.cache.shard_count = 0;
        let errors = validate(&config).expect_err("must fail");
        let f = fields(&errors);
        assert!(f.contains(&"cache.base_ttl_secs".to_string()));
        assert!(f.contains(&"cache.shard_count".to_string()));
    }

    #[test]
    fn test_negative_ttl_weight_rejected() {
        let mut config = valid_config();
        config.cache.ttl.frequency_weight = -0.1;
        let errors = validate(&config).expect_err("must fail");
        assert!(fields(&errors).contains(&"cache.ttl.frequency_weight".to_string()));
    }

    #[test]
    fn test_all_zero_eviction_weights_rejected() {
        let mut config = valid_config();
        config.cache.eviction = EvictionWeights {
            recency: 0.0,
            frequency: 0.0,
            quality: 0.0,
        };
        let errors = validate(&config).expect_err("must fail");
        assert!(fields(&errors).contains(&"cache.eviction".to_string()));
    }

    #[test]
    fn test_inverted_tuning_shares_rejected() {
        let mut config = valid_config();
        config.cache.tuning.min_frequency_share = 0.8;
        config.cache.tuning.max_frequency_share = 0.2;
        let errors = validate(&config).expect_err("must fail");
        assert!(fields(&errors).contains(&"cache.tuning.min_frequency_share".to_string()));
    }

    #[test]
    fn test_zero_learning_rate_rejected() {
        let mut config = valid_config();
        config.cache.tuning.learning_rate = 0.0;
        let errors = validate(&config).expect_err("must fail");
        assert!(fields(&errors).contains(&"cache.tuning.learning_rate".to_string()));
    }

    #[test]
    fn test_duplicate_worker_ids_rejected() {
        let mut config = valid_config();
        config.balancer.workers = vec![WorkerSpec::new("a", 2), WorkerSpec::new("a", 3)];
        let errors = validate(&config).expect_err("must fail");
        assert!(fields(&errors).contains(&"balancer.workers[1].id".to_string()));
    }

    #[test]
    fn test_zero_capacity_worker_rejected() {
        let mut config = valid_config();
        config.balancer.workers = vec![WorkerSpec::new("a", 0)];
        let errors = validate(&config).expect_err("must fail");
        assert!(fields(&errors).contains(&"balancer.workers[0].capacity".to_string()));
    }

    #[test]
    fn test_empty_pool_rejected() {
        let mut config = valid_config();
        config.balancer.worker_count = 0;
        let errors = validate(&config).expect_err("must fail");
        assert!(fields(&errors).contains(&"balancer.worker_count".to_string()));
    }

    #[test]
    fn test_hit_rate_threshold_out_of_range_rejected() {
        let mut config = valid_config();
        config.monitor.alert_thresholds.min_cache_hit_rate = 1.5;
        let errors = validate(&config).expect_err("must fail");
        assert!(
            fields(&errors).contains(&"monitor.alert_thresholds.min_cache_hit_rate".to_string())
        );
    }

    #[test]
    fn test_cpu_threshold_must_be_percentage() {
        let thresholds = AlertThresholds {
            max_cpu_usage: 150.0,
            ..AlertThresholds::default()
        };
        let errors = validate_thresholds(&thresholds).expect_err("must fail");
        assert!(fields(&errors).contains(&"monitor.alert_thresholds.max_cpu_usage".to_string()));
    }

    #[test]
    fn test_critical_factor_below_one_rejected() {
        let mut config = valid_config();
        config.monitor.critical_factor = 0.5;
        let errors = validate(&config).expect_err("must fail");
        assert!(fields(&errors).contains(&"monitor.critical_factor".to_string()));
    }

    #[test]
    fn test_unbounded_durations_rejected() {
        let mut config = valid_config();
        config.monitor.alert_cooldown_secs = u64::MAX;
        config.monitor.handler_timeout_ms = 0;
        config.request.slot_wait_timeout_ms = u64::MAX;
        config.request.generation_timeout_ms = u64::MAX;
        let errors = validate(&config).expect_err("must fail");
        let fields = fields(&errors);
        for field in [
            "monitor.alert_cooldown_secs",
            "monitor.handler_timeout_ms",
            "request.slot_wait_timeout_ms",
            "request.generation_timeout_ms",
        ] {
            assert!(fields.contains(&field.to_string()), "missing {field}");
        }
    }

    #[test]
    fn test_duration_limits_are_inclusive() {
        let mut config = valid_config();
        config.monitor.alert_cooldown_secs = MAX_ALERT_COOLDOWN_SECS;
        config.request.slot_wait_timeout_ms = MAX_TIMEOUT_MS;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_quality_weights_must_sum_to_one() {
        let mut config = valid_config();
        config.request.quality.confidence_weight = 0.5;
        let errors = validate(&config).expect_err("must fail");
        assert!(fields(&errors).contains(&"request.quality".to_string()));
    }

    #[test]
    fn test_validation_collects_every_violation() {
        let mut config = valid_config();
        config.cache.max_size = 0;
        config.monitor.window_size = 0;
        config.request.generation_timeout_ms = 0;
        let errors = validate(&config).expect_err("must fail");
        assert!(errors.len() >= 3, "expected 3+ errors, got {}", errors.len());
    }

    #[test]
    fn test_from_violations_joins_messages() {
        let err = ConfigError::from_violations(vec![
            invalid("a", 1, "bad"),
            invalid("b", 2, "worse"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("'a'"));
        assert!(msg.contains("'b'"));
    }
}
