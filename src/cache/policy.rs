//! # Cache Policy
//!
//! ## Responsibility
//! The pure functions behind the cache: TTL scaling, hybrid eviction
//! scoring, and the self-tuning rule that moves the TTL weights.
//!
//! ## Guarantees
//! - `TtlPolicy::ttl_for` is monotone non-decreasing in both quality and
//!   type hit count, and never exceeds the configured ceiling.
//! - `TtlPolicy::retune` keeps both weights non-negative and preserves their
//!   sum, so a retuned policy is still monotone.
//! - No I/O, no clocks: callers pass idle times and counts in.
//!
//! ## NOT Responsible For
//! - Storing entries or counting hits (see `store`)

use crate::config::{EvictionWeights, TtlWeights, TuningConfig};
use serde::Serialize;
use std::time::Duration;

// ── TTL ────────────────────────────────────────────────────────────────

/// TTL scaling function.
///
/// `ttl = min(max, base * (1 + quality_weight * q + frequency_weight * ln(1 + type_hits)))`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TtlPolicy {
    /// TTL of a zero-quality entry for a never-hit type.
    pub base: Duration,
    /// Ceiling on every computed TTL.
    pub max: Duration,
    /// Current scaling weights.
    pub weights: TtlWeights,
}

impl TtlPolicy {
    /// Build a policy from its parts.
    pub fn new(base: Duration, max: Duration, weights: TtlWeights) -> Self {
        Self { base, max, weights }
    }

    /// TTL for an entry of `quality` whose analysis type has been hit
    /// `type_hits` times. Quality is clamped to `[0, 1]`.
    pub fn ttl_for(&self, quality: f64, type_hits: u64) -> Duration {
        let q = if quality.is_nan() {
            0.0
        } else {
            quality.clamp(0.0, 1.0)
        };
        let factor = 1.0
            + self.weights.quality_weight * q
            + self.weights.frequency_weight * (1.0 + type_hits as f64).ln();
        let secs = (self.base.as_secs_f64() * factor).min(self.max.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max)
    }

    /// Share of the weight budget currently held by the frequency term.
    pub fn frequency_share(&self) -> f64 {
        let budget = self.weights.quality_weight + self.weights.frequency_weight;
        if budget <= 0.0 {
            0.0
        } else {
            self.weights.frequency_weight / budget
        }
    }

    /// Compute retuned weights from per-type traffic.
    ///
    /// Churn is `stores / (stores + hits)` summed across types, so busy types
    /// dominate. The frequency share moves toward the churn by
    /// `learning_rate`, clamped to the configured share bounds. Returns
    /// `None` when fewer than `min_samples` lookups and stores were observed
    /// or the weight budget is zero.
    pub fn retune(&self, traffic: &[TypeTraffic], tuning: &TuningConfig) -> Option<TtlWeights> {
        let observed: u64 = traffic.iter().map(TypeTraffic::observed).sum();
        if observed < tuning.min_samples {
            return None;
        }
        let budget = self.weights.quality_weight + self.weights.frequency_weight;
        if budget <= 0.0 {
            return None;
        }

        let stores: u64 = traffic.iter().map(|t| t.stores).sum();
        let hits: u64 = traffic.iter().map(|t| t.hits).sum();
        if stores + hits == 0 {
            return None;
        }
        let churn = stores as f64 / (stores + hits) as f64;

        let (lo, hi) = (tuning.min_frequency_share, tuning.max_frequency_share);
        let target = churn.clamp(lo, hi);
        let current = self.frequency_share();
        let share = (current + tuning.learning_rate * (target - current)).clamp(lo, hi);

        let frequency_weight = budget * share;
        Some(TtlWeights {
            quality_weight: (budget - frequency_weight).max(0.0),
            frequency_weight,
        })
    }
}

/// Traffic counters for one analysis type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeTraffic {
    /// Lookups that hit.
    pub hits: u64,
    /// Lookups that missed.
    pub misses: u64,
    /// Stores (new or replacing).
    pub stores: u64,
}

impl TypeTraffic {
    /// Lookups plus stores.
    pub fn observed(&self) -> u64 {
        self.hits + self.misses + self.stores
    }

    /// `hits / (hits + misses)`, or 0 without lookups.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Outcome of one strategy retune.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StrategyUpdate {
    /// Weights before the retune.
    pub before: TtlWeights,
    /// Weights after the retune.
    pub after: TtlWeights,
}

// ── Eviction ───────────────────────────────────────────────────────────

/// Hybrid recency / frequency / quality eviction score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionPolicy {
    weights: EvictionWeights,
    half_life: Duration,
}

impl EvictionPolicy {
    /// Build a policy. `half_life` is the idle time that halves recency.
    pub fn new(weights: EvictionWeights, half_life: Duration) -> Self {
        Self { weights, half_life }
    }

    /// Score an entry; the lowest-scoring entry is evicted first.
    pub fn score(&self, idle: Duration, access_count: u64, quality: f64) -> f64 {
        let decay = if self.half_life.is_zero() {
            if idle.is_zero() {
                1.0
            } else {
                0.0
            }
        } else {
            0.5f64.powf(idle.as_secs_f64() / self.half_life.as_secs_f64())
        };
        self.weights.recency * decay
            + self.weights.frequency * (1.0 + access_count as f64).ln()
            + self.weights.quality * quality
    }
}
