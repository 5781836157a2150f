//! # Quality Estimator
//!
//! Scores a generation in `[0, 1]` from heuristic signals: coherence,
//! completeness, and confidence, scaled by how generation finished. The
//! score feeds the cache's TTL and eviction policies; it never inspects
//! what the text means.

use crate::backend::{FinishReason, Generation};
use crate::config::QualityConfig;
use serde::Serialize;
use tracing::debug;

const QUESTION_WORDS: [&str; 7] = ["how", "what", "why", "when", "where", "who", "which"];

/// Breakdown of one quality score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityEstimate {
    /// Length and terminal punctuation signal.
    pub coherence: f64,
    /// Share of the prompt's question words echoed in the response.
    pub completeness: f64,
    /// Length-based confidence, `1 - 1/sqrt(len)`.
    pub confidence: f64,
    /// Multiplier for the finish reason.
    pub finish_factor: f64,
    /// Final score in `[0, 1]`.
    pub overall: f64,
    /// Diagnostic flags such as `too_short`.
    pub flags: Vec<&'static str>,
}

/// Heuristic quality scorer.
#[derive(Debug, Clone, Default)]
pub struct QualityEstimator {
    config: QualityConfig,
}

impl QualityEstimator {
    /// Build an estimator with the given weights.
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    /// Score `generation` as a response to `prompt`.
    pub fn estimate(&self, prompt: &str, generation: &Generation) -> QualityEstimate {
        let response = generation.text.trim();

        let len_ok = response.len() >= self.config.min_response_len;
        let ends_with_punct = response.ends_with(['.', '!', '?']);
        let coherence = match (len_ok, ends_with_punct) {
            (false, _) => 0.0,
            (true, true) => 0.85,
            (true, false) => 0.5,
        };

        let prompt_lower = prompt.to_lowercase();
        let response_lower = response.to_lowercase();
        let asked: Vec<&str> = QUESTION_WORDS
            .iter()
            .copied()
            .filter(|w| prompt_lower.contains(w))
            .collect();
        let completeness = if asked.is_empty() {
            0.7
        } else {
            let answered = asked.iter().filter(|w| response_lower.contains(*w)).count();
            answered as f64 / asked.len() as f64
        };

        let confidence = 1.0 - 1.0 / (response.len() as f64).sqrt().max(1.0);

        let finish_factor = match generation.finish_reason {
            FinishReason::Stop => 1.0,
            FinishReason::Length => 0.6,
            FinishReason::ContentFilter => 0.2,
        };

        let weighted = self.config.coherence_weight * coherence
            + self.config.completeness_weight * completeness
            + self.config.confidence_weight * confidence;
        let overall = (weighted * finish_factor).clamp(0.0, 1.0);

        let mut flags = Vec::new();
        if coherence < 0.4 {
            flags.push("low_coherence");
        }
        if completeness < 0.4 {
            flags.push("possibly_incomplete");
        }
        if !len_ok {
            flags.push("too_short");
        }
        if generation.finish_reason != FinishReason::Stop {
            flags.push("truncated");
        }

        debug!(overall, ?flags, "quality estimated");
        QualityEstimate {
            coherence,
            completeness,
            confidence,
            finish_factor,
            overall,
            flags,
        }
    }
}
