//! # tokio-generation-optimizer
//!
//! An adaptive request-optimization layer that sits in front of a costly,
//! latency-variable text-generation backend.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────── RequestOptimizer ────────────────────┐
//! request ──► CACHE_LOOKUP ──hit──► return (cache_hit = true)                │
//!                 │ miss                                                      │
//!                 ▼                                                           │
//!            AWAIT_SLOT (SessionLoadBalancer) ──► GENERATE (backend)          │
//!                                                     │                       │
//!                                     STORE (CacheStore) ◄┘                   │
//!                                                     │                       │
//!                                     RELEASE_SLOT ──► return                 │
//!                 └───────────── MetricsRegistry / PerformanceMonitor ────────┘
//! ```
//!
//! The four components are plain structs shared through `Arc`. Nothing is
//! global: a process (or a test) may build as many independent instances as
//! it likes, and every background task is owned and joined by the component
//! that started it.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![warn(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod backend;
pub mod balancer;
pub mod cache;
pub mod config;
pub mod metrics;
pub mod monitor;
pub mod optimizer;
pub mod quality;

// Re-exports for convenience
pub use backend::{
    BackendError, EchoBackend, FinishReason, Generation, GenerationBackend, GenerationOptions,
};
pub use balancer::{Assignment, Rejection, SessionLoadBalancer, SlotGuard, WorkerId};
pub use cache::{CacheStore, Fingerprint};
pub use config::OptimizerConfig;
pub use metrics::MetricsRegistry;
pub use monitor::{AlertHandler, PerformanceMonitor};
pub use optimizer::{
    FailureKind, GenerationRequest, OptimizationResult, OptimizeError,
    PerformanceOptimizationMetrics, RequestOptimizer,
};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`OptimizerError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Example
///
/// ```no_run
/// # use tokio_generation_optimizer::{init_tracing, OptimizerError};
/// # fn example() -> Result<(), OptimizerError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), OptimizerError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| OptimizerError::Other(format!("tracing init failed: {e}")))
}

/// Top-level errors for building and running the optimization layer.
///
/// Per-request failures are reported through [`OptimizeError`] instead; this
/// type covers construction, configuration, and lifecycle.
#[derive(Error, Debug)]
pub enum OptimizerError {
    /// The configuration failed validation.
    ///
    /// Returned at construction time so that misconfiguration surfaces
    /// immediately rather than at the first request.
    #[error("configuration error: {0}")]
    Config(#[from] config::validation::ConfigError),

    /// The metrics registry could not be built.
    #[error(transparent)]
    Metrics(#[from] metrics::MetricsError),

    /// A load-balancer operation failed.
    #[error(transparent)]
    Balancer(#[from] balancer::BalancerError),

    /// A monitor operation failed.
    #[error(transparent)]
    Monitor(#[from] monitor::MonitorError),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// Unique session identifier used for sticky worker assignment.
///
/// Sessions group related requests so that they keep landing on the same
/// worker and benefit from whatever session-scoped state it holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct SessionId(
    /// The raw string ID, typically a UUID or user-provided token.
    pub String,
);

impl SessionId {
    /// Create a new [`SessionId`] from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the session ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Milliseconds since the Unix epoch, saturating to 0 on a pre-epoch clock.
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_as_str_round_trips() {
        let session = SessionId::new("my-session");
        assert_eq!(session.as_str(), "my-session");
        assert_eq!(session.to_string(), "my-session");
    }

    #[test]
    fn test_session_id_from_str_matches_new() {
        assert_eq!(SessionId::from("abc"), SessionId::new("abc"));
    }

    #[test]
    fn test_other_error_display_is_message() {
        let err = OptimizerError::Other("boom".to_string());
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_component_errors_lift_into_optimizer_error() {
        fn lift(err: balancer::BalancerError) -> Result<(), OptimizerError> {
            Err(err)?
        }
        let err = lift(balancer::BalancerError::UnknownWorker(balancer::WorkerId::new("w9")))
            .expect_err("converted");
        assert!(matches!(err, OptimizerError::Balancer(_)));
        assert!(err.to_string().contains("w9"));
    }

    #[test]
    fn test_unix_millis_is_after_2020() {
        assert!(unix_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        // First call may succeed or fail depending on test execution order
        // (another test may have already installed a subscriber).
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
