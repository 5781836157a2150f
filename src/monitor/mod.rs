//! # Performance Monitoring
//!
//! - [`alert`]: alert values, cooldown state, handlers
//! - [`performance`]: the [`PerformanceMonitor`] and its monitoring task

pub mod alert;
pub mod performance;

pub use alert::{
    Alert, AlertError, AlertHandler, AlertMetric, AlertSeverity, AlertState, ChannelAlertHandler,
    LogAlertHandler,
};
pub use performance::{
    CacheSample, MetricsProbe, MonitoringHandle, PerformanceMonitor, ProbeSample, SystemSample,
    SystemPerformanceReport,
};

use crate::config::validation::ConfigError;
use thiserror::Error;

/// Errors produced by the monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The threshold set failed validation.
    #[error("invalid alert thresholds: {0}")]
    InvalidThresholds(#[from] ConfigError),

    /// The monitoring task panicked or was aborted.
    #[error("monitoring task failed: {0}")]
    Join(String),
}
