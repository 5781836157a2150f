//! # Alerts
//!
//! ## Responsibility
//! Alert values, per-(metric, severity) cooldown state, and the pluggable
//! [`AlertHandler`] trait with two built-in handlers.
//!
//! ## Guarantees
//! - An [`AlertState`] fires only once per cooldown window.
//! - Handlers are plain trait objects; a failing handler returns `Err` and
//!   the monitor keeps going.
//!
//! ## NOT Responsible For
//! - Deciding when a threshold is breached (see `performance`)

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Metrics that can raise an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AlertMetric {
    /// p95 response time over the window.
    ResponseTime,
    /// Cache hit rate from the latest cache sample.
    CacheHitRate,
    /// Error rate over the window.
    ErrorRate,
    /// Requests currently in flight.
    ConcurrentRequests,
    /// CPU usage from the latest system sample.
    CpuUsage,
    /// Memory usage from the latest system sample.
    MemoryUsage,
}

impl fmt::Display for AlertMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ResponseTime => "response_time",
            Self::CacheHitRate => "cache_hit_rate",
            Self::ErrorRate => "error_rate",
            Self::ConcurrentRequests => "concurrent_requests",
            Self::CpuUsage => "cpu_usage",
            Self::MemoryUsage => "memory_usage",
        };
        f.write_str(name)
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AlertSeverity {
    /// Threshold crossed.
    Warning,
    /// Threshold crossed by at least the critical factor.
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => f.write_str("warning"),
            Self::Critical => f.write_str("critical"),
        }
    }
}

/// A threshold breach delivered to handlers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    /// Breached metric.
    pub metric: AlertMetric,
    /// Severity.
    pub severity: AlertSeverity,
    /// Observed value.
    pub observed: f64,
    /// Threshold it was compared to.
    pub threshold: f64,
    /// Human-readable summary.
    pub message: String,
    /// Wall-clock time of firing, in Unix milliseconds.
    pub fired_at_ms: u64,
}

/// Cooldown bookkeeping for one (metric, severity) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertState {
    /// When the pair last fired.
    pub last_fired_at: Option<Instant>,
    /// The pair may fire again once this instant has passed.
    pub cooldown_until: Option<Instant>,
    /// Set when the cooldown end is past the clock's range; the pair never
    /// fires again.
    pub silenced: bool,
    /// Times the pair has fired.
    pub fire_count: u64,
}

impl AlertState {
    /// A pair that has never fired.
    pub fn quiet() -> Self {
        Self {
            last_fired_at: None,
            cooldown_until: None,
            silenced: false,
            fire_count: 0,
        }
    }

    /// `true` if a breach at `now` may fire: never fired, or past the cooldown.
    pub fn can_fire(&self, now: Instant) -> bool {
        !self.silenced && self.cooldown_until.map_or(true, |until| now > until)
    }

    /// Record a firing at `now` and start a new cooldown window.
    pub fn fire(&mut self, now: Instant, cooldown: Duration) {
        self.last_fired_at = Some(now);
        self.cooldown_until = now.checked_add(cooldown);
        self.silenced = self.cooldown_until.is_none();
        self.fire_count += 1;
    }
}

impl Default for AlertState {
    fn default() -> Self {
        Self::quiet()
    }
}

/// Errors returned by alert handlers.
#[derive(Debug, Error)]
pub enum AlertError {
    /// The handler could not deliver the alert.
    #[error("alert delivery failed: {0}")]
    Delivery(String),
}

/// Receives alerts from the monitor.
///
/// Handlers run on their own tasks and may be slow; the monitor holds no
/// lock while they run.
#[async_trait]
pub trait AlertHandler: Send + Sync {
    /// Deliver one alert.
    async fn handle(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Logs every alert through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertHandler;

#[async_trait]
impl AlertHandler for LogAlertHandler {
    async fn handle(&self, alert: &Alert) -> Result<(), AlertError> {
        match alert.severity {
            AlertSeverity::Warning => tracing::warn!(
                metric = %alert.metric,
                observed = alert.observed,
                threshold = alert.threshold,
                "{}",
                alert.message
            ),
            AlertSeverity::Critical => tracing::error!(
                metric = %alert.metric,
                observed = alert.observed,
                threshold = alert.threshold,
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// Forwards alerts into a Tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelAlertHandler {
    tx: mpsc::Sender<Alert>,
}

impl ChannelAlertHandler {
    /// Create a handler and the receiving end of its channel.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AlertHandler for ChannelAlertHandler {
    async fn handle(&self, alert: &Alert) -> Result<(), AlertError> {
        self.tx
            .send(alert.clone())
            .await
            .map_err(|_| AlertError::Delivery("alert channel closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert() -> Alert {
        Alert {
            metric: AlertMetric::ErrorRate,
            severity: AlertSeverity::Warning,
            observed: 0.2,
            threshold: 0.05,
            message: "error rate 0.200 above 0.050".into(),
            fired_at_ms: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_respects_cooldown() {
        let mut state = AlertState::quiet();
        let now = Instant::now();
        assert!(state.can_fire(now));
        state.fire(now, Duration::from_secs(60));
        assert!(!state.can_fire(now + Duration::from_secs(59)));
        assert!(!state.can_fire(now + Duration::from_secs(60)));
        assert!(state.can_fire(now + Duration::from_secs(61)));
        assert_eq!(state.fire_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_cooldown_silences_pair() {
        let mut state = AlertState::quiet();
        let now = Instant::now();
        state.fire(now, Duration::MAX);
        assert!(state.silenced);
        assert_eq!(state.cooldown_until, None);
        assert!(!state.can_fire(now + Duration::from_secs(365 * 24 * 3600)));
        assert_eq!(state.fire_count, 1);
    }

    #[tokio::test]
    async fn test_channel_handler_forwards_alert() {
        let (handler, mut rx) = ChannelAlertHandler::new(4);
        handler.handle(&alert()).await.expect("delivered");
        let got = rx.recv().await.expect("alert received");
        assert_eq!(got.metric, AlertMetric::ErrorRate);
    }

    #[tokio::test]
    async fn test_channel_handler_errors_when_closed() {
        let (handler, rx) = ChannelAlertHandler::new(1);
        drop(rx);
        assert!(handler.handle(&alert()).await.is_err());
    }

    #[tokio::test]
    async fn test_log_handler_never_fails() {
        assert!(LogAlertHandler.handle(&alert()).await.is_ok());
    }

    #[test]
    fn test_metric_display_is_snake_case() {
        assert_eq!(AlertMetric::CacheHitRate.to_string(), "cache_hit_rate");
        assert_eq!(AlertSeverity::Critical.to_string(), "critical");
    }
}
