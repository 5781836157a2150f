//! Generation backend abstraction.
//!
//! The optimizer calls a [`GenerationBackend`] only on a cache miss. This
//! module defines the trait, its request options and result types, the
//! backend error taxonomy, and [`EchoBackend`] for tests and demos.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Per-call generation options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Upper bound on generated tokens.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Backend-specific model name, if the backend serves several.
    pub model: Option<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            model: None,
        }
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// The model finished naturally.
    Stop,
    /// The token limit cut the output short.
    Length,
    /// A content filter truncated or blanked the output.
    ContentFilter,
}

/// A completed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    /// Generated text.
    pub text: String,
    /// Tokens consumed.
    pub tokens_used: u32,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
}

/// Errors a backend may return.
///
/// [`Timeout`](BackendError::Timeout) and
/// [`Unavailable`](BackendError::Unavailable) are transient: the caller may
/// retry. The rest are fatal for the request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The backend did not answer in time.
    #[error("backend timed out")]
    Timeout,

    /// The backend is down or overloaded (e.g. HTTP 5xx).
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the request (e.g. HTTP 4xx).
    #[error("backend rejected request: {0}")]
    Rejected(String),

    /// The backend answered with something unusable.
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

impl BackendError {
    /// `true` for failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_))
    }
}

/// A text-generation backend.
///
/// Implementations must be thread-safe; the optimizer shares one instance
/// across all requests through `Arc<dyn GenerationBackend>`.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Generate a completion for `prompt`.
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<Generation, BackendError>;
}

// ============================================================================
// Echo Backend (Testing)
// ============================================================================

/// Echoes the prompt back after an optional delay.
///
/// Each whitespace-separated word counts as one token. Output longer than
/// `max_tokens` is truncated and reported with [`FinishReason::Length`].
#[derive(Debug, Clone, Default)]
pub struct EchoBackend {
    delay: Duration,
}

impl EchoBackend {
    /// An echo backend with no delay.
    pub fn new() -> Self {
        Self::default()
    }

    /// An echo backend that sleeps `delay` before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl GenerationBackend for EchoBackend {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<Generation, BackendError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let words: Vec<&str> = prompt.split_whitespace().collect();
        let limit = options.max_tokens as usize;
        let (kept, finish_reason) = if words.len() > limit {
            (&words[..limit], FinishReason::Length)
        } else {
            (&words[..], FinishReason::Stop)
        };

        Ok(Generation {
            text: kept.join(" "),
            tokens_used: kept.len() as u32,
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_returns_prompt_words() {
        let backend = EchoBackend::new();
        let out = backend
            .generate("hello   brave new world", &GenerationOptions::default())
            .await
            .expect("echo never fails");
        assert_eq!(out.text, "hello brave new world");
        assert_eq!(out.tokens_used, 4);
        assert_eq!(out.finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_echo_truncates_at_max_tokens() {
        let backend = EchoBackend::new();
        let options = GenerationOptions {
            max_tokens: 2,
            ..GenerationOptions::default()
        };
        let out = backend
            .generate("one two three", &options)
            .await
            .expect("echo never fails");
        assert_eq!(out.text, "one two");
        assert_eq!(out.finish_reason, FinishReason::Length);
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_delay_is_honoured() {
        let backend = EchoBackend::with_delay(Duration::from_secs(2));
        let start = tokio::time::Instant::now();
        backend
            .generate("x", &GenerationOptions::default())
            .await
            .expect("echo never fails");
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[test]
    fn test_transient_classification() {
        assert!(BackendError::Timeout.is_transient());
        assert!(BackendError::Unavailable("503".into()).is_transient());
        assert!(!BackendError::Rejected("400".into()).is_transient());
        assert!(!BackendError::Malformed("eof".into()).is_transient());
    }
}
