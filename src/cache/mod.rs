//! # Result Cache
//!
//! Quality- and TTL-aware storage for generated results.
//!
//! - [`fingerprint`]: deterministic request keys
//! - [`policy`]: TTL scaling, eviction scoring, strategy retuning
//! - [`store`]: the sharded [`CacheStore`]
//!
//! A miss is an ordinary `None`, never an error. [`CacheError`] covers only
//! rejected inputs and compression failures.

pub mod fingerprint;
pub mod policy;
pub mod store;

pub use fingerprint::Fingerprint;
pub use policy::{EvictionPolicy, StrategyUpdate, TtlPolicy, TypeTraffic};
pub use store::{CacheHit, CacheStatistics, CacheStore, StoreOutcome, WarmReport, WarmSeed};

use thiserror::Error;

/// Errors returned by [`CacheStore::store`].
#[derive(Debug, Error)]
pub enum CacheError {
    /// Quality scores must lie in `[0, 1]`.
    #[error("quality score {0} is outside [0, 1]")]
    InvalidQuality(f64),

    /// Gzip encoding or decoding failed.
    #[error("cache payload compression failed: {0}")]
    Compression(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_quality_message_names_value() {
        let err = CacheError::InvalidQuality(1.5);
        assert!(err.to_string().contains("1.5"));
    }
}
