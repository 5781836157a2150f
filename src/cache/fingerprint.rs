//! Deterministic cache keys.
//!
//! A [`Fingerprint`] is the SHA-256 digest of the analysis type and the
//! normalised request content. Normalisation trims the content and collapses
//! every run of whitespace to a single space, so cosmetic formatting
//! differences share a cache slot. The analysis type is trimmed and
//! lower-cased. A NUL byte separates the two parts so that
//! `("ab", "c")` and `("a", "bc")` never collide.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 digest of `(analysis_type, normalised_content)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the fingerprint of a request.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tokio_generation_optimizer::Fingerprint;
    ///
    /// let a = Fingerprint::compute("Summary", "hello   world\n");
    /// let b = Fingerprint::compute("summary", "hello world");
    /// assert_eq!(a, b);
    /// ```
    pub fn compute(analysis_type: &str, content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(analysis_type.trim().to_lowercase().as_bytes());
        hasher.update([0u8]);
        let mut first = true;
        for word in content.split_whitespace() {
            if !first {
                hasher.update(b" ");
            }
            hasher.update(word.as_bytes());
            first = false;
        }
        Self(hasher.finalize().into())
    }

    /// Shard index for a store with `shard_count` partitions.
    ///
    /// Uses the first two digest bytes as a big-endian `u16`. A
    /// `shard_count` of zero is treated as one.
    pub fn shard(&self, shard_count: usize) -> usize {
        let prefix = u16::from_be_bytes([self.0[0], self.0[1]]) as usize;
        prefix % shard_count.max(1)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lower-case hex encoding of the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
