//! # CacheStore
//!
//! ## Responsibility
//! Hold generated results keyed by [`Fingerprint`], with quality-scaled
//! TTLs, hybrid eviction at capacity, gzip compression of large results,
//! and per-analysis-type traffic statistics.
//!
//! ## Guarantees
//! - Sharded: lookups and replacing stores lock one shard only.
//! - Bounded: the live entry count never exceeds `max_size`; new-key inserts
//!   are serialised through an insert gate so capacity checks cannot race.
//! - Exactly one eviction per new insert at capacity, choosing the lowest
//!   score (ties: oldest `created_at`, then lowest fingerprint).
//! - Last-write-wins per fingerprint; a reader never sees a partial entry.
//! - Expired entries are never served.
//!
//! ## NOT Responsible For
//! - Deciding what is cacheable (see `optimizer`)
//! - Persistence across restarts

use super::fingerprint::Fingerprint;
use super::policy::{EvictionPolicy, StrategyUpdate, TtlPolicy, TypeTraffic};
use super::CacheError;
use crate::config::{CacheConfig, TuningConfig};
use dashmap::DashMap;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

// ── Entries ────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Payload {
    Plain(String),
    Compressed(Vec<u8>),
}

impl Payload {
    fn encode(result: &str, threshold: usize) -> Result<Self, CacheError> {
        if result.len() <= threshold {
            return Ok(Self::Plain(result.to_string()));
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(result.as_bytes())
            .map_err(CacheError::Compression)?;
        let bytes = encoder.finish().map_err(CacheError::Compression)?;
        Ok(Self::Compressed(bytes))
    }

    fn decode(&self) -> Result<String, CacheError> {
        match self {
            Self::Plain(s) => Ok(s.clone()),
            Self::Compressed(bytes) => {
                let mut decoder = GzDecoder::new(bytes.as_slice());
                let mut out = String::new();
                decoder
                    .read_to_string(&mut out)
                    .map_err(CacheError::Compression)?;
                Ok(out)
            }
        }
    }

    fn is_compressed(&self) -> bool {
        matches!(self, Self::Compressed(_))
    }

    fn stored_bytes(&self) -> usize {
        match self {
            Self::Plain(s) => s.len(),
            Self::Compressed(b) => b.len(),
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    analysis_type: String,
    payload: Arc<Payload>,
    tokens_used: u32,
    quality: f64,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// A live cache entry returned by [`CacheStore::lookup`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheHit {
    /// Entry key.
    pub fingerprint: Fingerprint,
    /// The cached result, decompressed.
    pub content: String,
    /// Tokens the original generation consumed.
    pub tokens_used: u32,
    /// Quality score recorded at store time.
    pub quality: f64,
    /// Access count including this lookup.
    pub access_count: u64,
    /// Time since the entry was stored.
    pub age: Duration,
    /// TTL assigned at store time.
    pub ttl: Duration,
    /// Whether the entry is held compressed.
    pub compressed: bool,
}

/// What a [`CacheStore::store`] call did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreOutcome {
    /// Entry key.
    pub fingerprint: Fingerprint,
    /// TTL given to the entry.
    pub ttl: Duration,
    /// Whether the result was compressed.
    pub compressed: bool,
    /// `true` when an existing entry with the same key was overwritten.
    pub replaced: bool,
    /// Entry removed to make room, if any.
    pub evicted: Option<Fingerprint>,
}

/// A pre-computed result to load at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct WarmSeed {
    /// Analysis type of the seeded request.
    pub analysis_type: String,
    /// Request content.
    pub content: String,
    /// Result to cache.
    pub result: String,
    /// Tokens the result cost.
    pub tokens_used: u32,
    /// Quality score in `[0, 1]`.
    pub quality: f64,
}

/// Outcome of a warm-up task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    /// Seeds stored.
    pub loaded: usize,
    /// Seeds rejected (invalid quality or compression failure).
    pub failed: usize,
}

/// Point-in-time cache statistics. All values are derived on read.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStatistics {
    /// Lookups that returned a live entry.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
    /// `hits / (hits + misses)`, or 0 without lookups.
    pub hit_rate: f64,
    /// Live entries.
    pub size: usize,
    /// Capacity.
    pub max_size: usize,
    /// Entries removed to make room.
    pub evictions: u64,
    /// Entries removed because their TTL elapsed.
    pub expirations: u64,
    /// Mean age of live entries.
    pub average_entry_age: Duration,
    /// Live entries held compressed.
    pub compressed_entries: usize,
    /// Bytes held by live payloads (after compression).
    pub stored_bytes: usize,
}

// ── Store ──────────────────────────────────────────────────────────────

type Shard = Mutex<HashMap<Fingerprint, CacheEntry>>;

/// Sharded, quality- and TTL-aware result cache.
///
/// # Example
///
/// ```rust
/// use tokio_generation_optimizer::CacheStore;
/// use tokio_generation_optimizer::config::CacheConfig;
///
/// let cache = CacheStore::new(&CacheConfig::default());
/// cache.store("summary", "some text", "a summary.", 12, 0.8).unwrap();
/// let hit = cache.lookup("summary", "some  text").unwrap();
/// assert_eq!(hit.content, "a summary.");
/// ```
#[derive(Debug)]
pub struct CacheStore {
    shards: Vec<Shard>,
    insert_gate: Mutex<()>,
    max_size: usize,
    compression_threshold: usize,
    ttl_policy: RwLock<TtlPolicy>,
    eviction: EvictionPolicy,
    tuning: TuningConfig,
    len: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    types: DashMap<String, TypeTraffic>,
}

fn normalize_type(analysis_type: &str) -> String {
    analysis_type.trim().to_lowercase()
}

impl CacheStore {
    /// Build an empty store from validated configuration.
    pub fn new(config: &CacheConfig) -> Self {
        let shard_count = config.shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect(),
            insert_gate: Mutex::new(()),
            max_size: config.max_size.max(1),
            compression_threshold: config.compression_threshold,
            ttl_policy: RwLock::new(TtlPolicy::new(
                config.base_ttl(),
                config.max_ttl(),
                config.ttl,
            )),
            eviction: EvictionPolicy::new(config.eviction, config.decay_half_life()),
            tuning: config.tuning,
            len: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            types: DashMap::new(),
        }
    }

    fn shard_for(&self, fp: &Fingerprint) -> &Shard {
        &self.shards[fp.shard(self.shards.len())]
    }

    fn record_type<F: FnOnce(&mut TypeTraffic)>(&self, analysis_type: &str, f: F) {
        let mut entry = self.types.entry(normalize_type(analysis_type)).or_default();
        f(entry.value_mut());
    }

    fn miss(&self, analysis_type: &str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.record_type(analysis_type, |t| t.misses += 1);
    }

    /// Return the live entry for `(analysis_type, content)`, or `None`.
    ///
    /// A hit bumps the entry's access count and last-access time. An expired
    /// entry is removed and reported as a miss.
    pub fn lookup(&self, analysis_type: &str, content: &str) -> Option<CacheHit> {
        let fp = Fingerprint::compute(analysis_type, content);
        let now = Instant::now();

        let snapshot = {
            let mut shard = self.shard_for(&fp).lock();
            let expired = shard.get(&fp).map(|entry| entry.is_expired(now));
            if expired == Some(true) {
                shard.remove(&fp);
                self.len.fetch_sub(1, Ordering::AcqRel);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %fp, "cache entry expired on lookup");
            }
            match shard.get_mut(&fp) {
                None => None,
                Some(entry) => {
                    entry.access_count += 1;
                    entry.last_accessed = now;
                    Some((
                        Arc::clone(&entry.payload),
                        entry.tokens_used,
                        entry.quality,
                        entry.access_count,
                        now.saturating_duration_since(entry.created_at),
                        entry.ttl,
                    ))
                }
            }
        };

        let Some((payload, tokens_used, quality, access_count, age, ttl)) = snapshot else {
            self.miss(analysis_type);
            debug!(fingerprint = %fp, "cache miss");
            return None;
        };

        match payload.decode() {
            Ok(content) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.record_type(analysis_type, |t| t.hits += 1);
                debug!(fingerprint = %fp, access_count, "cache hit");
                Some(CacheHit {
                    fingerprint: fp,
                    content,
                    tokens_used,
                    quality,
                    access_count,
                    age,
                    ttl,
                    compressed: payload.is_compressed(),
                })
            }
            Err(e) => {
                warn!(fingerprint = %fp, error = %e, "dropping undecodable cache entry");
                let mut shard = self.shard_for(&fp).lock();
                let same = shard
                    .get(&fp)
                    .is_some_and(|entry| Arc::ptr_eq(&entry.payload, &payload));
                if same {
                    shard.remove(&fp);
                    self.len.fetch_sub(1, Ordering::AcqRel);
                }
                drop(shard);
                self.miss(analysis_type);
                None
            }
        }
    }

    /// `true` if a live entry exists. Does not touch counters or recency.
    pub fn contains(&self, analysis_type: &str, content: &str) -> bool {
        let fp = Fingerprint::compute(analysis_type, content);
        let now = Instant::now();
        self.shard_for(&fp)
            .lock()
            .get(&fp)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Store a result.
    ///
    /// The TTL grows with `quality` and with the analysis type's historical
    /// hit count. Results above the compression threshold are gzip-compressed.
    /// Storing a new key at capacity evicts exactly one entry first.
    ///
    /// # Errors
    ///
    /// - [`CacheError::InvalidQuality`] if `quality` is outside `[0, 1]`.
    /// - [`CacheError::Compression`] if the result cannot be compressed.
    pub fn store(
        &self,
        analysis_type: &str,
        content: &str,
        result: &str,
        tokens_used: u32,
        quality: f64,
    ) -> Result<StoreOutcome, CacheError> {
        if !(0.0..=1.0).contains(&quality) {
            return Err(CacheError::InvalidQuality(quality));
        }

        let fp = Fingerprint::compute(analysis_type, content);
        let payload = Payload::encode(result, self.compression_threshold)?;
        let compressed = payload.is_compressed();
        let type_key = normalize_type(analysis_type);
        let type_hits = self.types.get(&type_key).map(|t| t.hits).unwrap_or(0);
        let ttl = self.ttl_policy.read().ttl_for(quality, type_hits);
        let now = Instant::now();

        let entry = CacheEntry {
            analysis_type: type_key,
            payload: Arc::new(payload),
            tokens_used,
            quality,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            ttl,
        };
        self.record_type(analysis_type, |t| t.stores += 1);

        let mut outcome = StoreOutcome {
            fingerprint: fp,
            ttl,
            compressed,
            replaced: false,
            evicted: None,
        };

        // Fast path: overwrite an existing key in place.
        let entry = {
            let mut shard = self.shard_for(&fp).lock();
            match shard.get_mut(&fp) {
                Some(existing) => {
                    *existing = entry;
                    None
                }
                None => Some(entry),
            }
        };
        let Some(entry) = entry else {
            outcome.replaced = true;
            debug!(fingerprint = %fp, "cache entry replaced");
            return Ok(outcome);
        };

        let _gate = self.insert_gate.lock();
        {
            let mut shard = self.shard_for(&fp).lock();
            if let Some(existing) = shard.get_mut(&fp) {
                *existing = entry;
                outcome.replaced = true;
                return Ok(outcome);
            }
        }

        while self.len.load(Ordering::Acquire) >= self.max_size {
            match self.evict_one(now) {
                Some(victim) => outcome.evicted = Some(victim),
                None => break,
            }
        }

        self.shard_for(&fp).lock().insert(fp, entry);
        self.len.fetch_add(1, Ordering::AcqRel);
        debug!(fingerprint = %fp, ttl_secs = ttl.as_secs(), compressed, "cache entry stored");
        Ok(outcome)
    }

    /// Remove the lowest-scoring entry. Expired entries go first.
    ///
    /// Caller must hold the insert gate.
    fn evict_one(&self, now: Instant) -> Option<Fingerprint> {
        let mut victim: Option<(bool, f64, Instant, Fingerprint)> = None;
        for shard in &self.shards {
            let shard = shard.lock();
            for (fp, entry) in shard.iter() {
                let expired = entry.is_expired(now);
                let score = self.score(entry, now);
                let candidate = (expired, score, entry.created_at, *fp);
                let better = match &victim {
                    None => true,
                    Some(current) => is_better_victim(&candidate, current),
                };
                if better {
                    victim = Some(candidate);
                }
            }
        }

        let (expired, score, _, fp) = victim?;
        let mut shard = self.shard_for(&fp).lock();
        if let Some(entry) = shard.remove(&fp) {
            self.len.fetch_sub(1, Ordering::AcqRel);
            drop(shard);
            if expired {
                self.expirations.fetch_add(1, Ordering::Relaxed);
            } else {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
            info!(
                fingerprint = %fp,
                analysis_type = %entry.analysis_type,
                score,
                expired,
                "cache entry evicted"
            );
        }
        Some(fp)
    }

    fn score(&self, entry: &CacheEntry, now: Instant) -> f64 {
        self.eviction.score(
            now.saturating_duration_since(entry.last_accessed),
            entry.access_count,
            entry.quality,
        )
    }

    /// Remove one entry. Returns `true` if it was present.
    pub fn invalidate(&self, analysis_type: &str, content: &str) -> bool {
        let fp = Fingerprint::compute(analysis_type, content);
        let mut shard = self.shard_for(&fp).lock();
        let removed = shard.remove(&fp).is_some();
        if removed {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Remove every entry. Counters and type statistics are kept.
    pub fn clear(&self) {
        let _gate = self.insert_gate.lock();
        for shard in &self.shards {
            let mut shard = shard.lock();
            let n = shard.len();
            shard.clear();
            self.len.fetch_sub(n, Ordering::AcqRel);
        }
    }

    /// Sweep every shard for expired entries. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let before = shard.len();
            shard.retain(|_, entry| !entry.is_expired(now));
            let swept = before - shard.len();
            self.len.fetch_sub(swept, Ordering::AcqRel);
            removed += swept;
        }
        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            info!(removed, "purged expired cache entries");
        }
        removed
    }

    /// Live entry count (expired entries not yet swept are included).
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// `true` when the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Current TTL policy (changes after a strategy retune).
    pub fn ttl_policy(&self) -> TtlPolicy {
        *self.ttl_policy.read()
    }

    /// Traffic counters per normalised analysis type, sorted by type.
    pub fn type_statistics(&self) -> Vec<(String, TypeTraffic)> {
        let mut out: Vec<_> = self
            .types
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Retune the TTL weights from observed per-type traffic.
    ///
    /// Returns `None` when too little traffic has been observed.
    pub fn optimize_strategy(&self) -> Option<StrategyUpdate> {
        let traffic: Vec<TypeTraffic> = self.types.iter().map(|e| *e.value()).collect();
        let mut policy = self.ttl_policy.write();
        let after = policy.retune(&traffic, &self.tuning)?;
        let before = policy.weights;
        policy.weights = after;
        drop(policy);
        info!(
            quality_weight = after.quality_weight,
            frequency_weight = after.frequency_weight,
            "cache ttl strategy retuned"
        );
        Some(StrategyUpdate { before, after })
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> CacheStatistics {
        let now = Instant::now();
        let mut size = 0usize;
        let mut total_age = Duration::ZERO;
        let mut compressed_entries = 0usize;
        let mut stored_bytes = 0usize;
        for shard in &self.shards {
            let shard = shard.lock();
            for entry in shard.values() {
                size += 1;
                total_age += now.saturating_duration_since(entry.created_at);
                if entry.payload.is_compressed() {
                    compressed_entries += 1;
                }
                stored_bytes += entry.payload.stored_bytes();
            }
        }

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStatistics {
            hits,
            misses,
            hit_rate: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
            size,
            max_size: self.max_size,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            average_entry_age: if size == 0 {
                Duration::ZERO
            } else {
                total_age / size as u32
            },
            compressed_entries,
            stored_bytes,
        }
    }

    /// Store `seeds` on a background task, yielding between seeds.
    pub fn warm(self: &Arc<Self>, seeds: Vec<WarmSeed>) -> JoinHandle<WarmReport> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut report = WarmReport::default();
            for seed in seeds {
                match store.store(
                    &seed.analysis_type,
                    &seed.content,
                    &seed.result,
                    seed.tokens_used,
                    seed.quality,
                ) {
                    Ok(_) => report.loaded += 1,
                    Err(e) => {
                        warn!(analysis_type = %seed.analysis_type, error = %e, "warm seed rejected");
                        report.failed += 1;
                    }
                }
                tokio::task::yield_now().await;
            }
            info!(loaded = report.loaded, failed = report.failed, "cache warm-up complete");
            report
        })
    }

    /// Run [`optimize_strategy`](Self::optimize_strategy) every `interval`
    /// until `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn_strategy_tuner(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            info!(interval_secs = interval.as_secs(), "cache strategy tuner started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        store.purge_expired();
                        store.optimize_strategy();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("cache strategy tuner stopped");
        })
    }

    #[cfg(test)]
    fn scores(&self) -> Vec<(Fingerprint, f64)> {
        let now = Instant::now();
        self.shards
            .iter()
            .flat_map(|shard| {
                let shard = shard.lock();
                shard
                    .iter()
                    .map(|(fp, e)| (*fp, self.score(e, now)))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[cfg(test)]
    fn analysis_type_of(&self, fp: &Fingerprint) -> Option<String> {
        self.shard_for(fp)
            .lock()
            .get(fp)
            .map(|e| e.analysis_type.clone())
    }
}

/// Victim ordering: expired first, then lowest score, oldest, lowest key.
fn is_better_victim(
    candidate: &(bool, f64, Instant, Fingerprint),
    current: &(bool, f64, Instant, Fingerprint),
) -> bool {
    if candidate.0 != current.0 {
        return candidate.0;
    }
    candidate
        .1
        .total_cmp(&current.1)
        .then_with(|| candidate.2.cmp(&current.2))
        .then_with(|| candidate.3.cmp(&current.3))
        .is_lt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_size: usize) -> CacheConfig {
        CacheConfig {
            max_size,
            shard_count: 4,
            ..CacheConfig::default()
        }
    }

    #[test]
    fn test_lookup_after_store_returns_content_unchanged() {
        let cache = CacheStore::new(&config(10));
        cache
            .store("summary", "input", "the result", 7, 0.5)
            .expect("store");
        let hit = cache.lookup("summary", "input").expect("hit");
        assert_eq!(hit.content, "the result");
        assert_eq!(hit.tokens_used, 7);
        assert_eq!(hit.access_count, 1);
    }

    #[test]
    fn test_lookup_unknown_key_is_miss() {
        let cache = CacheStore::new(&config(10));
        assert!(cache.lookup("summary", "nothing").is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.0);
    }

    #[test]
    fn test_invalid_quality_is_rejected() {
        let cache = CacheStore::new(&config(10));
        let err = cache.store("t", "c", "r", 1, 1.5).expect_err("must reject");
        assert!(matches!(err, CacheError::InvalidQuality(_)));
        assert!(cache.store("t", "c", "r", 1, f64::NAN).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_large_result_is_compressed_and_round_trips() {
        let cfg = CacheConfig {
            compression_threshold: 64,
            ..config(10)
        };
        let cache = CacheStore::new(&cfg);
        let big = "lorem ipsum ".repeat(200);
        let outcome = cache.store("t", "c", &big, 1, 0.5).expect("store");
        assert!(outcome.compressed);
        let hit = cache.lookup("t", "c").expect("hit");
        assert!(hit.compressed);
        assert_eq!(hit.content, big);
        let stats = cache.stats();
        assert_eq!(stats.compressed_entries, 1);
        assert!(stats.stored_bytes < big.len());
    }

    #[test]
    fn test_restore_same_key_replaces_in_place() {
        let cache = CacheStore::new(&config(2));
        cache.store("t", "c", "first", 1, 0.5).expect("store");
        let outcome = cache.store("t", "c", "second", 2, 0.5).expect("store");
        assert!(outcome.replaced);
        assert!(outcome.evicted.is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup("t", "c").expect("hit").content, "second");
    }

    #[test]
    fn test_eviction_removes_exactly_one_lowest_scored_entry() {
        let cache = CacheStore::new(&config(3));
        cache.store("t", "a", "ra", 1, 0.9).expect("store");
        cache.store("t", "b", "rb", 1, 0.1).expect("store");
        cache.store("t", "c", "rc", 1, 0.5).expect("store");
        for _ in 0..3 {
            cache.lookup("t", "a");
            cache.lookup("t", "c");
        }

        let scores = cache.scores();
        let (min_fp, min_score) = scores
            .iter()
            .copied()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .expect("non-empty");

        let outcome = cache.store("t", "d", "rd", 1, 0.5).expect("store");
        assert_eq!(outcome.evicted, Some(min_fp));
        assert_eq!(cache.len(), 3);
        assert!(scores.iter().all(|(_, s)| min_score <= *s));
        assert!(!cache.contains("t", "b"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_tie_breaks_on_oldest_created() {
        let cfg = CacheConfig {
            eviction: crate::config::EvictionWeights {
                recency: 0.0,
                frequency: 0.5,
                quality: 0.5,
            },
            ..config(2)
        };
        let cache = CacheStore::new(&cfg);
        let first = cache.store("t", "old", "r", 1, 0.5).expect("store");
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.store("t", "new", "r", 1, 0.5).expect("store");
        tokio::time::advance(Duration::from_secs(1)).await;
        let outcome = cache.store("t", "third", "r", 1, 0.5).expect("store");
        assert_eq!(outcome.evicted, Some(first.fingerprint));
        assert!(cache.contains("t", "new"));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_evicted_before_lower_scored_live_entry() {
        let cfg = CacheConfig {
            base_ttl_secs: 10,
            max_ttl_secs: 10,
            ..config(2)
        };
        let cache = CacheStore::new(&cfg);
        let stale = cache.store("t", "stale", "r", 1, 1.0).expect("store");
        for _ in 0..3 {
            assert!(cache.lookup("t", "stale").is_some());
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.store("t", "fresh", "r", 1, 0.0).expect("store");

        let outcome = cache.store("t", "third", "r", 1, 0.5).expect("store");
        assert_eq!(outcome.evicted, Some(stale.fingerprint));
        assert!(cache.contains("t", "fresh"));
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_a_miss() {
        let cfg = CacheConfig {
            base_ttl_secs: 10,
            max_ttl_secs: 100,
            ..config(10)
        };
        let cache = CacheStore::new(&cfg);
        let outcome = cache.store("t", "c", "r", 1, 0.0).expect("store");
        assert_eq!(outcome.ttl, Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.lookup("t", "c").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.lookup("t", "c").is_none());
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_sweeps_all_shards() {
        let cfg = CacheConfig {
            base_ttl_secs: 5,
            max_ttl_secs: 5,
            ..config(100)
        };
        let cache = CacheStore::new(&cfg);
        for i in 0..20 {
            cache.store("t", &format!("c{i}"), "r", 1, 0.5).expect("store");
        }
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.purge_expired(), 20);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_type_hits_extend_ttl() {
        let cache = CacheStore::new(&config(10));
        let cold = cache.store("report", "x", "r", 1, 0.5).expect("store");
        for _ in 0..10 {
            cache.lookup("report", "x");
        }
        let warm = cache.store("report", "y", "r", 1, 0.5).expect("store");
        assert!(warm.ttl > cold.ttl);
    }

    #[test]
    fn test_type_statistics_are_normalised() {
        let cache = CacheStore::new(&config(10));
        cache.store("Summary ", "x", "r", 1, 0.5).expect("store");
        cache.lookup("summary", "x");
        let fp = Fingerprint::compute("summary", "x");
        assert_eq!(cache.analysis_type_of(&fp).as_deref(), Some("summary"));
        let stats = cache.type_statistics();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].1.stores, 1);
        assert_eq!(stats[0].1.hits, 1);
    }

    #[test]
    fn test_optimize_strategy_needs_min_samples() {
        let cache = CacheStore::new(&config(10));
        cache.store("t", "c", "r", 1, 0.5).expect("store");
        assert!(cache.optimize_strategy().is_none());
    }

    #[test]
    fn test_optimize_strategy_updates_policy() {
        let cache = CacheStore::new(&config(1000));
        for i in 0..60 {
            cache.lookup("t", &format!("c{i}"));
            cache.store("t", &format!("c{i}"), "r", 1, 0.5).expect("store");
        }
        let update = cache.optimize_strategy().expect("retuned");
        assert_eq!(cache.ttl_policy().weights, update.after);
        assert!(update.after.frequency_weight > update.before.frequency_weight);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = CacheStore::new(&config(10));
        cache.store("t", "a", "r", 1, 0.5).expect("store");
        cache.store("t", "b", "r", 1, 0.5).expect("store");
        assert!(cache.invalidate("t", "a"));
        assert!(!cache.invalidate("t", "a"));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_warm_loads_seeds_and_counts_failures() {
        let cache = Arc::new(CacheStore::new(&config(10)));
        let seeds = vec![
            WarmSeed {
                analysis_type: "t".into(),
                content: "a".into(),
                result: "ra".into(),
                tokens_used: 1,
                quality: 0.7,
            },
            WarmSeed {
                analysis_type: "t".into(),
                content: "b".into(),
                result: "rb".into(),
                tokens_used: 1,
                quality: 2.0,
            },
        ];
        let report = cache.warm(seeds).await.expect("warm task");
        assert_eq!(report, WarmReport { loaded: 1, failed: 1 });
        assert!(cache.contains("t", "a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_strategy_tuner_stops_on_shutdown() {
        let cache = Arc::new(CacheStore::new(&config(10)));
        let (tx, rx) = watch::channel(false);
        let handle = cache.spawn_strategy_tuner(Duration::from_secs(1), rx);
        tokio::time::advance(Duration::from_secs(3)).await;
        tx.send(true).expect("send shutdown");
        handle.await.expect("tuner joins");
    }
}
