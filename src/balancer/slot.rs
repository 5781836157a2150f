//! Worker slots.
//!
//! A [`WorkerSlot`] tracks how many sessions a worker is serving. Load is an
//! atomic counter reserved with compare-and-swap, so `0 <= load <= capacity`
//! holds at every instant without a lock.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Worker identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// Create a new [`WorkerId`].
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One worker and its live load.
#[derive(Debug)]
pub struct WorkerSlot {
    id: WorkerId,
    capacity: usize,
    load: AtomicUsize,
    tags: Vec<String>,
    last_heartbeat: Mutex<Instant>,
    assigned_total: AtomicU64,
}

impl WorkerSlot {
    /// Create an idle worker. The heartbeat starts at "now".
    pub fn new(id: WorkerId, capacity: usize, tags: Vec<String>) -> Self {
        Self {
            id,
            capacity,
            load: AtomicUsize::new(0),
            tags,
            last_heartbeat: Mutex::new(Instant::now()),
            assigned_total: AtomicU64::new(0),
        }
    }

    /// Worker identifier.
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Maximum concurrent sessions.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sessions currently bound.
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    /// Specialization tags.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// `true` if at least one more session fits.
    pub fn has_capacity(&self) -> bool {
        self.load() < self.capacity
    }

    /// Reserve one unit of load. Fails without side effects when full.
    pub fn try_reserve(&self) -> bool {
        let reserved = self
            .load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| {
                (load < self.capacity).then_some(load + 1)
            })
            .is_ok();
        if reserved {
            self.assigned_total.fetch_add(1, Ordering::Relaxed);
        }
        reserved
    }

    /// Return one unit of load. Saturates at zero.
    pub fn release(&self) {
        let _ = self
            .load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| {
                load.checked_sub(1)
            });
    }

    /// `true` if no tags are required or the worker carries any of them.
    pub fn matches_tags(&self, required: &[String]) -> bool {
        required.is_empty() || required.iter().any(|t| self.tags.contains(t))
    }

    /// Refresh the heartbeat.
    pub fn heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Last heartbeat.
    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }

    /// Freeze the fields worker selection orders by.
    ///
    /// Sorting compares these frozen keys, so concurrent reservations on
    /// the live counters cannot make the order inconsistent mid-sort.
    pub fn selection_key(&self) -> SelectionKey {
        SelectionKey {
            load: self.load(),
            capacity: self.capacity,
            last_heartbeat: self.last_heartbeat(),
        }
    }

    /// Point-in-time view of this worker.
    pub fn snapshot(&self) -> WorkerLoad {
        let load = self.load();
        WorkerLoad {
            id: self.id.clone(),
            load,
            capacity: self.capacity,
            load_ratio: if self.capacity == 0 {
                1.0
            } else {
                load as f64 / self.capacity as f64
            },
            tags: self.tags.clone(),
            assigned_total: self.assigned_total.load(Ordering::Relaxed),
            since_heartbeat: Instant::now().saturating_duration_since(self.last_heartbeat()),
        }
    }
}

/// Snapshot of a worker's load ratio and heartbeat.
///
/// Orders by `load / capacity` (exact integer arithmetic), lowest first,
/// then by oldest heartbeat.
#[derive(Debug, Clone, Copy)]
pub struct SelectionKey {
    load: usize,
    capacity: usize,
    last_heartbeat: Instant,
}

impl Ord for SelectionKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        let lhs = self.load as u128 * other.capacity.max(1) as u128;
        let rhs = other.load as u128 * self.capacity.max(1) as u128;
        lhs.cmp(&rhs)
            .then_with(|| self.last_heartbeat.cmp(&other.last_heartbeat))
    }
}

impl PartialOrd for SelectionKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SelectionKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for SelectionKey {}

/// Per-worker entry of `LoadBalancingMetrics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerLoad {
    /// Worker identifier.
    pub id: WorkerId,
    /// Sessions currently bound.
    pub load: usize,
    /// Maximum concurrent sessions.
    pub capacity: usize,
    /// `load / capacity`.
    pub load_ratio: f64,
    /// Specialization tags.
    pub tags: Vec<String>,
    /// Reservations granted since the worker was registered.
    pub assigned_total: u64,
    /// Time since the last heartbeat.
    pub since_heartbeat: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reserve_stops_at_capacity() {
        let slot = WorkerSlot::new("w".into(), 2, vec![]);
        assert!(slot.try_reserve());
        assert!(slot.try_reserve());
        assert!(!slot.try_reserve());
        assert_eq!(slot.load(), 2);
    }

    #[test]
    fn test_release_saturates_at_zero() {
        let slot = WorkerSlot::new("w".into(), 1, vec![]);
        slot.release();
        assert_eq!(slot.load(), 0);
        assert!(slot.try_reserve());
        slot.release();
        slot.release();
        assert_eq!(slot.load(), 0);
    }

    #[test]
    fn test_concurrent_reserve_never_exceeds_capacity() {
        let slot = Arc::new(WorkerSlot::new("w".into(), 5, vec![]));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let slot = Arc::clone(&slot);
                std::thread::spawn(move || (0..100).filter(|_| slot.try_reserve()).count())
            })
            .collect();
        let granted: usize = handles
            .into_iter()
            .map(|h| h.join().expect("thread must not panic"))
            .sum();
        assert_eq!(granted, 5);
        assert_eq!(slot.load(), 5);
    }

    #[test]
    fn test_matches_any_required_tag() {
        let slot = WorkerSlot::new("w".into(), 1, vec!["summary".into(), "gpu".into()]);
        assert!(slot.matches_tags(&[]));
        assert!(slot.matches_tags(&["gpu".into()]));
        assert!(slot.matches_tags(&["chat".into(), "summary".into()]));
        assert!(!slot.matches_tags(&["chat".into()]));
    }

    #[test]
    fn test_load_ratio_ordering_is_exact() {
        let a = WorkerSlot::new("a".into(), 3, vec![]);
        let b = WorkerSlot::new("b".into(), 6, vec![]);
        a.try_reserve();
        b.try_reserve();
        b.try_reserve();
        // 1/3 == 2/6, same heartbeat instant
        let (ka, kb) = (a.selection_key(), b.selection_key());
        let kb = SelectionKey {
            last_heartbeat: ka.last_heartbeat,
            ..kb
        };
        assert_eq!(ka.cmp(&kb), CmpOrdering::Equal);
        b.try_reserve();
        let kb = SelectionKey {
            last_heartbeat: ka.last_heartbeat,
            ..b.selection_key()
        };
        assert_eq!(ka.cmp(&kb), CmpOrdering::Less);
    }

    #[test]
    fn test_selection_key_is_frozen_at_snapshot() {
        let slot = WorkerSlot::new("w".into(), 4, vec![]);
        let before = slot.selection_key();
        slot.try_reserve();
        slot.try_reserve();
        let after = slot.selection_key();
        assert_eq!(before.load, 0);
        assert_eq!(after.load, 2);
        assert!(before < after);
    }
}
