//! # SessionLoadBalancer
//!
//! ## Responsibility
//! Bind sessions to workers with bounded capacity. Prefer the caller's
//! preferred worker or the worker a session used last, otherwise pick the
//! least-loaded worker by ratio. Reclaim bindings left idle too long.
//!
//! ## Guarantees
//! - Capacity: a worker's load never exceeds its capacity (CAS reservation).
//!   Every live [`SlotGuard`] owns one unit of load, including guards for a
//!   session that is already bound, so in-flight work never outnumbers
//!   capacity.
//! - Exclusivity: a session is bound to at most one worker at any instant;
//!   binding creation happens under the session's map-shard lock.
//! - Rejection is a value ([`Assignment::Rejected`]), not an error.
//! - `release` of an unbound session is a no-op.
//! - Waiting for a slot is signal-driven ([`Notify`]), never a busy loop, and
//!   dropping a waiting future leaks nothing.
//!
//! ## NOT Responsible For
//! - Running generation on the worker (see `optimizer`)
//! - Worker health probing beyond recording heartbeats

use super::slot::{WorkerId, WorkerLoad, WorkerSlot};
use super::BalancerError;
use crate::config::{BalancerConfig, WorkerSpec};
use crate::SessionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Why an assignment was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Rejection {
    /// Every eligible worker is at capacity.
    NoCapacity,
    /// No registered worker carries any of the required tags.
    NoMatchingWorker,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoCapacity => f.write_str("all eligible workers are at capacity"),
            Self::NoMatchingWorker => f.write_str("no worker matches the required tags"),
        }
    }
}

/// Result of [`SessionLoadBalancer::assign`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// The session is bound to `worker`.
    Assigned {
        /// The bound worker.
        worker: WorkerId,
        /// `true` when the worker came from an existing binding, the
        /// caller's preference, or the session's previous worker.
        sticky: bool,
        /// `true` when an existing binding was reused and no load was taken.
        reused: bool,
    },
    /// No worker could take the session.
    Rejected(Rejection),
}

impl Assignment {
    /// The bound worker, if assigned.
    pub fn worker(&self) -> Option<&WorkerId> {
        match self {
            Self::Assigned { worker, .. } => Some(worker),
            Self::Rejected(_) => None,
        }
    }

    /// `true` if the assignment was refused.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

#[derive(Debug)]
struct SessionBinding {
    id: u64,
    worker: Arc<WorkerSlot>,
    last_activity: Instant,
    /// Units owned by the binding itself (taken by `assign`).
    units: usize,
    /// Live guards, each owning one unit of its own.
    active: usize,
}

/// Point-in-time balancer statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadBalancingMetrics {
    /// Assignments that took a new slot.
    pub total_assignments: u64,
    /// Assignments that landed on a sticky worker.
    pub sticky_assignments: u64,
    /// Sessions currently bound.
    pub active_sessions: usize,
    /// Assignments refused.
    pub rejected: u64,
    /// Bindings reclaimed by expiry sweeps.
    pub reclaimed: u64,
    /// Load per worker, in registration order.
    pub workers: Vec<WorkerLoad>,
}

/// Sticky, capacity-bounded session-to-worker balancer.
#[derive(Debug)]
pub struct SessionLoadBalancer {
    workers: RwLock<Vec<Arc<WorkerSlot>>>,
    bindings: DashMap<SessionId, SessionBinding>,
    affinity: DashMap<SessionId, (WorkerId, Instant)>,
    released: Notify,
    next_binding: AtomicU64,
    total_assignments: AtomicU64,
    sticky_assignments: AtomicU64,
    rejections: AtomicU64,
    reclaimed: AtomicU64,
}

impl SessionLoadBalancer {
    /// Build a balancer with the workers described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`BalancerError::InvalidWorker`] or
    /// [`BalancerError::DuplicateWorker`] for a malformed worker list.
    pub fn new(config: &BalancerConfig) -> Result<Self, BalancerError> {
        Self::with_workers(config.resolved_workers())
    }

    /// Build a balancer from an explicit worker list.
    ///
    /// # Errors
    ///
    /// See [`SessionLoadBalancer::new`].
    pub fn with_workers(specs: Vec<WorkerSpec>) -> Result<Self, BalancerError> {
        let balancer = Self {
            workers: RwLock::new(Vec::with_capacity(specs.len())),
            bindings: DashMap::new(),
            affinity: DashMap::new(),
            released: Notify::new(),
            next_binding: AtomicU64::new(1),
            total_assignments: AtomicU64::new(0),
            sticky_assignments: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        };
        for spec in specs {
            balancer.register_worker(spec)?;
        }
        Ok(balancer)
    }

    /// Add a worker at runtime.
    ///
    /// # Errors
    ///
    /// - [`BalancerError::InvalidWorker`] for an empty id or zero capacity.
    /// - [`BalancerError::DuplicateWorker`] if the id is already registered.
    pub fn register_worker(&self, spec: WorkerSpec) -> Result<WorkerId, BalancerError> {
        let capacity = spec.capacity.unwrap_or(0);
        if spec.id.trim().is_empty() {
            return Err(BalancerError::InvalidWorker {
                id: spec.id,
                reason: "worker id must not be empty".into(),
            });
        }
        if capacity == 0 {
            return Err(BalancerError::InvalidWorker {
                id: spec.id,
                reason: "capacity must be at least 1".into(),
            });
        }

        let id = WorkerId::new(spec.id);
        let mut workers = self.workers.write();
        if workers.iter().any(|w| w.id() == &id) {
            return Err(BalancerError::DuplicateWorker(id));
        }
        workers.push(Arc::new(WorkerSlot::new(id.clone(), capacity, spec.tags)));
        drop(workers);

        info!(worker = %id, capacity, "worker registered");
        self.released.notify_waiters();
        Ok(id)
    }

    /// Bind `session` to a worker, or refuse.
    ///
    /// An already-bound session gets its existing worker back with its
    /// activity refreshed and no extra load. Otherwise `preferred` (or the
    /// worker the session used last) is tried first, then the eligible
    /// worker with the lowest load ratio, ties going to the oldest heartbeat.
    pub fn assign(
        &self,
        session: &SessionId,
        preferred: Option<&WorkerId>,
        required_tags: &[String],
    ) -> Assignment {
        let assignment = self.try_assign(session, preferred, required_tags);
        if let Assignment::Rejected(reason) = &assignment {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            debug!(session = %session, %reason, "assignment rejected");
        }
        assignment
    }

    fn try_assign(
        &self,
        session: &SessionId,
        preferred: Option<&WorkerId>,
        required_tags: &[String],
    ) -> Assignment {
        let now = Instant::now();
        match self.bindings.entry(session.clone()) {
            Entry::Occupied(mut occupied) => {
                let binding = occupied.get_mut();
                binding.last_activity = now;
                Assignment::Assigned {
                    worker: binding.worker.id().clone(),
                    sticky: true,
                    reused: true,
                }
            }
            Entry::Vacant(vacant) => {
                let (worker, sticky) = match self.reserve_worker(session, preferred, required_tags)
                {
                    Ok(reserved) => reserved,
                    Err(reason) => return Assignment::Rejected(reason),
                };
                let worker_id = worker.id().clone();
                vacant.insert(self.new_binding(worker, now, 1, 0));
                self.record_assignment(session, &worker_id, sticky);
                Assignment::Assigned {
                    worker: worker_id,
                    sticky,
                    reused: false,
                }
            }
        }
    }

    /// Reserve one unit for a single request. A bound session reserves on
    /// its bound worker; an unbound one is placed like [`assign`](Self::assign).
    /// Returns the reserved worker, stickiness and the binding id.
    fn try_acquire(
        &self,
        session: &SessionId,
        preferred: Option<&WorkerId>,
        required_tags: &[String],
    ) -> Result<(Arc<WorkerSlot>, bool, u64), Rejection> {
        let now = Instant::now();
        match self.bindings.entry(session.clone()) {
            Entry::Occupied(mut occupied) => {
                let binding = occupied.get_mut();
                if !binding.worker.try_reserve() {
                    return Err(Rejection::NoCapacity);
                }
                binding.active += 1;
                binding.last_activity = now;
                let worker = Arc::clone(&binding.worker);
                let id = binding.id;
                self.record_assignment(session, worker.id(), true);
                Ok((worker, true, id))
            }
            Entry::Vacant(vacant) => {
                let (worker, sticky) = self.reserve_worker(session, preferred, required_tags)?;
                let binding = self.new_binding(Arc::clone(&worker), now, 0, 1);
                let id = binding.id;
                vacant.insert(binding);
                self.record_assignment(session, worker.id(), sticky);
                Ok((worker, sticky, id))
            }
        }
    }

    fn new_binding(
        &self,
        worker: Arc<WorkerSlot>,
        now: Instant,
        units: usize,
        active: usize,
    ) -> SessionBinding {
        SessionBinding {
            id: self.next_binding.fetch_add(1, Ordering::Relaxed),
            worker,
            last_activity: now,
            units,
            active,
        }
    }

    fn record_assignment(&self, session: &SessionId, worker: &WorkerId, sticky: bool) {
        self.total_assignments.fetch_add(1, Ordering::Relaxed);
        if sticky {
            self.sticky_assignments.fetch_add(1, Ordering::Relaxed);
        }
        debug!(session = %session, worker = %worker, sticky, "session assigned");
    }

    fn reserve_worker(
        &self,
        session: &SessionId,
        preferred: Option<&WorkerId>,
        required_tags: &[String],
    ) -> Result<(Arc<WorkerSlot>, bool), Rejection> {
        let workers = self.workers.read();
        let mut eligible: Vec<&Arc<WorkerSlot>> = workers
            .iter()
            .filter(|w| w.matches_tags(required_tags))
            .collect();
        if eligible.is_empty() {
            return Err(Rejection::NoMatchingWorker);
        }

        let remembered = self.affinity.get(session).map(|a| a.value().0.clone());
        let sticky_target = preferred.cloned().or(remembered);
        if let Some(target) = sticky_target {
            if let Some(worker) = eligible.iter().find(|w| w.id() == &target) {
                if worker.try_reserve() {
                    return Ok((Arc::clone(worker), true));
                }
            }
        }

        eligible.sort_by_cached_key(|w| w.selection_key());
        eligible
            .into_iter()
            .find(|w| w.try_reserve())
            .map(|w| (Arc::clone(w), false))
            .ok_or(Rejection::NoCapacity)
    }

    /// Unbind `session` and free the units the binding owns. Guards still
    /// in flight keep their own unit until they drop. Unknown sessions are a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for worker-side
    /// release failures.
    pub fn release(&self, session: &SessionId) -> Result<(), BalancerError> {
        if let Some((_, binding)) = self.bindings.remove(session) {
            for _ in 0..binding.units {
                binding.worker.release();
            }
            self.remember(session, &binding.worker);
            self.released.notify_waiters();
        }
        Ok(())
    }

    /// Return a guard's unit, and drop the binding once nothing holds it.
    fn finish_request(&self, session: &SessionId, binding_id: u64, worker: &WorkerSlot) {
        worker.release();
        let now = Instant::now();
        let finished = self.bindings.remove_if_mut(session, |_, binding| {
            if binding.id != binding_id {
                return false;
            }
            binding.active = binding.active.saturating_sub(1);
            binding.last_activity = now;
            binding.active == 0 && binding.units == 0
        });
        if let Some((_, binding)) = finished {
            self.remember(session, &binding.worker);
        }
        self.released.notify_waiters();
    }

    fn remember(&self, session: &SessionId, worker: &WorkerSlot) {
        self.affinity
            .insert(session.clone(), (worker.id().clone(), Instant::now()));
        debug!(session = %session, worker = %worker.id(), "session released");
    }

    /// Bind `session`, waiting up to `wait` for a slot to free.
    ///
    /// # Errors
    ///
    /// [`BalancerError::Capacity`] if no slot frees in time or no worker
    /// matches the tags. A `wait` too large to form a deadline waits
    /// without one.
    pub async fn acquire(
        self: &Arc<Self>,
        session: &SessionId,
        preferred: Option<&WorkerId>,
        required_tags: &[String],
        wait: Duration,
    ) -> Result<SlotGuard, BalancerError> {
        let started = Instant::now();
        let deadline = started.checked_add(wait);
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let reason = match self.try_acquire(session, preferred, required_tags) {
                Ok((slot, sticky, binding_id)) => {
                    return Ok(SlotGuard {
                        balancer: Arc::clone(self),
                        session: session.clone(),
                        worker: slot.id().clone(),
                        slot: Some(slot),
                        sticky,
                        binding_id,
                    });
                }
                Err(reason) => reason,
            };

            let gave_up = reason == Rejection::NoMatchingWorker
                || wait.is_zero()
                || match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, notified).await.is_err(),
                    None => {
                        notified.await;
                        false
                    }
                };
            if gave_up {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                let waited = started.elapsed();
                warn!(session = %session, %reason, waited_ms = waited.as_millis() as u64, "slot acquisition failed");
                return Err(BalancerError::Capacity {
                    session: session.clone(),
                    reason,
                    waited,
                });
            }
        }
    }

    /// Refresh a session's activity. Returns `false` if it is not bound.
    pub fn touch(&self, session: &SessionId) -> bool {
        match self.bindings.get_mut(session) {
            Some(mut binding) => {
                binding.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Record a heartbeat from `worker`.
    ///
    /// # Errors
    ///
    /// [`BalancerError::UnknownWorker`] if no such worker is registered.
    pub fn heartbeat(&self, worker: &WorkerId) -> Result<(), BalancerError> {
        let workers = self.workers.read();
        let slot = workers
            .iter()
            .find(|w| w.id() == worker)
            .ok_or_else(|| BalancerError::UnknownWorker(worker.clone()))?;
        slot.heartbeat();
        Ok(())
    }

    /// Force-release every binding idle for strictly longer than
    /// `inactivity_threshold`. Bindings with a request in flight are kept.
    /// Returns the number reclaimed.
    pub fn cleanup_expired(&self, inactivity_threshold: Duration) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.bindings.retain(|session, binding| {
            if binding.active == 0
                && now.saturating_duration_since(binding.last_activity) > inactivity_threshold
            {
                for _ in 0..binding.units {
                    binding.worker.release();
                }
                expired.push(session.clone());
                false
            } else {
                true
            }
        });
        self.affinity
            .retain(|_, (_, at)| now.saturating_duration_since(*at) <= inactivity_threshold);

        let count = expired.len();
        if count > 0 {
            self.reclaimed.fetch_add(count as u64, Ordering::Relaxed);
            self.released.notify_waiters();
            info!(reclaimed = count, "expired sessions reclaimed");
        }
        count
    }

    /// Run [`cleanup_expired`](Self::cleanup_expired) every `interval` until
    /// `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        inactivity_threshold: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let balancer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        balancer.cleanup_expired(inactivity_threshold);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("session cleanup stopped");
        })
    }

    /// Worker currently bound to `session`.
    pub fn binding_for(&self, session: &SessionId) -> Option<WorkerId> {
        self.bindings.get(session).map(|b| b.worker.id().clone())
    }

    /// Sessions currently bound.
    pub fn active_session_count(&self) -> usize {
        self.bindings.len()
    }

    /// Number of registered workers.
    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    /// Point-in-time statistics.
    pub fn metrics(&self) -> LoadBalancingMetrics {
        LoadBalancingMetrics {
            total_assignments: self.total_assignments.load(Ordering::Relaxed),
            sticky_assignments: self.sticky_assignments.load(Ordering::Relaxed),
            active_sessions: self.active_session_count(),
            rejected: self.rejections.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            workers: self.workers.read().iter().map(|w| w.snapshot()).collect(),
        }
    }
}

// ── SlotGuard ──────────────────────────────────────────────────────────

/// One unit of load held on a worker for one request. Returns the unit on
/// [`release`](SlotGuard::release) or drop, and unbinds the session when the
/// last guard on a binding goes away.
#[derive(Debug)]
pub struct SlotGuard {
    balancer: Arc<SessionLoadBalancer>,
    session: SessionId,
    worker: WorkerId,
    slot: Option<Arc<WorkerSlot>>,
    sticky: bool,
    binding_id: u64,
}

impl SlotGuard {
    /// The worker holding this slot.
    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    /// The session bound by this slot.
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// `true` when the worker was a sticky choice.
    pub fn is_sticky(&self) -> bool {
        self.sticky
    }

    /// Refresh the session's activity.
    pub fn touch(&self) {
        self.balancer.touch(&self.session);
    }

    /// Release the slot now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.balancer
                .finish_request(&self.session, self.binding_id, &slot);
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer(workers: usize, capacity: usize) -> Arc<SessionLoadBalancer> {
        let specs = (0..workers)
            .map(|i| WorkerSpec::new(format!("w{i}"), capacity))
            .collect();
        Arc::new(SessionLoadBalancer::with_workers(specs).expect("valid workers"))
    }

    fn sid(s: &str) -> SessionId {
        SessionId::new(s)
    }

    #[test]
    fn test_existing_binding_is_reused_without_extra_load() {
        let lb = balancer(1, 2);
        let first = lb.assign(&sid("s"), None, &[]);
        let second = lb.assign(&sid("s"), None, &[]);
        assert_eq!(first.worker(), second.worker());
        assert!(matches!(second, Assignment::Assigned { reused: true, .. }));
        assert_eq!(lb.metrics().workers[0].load, 1);
    }

    #[test]
    fn test_preferred_worker_wins_when_it_has_room() {
        let lb = balancer(3, 2);
        let preferred = WorkerId::new("w2");
        let a = lb.assign(&sid("s"), Some(&preferred), &[]);
        assert_eq!(
            a,
            Assignment::Assigned {
                worker: preferred,
                sticky: true,
                reused: false
            }
        );
    }

    #[test]
    fn test_full_preferred_worker_falls_back_to_least_loaded() {
        let lb = balancer(2, 1);
        let w0 = WorkerId::new("w0");
        lb.assign(&sid("a"), Some(&w0), &[]);
        let b = lb.assign(&sid("b"), Some(&w0), &[]);
        assert_eq!(b.worker(), Some(&WorkerId::new("w1")));
        assert!(matches!(b, Assignment::Assigned { sticky: false, .. }));
    }

    #[test]
    fn test_least_loaded_ratio_is_selected() {
        let lb = Arc::new(
            SessionLoadBalancer::with_workers(vec![
                WorkerSpec::new("small", 2),
                WorkerSpec::new("large", 10),
            ])
            .expect("valid"),
        );
        lb.assign(&sid("1"), Some(&WorkerId::new("small")), &[]);
        // small: 1/2, large: 0/10
        let next = lb.assign(&sid("2"), None, &[]);
        assert_eq!(next.worker(), Some(&WorkerId::new("large")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ties_go_to_oldest_heartbeat() {
        let lb = balancer(2, 2);
        tokio::time::advance(Duration::from_secs(1)).await;
        lb.heartbeat(&WorkerId::new("w0")).expect("known worker");
        let a = lb.assign(&sid("s"), None, &[]);
        assert_eq!(a.worker(), Some(&WorkerId::new("w1")));
    }

    #[test]
    fn test_required_tags_filter_workers() {
        let lb = SessionLoadBalancer::with_workers(vec![
            WorkerSpec::new("plain", 4),
            WorkerSpec::new("tagged", 4).with_tags(["summary"]),
        ])
        .expect("valid");
        let a = lb.assign(&sid("s"), None, &["summary".to_string()]);
        assert_eq!(a.worker(), Some(&WorkerId::new("tagged")));
        let b = lb.assign(&sid("t"), None, &["chat".to_string()]);
        assert_eq!(b, Assignment::Rejected(Rejection::NoMatchingWorker));
    }

    #[test]
    fn test_release_unknown_session_is_noop() {
        let lb = balancer(1, 1);
        assert!(lb.release(&sid("ghost")).is_ok());
        lb.assign(&sid("s"), None, &[]);
        lb.release(&sid("s")).expect("release");
        lb.release(&sid("s")).expect("second release is a no-op");
        assert_eq!(lb.metrics().workers[0].load, 0);
    }

    #[test]
    fn test_affinity_returns_session_to_previous_worker() {
        let lb = balancer(3, 4);
        let first = lb.assign(&sid("s"), None, &[]);
        let worker = first.worker().cloned().expect("assigned");
        lb.release(&sid("s")).expect("release");
        // Load other workers so least-loaded would not pick the old one.
        lb.assign(&sid("x"), None, &[]);
        let again = lb.assign(&sid("s"), None, &[]);
        assert_eq!(again.worker(), Some(&worker));
        assert!(matches!(again, Assignment::Assigned { sticky: true, .. }));
    }

    #[test]
    fn test_duplicate_and_invalid_workers_rejected() {
        let lb = balancer(1, 1);
        assert!(matches!(
            lb.register_worker(WorkerSpec::new("w0", 1)),
            Err(BalancerError::DuplicateWorker(_))
        ));
        assert!(matches!(
            lb.register_worker(WorkerSpec::new("z", 0)),
            Err(BalancerError::InvalidWorker { .. })
        ));
        assert!(matches!(
            lb.heartbeat(&WorkerId::new("nope")),
            Err(BalancerError::UnknownWorker(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_is_strictly_greater_than_threshold() {
        let lb = balancer(1, 4);
        lb.assign(&sid("old"), None, &[]);
        tokio::time::advance(Duration::from_secs(10)).await;
        lb.assign(&sid("edge"), None, &[]);
        tokio::time::advance(Duration::from_secs(5)).await;

        // old: idle 15s, edge: idle exactly 5s
        assert_eq!(lb.cleanup_expired(Duration::from_secs(5)), 1);
        assert_eq!(lb.binding_for(&sid("old")), None);
        assert!(lb.binding_for(&sid("edge")).is_some());
        assert_eq!(lb.metrics().workers[0].load, 1);
        assert_eq!(lb.metrics().reclaimed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_defers_expiry() {
        let lb = balancer(1, 1);
        lb.assign(&sid("s"), None, &[]);
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(lb.touch(&sid("s")));
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(lb.cleanup_expired(Duration::from_secs(10)), 0);
    }

    #[tokio::test]
    async fn test_guard_drop_releases_slot() {
        let lb = balancer(1, 1);
        {
            let guard = lb
                .acquire(&sid("s"), None, &[], Duration::ZERO)
                .await
                .expect("slot");
            assert_eq!(guard.worker(), &WorkerId::new("w0"));
            assert_eq!(lb.active_session_count(), 1);
        }
        assert_eq!(lb.active_session_count(), 0);
        assert_eq!(lb.metrics().workers[0].load, 0);
    }

    #[tokio::test]
    async fn test_same_session_guards_each_hold_a_unit() {
        let lb = balancer(1, 2);
        let owner = lb
            .acquire(&sid("s"), None, &[], Duration::ZERO)
            .await
            .expect("slot");
        let second = lb
            .acquire(&sid("s"), None, &[], Duration::ZERO)
            .await
            .expect("second slot on the bound worker");
        assert!(second.is_sticky());
        assert_eq!(lb.metrics().workers[0].load, 2);
        assert!(lb
            .acquire(&sid("s"), None, &[], Duration::ZERO)
            .await
            .is_err());

        owner.release();
        assert_eq!(lb.active_session_count(), 1);
        assert_eq!(lb.metrics().workers[0].load, 1);
        drop(second);
        assert_eq!(lb.active_session_count(), 0);
        assert_eq!(lb.metrics().workers[0].load, 0);
    }

    #[tokio::test]
    async fn test_bound_session_on_full_worker_is_refused() {
        let lb = balancer(2, 1);
        let _held = lb
            .acquire(&sid("s"), None, &[], Duration::ZERO)
            .await
            .expect("slot");
        let err = lb
            .acquire(&sid("s"), None, &[], Duration::ZERO)
            .await
            .expect_err("bound worker is full");
        assert!(matches!(
            err,
            BalancerError::Capacity {
                reason: Rejection::NoCapacity,
                ..
            }
        ));
        // The idle second worker is not used: the session stays on its binding.
        assert_eq!(lb.metrics().workers[1].load, 0);
    }

    #[tokio::test]
    async fn test_release_with_guard_in_flight_frees_each_unit_once() {
        let lb = balancer(1, 2);
        lb.assign(&sid("s"), None, &[]);
        let guard = lb
            .acquire(&sid("s"), None, &[], Duration::ZERO)
            .await
            .expect("slot");
        assert_eq!(lb.metrics().workers[0].load, 2);

        lb.release(&sid("s")).expect("release");
        assert_eq!(lb.binding_for(&sid("s")), None);
        assert_eq!(lb.metrics().workers[0].load, 1);
        drop(guard);
        assert_eq!(lb.metrics().workers[0].load, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_keeps_bindings_with_requests_in_flight() {
        let lb = balancer(1, 1);
        let guard = lb
            .acquire(&sid("s"), None, &[], Duration::ZERO)
            .await
            .expect("slot");
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(lb.cleanup_expired(Duration::from_secs(5)), 0);
        assert_eq!(lb.metrics().workers[0].load, 1);
        drop(guard);
        assert_eq!(lb.binding_for(&sid("s")), None);
        assert_eq!(lb.metrics().workers[0].load, 0);
    }

    #[tokio::test]
    async fn test_acquire_zero_wait_fails_fast_when_full() {
        let lb = balancer(1, 1);
        let _held = lb
            .acquire(&sid("a"), None, &[], Duration::ZERO)
            .await
            .expect("slot");
        let err = lb
            .acquire(&sid("b"), None, &[], Duration::ZERO)
            .await
            .expect_err("full");
        assert!(matches!(
            err,
            BalancerError::Capacity {
                reason: Rejection::NoCapacity,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_acquire_wakes_when_slot_frees() {
        let lb = balancer(1, 1);
        let held = lb
            .acquire(&sid("a"), None, &[], Duration::ZERO)
            .await
            .expect("slot");

        let waiter = {
            let lb = Arc::clone(&lb);
            tokio::spawn(async move {
                lb.acquire(&sid("b"), None, &[], Duration::from_secs(5))
                    .await
                    .map(|g| g.worker().clone())
            })
        };
        tokio::task::yield_now().await;
        held.release();

        let worker = waiter.await.expect("join").expect("slot after release");
        assert_eq!(worker, WorkerId::new("w0"));
    }

    #[tokio::test]
    async fn test_acquire_with_unbounded_wait_blocks_until_release() {
        let lb = balancer(1, 1);
        let held = lb
            .acquire(&sid("a"), None, &[], Duration::ZERO)
            .await
            .expect("slot");

        let waiter = {
            let lb = Arc::clone(&lb);
            tokio::spawn(async move {
                lb.acquire(&sid("b"), None, &[], Duration::MAX)
                    .await
                    .map(|g| g.worker().clone())
            })
        };
        tokio::task::yield_now().await;
        held.release();

        let worker = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter finishes")
            .expect("join")
            .expect("slot after release");
        assert_eq!(worker, WorkerId::new("w0"));
    }

    #[test]
    fn test_concurrent_assign_over_many_workers() {
        let lb = balancer(32, 2);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let lb = Arc::clone(&lb);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let session = sid(&format!("t{t}-{i}"));
                        if !lb.assign(&session, None, &[]).is_rejected() {
                            lb.release(&session).expect("release");
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("assign must not panic");
        }
        let metrics = lb.metrics();
        assert_eq!(metrics.active_sessions, 0);
        assert!(metrics.workers.iter().all(|w| w.load == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_and_leaks_nothing() {
        let lb = balancer(1, 1);
        let _held = lb
            .acquire(&sid("a"), None, &[], Duration::ZERO)
            .await
            .expect("slot");
        let err = lb
            .acquire(&sid("b"), None, &[], Duration::from_millis(200))
            .await
            .expect_err("times out");
        assert!(matches!(
            err,
            BalancerError::Capacity { waited, .. } if waited >= Duration::from_millis(200)
        ));
        assert_eq!(lb.metrics().workers[0].load, 1);
        assert_eq!(lb.binding_for(&sid("b")), None);
    }
}
