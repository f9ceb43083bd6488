//! Lifecycle listeners and per-step metrics
//!
//! Listeners observe workflow and retry lifecycle events. Any number may
//! be registered; registration is copy-on-write so notification never
//! blocks registration. A panicking listener is logged and ignored - it
//! must not take the instance down with it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::warn;

use crate::instance::{SuspensionPayload, WorkflowFailure};
use crate::reliability::RetryState;
use crate::step::{StepError, StepResult};
use crate::value::TypedValue;

/// Observer of workflow lifecycle events
///
/// All callbacks are optional; implement only what you need.
pub trait WorkflowListener: Send + Sync {
    /// An instance started executing
    fn on_started(&self, instance_id: &str, graph_id: &str) {
        let _ = (instance_id, graph_id);
    }

    /// A step returned a result
    fn on_step_completed(&self, instance_id: &str, step_id: &str, result: &StepResult) {
        let _ = (instance_id, step_id, result);
    }

    /// An instance suspended awaiting input
    fn on_suspended(&self, instance_id: &str, suspension: &SuspensionPayload) {
        let _ = (instance_id, suspension);
    }

    /// A suspended instance was resumed
    fn on_resumed(&self, instance_id: &str) {
        let _ = instance_id;
    }

    /// An instance completed successfully
    fn on_completed(&self, instance_id: &str, result: &TypedValue) {
        let _ = (instance_id, result);
    }

    /// An instance failed
    fn on_failed(&self, instance_id: &str, failure: &WorkflowFailure) {
        let _ = (instance_id, failure);
    }
}

/// Observer of retry lifecycle events
pub trait RetryListener: Send + Sync {
    /// A retry attempt is about to run (attempt > 1)
    fn before_retry(&self, step_id: &str, state: &RetryState) {
        let _ = (step_id, state);
    }

    /// The step succeeded (possibly after retries)
    fn on_retry_success(&self, step_id: &str, state: &RetryState) {
        let _ = (step_id, state);
    }

    /// An attempt failed
    fn on_retry_failure(&self, step_id: &str, state: &RetryState, error: &StepError, will_retry: bool) {
        let _ = (step_id, state, error, will_retry);
    }

    /// Retrying was aborted by an abort-on match or retry-on miss
    fn on_retry_aborted(&self, step_id: &str, state: &RetryState, error: &StepError) {
        let _ = (step_id, state, error);
    }

    /// All attempts were used up
    fn on_retry_exhausted(&self, step_id: &str, state: &RetryState, error: &StepError) {
        let _ = (step_id, state, error);
    }
}

/// Handle for removing a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Copy-on-write listener collection
///
/// `notify` iterates a snapshot taken at call time, so registration and
/// removal never contend with an in-flight notification.
pub struct Listeners<L: ?Sized> {
    entries: RwLock<Arc<Vec<(u64, Arc<L>)>>>,
    next_id: AtomicU64,
}

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<L: ?Sized> Listeners<L> {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();
        let mut next = entries.as_ref().clone();
        next.push((id, listener));
        *entries = Arc::new(next);
        ListenerId(id)
    }

    /// Remove a listener; returns whether it was present
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        let next: Vec<_> = entries
            .iter()
            .filter(|(entry_id, _)| *entry_id != id.0)
            .cloned()
            .collect();
        let removed = next.len() != before;
        *entries = Arc::new(next);
        removed
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no listeners are registered
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Invoke a callback on every listener, isolating panics
    pub fn notify(&self, f: impl Fn(&L)) {
        let snapshot = self.entries.read().clone();
        for (id, listener) in snapshot.iter() {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                warn!(listener_id = id, "listener panicked; ignoring");
            }
        }
    }
}

/// Atomic counters for one (graph id, step id)
#[derive(Default)]
struct StepCounters {
    retries: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    exhausted: AtomicU64,
    aborted: AtomicU64,
}

/// Point-in-time metrics for one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepMetrics {
    /// Retry attempts (first attempts are not counted)
    pub retries: u64,

    /// Successful invocations
    pub successes: u64,

    /// Failed attempts
    pub failures: u64,

    /// Retry sequences that ran out of attempts
    pub exhausted: u64,

    /// Retry sequences aborted by policy
    pub aborted: u64,
}

impl StepMetrics {
    /// Fraction of invocations that eventually succeeded
    pub fn success_rate(&self) -> f64 {
        let terminal = self.successes + self.exhausted + self.aborted;
        if terminal == 0 {
            return 0.0;
        }
        self.successes as f64 / terminal as f64
    }
}

/// In-memory per-step metrics, keyed by (graph id, step id)
///
/// Counters are atomics; reads are lock-free snapshots. Persistence of
/// metrics is out of scope.
#[derive(Default)]
pub struct MetricsRegistry {
    steps: DashMap<(String, String), Arc<StepCounters>>,
}

impl MetricsRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, graph_id: &str, step_id: &str) -> Arc<StepCounters> {
        self.steps
            .entry((graph_id.to_string(), step_id.to_string()))
            .or_default()
            .clone()
    }

    /// Count one retry attempt
    pub fn record_retry(&self, graph_id: &str, step_id: &str) {
        self.counters(graph_id, step_id)
            .retries
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count one success
    pub fn record_success(&self, graph_id: &str, step_id: &str) {
        self.counters(graph_id, step_id)
            .successes
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count one failed attempt
    pub fn record_failure(&self, graph_id: &str, step_id: &str) {
        self.counters(graph_id, step_id)
            .failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count one exhausted retry sequence
    pub fn record_exhausted(&self, graph_id: &str, step_id: &str) {
        self.counters(graph_id, step_id)
            .exhausted
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count one aborted retry sequence
    pub fn record_aborted(&self, graph_id: &str, step_id: &str) {
        self.counters(graph_id, step_id)
            .aborted
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Read the current counters for a step
    pub fn snapshot(&self, graph_id: &str, step_id: &str) -> StepMetrics {
        match self
            .steps
            .get(&(graph_id.to_string(), step_id.to_string()))
        {
            Some(counters) => StepMetrics {
                retries: counters.retries.load(Ordering::Relaxed),
                successes: counters.successes.load(Ordering::Relaxed),
                failures: counters.failures.load(Ordering::Relaxed),
                exhausted: counters.exhausted.load(Ordering::Relaxed),
                aborted: counters.aborted.load(Ordering::Relaxed),
            },
            None => StepMetrics::default(),
        }
    }
}
