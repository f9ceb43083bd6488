//! Per-step circuit breakers
//!
//! A breaker guards one (graph id, step id) pair across all instances of
//! that graph. When consecutive failures reach the threshold the circuit
//! opens and step invocations fail fast without running the body. State
//! transitions are persisted through the state repository so a restarted
//! engine resumes with the same gate.
//!
//! # State machine
//!
//! ```text
//! ┌─────────┐  failure threshold  ┌─────────┐   open duration   ┌──────────┐
//! │ Closed  │ ──────────────────► │  Open   │ ────────────────► │ HalfOpen │
//! └─────────┘                     └─────────┘                   └──────────┘
//!      ▲                               ▲                             │
//!      │        success threshold      │       any failure           │
//!      └───────────────────────────────┴─────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::persistence::{RepositoryError, StateRepository};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - all calls rejected
    Open,

    /// Testing if the step recovered - limited calls allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # Example
///
/// ```
/// use runloom_core::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(5)
///     .with_open_duration(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Time to wait before transitioning from open to half-open
    #[serde(with = "duration_millis")]
    pub open_duration: Duration,

    /// Maximum trial calls allowed while half-open
    pub half_open_max_attempts: u32,

    /// Successes required in half-open to close the circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            half_open_max_attempts: 3,
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the consecutive-failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set how long the circuit stays open
    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    /// Set the half-open trial call budget
    pub fn with_half_open_max_attempts(mut self, attempts: u32) -> Self {
        self.half_open_max_attempts = attempts.max(1);
        self
    }

    /// Set the successes required to close from half-open
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }
}

/// Persisted breaker state for one (graph id, step id)
///
/// Timing fields are only compared monotonically against `now`; no
/// wall-clock trust beyond that is required after a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitSnapshot {
    /// Current state
    pub state: CircuitState,

    /// Consecutive failure count (closed state)
    pub failure_count: u32,

    /// Success count while half-open
    pub success_count: u32,

    /// Trial calls admitted while half-open
    pub half_open_attempts: u32,

    /// When the most recent failure was recorded
    pub last_failure_at: Option<DateTime<Utc>>,

    /// Message of the most recent failure
    pub last_error: Option<String>,

    /// When the state last changed
    pub changed_at: DateTime<Utc>,
}

impl CircuitSnapshot {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_attempts: 0,
            last_failure_at: None,
            last_error: None,
            changed_at: Utc::now(),
        }
    }

    fn transition(&mut self, state: CircuitState) {
        self.state = state;
        self.failure_count = 0;
        self.success_count = 0;
        self.half_open_attempts = 0;
        self.changed_at = Utc::now();
    }

    fn open_elapsed(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.changed_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Error types for circuit breaker operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError {
    /// Circuit is open, calls are not allowed
    #[error("circuit breaker open for step {step_id}")]
    Open {
        /// Step the breaker guards
        step_id: String,
        /// The failure that tripped the breaker
        last_error: Option<String>,
    },

    /// Circuit is half-open and the trial budget is spent
    #[error("circuit breaker half-open for step {step_id}, no trial calls available")]
    HalfOpenExhausted {
        /// Step the breaker guards
        step_id: String,
    },

    /// Repository error while loading or persisting state
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Permit that must be resolved after a guarded call
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
}

impl std::fmt::Debug for CircuitPermit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitPermit").finish_non_exhaustive()
    }
}

impl CircuitPermit<'_> {
    /// Report that the guarded call succeeded
    pub async fn success(self) -> Result<(), CircuitBreakerError> {
        self.breaker.record_success().await
    }

    /// Report that the guarded call failed
    pub async fn failure(self, error: impl Into<String>) -> Result<(), CircuitBreakerError> {
        self.breaker.record_failure(error.into()).await
    }
}

/// Circuit breaker guarding one step of one graph
///
/// The engine keeps a single breaker per (graph id, step id); all
/// instances of the graph share it. State is held in memory and written
/// through to the repository after every change.
pub struct CircuitBreaker {
    graph_id: String,
    step_id: String,
    config: CircuitBreakerConfig,
    repository: Arc<dyn StateRepository>,
    state: tokio::sync::Mutex<Option<CircuitSnapshot>>,
}

impl CircuitBreaker {
    /// Create a breaker for a (graph id, step id) pair
    pub fn new(
        graph_id: impl Into<String>,
        step_id: impl Into<String>,
        config: CircuitBreakerConfig,
        repository: Arc<dyn StateRepository>,
    ) -> Self {
        Self {
            graph_id: graph_id.into(),
            step_id: step_id.into(),
            config,
            repository,
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// The step this breaker guards
    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// The breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Admit or reject a call
    ///
    /// Returns a permit that must be resolved with
    /// [`success`](CircuitPermit::success) or [`failure`](CircuitPermit::failure).
    pub async fn acquire(&self) -> Result<CircuitPermit<'_>, CircuitBreakerError> {
        let mut guard = self.state.lock().await;
        let snapshot = self.loaded(&mut guard).await?;

        match snapshot.state {
            CircuitState::Closed => Ok(CircuitPermit { breaker: self }),
            CircuitState::Open => {
                if snapshot.open_elapsed() >= self.config.open_duration {
                    info!(
                        graph_id = %self.graph_id,
                        step_id = %self.step_id,
                        "circuit breaker transitioning to half-open"
                    );
                    snapshot.transition(CircuitState::HalfOpen);
                    snapshot.half_open_attempts = 1;
                    self.persist(snapshot).await?;
                    Ok(CircuitPermit { breaker: self })
                } else {
                    Err(CircuitBreakerError::Open {
                        step_id: self.step_id.clone(),
                        last_error: snapshot.last_error.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if snapshot.half_open_attempts < self.config.half_open_max_attempts {
                    snapshot.half_open_attempts += 1;
                    self.persist(snapshot).await?;
                    Ok(CircuitPermit { breaker: self })
                } else {
                    Err(CircuitBreakerError::HalfOpenExhausted {
                        step_id: self.step_id.clone(),
                    })
                }
            }
        }
    }

    /// Current state (for observability)
    pub async fn state(&self) -> Result<CircuitState, CircuitBreakerError> {
        let mut guard = self.state.lock().await;
        let snapshot = self.loaded(&mut guard).await?;
        Ok(snapshot.state)
    }

    /// Force the breaker closed (admin/testing)
    pub async fn reset(&self) -> Result<(), CircuitBreakerError> {
        let mut guard = self.state.lock().await;
        let snapshot = self.loaded(&mut guard).await?;
        snapshot.transition(CircuitState::Closed);
        self.persist(snapshot).await?;
        Ok(())
    }

    async fn record_success(&self) -> Result<(), CircuitBreakerError> {
        let mut guard = self.state.lock().await;
        let snapshot = self.loaded(&mut guard).await?;

        match snapshot.state {
            CircuitState::Closed => {
                if snapshot.failure_count > 0 {
                    snapshot.failure_count = 0;
                    self.persist(snapshot).await?;
                }
            }
            CircuitState::HalfOpen => {
                snapshot.success_count += 1;
                if snapshot.success_count >= self.config.success_threshold {
                    info!(
                        graph_id = %self.graph_id,
                        step_id = %self.step_id,
                        "circuit breaker closed after recovery"
                    );
                    snapshot.transition(CircuitState::Closed);
                }
                self.persist(snapshot).await?;
            }
            CircuitState::Open => {
                // A success cannot be reported while open; nothing to do
            }
        }
        Ok(())
    }

    async fn record_failure(&self, error: String) -> Result<(), CircuitBreakerError> {
        let mut guard = self.state.lock().await;
        let snapshot = self.loaded(&mut guard).await?;

        snapshot.last_failure_at = Some(Utc::now());
        snapshot.last_error = Some(error);

        match snapshot.state {
            CircuitState::Closed => {
                snapshot.failure_count += 1;
                if snapshot.failure_count >= self.config.failure_threshold {
                    info!(
                        graph_id = %self.graph_id,
                        step_id = %self.step_id,
                        failures = snapshot.failure_count,
                        "circuit breaker opened"
                    );
                    let last_failure_at = snapshot.last_failure_at;
                    let last_error = snapshot.last_error.clone();
                    snapshot.transition(CircuitState::Open);
                    snapshot.last_failure_at = last_failure_at;
                    snapshot.last_error = last_error;
                }
            }
            CircuitState::HalfOpen => {
                debug!(
                    graph_id = %self.graph_id,
                    step_id = %self.step_id,
                    "trial call failed, circuit breaker reopened"
                );
                let last_failure_at = snapshot.last_failure_at;
                let last_error = snapshot.last_error.clone();
                snapshot.transition(CircuitState::Open);
                snapshot.last_failure_at = last_failure_at;
                snapshot.last_error = last_error;
            }
            CircuitState::Open => {}
        }

        self.persist(snapshot).await?;
        Ok(())
    }

    /// Materialize the snapshot, loading from the repository on first use
    async fn loaded<'a>(
        &self,
        guard: &'a mut tokio::sync::MutexGuard<'_, Option<CircuitSnapshot>>,
    ) -> Result<&'a mut CircuitSnapshot, RepositoryError> {
        if guard.is_none() {
            let snapshot = self
                .repository
                .load_breaker(&self.graph_id, &self.step_id)
                .await?
                .unwrap_or_else(CircuitSnapshot::closed);
            return Ok(guard.insert(snapshot));
        }
        match guard.as_mut() {
            Some(snapshot) => Ok(snapshot),
            None => unreachable!("snapshot materialized above"),
        }
    }

    async fn persist(&self, snapshot: &CircuitSnapshot) -> Result<(), RepositoryError> {
        self.repository
            .save_breaker(&self.graph_id, &self.step_id, snapshot)
            .await
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("graph_id", &self.graph_id)
            .field("step_id", &self.step_id)
            .field("config", &self.config)
            .finish()
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryRepository;

    fn test_breaker(repository: Arc<dyn StateRepository>) -> CircuitBreaker {
        CircuitBreaker::new(
            "onboard",
            "fetch",
            CircuitBreakerConfig::default()
                .with_failure_threshold(3)
                .with_success_threshold(2)
                .with_open_duration(Duration::from_millis(100)),
            repository,
        )
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let breaker = test_breaker(Arc::new(MemoryRepository::new()));
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_failure_threshold() {
        let breaker = test_breaker(Arc::new(MemoryRepository::new()));

        for _ in 0..3 {
            let permit = breaker.acquire().await.unwrap();
            permit.failure("boom").await.unwrap();
        }

        let result = breaker.acquire().await;
        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let breaker = test_breaker(Arc::new(MemoryRepository::new()));

        for _ in 0..2 {
            let permit = breaker.acquire().await.unwrap();
            permit.failure("boom").await.unwrap();
        }
        let permit = breaker.acquire().await.unwrap();
        permit.success().await.unwrap();

        // Two more failures should not reach the threshold of three
        for _ in 0..2 {
            let permit = breaker.acquire().await.unwrap();
            permit.failure("boom").await.unwrap();
        }
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_after_open_duration() {
        let breaker = test_breaker(Arc::new(MemoryRepository::new()));

        for _ in 0..3 {
            let permit = breaker.acquire().await.unwrap();
            permit.failure("boom").await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(150)).await;

        let permit = breaker.acquire().await.expect("should admit trial call");
        assert_eq!(breaker.state().await.unwrap(), CircuitState::HalfOpen);
        permit.success().await.unwrap();
    }

    #[tokio::test]
    async fn test_closes_after_success_threshold() {
        let breaker = test_breaker(Arc::new(MemoryRepository::new()));

        for _ in 0..3 {
            let permit = breaker.acquire().await.unwrap();
            permit.failure("boom").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        for _ in 0..2 {
            let permit = breaker.acquire().await.unwrap();
            permit.success().await.unwrap();
        }

        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reopens_on_half_open_failure() {
        let breaker = test_breaker(Arc::new(MemoryRepository::new()));

        for _ in 0..3 {
            let permit = breaker.acquire().await.unwrap();
            permit.failure("boom").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let permit = breaker.acquire().await.unwrap();
        permit.failure("still broken").await.unwrap();

        assert!(matches!(
            breaker.acquire().await,
            Err(CircuitBreakerError::Open { .. })
        ));
    }

    #[tokio::test]
    async fn test_half_open_trial_budget() {
        let repository: Arc<dyn StateRepository> = Arc::new(MemoryRepository::new());
        let breaker = CircuitBreaker::new(
            "onboard",
            "fetch",
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_half_open_max_attempts(1)
                .with_open_duration(Duration::from_millis(50)),
            repository,
        );

        let permit = breaker.acquire().await.unwrap();
        permit.failure("boom").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        // First trial call admitted, budget of one is then spent
        let _permit = breaker.acquire().await.unwrap();
        assert!(matches!(
            breaker.acquire().await,
            Err(CircuitBreakerError::HalfOpenExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_state_survives_reload() {
        let repository: Arc<dyn StateRepository> = Arc::new(MemoryRepository::new());

        {
            let breaker = test_breaker(repository.clone());
            for _ in 0..3 {
                let permit = breaker.acquire().await.unwrap();
                permit.failure("boom").await.unwrap();
            }
        }

        // A fresh breaker over the same repository sees the open circuit
        let breaker = test_breaker(repository);
        assert!(matches!(
            breaker.acquire().await,
            Err(CircuitBreakerError::Open { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_error_carries_last_failure() {
        let breaker = test_breaker(Arc::new(MemoryRepository::new()));

        for _ in 0..3 {
            let permit = breaker.acquire().await.unwrap();
            permit.failure("downstream 503").await.unwrap();
        }

        match breaker.acquire().await {
            Err(CircuitBreakerError::Open { last_error, .. }) => {
                assert_eq!(last_error.as_deref(), Some("downstream 503"));
            }
            other => panic!("expected open error, got {other:?}"),
        }
    }
}
