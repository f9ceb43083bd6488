//! The retry executor
//!
//! Wraps a single step invocation with its retry policy: circuit breaker
//! gate, persistent retry state, listener notifications, exponential
//! backoff with jitter, and a cancellable delay sleep. Either returns a
//! step result or a terminal [`RetryError`].

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::listener::{Listeners, MetricsRegistry, RetryListener};
use crate::persistence::{RepositoryError, StateRepository};
use crate::step::{StepError, StepResult};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitPermit};
use super::retry::{RetryPolicy, RetryState};

/// Terminal outcome of a retried invocation
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// The step's circuit breaker rejected the call without invoking it
    #[error("circuit open for step {step_id}")]
    CircuitOpen {
        /// The guarded step
        step_id: String,
        /// The failure that tripped the breaker
        last_error: Option<String>,
    },

    /// All attempts were used up
    #[error("step {step_id} exhausted {attempts} attempts: {source}")]
    Exhausted {
        /// The failing step
        step_id: String,
        /// Attempts made
        attempts: u32,
        /// The last failure
        #[source]
        source: StepError,
    },

    /// Retrying was aborted by an abort-on match or retry-on miss
    #[error("step {step_id} aborted after {attempts} attempts: {source}")]
    Aborted {
        /// The failing step
        step_id: String,
        /// Attempts made
        attempts: u32,
        /// The aborting failure
        #[source]
        source: StepError,
    },

    /// The instance was cancelled during a retry delay
    #[error("step {step_id} cancelled during retry delay")]
    Cancelled {
        /// The step whose delay was interrupted
        step_id: String,
    },

    /// The repository failed a required write
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// One invocation to wrap
pub struct RetryRequest<'a> {
    /// Graph the step belongs to (metrics/breaker key)
    pub graph_id: &'a str,

    /// Instance being executed (retry-state key)
    pub instance_id: &'a str,

    /// Step being invoked
    pub step_id: &'a str,

    /// Policy in effect for this step
    pub policy: &'a RetryPolicy,

    /// Breaker guarding this step, if breaking is enabled
    pub breaker: Option<&'a CircuitBreaker>,

    /// Instance cancellation; interrupts the delay sleep
    pub cancellation: &'a CancellationToken,
}

/// Executes step bodies under a retry policy
pub struct RetryExecutor {
    repository: Arc<dyn StateRepository>,
    listeners: Arc<Listeners<dyn RetryListener>>,
    metrics: Arc<MetricsRegistry>,
}

impl RetryExecutor {
    /// Create a retry executor
    pub fn new(
        repository: Arc<dyn StateRepository>,
        listeners: Arc<Listeners<dyn RetryListener>>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            repository,
            listeners,
            metrics,
        }
    }

    /// Run a step body until it succeeds, aborts, or exhausts its attempts
    ///
    /// The thunk is re-invoked for each attempt. A `Fail` result is
    /// treated as an error when the policy sets `retry_on_fail_result`;
    /// otherwise it is returned for the executor to interpret as
    /// terminal.
    pub async fn execute<F, Fut>(
        &self,
        request: RetryRequest<'_>,
        thunk: F,
    ) -> Result<StepResult, RetryError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<StepResult, StepError>>,
    {
        let permit = match request.breaker {
            Some(breaker) => Some(self.acquire_permit(breaker, request.step_id).await?),
            None => None,
        };

        // Retry state is only persisted once a retry actually happens, so
        // max_attempts = 1 never writes one.
        let mut state = match self
            .repository
            .load_retry_state(request.instance_id, request.step_id)
            .await?
        {
            Some(state) => state,
            None => RetryState::first_attempt(request.step_id, request.policy.max_attempts),
        };

        loop {
            if state.attempt > 1 {
                self.metrics.record_retry(request.graph_id, request.step_id);
                self.listeners
                    .notify(|l| l.before_retry(request.step_id, &state));
            }

            let outcome = thunk().await;

            let error = match outcome {
                Ok(StepResult::Fail { error }) if request.policy.retry_on_fail_result => {
                    debug!(
                        step_id = request.step_id,
                        "fail result treated as retryable error"
                    );
                    error
                }
                Ok(StepResult::Fail { error }) => {
                    // Terminal fail result: the executor interprets it;
                    // the breaker still counts it against the step.
                    self.metrics.record_failure(request.graph_id, request.step_id);
                    self.clear_state(&request, &state).await?;
                    self.resolve_permit(permit, Err(&error.message)).await;
                    return Ok(StepResult::Fail { error });
                }
                Ok(result) => {
                    self.metrics.record_success(request.graph_id, request.step_id);
                    self.listeners
                        .notify(|l| l.on_retry_success(request.step_id, &state));
                    self.clear_state(&request, &state).await?;
                    self.resolve_permit(permit, Ok(())).await;
                    return Ok(result);
                }
                Err(error) => error,
            };

            self.metrics.record_failure(request.graph_id, request.step_id);

            let retry_allowed = error.retryable && request.policy.should_retry(error.kind());
            if !retry_allowed {
                self.metrics.record_aborted(request.graph_id, request.step_id);
                self.listeners
                    .notify(|l| l.on_retry_aborted(request.step_id, &state, &error));
                self.clear_state(&request, &state).await?;
                self.resolve_permit(permit, Err(&error.message)).await;
                return Err(RetryError::Aborted {
                    step_id: request.step_id.to_string(),
                    attempts: state.attempt,
                    source: error,
                });
            }

            if !request.policy.has_attempts_remaining(state.attempt) {
                self.metrics.record_exhausted(request.graph_id, request.step_id);
                self.listeners
                    .notify(|l| l.on_retry_exhausted(request.step_id, &state, &error));
                self.clear_state(&request, &state).await?;
                self.resolve_permit(permit, Err(&error.message)).await;
                return Err(RetryError::Exhausted {
                    step_id: request.step_id.to_string(),
                    attempts: state.attempt,
                    source: error,
                });
            }

            let delay = request.policy.delay_after_attempt(state.attempt);
            debug!(
                step_id = request.step_id,
                attempt = state.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "step attempt failed, retrying after backoff"
            );

            // Persist the advanced counter before sleeping so a crash
            // during the delay resumes at the right attempt.
            state.advance(error.message.clone());
            self.repository
                .save_retry_state(request.instance_id, &state)
                .await?;
            self.listeners
                .notify(|l| l.on_retry_failure(request.step_id, &state, &error, true));

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = request.cancellation.cancelled() => {
                    return Err(RetryError::Cancelled {
                        step_id: request.step_id.to_string(),
                    });
                }
            }
        }
    }

    async fn acquire_permit<'b>(
        &self,
        breaker: &'b CircuitBreaker,
        step_id: &str,
    ) -> Result<CircuitPermit<'b>, RetryError> {
        match breaker.acquire().await {
            Ok(permit) => Ok(permit),
            Err(CircuitBreakerError::Open {
                step_id,
                last_error,
            }) => Err(RetryError::CircuitOpen {
                step_id,
                last_error,
            }),
            Err(CircuitBreakerError::HalfOpenExhausted { step_id }) => {
                Err(RetryError::CircuitOpen {
                    step_id,
                    last_error: None,
                })
            }
            Err(CircuitBreakerError::Repository(error)) => {
                warn!(step_id, %error, "breaker state unavailable");
                Err(RetryError::Repository(error))
            }
        }
    }

    async fn resolve_permit(&self, permit: Option<CircuitPermit<'_>>, outcome: Result<(), &str>) {
        let Some(permit) = permit else { return };
        let resolution = match outcome {
            Ok(()) => permit.success().await,
            Err(message) => permit.failure(message).await,
        };
        if let Err(error) = resolution {
            warn!(%error, "failed to record circuit breaker outcome");
        }
    }

    /// Delete persisted retry state once the sequence is over
    async fn clear_state(
        &self,
        request: &RetryRequest<'_>,
        state: &RetryState,
    ) -> Result<(), RepositoryError> {
        if state.attempt > 1 {
            self.repository
                .delete_retry_state(request.instance_id, request.step_id)
                .await?;
        }
        Ok(())
    }
}
