//! Retry policy and persistent retry state

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Per-step retry configuration
///
/// Supports exponential backoff with jitter to avoid thundering herd.
/// The `retry_on` / `abort_on` sets match against
/// [`StepError::kind`](crate::StepError::kind); `abort_on` wins.
///
/// # Example
///
/// ```
/// use runloom_core::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_millis(10))
///     .with_retry_on("io");
///
/// // First retry after ~10ms, second after ~20ms, third after ~40ms, etc.
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g. 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness.
    pub jitter: f64,

    /// Error kinds that are retried (empty = retry everything)
    #[serde(default)]
    pub retry_on: Vec<String>,

    /// Error kinds that abort immediately (takes precedence over `retry_on`)
    #[serde(default)]
    pub abort_on: Vec<String>,

    /// Treat a `Fail` step result as an error eligible for retry
    #[serde(default)]
    pub retry_on_fail_result: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff with sensible defaults
    ///
    /// - 3 max attempts
    /// - 1 second initial interval
    /// - 60 second max interval
    /// - 2x backoff coefficient
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            retry_on: vec![],
            abort_on: vec![],
            retry_on_fail_result: false,
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            retry_on: vec![],
            abort_on: vec![],
            retry_on_fail_result: false,
        }
    }

    /// Fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            retry_on: vec![],
            abort_on: vec![],
            retry_on_fail_result: false,
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Add a retryable error kind (empty set = retry everything)
    pub fn with_retry_on(mut self, kind: impl Into<String>) -> Self {
        self.retry_on.push(kind.into());
        self
    }

    /// Add an error kind that aborts retrying immediately
    pub fn with_abort_on(mut self, kind: impl Into<String>) -> Self {
        self.abort_on.push(kind.into());
        self
    }

    /// Treat `Fail` step results as retryable errors
    pub fn with_retry_on_fail_result(mut self, enabled: bool) -> Self {
        self.retry_on_fail_result = enabled;
        self
    }

    /// Delay to sleep after the given failed attempt (1-based)
    ///
    /// `min(initial · coefficient^(attempt-1), max_interval)` with
    /// symmetric jitter of ±(delay · jitter) applied on top.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(exponent as i32);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..=jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether an error kind should be retried
    ///
    /// `abort_on` matches win; a non-empty `retry_on` set that does not
    /// match is an abort; otherwise retry.
    pub fn should_retry(&self, kind: Option<&str>) -> bool {
        if let Some(kind) = kind {
            if self.abort_on.iter().any(|k| k == kind) {
                return false;
            }
            if !self.retry_on.is_empty() {
                return self.retry_on.iter().any(|k| k == kind);
            }
            true
        } else {
            // Unclassified errors abort when an explicit retry_on set exists
            self.retry_on.is_empty()
        }
    }

    /// Whether there are attempts left after the given attempt
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// Durable record of an in-progress retry sequence
///
/// Created on the first retry of a step within an instance, saved before
/// each backoff sleep, deleted on success or terminal failure. Reloaded on
/// instance recovery so counting resumes where it left off.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryState {
    /// Step being retried
    pub step_id: String,

    /// Attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed by the policy
    pub max_attempts: u32,

    /// When the first attempt ran
    pub first_attempt_at: DateTime<Utc>,

    /// When the current attempt ran
    pub current_attempt_at: DateTime<Utc>,

    /// Message of the most recent failure
    pub last_error: Option<String>,
}

impl RetryState {
    /// Create state for the first attempt of a step
    pub fn first_attempt(step_id: impl Into<String>, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            attempt: 1,
            max_attempts,
            first_attempt_at: now,
            current_attempt_at: now,
            last_error: None,
        }
    }

    /// Advance to the next attempt, recording the failure that caused it
    pub fn advance(&mut self, error: impl Into<String>) {
        self.attempt += 1;
        self.current_attempt_at = Utc::now();
        self.last_error = Some(error.into());
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
