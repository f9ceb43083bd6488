//! Async step state and progress reporting
//!
//! A step that returns an `Async` result hands its work to a background
//! handler keyed by task id. The engine allocates an [`AsyncTaskState`],
//! persists it, and gives the handler a [`ProgressReporter`] for progress
//! updates and cooperative cancellation. Completion feeds the handler's
//! step result back into the executor.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::persistence::StateRepository;
use crate::step::StepResult;
use crate::value::TypedValue;

/// Status of an async task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncTaskStatus {
    /// Allocated but not yet started
    Pending,

    /// Handler is running
    InProgress,

    /// Handler finished successfully
    Completed,

    /// Handler failed
    Failed,

    /// Task was cancelled (externally or by its watchdog)
    Cancelled,
}

impl std::fmt::Display for AsyncTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Durable record of an async task
///
/// Percent is monotonic non-decreasing except on cancellation; the task
/// is `Completed` iff percent is 100 and the handler returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncTaskState {
    /// Task id from the `Async` step result (unique per execution)
    pub task_id: String,

    /// External tracking id, generated when the task starts
    pub message_id: Uuid,

    /// Instance the task belongs to
    pub instance_id: String,

    /// Immediate data the producing step yielded
    pub initial_data: Option<TypedValue>,

    /// Most recent data reported by the handler
    pub current_data: Option<serde_json::Value>,

    /// Completion percentage (0..=100)
    pub percent: u8,

    /// Most recent status message
    pub status_message: Option<String>,

    /// When the task started
    pub started_at: DateTime<Utc>,

    /// When the task reached a final status
    pub completed_at: Option<DateTime<Utc>>,

    /// Raw result data, when completed
    pub result: Option<serde_json::Value>,

    /// The handler's final step result, when completed
    pub final_result: Option<StepResult>,

    /// Error message, when failed
    pub error: Option<String>,

    /// Current status
    pub status: AsyncTaskStatus,
}

impl AsyncTaskState {
    /// Allocate state for a task that is starting now
    pub fn started(
        instance_id: impl Into<String>,
        task_id: impl Into<String>,
        initial_data: Option<TypedValue>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            message_id: Uuid::now_v7(),
            instance_id: instance_id.into(),
            initial_data,
            current_data: None,
            percent: 0,
            status_message: None,
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            final_result: None,
            error: None,
            status: AsyncTaskStatus::InProgress,
        }
    }

    /// Record a progress update; percent never decreases
    pub fn record_progress(&mut self, percent: u8, message: Option<String>) {
        self.percent = self.percent.max(percent.min(100));
        if message.is_some() {
            self.status_message = message;
        }
    }

    /// Mark the task completed with the handler's result
    pub fn complete(&mut self, result: StepResult) {
        self.percent = 100;
        self.status = AsyncTaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.result = serde_json::to_value(&result).ok();
        self.final_result = Some(result);
    }

    /// Mark the task failed
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = AsyncTaskStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    /// Mark the task cancelled
    pub fn cancel(&mut self) {
        self.status = AsyncTaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Whether the task reached a final status
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            AsyncTaskStatus::Completed | AsyncTaskStatus::Failed | AsyncTaskStatus::Cancelled
        )
    }
}

/// Progress and cancellation channel handed to async handlers
///
/// # Example
///
/// ```ignore
/// async fn encode(args: Value, _ctx: Arc<WorkflowContext>, progress: ProgressReporter)
///     -> Result<StepResult, StepError>
/// {
///     for chunk in 0..4 {
///         if progress.is_cancelled() {
///             return Err(StepError::non_retryable("cancelled"));
///         }
///         encode_chunk(chunk).await?;
///         progress.update(25 * (chunk + 1), "encoding").await;
///     }
///     Ok(StepResult::finish(TypedValue::new("encoded", json!("done"))))
/// }
/// ```
#[derive(Clone)]
pub struct ProgressReporter {
    state: Arc<Mutex<AsyncTaskState>>,
    repository: Arc<dyn StateRepository>,
    cancellation: CancellationToken,
}

impl ProgressReporter {
    /// Create a reporter over shared task state
    pub(crate) fn new(
        state: Arc<Mutex<AsyncTaskState>>,
        repository: Arc<dyn StateRepository>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            state,
            repository,
            cancellation,
        }
    }

    /// Report progress; percent is clamped monotonic non-decreasing
    ///
    /// The updated state is persisted; a persistence failure is logged
    /// and does not interrupt the handler.
    pub async fn update(&self, percent: u8, message: impl Into<String>) {
        let snapshot = {
            let mut state = self.state.lock();
            state.record_progress(percent, Some(message.into()));
            state.clone()
        };

        if let Err(error) = self
            .repository
            .save_async_task(&snapshot.instance_id, &snapshot)
            .await
        {
            warn!(
                instance_id = %snapshot.instance_id,
                task_id = %snapshot.task_id,
                %error,
                "failed to persist async task progress"
            );
        }
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolve when cancellation is requested (for `select!` patterns)
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Current completion percentage
    pub fn percent(&self) -> u8 {
        self.state.lock().percent
    }

    /// External tracking id of the task
    pub fn message_id(&self) -> Uuid {
        self.state.lock().message_id
    }
}

/// Match a task id against a handler pattern
///
/// Patterns are an exact id or a prefix with a single trailing `*`
/// (`encode-*` matches `encode-42`).
pub fn pattern_matches(pattern: &str, task_id: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => task_id.starts_with(prefix),
        None => pattern == task_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryRepository;
    use crate::step::StepResult;
    use serde_json::json;

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("encode-42", "encode-42"));
        assert!(pattern_matches("encode-*", "encode-42"));
        assert!(pattern_matches("*", "anything"));
        assert!(!pattern_matches("encode-*", "decode-42"));
        assert!(!pattern_matches("encode-42", "encode-43"));
    }

    #[test]
    fn test_percent_is_monotonic() {
        let mut state = AsyncTaskState::started("i-1", "t1", None);
        state.record_progress(50, Some("half".into()));
        state.record_progress(25, Some("stale update".into()));

        assert_eq!(state.percent, 50);
        assert_eq!(state.status_message.as_deref(), Some("stale update"));
    }

    #[test]
    fn test_percent_is_capped() {
        let mut state = AsyncTaskState::started("i-1", "t1", None);
        state.record_progress(250, None);
        assert_eq!(state.percent, 100);
    }

    #[test]
    fn test_completion_sets_percent_to_100() {
        let mut state = AsyncTaskState::started("i-1", "t1", None);
        state.record_progress(60, None);
        state.complete(StepResult::finish(TypedValue::new("done", json!("ok"))));

        assert_eq!(state.percent, 100);
        assert_eq!(state.status, AsyncTaskStatus::Completed);
        assert!(state.completed_at.is_some());
        assert!(state.final_result.is_some());
    }

    #[tokio::test]
    async fn test_reporter_updates_and_persists() {
        let repository = Arc::new(MemoryRepository::new());
        let state = AsyncTaskState::started("i-1", "t1", None);
        let shared = Arc::new(Mutex::new(state));
        let reporter = ProgressReporter::new(
            shared.clone(),
            repository.clone(),
            CancellationToken::new(),
        );

        reporter.update(25, "quarter").await;
        reporter.update(50, "half").await;

        assert_eq!(reporter.percent(), 50);

        let persisted = repository
            .load_async_task("i-1", "t1")
            .await
            .expect("should load")
            .expect("should exist");
        assert_eq!(persisted.percent, 50);
        assert_eq!(persisted.status_message.as_deref(), Some("half"));
    }

    #[tokio::test]
    async fn test_reporter_observes_cancellation() {
        let token = CancellationToken::new();
        let reporter = ProgressReporter::new(
            Arc::new(Mutex::new(AsyncTaskState::started("i-1", "t1", None))),
            Arc::new(MemoryRepository::new()),
            token.clone(),
        );

        assert!(!reporter.is_cancelled());
        token.cancel();
        assert!(reporter.is_cancelled());
    }
}
