//! Step results and step errors
//!
//! A step body returns exactly one [`StepResult`]; the executor interprets
//! it to advance the instance. Results are pure values carrying no engine
//! references, and serialize so that an async handler's final result can
//! be persisted alongside its task state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::value::{TypeTag, TypedValue};

/// Error produced by a step body
///
/// The retry-on / abort-on sets of a retry policy match on `kind`, which
/// plays the role an exception class plays elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    /// Error message
    pub message: String,

    /// Error kind for programmatic handling and retry matching
    pub kind: Option<String>,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors fail the step without further attempts,
    /// regardless of the retry policy.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl StepError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            retryable: false,
            details: None,
        }
    }

    /// Set the error kind
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The error kind, if set
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StepError {}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        Self::non_retryable(format!("payload conversion failed: {err}")).with_kind("conversion")
    }
}

/// Request to pause the instance until external input arrives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuspendRequest {
    /// Prompt data surfaced to the caller (and the chat store, if bound)
    pub prompt: serde_json::Value,

    /// Type the resume input is expected to carry
    pub expected_input: TypeTag,

    /// Metadata propagated verbatim to observers (schema name, system flag, ...)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl SuspendRequest {
    /// Create a suspend request
    pub fn new(prompt: serde_json::Value, expected_input: impl Into<TypeTag>) -> Self {
        Self {
            prompt,
            expected_input: expected_input.into(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Attach a metadata entry (propagated verbatim)
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Request to hand work to an async step handler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AsyncRequest {
    /// Task id; matched against async handler patterns
    pub task_id: String,

    /// Output stored for the producing step while the task runs
    pub immediate: Option<TypedValue>,

    /// Arguments passed to the async handler
    #[serde(default)]
    pub args: serde_json::Value,

    /// Watchdog timeout; the task is cancelled when it elapses
    #[serde(default, with = "option_duration_millis")]
    pub timeout: Option<Duration>,
}

impl AsyncRequest {
    /// Create an async request
    pub fn new(task_id: impl Into<String>, immediate: Option<TypedValue>) -> Self {
        Self {
            task_id: task_id.into(),
            immediate,
            args: serde_json::Value::Null,
            timeout: None,
        }
    }

    /// Set the handler arguments
    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    /// Set the watchdog timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result returned by a step body
///
/// The executor interprets each variant:
///
/// - `Continue` / `Branch` advance by type-based routing
/// - `Suspend` pauses the instance until [`resume`](crate::engine::WorkflowEngine::resume)
/// - `Async` starts a background task and yields
/// - `Finish` / `Fail` are terminal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepResult {
    /// Advance to the next step chosen by the payload's type
    Continue { payload: Option<TypedValue> },

    /// Like `Continue`, but the transition was explicitly chosen by the step
    Branch { payload: TypedValue },

    /// Pause the instance and surface a prompt
    Suspend(SuspendRequest),

    /// Start an async task and yield
    Async(AsyncRequest),

    /// Terminal success with a final value
    Finish { result: TypedValue },

    /// Failure; the retry policy decides whether it is terminal
    Fail { error: StepError },
}

impl StepResult {
    /// Continue with a payload
    pub fn next(payload: TypedValue) -> Self {
        Self::Continue {
            payload: Some(payload),
        }
    }

    /// Continue with no payload (input preparation falls back to trigger data)
    pub fn proceed() -> Self {
        Self::Continue { payload: None }
    }

    /// Branch on the payload's concrete type
    pub fn branch(payload: TypedValue) -> Self {
        Self::Branch { payload }
    }

    /// Suspend with a prompt, expecting input of the given type
    pub fn suspend(prompt: serde_json::Value, expected_input: impl Into<TypeTag>) -> Self {
        Self::Suspend(SuspendRequest::new(prompt, expected_input))
    }

    /// Start an async task
    pub fn run_async(request: AsyncRequest) -> Self {
        Self::Async(request)
    }

    /// Finish the workflow with a final value
    pub fn finish(result: TypedValue) -> Self {
        Self::Finish { result }
    }

    /// Fail the step
    pub fn fail(error: StepError) -> Self {
        Self::Fail { error }
    }

    /// Whether this result ends the instance
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. } | Self::Fail { .. })
    }
}

/// Conversion of raw step returns into results
///
/// A step body may return a bare value; the executor wraps non-result
/// returns as `Continue`. `Option<TypedValue>::None` is `Continue` with
/// no payload.
pub trait IntoStepResult {
    /// Wrap the value as a step result
    fn into_step_result(self) -> StepResult;
}

impl IntoStepResult for StepResult {
    fn into_step_result(self) -> StepResult {
        self
    }
}

impl IntoStepResult for TypedValue {
    fn into_step_result(self) -> StepResult {
        StepResult::next(self)
    }
}

impl IntoStepResult for Option<TypedValue> {
    fn into_step_result(self) -> StepResult {
        StepResult::Continue { payload: self }
    }
}

impl IntoStepResult for () {
    fn into_step_result(self) -> StepResult {
        StepResult::proceed()
    }
}

/// Serde support for Option<Duration> as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_millis().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_error_retryable() {
        let error = StepError::retryable("timeout");
        assert!(error.retryable);
        assert_eq!(error.to_string(), "timeout");
    }

    #[test]
    fn test_step_error_with_kind() {
        let error = StepError::retryable("connection failed").with_kind("io");
        assert_eq!(error.kind(), Some("io"));
    }

    #[test]
    fn test_raw_value_auto_wraps_as_continue() {
        let value = TypedValue::new("greeting", json!({ "text": "hi" }));
        let result = value.clone().into_step_result();

        assert_eq!(
            result,
            StepResult::Continue {
                payload: Some(value)
            }
        );
    }

    #[test]
    fn test_none_wraps_as_empty_continue() {
        let result = (None as Option<TypedValue>).into_step_result();
        assert_eq!(result, StepResult::Continue { payload: None });
    }

    #[test]
    fn test_result_serialization() {
        let result = StepResult::suspend(json!({ "q": "name?" }), "name_input");
        let encoded = serde_json::to_string(&result).unwrap();
        assert!(encoded.contains("\"type\":\"suspend\""));

        let parsed: StepResult = serde_json::from_str(&encoded).unwrap();
        assert_eq!(result, parsed);
    }

    #[test]
    fn test_async_request_timeout_round_trip() {
        let request = AsyncRequest::new("t1", None)
            .with_args(json!({ "n": 3 }))
            .with_timeout(Duration::from_secs(10));

        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded["timeout"], json!(10_000));

        let parsed: AsyncRequest = serde_json::from_value(encoded).unwrap();
        assert_eq!(parsed.timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_terminal_results() {
        assert!(StepResult::finish(TypedValue::new("done", json!("ok"))).is_terminal());
        assert!(StepResult::fail(StepError::non_retryable("boom")).is_terminal());
        assert!(!StepResult::proceed().is_terminal());
    }
}
