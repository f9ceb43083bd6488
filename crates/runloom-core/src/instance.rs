//! Durable workflow instances
//!
//! An instance is one execution of a graph: its context, status and the
//! references the engine needs to pick the execution back up (current
//! step, suspension, in-flight async task). It is the unit the state
//! repository persists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ContextSnapshot;
use crate::value::TypeTag;

/// Instance status
///
/// `created → running → { suspended ⇄ running, completed, failed, cancelled }`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Instance created but not started
    Created,

    /// Instance is executing steps (or waiting on an async task)
    Running,

    /// Instance is paused awaiting external input
    Suspended,

    /// Instance completed successfully
    Completed,

    /// Instance failed
    Failed,

    /// Instance was cancelled
    Cancelled,
}

impl InstanceStatus {
    /// Whether this status is final
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Category of a workflow failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A step returned a terminal `Fail`
    StepFailed,

    /// The retry policy ran out of attempts
    RetryExhausted,

    /// The retry was aborted by an abort-on match (or a retry-on miss)
    RetryAborted,

    /// The step's circuit breaker was open
    CircuitOpen,

    /// No compatible next step for a produced payload
    Routing,

    /// A step exceeded its invocation limit
    InvocationLimit,

    /// The state repository failed a synchronous write
    Repository,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StepFailed => write!(f, "step_failed"),
            Self::RetryExhausted => write!(f, "retry_exhausted"),
            Self::RetryAborted => write!(f, "retry_aborted"),
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::Routing => write!(f, "routing"),
            Self::InvocationLimit => write!(f, "invocation_limit"),
            Self::Repository => write!(f, "repository"),
        }
    }
}

/// User-facing description of why an instance failed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowFailure {
    /// Failure category
    pub kind: FailureKind,

    /// Step that failed, when attributable
    pub step_id: Option<String>,

    /// Attempts made at the failing step
    pub attempts: u32,

    /// Human-readable message
    pub message: String,

    /// Root cause, when distinct from the message
    pub cause: Option<String>,
}

impl WorkflowFailure {
    /// Create a failure record
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            step_id: None,
            attempts: 0,
            message: message.into(),
            cause: None,
        }
    }

    /// Attribute the failure to a step
    pub fn at_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Record how many attempts were made
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Record the root cause
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

impl std::fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Durable prompt produced by a suspended step
///
/// Referenced by the instance until a resume consumes it. The metadata
/// map travels verbatim to observers (schema identifiers, system flag).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuspensionPayload {
    /// Instance that suspended
    pub instance_id: String,

    /// Step that produced the suspension
    pub step_id: String,

    /// Prompt data for the caller
    pub prompt: serde_json::Value,

    /// Type the resume input must carry
    pub expected_input: TypeTag,

    /// Opaque metadata, propagated verbatim
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Durable record of one workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Stable external id
    pub instance_id: String,

    /// Graph this instance runs
    pub graph_id: String,

    /// Graph version this instance runs
    pub graph_version: u32,

    /// Current status
    pub status: InstanceStatus,

    /// Step the executor is at (or suspended on)
    pub current_step: Option<String>,

    /// Serialized context
    pub context: ContextSnapshot,

    /// Failure details, when status is `Failed`
    pub failure: Option<WorkflowFailure>,

    /// Step id of an outstanding suspension, if any
    pub suspended_step: Option<String>,

    /// Task id of an outstanding async task, if any
    pub async_task: Option<String>,

    /// When the instance was created
    pub created_at: DateTime<Utc>,

    /// When the instance was last persisted
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Create a fresh instance record
    pub fn new(graph_id: impl Into<String>, graph_version: u32, context: ContextSnapshot) -> Self {
        let now = Utc::now();
        Self {
            instance_id: context.instance_id.clone(),
            graph_id: graph_id.into(),
            graph_version,
            status: InstanceStatus::Created,
            current_step: None,
            context,
            failure: None,
            suspended_step: None,
            async_task: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the instance is in a final state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether `next` is a legal transition from the current status
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self.status, next),
            (Created, Running)
                | (Created, Cancelled)
                | (Running, Suspended)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Suspended, Running)
                | (Suspended, Cancelled)
        )
    }

    /// Move to a new status, refreshing the update timestamp
    pub fn transition(&mut self, next: InstanceStatus) {
        self.status = next;
        self.updated_at = Utc::now();
    }
}
