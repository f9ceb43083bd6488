//! # Runloom Core
//!
//! A durable, resumable workflow execution engine for multi-step
//! processes: conversational dialogs, human-in-the-loop approvals and
//! long-running asynchronous jobs.
//!
//! ## Features
//!
//! - **Typed step graphs**: steps declare input/output type tags; routing
//!   picks the next step from the produced payload's type
//! - **Durable instances**: state persists through a pluggable repository
//!   so execution survives process restarts
//! - **Suspend/resume**: steps can pause the instance with a prompt and
//!   pick up when external input arrives
//! - **Async steps**: background handlers with progress tracking,
//!   cooperative cancellation and watchdog timeouts
//! - **Reliability**: per-step retry policies with exponential backoff,
//!   jitter and persistent circuit breakers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                          │
//! │   (graph registry, instance lifecycle, listener fan-out)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   per-instance executor                      │
//! │  (input preparation → retry executor → result interpretation)│
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StateRepository                          │
//! │ (instances, retry state, breakers, async tasks, suspensions)│
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use runloom_core::prelude::*;
//!
//! let graph = WorkflowGraph::builder("onboard", 1)
//!     .trigger_tag("signup")
//!     .step(
//!         StepNode::builder("greet")
//!             .initial()
//!             .handler(|input, _ctx| async move { Ok(input) })
//!             .build()?,
//!     )
//!     .build()?;
//!
//! let engine = WorkflowEngine::builder().build();
//! engine.register(graph)?;
//!
//! let handle = engine
//!     .execute("onboard", Some(trigger), ExecuteOptions::new())
//!     .await?;
//! ```

pub mod chat;
pub mod context;
pub mod engine;
pub mod graph;
pub mod instance;
pub mod listener;
pub mod persistence;
pub mod reliability;
pub mod step;
pub mod task;
pub mod value;

/// Prelude for common imports
pub mod prelude {
    pub use crate::chat::{ChatEvent, ChatRole, ChatStore};
    pub use crate::context::{ContextSnapshot, WorkflowContext};
    pub use crate::engine::{
        EngineConfig, EngineError, ExecuteOptions, ExecutionHandle, PersistenceMode, WaitError,
        WorkflowEngine,
    };
    pub use crate::graph::{GraphError, WorkflowGraph};
    pub use crate::instance::{
        FailureKind, InstanceStatus, SuspensionPayload, WorkflowFailure, WorkflowInstance,
    };
    pub use crate::listener::{RetryListener, StepMetrics, WorkflowListener};
    pub use crate::persistence::{MemoryRepository, RepositoryError, StateRepository};
    pub use crate::reliability::{CircuitBreakerConfig, CircuitState, RetryPolicy};
    pub use crate::step::{
        AsyncRequest, OnLimitExceeded, StepError, StepNode, StepResult, SuspendRequest,
    };
    pub use crate::task::{AsyncTaskState, AsyncTaskStatus, ProgressReporter};
    pub use crate::value::{InputType, Payload, TypeTag, TypedValue};
}

// Re-export key types at crate root
pub use chat::{ChatEvent, ChatRole, ChatStore};
pub use context::{ContextSnapshot, WorkflowContext};
pub use engine::{
    EngineConfig, EngineError, ExecuteOptions, ExecutionHandle, PersistenceMode, WaitError,
    WorkflowEngine,
};
pub use graph::{GraphError, RoutingError, WorkflowGraph};
pub use instance::{
    FailureKind, InstanceStatus, SuspensionPayload, WorkflowFailure, WorkflowInstance,
};
pub use listener::{
    ListenerId, MetricsRegistry, RetryListener, StepMetrics, WorkflowListener,
};
pub use persistence::{MemoryRepository, RepositoryError, StateRepository};
pub use reliability::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitSnapshot, CircuitState,
    RetryError, RetryPolicy, RetryState,
};
pub use step::{
    AsyncRequest, IntoStepResult, OnLimitExceeded, StepBuilder, StepError, StepNode, StepResult,
    SuspendRequest,
};
pub use task::{AsyncTaskState, AsyncTaskStatus, ProgressReporter};
pub use value::{InputType, Payload, TypeRegistry, TypeTag, TypedValue};
