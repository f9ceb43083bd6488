//! Execution handles
//!
//! An [`ExecutionHandle`] is what callers hold after `execute` or
//! `resume`: status polling, a blocking wait for a terminal status, and
//! access to the final result or failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::instance::{InstanceStatus, SuspensionPayload, WorkflowFailure};
use crate::value::TypedValue;

use super::{EngineError, EngineShared, InstanceCell};

/// Error from waiting on an execution handle
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The instance did not reach a terminal status in time
    #[error("timed out waiting for a terminal status")]
    Timeout,

    /// The engine went away while waiting
    #[error("engine shut down while waiting")]
    Closed,
}

/// Caller-side view of one workflow execution
#[derive(Clone)]
pub struct ExecutionHandle {
    pub(crate) instance_id: String,
    pub(crate) status_rx: watch::Receiver<InstanceStatus>,
    pub(crate) cell: Arc<InstanceCell>,
    pub(crate) shared: Arc<EngineShared>,
}

impl ExecutionHandle {
    /// The instance this handle observes
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Current status
    pub fn status(&self) -> InstanceStatus {
        *self.status_rx.borrow()
    }

    /// Wait until the instance reaches a terminal status
    pub async fn wait_for_terminal(&self, timeout: Duration) -> Result<InstanceStatus, WaitError> {
        let mut rx = self.status_rx.clone();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let current = *rx.borrow_and_update();
            if current.is_terminal() {
                return Ok(current);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::Closed),
                Err(_) => return Err(WaitError::Timeout),
            }
        }
    }

    /// The final result, if the instance completed
    pub fn final_result(&self) -> Option<TypedValue> {
        self.cell.context.final_result()
    }

    /// The failure, if the instance failed
    pub async fn failure(&self) -> Option<WorkflowFailure> {
        self.cell.record.lock().await.failure.clone()
    }

    /// The outstanding suspension payload, if the instance is suspended
    pub async fn suspension(&self) -> Result<Option<SuspensionPayload>, EngineError> {
        Ok(self
            .shared
            .repository
            .load_suspension(&self.instance_id)
            .await?)
    }

    /// Error from a failed attempt to persist terminal state, if any
    pub fn persist_error(&self) -> Option<String> {
        self.cell.persist_error.lock().clone()
    }
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("instance_id", &self.instance_id)
            .field("status", &self.status())
            .finish()
    }
}
