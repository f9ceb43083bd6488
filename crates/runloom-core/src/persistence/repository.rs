//! StateRepository trait definition

use async_trait::async_trait;

use crate::instance::{SuspensionPayload, WorkflowInstance};
use crate::reliability::{CircuitSnapshot, RetryState};
use crate::task::AsyncTaskState;

/// Error type for repository operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    /// Underlying store failure
    #[error("database error: {0}")]
    Database(String),

    /// A record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Durable store for engine state
///
/// One record family per domain type, each keyed as listed below.
/// Implementations must be thread-safe and per-key linearizable;
/// at-least-once write delivery is acceptable because the engine's
/// operations are idempotent.
#[async_trait]
pub trait StateRepository: Send + Sync + 'static {
    // =========================================================================
    // Workflow instances (keyed by instance id)
    // =========================================================================

    /// Save or overwrite an instance
    async fn save_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError>;

    /// Load an instance
    async fn load_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<WorkflowInstance>, RepositoryError>;

    /// Delete an instance
    async fn delete_instance(&self, instance_id: &str) -> Result<(), RepositoryError>;

    // =========================================================================
    // Retry state (keyed by instance id + step id)
    // =========================================================================

    /// Save or overwrite retry state for a step
    async fn save_retry_state(
        &self,
        instance_id: &str,
        state: &RetryState,
    ) -> Result<(), RepositoryError>;

    /// Load retry state for a step
    async fn load_retry_state(
        &self,
        instance_id: &str,
        step_id: &str,
    ) -> Result<Option<RetryState>, RepositoryError>;

    /// Delete retry state for a step
    async fn delete_retry_state(
        &self,
        instance_id: &str,
        step_id: &str,
    ) -> Result<(), RepositoryError>;

    // =========================================================================
    // Circuit breaker snapshots (keyed by graph id + step id)
    // =========================================================================

    /// Save or overwrite a breaker snapshot
    async fn save_breaker(
        &self,
        graph_id: &str,
        step_id: &str,
        snapshot: &CircuitSnapshot,
    ) -> Result<(), RepositoryError>;

    /// Load a breaker snapshot
    async fn load_breaker(
        &self,
        graph_id: &str,
        step_id: &str,
    ) -> Result<Option<CircuitSnapshot>, RepositoryError>;

    /// Delete a breaker snapshot
    async fn delete_breaker(&self, graph_id: &str, step_id: &str) -> Result<(), RepositoryError>;

    // =========================================================================
    // Async task state (keyed by instance id + task id)
    // =========================================================================

    /// Save or overwrite async task state
    async fn save_async_task(
        &self,
        instance_id: &str,
        state: &AsyncTaskState,
    ) -> Result<(), RepositoryError>;

    /// Load async task state
    async fn load_async_task(
        &self,
        instance_id: &str,
        task_id: &str,
    ) -> Result<Option<AsyncTaskState>, RepositoryError>;

    /// Delete async task state
    async fn delete_async_task(
        &self,
        instance_id: &str,
        task_id: &str,
    ) -> Result<(), RepositoryError>;

    // =========================================================================
    // Suspension payloads (keyed by instance id)
    // =========================================================================

    /// Save or overwrite a suspension payload
    async fn save_suspension(&self, payload: &SuspensionPayload) -> Result<(), RepositoryError>;

    /// Load the suspension payload of an instance
    async fn load_suspension(
        &self,
        instance_id: &str,
    ) -> Result<Option<SuspensionPayload>, RepositoryError>;

    /// Delete the suspension payload of an instance
    async fn delete_suspension(&self, instance_id: &str) -> Result<(), RepositoryError>;

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Delete all state belonging to an instance
    ///
    /// Used on terminal cleanup for deployments that do not keep an audit
    /// trail. Breaker snapshots are not touched; they belong to the graph.
    async fn delete_all(&self, instance_id: &str) -> Result<(), RepositoryError>;
}
