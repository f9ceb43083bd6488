//! In-memory implementation of StateRepository for testing

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::instance::{SuspensionPayload, WorkflowInstance};
use crate::reliability::{CircuitSnapshot, RetryState};
use crate::task::AsyncTaskState;

use super::repository::{RepositoryError, StateRepository};

/// In-memory implementation of [`StateRepository`]
///
/// This is primarily for tests. It stores all record families in memory
/// and provides the same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use runloom_core::MemoryRepository;
///
/// let repository = MemoryRepository::new();
/// assert_eq!(repository.instance_count(), 0);
/// ```
#[derive(Default)]
pub struct MemoryRepository {
    instances: RwLock<HashMap<String, WorkflowInstance>>,
    retry_states: RwLock<HashMap<(String, String), RetryState>>,
    breakers: RwLock<HashMap<(String, String), CircuitSnapshot>>,
    async_tasks: RwLock<HashMap<(String, String), AsyncTaskState>>,
    suspensions: RwLock<HashMap<String, SuspensionPayload>>,
}

impl MemoryRepository {
    /// Create a new in-memory repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored instances
    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Number of stored retry states
    pub fn retry_state_count(&self) -> usize {
        self.retry_states.read().len()
    }

    /// Number of stored async task states
    pub fn async_task_count(&self) -> usize {
        self.async_tasks.read().len()
    }

    /// Number of stored suspension payloads
    pub fn suspension_count(&self) -> usize {
        self.suspensions.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.instances.write().clear();
        self.retry_states.write().clear();
        self.breakers.write().clear();
        self.async_tasks.write().clear();
        self.suspensions.write().clear();
    }
}

#[async_trait]
impl StateRepository for MemoryRepository {
    async fn save_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        self.instances
            .write()
            .insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    async fn load_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.instances.read().get(instance_id).cloned())
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<(), RepositoryError> {
        self.instances.write().remove(instance_id);
        Ok(())
    }

    async fn save_retry_state(
        &self,
        instance_id: &str,
        state: &RetryState,
    ) -> Result<(), RepositoryError> {
        self.retry_states.write().insert(
            (instance_id.to_string(), state.step_id.clone()),
            state.clone(),
        );
        Ok(())
    }

    async fn load_retry_state(
        &self,
        instance_id: &str,
        step_id: &str,
    ) -> Result<Option<RetryState>, RepositoryError> {
        Ok(self
            .retry_states
            .read()
            .get(&(instance_id.to_string(), step_id.to_string()))
            .cloned())
    }

    async fn delete_retry_state(
        &self,
        instance_id: &str,
        step_id: &str,
    ) -> Result<(), RepositoryError> {
        self.retry_states
            .write()
            .remove(&(instance_id.to_string(), step_id.to_string()));
        Ok(())
    }

    async fn save_breaker(
        &self,
        graph_id: &str,
        step_id: &str,
        snapshot: &CircuitSnapshot,
    ) -> Result<(), RepositoryError> {
        self.breakers.write().insert(
            (graph_id.to_string(), step_id.to_string()),
            snapshot.clone(),
        );
        Ok(())
    }

    async fn load_breaker(
        &self,
        graph_id: &str,
        step_id: &str,
    ) -> Result<Option<CircuitSnapshot>, RepositoryError> {
        Ok(self
            .breakers
            .read()
            .get(&(graph_id.to_string(), step_id.to_string()))
            .cloned())
    }

    async fn delete_breaker(&self, graph_id: &str, step_id: &str) -> Result<(), RepositoryError> {
        self.breakers
            .write()
            .remove(&(graph_id.to_string(), step_id.to_string()));
        Ok(())
    }

    async fn save_async_task(
        &self,
        instance_id: &str,
        state: &AsyncTaskState,
    ) -> Result<(), RepositoryError> {
        self.async_tasks.write().insert(
            (instance_id.to_string(), state.task_id.clone()),
            state.clone(),
        );
        Ok(())
    }

    async fn load_async_task(
        &self,
        instance_id: &str,
        task_id: &str,
    ) -> Result<Option<AsyncTaskState>, RepositoryError> {
        Ok(self
            .async_tasks
            .read()
            .get(&(instance_id.to_string(), task_id.to_string()))
            .cloned())
    }

    async fn delete_async_task(
        &self,
        instance_id: &str,
        task_id: &str,
    ) -> Result<(), RepositoryError> {
        self.async_tasks
            .write()
            .remove(&(instance_id.to_string(), task_id.to_string()));
        Ok(())
    }

    async fn save_suspension(&self, payload: &SuspensionPayload) -> Result<(), RepositoryError> {
        self.suspensions
            .write()
            .insert(payload.instance_id.clone(), payload.clone());
        Ok(())
    }

    async fn load_suspension(
        &self,
        instance_id: &str,
    ) -> Result<Option<SuspensionPayload>, RepositoryError> {
        Ok(self.suspensions.read().get(instance_id).cloned())
    }

    async fn delete_suspension(&self, instance_id: &str) -> Result<(), RepositoryError> {
        self.suspensions.write().remove(instance_id);
        Ok(())
    }

    async fn delete_all(&self, instance_id: &str) -> Result<(), RepositoryError> {
        self.instances.write().remove(instance_id);
        self.retry_states
            .write()
            .retain(|(id, _), _| id != instance_id);
        self.async_tasks
            .write()
            .retain(|(id, _), _| id != instance_id);
        self.suspensions.write().remove(instance_id);
        Ok(())
    }
}
