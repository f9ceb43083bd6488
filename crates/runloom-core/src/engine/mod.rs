//! The workflow engine facade
//!
//! Owns graph registration, instance lifecycle (execute / resume /
//! cancel), listener fan-out and the shared reliability plumbing. Each
//! instance has at most one thread of control at a time; different
//! instances run concurrently on the runtime's worker pool.

mod executor;
mod handle;
mod input;

pub use handle::{ExecutionHandle, WaitError};
pub use input::prepare_input;

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::chat::ChatStore;
use crate::context::WorkflowContext;
use crate::graph::{GraphError, WorkflowGraph};
use crate::instance::{InstanceStatus, WorkflowInstance};
use crate::listener::{
    ListenerId, Listeners, MetricsRegistry, RetryListener, StepMetrics, WorkflowListener,
};
use crate::persistence::{MemoryRepository, RepositoryError, StateRepository};
use crate::reliability::{CircuitBreaker, CircuitBreakerConfig, RetryExecutor, RetryPolicy};
use crate::value::TypedValue;

/// How instance records are written to the repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistenceMode {
    /// Await every write; a failed write aborts the step
    #[default]
    Sync,

    /// Spawn writes; failures are logged, terminal failures surface
    /// through the execution handle
    Async,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Write mode for instance records
    pub persistence_mode: PersistenceMode,

    /// Policy for steps that do not declare one
    pub default_retry_policy: RetryPolicy,

    /// Breaker applied to every step when set; steps may override
    pub default_circuit_breaker: Option<CircuitBreakerConfig>,

    /// Safety valve on steps executed in one run
    pub max_steps_per_run: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            persistence_mode: PersistenceMode::Sync,
            default_retry_policy: RetryPolicy::no_retry(),
            default_circuit_breaker: None,
            max_steps_per_run: 10_000,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence mode
    pub fn with_persistence_mode(mut self, mode: PersistenceMode) -> Self {
        self.persistence_mode = mode;
        self
    }

    /// Set the default retry policy
    pub fn with_default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = policy;
        self
    }

    /// Enable a default circuit breaker for all steps
    pub fn with_default_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.default_circuit_breaker = Some(config);
        self
    }

    /// Set the per-run step budget
    pub fn with_max_steps_per_run(mut self, max: usize) -> Self {
        self.max_steps_per_run = max.max(1);
        self
    }
}

/// Options for starting an execution
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Stable external instance id; defaults to the run id
    pub instance_id: Option<String>,

    /// Bind the instance to a chat; suspend/finish events mirror there
    pub chat_id: Option<String>,

    /// Bind the instance to a user
    pub user_id: Option<String>,
}

impl ExecuteOptions {
    /// Create empty options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the external instance id
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Bind to a chat
    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    /// Bind to a user
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No graph registered under the id
    #[error("graph not found: {graph_id}")]
    GraphNotFound { graph_id: String },

    /// No graph registered under the (id, version) an instance references
    #[error("graph {graph_id} version {version} is not registered")]
    GraphVersionNotFound { graph_id: String, version: u32 },

    /// The (id, version) pair is already registered
    #[error("graph {graph_id} version {version} is already registered")]
    DuplicateGraph { graph_id: String, version: u32 },

    /// No instance with the given id
    #[error("instance not found: {instance_id}")]
    InstanceNotFound { instance_id: String },

    /// An instance with the given id already exists
    #[error("instance already exists: {instance_id}")]
    InstanceExists { instance_id: String },

    /// The operation requires a suspended instance
    #[error("instance {instance_id} is {status}, expected suspended")]
    NotSuspended {
        instance_id: String,
        status: InstanceStatus,
    },

    /// Graph validation failed
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// The repository failed
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Live per-instance state shared between the executor, async tasks and
/// execution handles
pub(crate) struct InstanceCell {
    /// The durable record; its lock serializes all execution entry points
    pub record: tokio::sync::Mutex<WorkflowInstance>,

    /// The live context (internally synchronized)
    pub context: Arc<WorkflowContext>,

    /// Instance-level cooperative cancellation
    pub cancellation: CancellationToken,

    /// Status broadcast for execution handles
    pub status_tx: watch::Sender<InstanceStatus>,

    /// Keeps `status_tx` open even while no `ExecutionHandle` has
    /// subscribed yet; a watch channel with zero receivers is closed,
    /// and closed channels silently drop every subsequent `send`.
    _status_rx_keepalive: watch::Receiver<InstanceStatus>,

    /// Cancellation tokens of in-flight async tasks, by task id
    pub tasks: DashMap<String, CancellationToken>,

    /// Error from a failed attempt to persist terminal state
    pub persist_error: parking_lot::Mutex<Option<String>>,
}

impl InstanceCell {
    fn new(record: WorkflowInstance, context: WorkflowContext) -> Arc<Self> {
        let (status_tx, status_rx) = watch::channel(record.status);
        Arc::new(Self {
            record: tokio::sync::Mutex::new(record),
            context: Arc::new(context),
            cancellation: CancellationToken::new(),
            status_tx,
            _status_rx_keepalive: status_rx,
            tasks: DashMap::new(),
            persist_error: parking_lot::Mutex::new(None),
        })
    }
}

/// State shared by the facade, executors and handles
pub(crate) struct EngineShared {
    pub config: EngineConfig,
    pub repository: Arc<dyn StateRepository>,
    pub chat: Option<Arc<dyn ChatStore>>,
    pub graphs: DashMap<String, BTreeMap<u32, Arc<WorkflowGraph>>>,
    pub cells: DashMap<String, Arc<InstanceCell>>,
    pub breakers: DashMap<(String, String), Arc<CircuitBreaker>>,
    pub workflow_listeners: Arc<Listeners<dyn WorkflowListener>>,
    pub retry_listeners: Arc<Listeners<dyn RetryListener>>,
    pub metrics: Arc<MetricsRegistry>,
    pub retry: RetryExecutor,
}

impl EngineShared {
    /// Latest registered version of a graph
    fn latest_graph(&self, graph_id: &str) -> Result<Arc<WorkflowGraph>, EngineError> {
        self.graphs
            .get(graph_id)
            .and_then(|versions| versions.last_key_value().map(|(_, g)| g.clone()))
            .ok_or_else(|| EngineError::GraphNotFound {
                graph_id: graph_id.to_string(),
            })
    }

    /// Exact (id, version) lookup, used when resuming persisted instances
    fn graph_version(&self, graph_id: &str, version: u32) -> Result<Arc<WorkflowGraph>, EngineError> {
        self.graphs
            .get(graph_id)
            .and_then(|versions| versions.get(&version).cloned())
            .ok_or_else(|| EngineError::GraphVersionNotFound {
                graph_id: graph_id.to_string(),
                version,
            })
    }

    /// The shared breaker for a (graph id, step id), created on first use
    pub(crate) fn breaker(
        &self,
        graph_id: &str,
        step_id: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        self.breakers
            .entry((graph_id.to_string(), step_id.to_string()))
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    graph_id,
                    step_id,
                    config,
                    self.repository.clone(),
                ))
            })
            .clone()
    }

    /// Find the live cell, restoring it from the repository if needed
    async fn cell_or_restore(&self, instance_id: &str) -> Result<Arc<InstanceCell>, EngineError> {
        if let Some(cell) = self.cells.get(instance_id) {
            return Ok(cell.clone());
        }

        let record = self
            .repository
            .load_instance(instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;

        let context = WorkflowContext::from_snapshot(record.context.clone());
        let cell = InstanceCell::new(record, context);
        // A concurrent restore may have won; use whichever cell is in the map
        let cell = self
            .cells
            .entry(instance_id.to_string())
            .or_insert(cell)
            .clone();
        Ok(cell)
    }
}

/// The engine facade
///
/// # Example
///
/// ```ignore
/// let engine = WorkflowEngine::builder().build();
/// engine.register(graph)?;
///
/// let handle = engine
///     .execute("onboard", Some(trigger), ExecuteOptions::new())
///     .await?;
/// handle.wait_for_terminal(Duration::from_secs(5)).await?;
/// ```
#[derive(Clone)]
pub struct WorkflowEngine {
    shared: Arc<EngineShared>,
}

/// Builder for [`WorkflowEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    repository: Option<Arc<dyn StateRepository>>,
    chat: Option<Arc<dyn ChatStore>>,
}

impl EngineBuilder {
    /// Set the engine configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use the given state repository (defaults to the in-memory one)
    pub fn repository(mut self, repository: Arc<dyn StateRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Attach a chat store collaborator
    pub fn chat_store(mut self, chat: Arc<dyn ChatStore>) -> Self {
        self.chat = Some(chat);
        self
    }

    /// Build the engine
    pub fn build(self) -> WorkflowEngine {
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(MemoryRepository::new()));
        let workflow_listeners: Arc<Listeners<dyn WorkflowListener>> = Arc::new(Listeners::new());
        let retry_listeners: Arc<Listeners<dyn RetryListener>> = Arc::new(Listeners::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let retry = RetryExecutor::new(
            repository.clone(),
            retry_listeners.clone(),
            metrics.clone(),
        );

        WorkflowEngine {
            shared: Arc::new(EngineShared {
                config: self.config,
                repository,
                chat: self.chat,
                graphs: DashMap::new(),
                cells: DashMap::new(),
                breakers: DashMap::new(),
                workflow_listeners,
                retry_listeners,
                metrics,
                retry,
            }),
        }
    }
}

impl WorkflowEngine {
    /// Start building an engine
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            repository: None,
            chat: None,
        }
    }

    /// Register a graph; duplicate (id, version) pairs are rejected
    pub fn register(&self, graph: WorkflowGraph) -> Result<(), EngineError> {
        let mut versions = self.shared.graphs.entry(graph.id().to_string()).or_default();
        if versions.contains_key(&graph.version()) {
            return Err(EngineError::DuplicateGraph {
                graph_id: graph.id().to_string(),
                version: graph.version(),
            });
        }
        info!(graph_id = graph.id(), version = graph.version(), "registered graph");
        versions.insert(graph.version(), Arc::new(graph));
        Ok(())
    }

    /// Start a new instance and run it to its first yield point
    ///
    /// Returns once the instance suspends, hands off to an async task, or
    /// terminates; the handle reports which.
    #[instrument(skip(self, trigger, options))]
    pub async fn execute(
        &self,
        graph_id: &str,
        trigger: Option<TypedValue>,
        options: ExecuteOptions,
    ) -> Result<ExecutionHandle, EngineError> {
        let graph = self.shared.latest_graph(graph_id)?;

        let context = match &options.instance_id {
            Some(id) => WorkflowContext::new(id.clone(), trigger),
            None => WorkflowContext::anonymous(trigger),
        };
        let instance_id = context.instance_id();

        if self.shared.cells.contains_key(&instance_id)
            || self
                .shared
                .repository
                .load_instance(&instance_id)
                .await?
                .is_some()
        {
            return Err(EngineError::InstanceExists { instance_id });
        }

        if let Some(chat_id) = &options.chat_id {
            context.set_chat_id(chat_id.clone());
        }
        if let Some(user_id) = &options.user_id {
            context.set_user_id(user_id.clone());
        }

        let record = WorkflowInstance::new(graph.id(), graph.version(), context.snapshot());
        let cell = InstanceCell::new(record, context);
        self.shared.cells.insert(instance_id.clone(), cell.clone());

        {
            let mut record = cell.record.lock().await;
            executor::persist(&self.shared, &cell, &mut record, false).await?;
            self.shared
                .workflow_listeners
                .notify(|l| l.on_started(&instance_id, graph.id()));
            executor::set_status(&cell, &mut record, InstanceStatus::Running);
        }

        info!(%instance_id, graph_id = graph.id(), "executing instance");
        executor::run(self.shared.clone(), cell.clone(), graph, None).await;

        Ok(self.handle_for(instance_id, cell))
    }

    /// Resume a suspended instance with user input
    ///
    /// Writes the input under the reserved keys, clears the suspension,
    /// emits the user chat event and re-enters the executor at the step
    /// that suspended.
    #[instrument(skip(self, user_input))]
    pub async fn resume(
        &self,
        instance_id: &str,
        user_input: TypedValue,
    ) -> Result<ExecutionHandle, EngineError> {
        let cell = self.shared.cell_or_restore(instance_id).await?;

        let graph = {
            let mut record = cell.record.lock().await;
            if record.status != InstanceStatus::Suspended {
                return Err(EngineError::NotSuspended {
                    instance_id: instance_id.to_string(),
                    status: record.status,
                });
            }
            let graph = self
                .shared
                .graph_version(&record.graph_id, record.graph_version)?;

            cell.context.set_user_input(user_input.clone());
            record.suspended_step = None;
            self.shared.repository.delete_suspension(instance_id).await?;
            executor::set_status(&cell, &mut record, InstanceStatus::Running);
            executor::persist(&self.shared, &cell, &mut record, false).await?;

            // The user's reply reaches the chat before the executor runs
            executor::emit_chat_user(&self.shared, &cell.context, &user_input).await;
            self.shared
                .workflow_listeners
                .notify(|l| l.on_resumed(instance_id));
            graph
        };

        info!(%instance_id, "resuming instance");
        executor::run(self.shared.clone(), cell.clone(), graph, None).await;

        Ok(self.handle_for(instance_id.to_string(), cell))
    }

    /// Cancel an instance
    ///
    /// Cooperative: sets the cancellation flag, wakes any retry-delay
    /// sleep, cancels in-flight async tasks, and refuses future resumes.
    /// Cancelling a terminal instance is a no-op.
    #[instrument(skip(self))]
    pub async fn cancel(&self, instance_id: &str) -> Result<(), EngineError> {
        let cell = self.shared.cell_or_restore(instance_id).await?;

        cell.cancellation.cancel();
        for entry in cell.tasks.iter() {
            entry.value().cancel();
        }

        // Waits for the current step to give up control
        let mut record = cell.record.lock().await;
        executor::cancel_locked(&self.shared, &cell, &mut record).await;
        Ok(())
    }

    /// Observational snapshot of an instance
    pub async fn get_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<WorkflowInstance>, EngineError> {
        if let Some(cell) = self.shared.cells.get(instance_id) {
            let cell = cell.clone();
            let mut record = cell.record.lock().await.clone();
            record.context = cell.context.snapshot();
            return Ok(Some(record));
        }
        Ok(self.shared.repository.load_instance(instance_id).await?)
    }

    /// Handle for an already-running instance
    pub fn handle(&self, instance_id: &str) -> Option<ExecutionHandle> {
        let cell = self.shared.cells.get(instance_id)?.clone();
        Some(self.handle_for(instance_id.to_string(), cell))
    }

    /// Register a workflow lifecycle listener
    pub fn add_listener(&self, listener: Arc<dyn WorkflowListener>) -> ListenerId {
        self.shared.workflow_listeners.add(listener)
    }

    /// Remove a workflow lifecycle listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.workflow_listeners.remove(id)
    }

    /// Register a retry listener
    pub fn add_retry_listener(&self, listener: Arc<dyn RetryListener>) -> ListenerId {
        self.shared.retry_listeners.add(listener)
    }

    /// Remove a retry listener
    pub fn remove_retry_listener(&self, id: ListenerId) -> bool {
        self.shared.retry_listeners.remove(id)
    }

    /// Metrics for one (graph id, step id)
    pub fn step_metrics(&self, graph_id: &str, step_id: &str) -> StepMetrics {
        self.shared.metrics.snapshot(graph_id, step_id)
    }

    fn handle_for(&self, instance_id: String, cell: Arc<InstanceCell>) -> ExecutionHandle {
        ExecutionHandle {
            instance_id,
            status_rx: cell.status_tx.subscribe(),
            cell,
            shared: self.shared.clone(),
        }
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("graphs", &self.shared.graphs.len())
            .field("instances", &self.shared.cells.len())
            .finish()
    }
}
