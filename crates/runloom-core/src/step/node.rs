//! Step nodes and handler registration
//!
//! A step node is the immutable description of one unit of work: its
//! declared input/output types, retry policy, invocation limit and the
//! handler that runs it. Handlers are registered explicitly as factory
//! closures over boxed futures; there is no runtime reflection.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::context::WorkflowContext;
use crate::graph::GraphError;
use crate::reliability::{CircuitBreakerConfig, RetryPolicy};
use crate::step::result::{IntoStepResult, StepError, StepResult};
use crate::task::ProgressReporter;
use crate::value::{InputType, Payload, TypeTag, TypedValue};

/// Future returned by step handlers
pub type StepFuture = BoxFuture<'static, Result<StepResult, StepError>>;

/// Erased step handler
///
/// The typed registration helpers on [`StepBuilder`] produce these; the
/// executor only ever sees the erased form.
pub type StepFn = Arc<dyn Fn(Option<TypedValue>, Arc<WorkflowContext>) -> StepFuture + Send + Sync>;

/// Erased async step handler: (args, context, progress) → step result
pub type AsyncStepFn =
    Arc<dyn Fn(serde_json::Value, Arc<WorkflowContext>, ProgressReporter) -> StepFuture + Send + Sync>;

/// Predicate deciding whether a routing candidate may receive a payload
pub type RoutePredicate = Arc<dyn Fn(&TypedValue) -> bool + Send + Sync>;

/// What runs when the step executes
#[derive(Clone)]
pub enum StepKind {
    /// An ordinary step body
    Handler(StepFn),

    /// An async task handler, invoked by task-id match rather than routing
    AsyncHandler {
        /// Task-id pattern; exact match or a single trailing `*`
        pattern: String,
        /// The handler body
        handler: AsyncStepFn,
    },
}

/// Behavior when a step exceeds its invocation limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnLimitExceeded {
    /// Fail the instance
    Error,

    /// Finish the instance with the most recent output
    Stop,

    /// Log and keep executing
    Continue,
}

/// Immutable description of one step in a graph
pub struct StepNode {
    pub(crate) id: String,
    pub(crate) description: String,
    pub(crate) input: InputType,
    pub(crate) output: Option<TypeTag>,
    pub(crate) initial: bool,
    pub(crate) kind: StepKind,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) circuit_breaker: Option<CircuitBreakerConfig>,
    pub(crate) invocation_limit: u32,
    pub(crate) on_limit: OnLimitExceeded,
    pub(crate) next: Vec<String>,
    pub(crate) route: Option<RoutePredicate>,
}

impl StepNode {
    /// Start building a step with the given id
    pub fn builder(id: impl Into<String>) -> StepBuilder {
        StepBuilder::new(id)
    }

    /// Step id, unique within its graph
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Declared input type
    pub fn input(&self) -> &InputType {
        &self.input
    }

    /// Declared output tag, if any
    pub fn output(&self) -> Option<&TypeTag> {
        self.output.as_ref()
    }

    /// Whether this is the graph's entry step
    pub fn is_initial(&self) -> bool {
        self.initial
    }

    /// Whether this step is an async task handler
    pub fn is_async_handler(&self) -> bool {
        matches!(self.kind, StepKind::AsyncHandler { .. })
    }

    /// The async task-id pattern, for async handler steps
    pub fn async_pattern(&self) -> Option<&str> {
        match &self.kind {
            StepKind::AsyncHandler { pattern, .. } => Some(pattern),
            StepKind::Handler(_) => None,
        }
    }

    /// Retry policy override, if declared
    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    /// Circuit breaker configuration, if breaking is enabled
    pub fn circuit_breaker(&self) -> Option<&CircuitBreakerConfig> {
        self.circuit_breaker.as_ref()
    }

    /// Maximum invocations per instance
    pub fn invocation_limit(&self) -> u32 {
        self.invocation_limit
    }

    /// Behavior when the invocation limit is exceeded
    pub fn on_limit(&self) -> OnLimitExceeded {
        self.on_limit
    }

    /// Declared successor step ids, in priority order
    pub fn next_steps(&self) -> &[String] {
        &self.next
    }

    /// Whether a payload passes this step's route predicate
    pub fn admits(&self, payload: &TypedValue) -> bool {
        match &self.route {
            Some(predicate) => predicate(payload),
            None => true,
        }
    }

    /// Invoke the step body
    pub fn invoke(&self, input: Option<TypedValue>, ctx: Arc<WorkflowContext>) -> StepFuture {
        match &self.kind {
            StepKind::Handler(handler) => handler(input, ctx),
            StepKind::AsyncHandler { .. } => {
                let id = self.id.clone();
                Box::pin(async move {
                    Err(StepError::non_retryable(format!(
                        "async handler step '{id}' cannot be invoked directly"
                    ))
                    .with_kind("routing"))
                })
            }
        }
    }

    /// Invoke the async handler body
    pub fn invoke_async(
        &self,
        args: serde_json::Value,
        ctx: Arc<WorkflowContext>,
        progress: ProgressReporter,
    ) -> Option<StepFuture> {
        match &self.kind {
            StepKind::AsyncHandler { handler, .. } => Some(handler(args, ctx, progress)),
            StepKind::Handler(_) => None,
        }
    }
}

impl std::fmt::Debug for StepNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepNode")
            .field("id", &self.id)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("initial", &self.initial)
            .field("async_pattern", &self.async_pattern())
            .field("next", &self.next)
            .finish()
    }
}

/// Fluent builder for [`StepNode`]
///
/// # Example
///
/// ```ignore
/// let step = StepNode::builder("greet")
///     .description("Greets the user by name")
///     .initial()
///     .typed_handler(|input: NameInput, _ctx| async move {
///         Ok(TypedValue::of(&Greeting::for_name(&input.name))?)
///     })
///     .build()?;
/// ```
pub struct StepBuilder {
    id: String,
    description: String,
    input: Option<InputType>,
    output: Option<TypeTag>,
    initial: bool,
    kind: Option<StepKind>,
    retry: Option<RetryPolicy>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    invocation_limit: u32,
    on_limit: OnLimitExceeded,
    next: Vec<String>,
    route: Option<RoutePredicate>,
}

impl StepBuilder {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            input: None,
            output: None,
            initial: false,
            kind: None,
            retry: None,
            circuit_breaker: None,
            invocation_limit: 100,
            on_limit: OnLimitExceeded::Error,
            next: Vec::new(),
            route: None,
        }
    }

    /// Set the human-readable description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declare the input type from a [`Payload`]
    pub fn input<P: Payload>(mut self) -> Self {
        self.input = Some(InputType::of::<P>());
        self
    }

    /// Declare the input type by tag
    pub fn input_tag(mut self, tag: impl Into<TypeTag>) -> Self {
        self.input = Some(InputType::Value(tag.into()));
        self
    }

    /// Accept any prior output (explicit opt-in)
    pub fn accepts_any(mut self) -> Self {
        self.input = Some(InputType::AnyValue);
        self
    }

    /// The step reads only the context; no input argument is prepared
    pub fn context_input(mut self) -> Self {
        self.input = Some(InputType::Context);
        self
    }

    /// Declare the output type from a [`Payload`]
    pub fn output<P: Payload>(mut self) -> Self {
        self.output = Some(TypeTag::of::<P>());
        self
    }

    /// Declare the output type by tag
    pub fn output_tag(mut self, tag: impl Into<TypeTag>) -> Self {
        self.output = Some(tag.into());
        self
    }

    /// Mark this step as the graph's entry point
    pub fn initial(mut self) -> Self {
        self.initial = true;
        self
    }

    /// Override the retry policy
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Enable circuit breaking with the given configuration
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Set the per-instance invocation limit
    pub fn invocation_limit(mut self, limit: u32) -> Self {
        self.invocation_limit = limit.max(1);
        self
    }

    /// Set the on-limit behavior
    pub fn on_limit(mut self, behavior: OnLimitExceeded) -> Self {
        self.on_limit = behavior;
        self
    }

    /// Append a declared successor
    pub fn next(mut self, step_id: impl Into<String>) -> Self {
        self.next.push(step_id.into());
        self
    }

    /// Restrict routing into this step to payloads passing the predicate
    pub fn route_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&TypedValue) -> bool + Send + Sync + 'static,
    {
        self.route = Some(Arc::new(predicate));
        self
    }

    /// Register the step body
    ///
    /// The body receives the prepared input (if any) and the context, and
    /// may return anything convertible into a [`StepResult`].
    pub fn handler<F, Fut, R>(mut self, f: F) -> Self
    where
        F: Fn(Option<TypedValue>, Arc<WorkflowContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, StepError>> + Send + 'static,
        R: IntoStepResult + 'static,
    {
        self.kind = Some(StepKind::Handler(Arc::new(move |input, ctx| {
            let fut = f(input, ctx);
            Box::pin(async move { fut.await.map(IntoStepResult::into_step_result) })
        })));
        self
    }

    /// Register a step body taking a decoded, concrete input
    ///
    /// Also declares the input type from `I` unless one was declared
    /// explicitly. The prepared input is structurally converted; a missing
    /// or unconvertible input fails the step with kind `conversion`.
    pub fn typed_handler<I, F, Fut, R>(mut self, f: F) -> Self
    where
        I: Payload,
        F: Fn(I, Arc<WorkflowContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, StepError>> + Send + 'static,
        R: IntoStepResult + 'static,
    {
        if self.input.is_none() {
            self.input = Some(InputType::of::<I>());
        }
        self.kind = Some(StepKind::Handler(Arc::new(move |input, ctx| {
            match decode_input::<I>(input) {
                Ok(typed) => {
                    let fut = f(typed, ctx);
                    Box::pin(async move { fut.await.map(IntoStepResult::into_step_result) })
                }
                Err(error) => Box::pin(std::future::ready(Err(error))),
            }
        })));
        self
    }

    /// Register an async task handler matched by task-id pattern
    ///
    /// The pattern is an exact task id or a prefix with a single trailing
    /// `*`. Async handler steps are never routed to; they run when a step
    /// returns an `Async` result with a matching task id.
    pub fn async_handler<F, Fut, R>(mut self, pattern: impl Into<String>, f: F) -> Self
    where
        F: Fn(serde_json::Value, Arc<WorkflowContext>, ProgressReporter) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<R, StepError>> + Send + 'static,
        R: IntoStepResult + 'static,
    {
        self.kind = Some(StepKind::AsyncHandler {
            pattern: pattern.into(),
            handler: Arc::new(move |args, ctx, progress| {
                let fut = f(args, ctx, progress);
                Box::pin(async move { fut.await.map(IntoStepResult::into_step_result) })
            }),
        });
        self
    }

    /// Finish building the step
    pub fn build(self) -> Result<StepNode, GraphError> {
        let kind = self.kind.ok_or_else(|| GraphError::MissingHandler {
            step_id: self.id.clone(),
        })?;

        Ok(StepNode {
            id: self.id,
            description: self.description,
            input: self.input.unwrap_or(InputType::AnyValue),
            output: self.output,
            initial: self.initial,
            kind,
            retry: self.retry,
            circuit_breaker: self.circuit_breaker,
            invocation_limit: self.invocation_limit,
            on_limit: self.on_limit,
            next: self.next,
            route: self.route,
        })
    }
}

/// Decode a prepared input into a concrete payload type
fn decode_input<I: Payload>(input: Option<TypedValue>) -> Result<I, StepError> {
    let value = input.ok_or_else(|| {
        StepError::non_retryable("step expected an input, but none was prepared")
            .with_kind("conversion")
    })?;
    value.decode().map_err(StepError::from)
}
