//! Workflow graphs
//!
//! A graph is the immutable blueprint of a workflow: a named, versioned
//! set of step nodes with exactly one entry step, a type registry for
//! assignability, and the routing rules that pick the next step from a
//! produced payload's type.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::step::StepNode;
use crate::task::pattern_matches;
use crate::value::{Payload, TypeRegistry, TypeTag, TypedValue};

/// Errors from graph construction
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Two steps share an id
    #[error("duplicate step id '{step_id}' in graph '{graph_id}'")]
    DuplicateStep { graph_id: String, step_id: String },

    /// No step is marked initial
    #[error("graph '{graph_id}' has no initial step")]
    NoInitialStep { graph_id: String },

    /// More than one step is marked initial
    #[error("graph '{graph_id}' marks both '{first}' and '{second}' as initial")]
    MultipleInitialSteps {
        graph_id: String,
        first: String,
        second: String,
    },

    /// A declared successor does not exist
    #[error("step '{step_id}' declares unknown next step '{next}'")]
    UnknownNextStep { step_id: String, next: String },

    /// An async task-id pattern is malformed
    #[error("step '{step_id}' has invalid async pattern '{pattern}' (one trailing '*' allowed)")]
    InvalidAsyncPattern { step_id: String, pattern: String },

    /// An async handler step cannot be the entry step
    #[error("async handler step '{step_id}' cannot be marked initial")]
    AsyncHandlerAsInitial { step_id: String },

    /// An async handler step cannot be a routing target
    #[error("step '{step_id}' declares async handler '{next}' as a successor")]
    AsyncHandlerAsSuccessor { step_id: String, next: String },

    /// A step was built without a handler
    #[error("step '{step_id}' has no handler")]
    MissingHandler { step_id: String },
}

/// Routing failure: declared successors rejected the payload
#[derive(Debug, thiserror::Error)]
#[error("no declared successor of step '{step_id}' accepts payload type '{tag}'")]
pub struct RoutingError {
    /// The producing step
    pub step_id: String,

    /// The payload tag that found no taker
    pub tag: TypeTag,
}

/// Immutable workflow definition
///
/// # Example
///
/// ```ignore
/// let graph = WorkflowGraph::builder("onboard", 1)
///     .trigger_tag("signup")
///     .step(collect)?
///     .step(verify)?
///     .step(welcome)?
///     .build()?;
/// ```
pub struct WorkflowGraph {
    id: String,
    version: u32,
    trigger_type: TypeTag,
    result_type: Option<TypeTag>,
    steps: Vec<Arc<StepNode>>,
    index: HashMap<String, usize>,
    types: TypeRegistry,
    initial: usize,
}

impl WorkflowGraph {
    /// Start building a graph
    pub fn builder(id: impl Into<String>, version: u32) -> GraphBuilder {
        GraphBuilder::new(id, version)
    }

    /// Graph id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Graph version
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Type tag of the trigger data
    pub fn trigger_type(&self) -> &TypeTag {
        &self.trigger_type
    }

    /// Type tag of the final result, if declared
    pub fn result_type(&self) -> Option<&TypeTag> {
        self.result_type.as_ref()
    }

    /// The assignability registry
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Look up a step by id
    pub fn step(&self, step_id: &str) -> Option<&Arc<StepNode>> {
        self.index.get(step_id).map(|&i| &self.steps[i])
    }

    /// All steps, in declaration order
    pub fn steps(&self) -> &[Arc<StepNode>] {
        &self.steps
    }

    /// The entry step
    pub fn initial_step(&self) -> &Arc<StepNode> {
        &self.steps[self.initial]
    }

    /// Resolve the next step after `from` produced `payload`
    ///
    /// Declared successors are walked in order and the first whose input
    /// accepts the payload (and whose route predicate admits it) wins.
    /// With no declared successors, steps are scanned in declaration
    /// order, skipping the entry step and async handlers. `Ok(None)`
    /// means no step wants the payload; the executor treats that as
    /// completion. Declared successors that all reject the payload are a
    /// routing error.
    pub fn route_from(
        &self,
        from: &StepNode,
        payload: &TypedValue,
    ) -> Result<Option<Arc<StepNode>>, RoutingError> {
        if !from.next_steps().is_empty() {
            for next_id in from.next_steps() {
                if let Some(candidate) = self.step(next_id) {
                    if self.types.accepts(candidate.input(), &payload.tag)
                        && candidate.admits(payload)
                    {
                        return Ok(Some(candidate.clone()));
                    }
                }
            }
            return Err(RoutingError {
                step_id: from.id().to_string(),
                tag: payload.tag.clone(),
            });
        }

        for candidate in &self.steps {
            if candidate.is_initial() || candidate.is_async_handler() {
                continue;
            }
            if self.types.accepts(candidate.input(), &payload.tag) && candidate.admits(payload) {
                return Ok(Some(candidate.clone()));
            }
        }
        Ok(None)
    }

    /// Find the async handler whose pattern matches a task id
    ///
    /// Handlers are tried in declaration order; the first match wins.
    pub fn find_async_handler(&self, task_id: &str) -> Option<&Arc<StepNode>> {
        self.steps.iter().find(|step| {
            step.async_pattern()
                .is_some_and(|pattern| pattern_matches(pattern, task_id))
        })
    }
}

impl std::fmt::Debug for WorkflowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowGraph")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("steps", &self.steps.iter().map(|s| s.id()).collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`WorkflowGraph`]
pub struct GraphBuilder {
    id: String,
    version: u32,
    trigger_type: Option<TypeTag>,
    result_type: Option<TypeTag>,
    steps: Vec<Arc<StepNode>>,
    types: TypeRegistry,
}

impl GraphBuilder {
    fn new(id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            version,
            trigger_type: None,
            result_type: None,
            steps: Vec::new(),
            types: TypeRegistry::new(),
        }
    }

    /// Declare the trigger data type from a [`Payload`]
    pub fn trigger<P: Payload>(mut self) -> Self {
        self.trigger_type = Some(TypeTag::of::<P>());
        self
    }

    /// Declare the trigger data type by tag
    pub fn trigger_tag(mut self, tag: impl Into<TypeTag>) -> Self {
        self.trigger_type = Some(tag.into());
        self
    }

    /// Declare the final result type from a [`Payload`]
    pub fn result<P: Payload>(mut self) -> Self {
        self.result_type = Some(TypeTag::of::<P>());
        self
    }

    /// Declare the final result type by tag
    pub fn result_tag(mut self, tag: impl Into<TypeTag>) -> Self {
        self.result_type = Some(tag.into());
        self
    }

    /// Record an assignability edge in the graph's type registry
    pub fn assignable(mut self, from: impl Into<TypeTag>, to: impl Into<TypeTag>) -> Self {
        self.types.register_assignable(from, to);
        self
    }

    /// Add a step
    pub fn step(mut self, step: StepNode) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Validate and build the graph
    pub fn build(self) -> Result<WorkflowGraph, GraphError> {
        let mut index = HashMap::new();
        let mut seen = HashSet::new();
        let mut initial: Option<usize> = None;

        for (i, step) in self.steps.iter().enumerate() {
            if !seen.insert(step.id().to_string()) {
                return Err(GraphError::DuplicateStep {
                    graph_id: self.id.clone(),
                    step_id: step.id().to_string(),
                });
            }
            index.insert(step.id().to_string(), i);

            if step.is_initial() {
                if step.is_async_handler() {
                    return Err(GraphError::AsyncHandlerAsInitial {
                        step_id: step.id().to_string(),
                    });
                }
                if let Some(first) = initial {
                    return Err(GraphError::MultipleInitialSteps {
                        graph_id: self.id.clone(),
                        first: self.steps[first].id().to_string(),
                        second: step.id().to_string(),
                    });
                }
                initial = Some(i);
            }

            if let Some(pattern) = step.async_pattern() {
                let wildcards = pattern.matches('*').count();
                let valid = match wildcards {
                    0 => !pattern.is_empty(),
                    1 => pattern.ends_with('*'),
                    _ => false,
                };
                if !valid {
                    return Err(GraphError::InvalidAsyncPattern {
                        step_id: step.id().to_string(),
                        pattern: pattern.to_string(),
                    });
                }
            }
        }

        let initial = initial.ok_or(GraphError::NoInitialStep {
            graph_id: self.id.clone(),
        })?;

        for step in &self.steps {
            for next in step.next_steps() {
                match index.get(next) {
                    None => {
                        return Err(GraphError::UnknownNextStep {
                            step_id: step.id().to_string(),
                            next: next.clone(),
                        })
                    }
                    Some(&i) if self.steps[i].is_async_handler() => {
                        return Err(GraphError::AsyncHandlerAsSuccessor {
                            step_id: step.id().to_string(),
                            next: next.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(WorkflowGraph {
            id: self.id,
            version: self.version,
            trigger_type: self.trigger_type.unwrap_or_else(|| TypeTag::new("trigger")),
            result_type: self.result_type,
            steps: self.steps,
            index,
            types: self.types,
            initial,
        })
    }
}
