//! Per-instance workflow context
//!
//! The context is the mutable state an instance carries between steps:
//! trigger data, step outputs in insertion order, custom user values and
//! a handful of reserved slots (user input, final result, chat binding,
//! invocation counts). It is owned by the executing instance; the engine
//! serializes all mutations, and reads from other threads are safe.

use std::collections::HashMap;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::value::{TypeTag, TypedValue};

/// Serializable snapshot of a context
///
/// This is what the repository persists inside the instance record; a
/// restarted engine rebuilds the live [`WorkflowContext`] from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSnapshot {
    /// Run id (unique per execution)
    pub run_id: Uuid,

    /// Stable external instance id (defaults to the run id)
    pub instance_id: String,

    /// Data the workflow was started with
    pub trigger: Option<TypedValue>,

    /// Step outputs in insertion order, keyed by step id
    pub outputs: IndexMap<String, TypedValue>,

    /// User-scoped custom values
    #[serde(default)]
    pub custom: HashMap<String, serde_json::Value>,

    /// Final result (set once, on completion)
    pub final_result: Option<TypedValue>,

    /// Input supplied on resume, consumed by input preparation
    pub user_input: Option<TypedValue>,

    /// Explicit input for the resumed step, consumed before older outputs
    pub resumed_step_input: Option<TypedValue>,

    /// Chat binding; when set, suspend/finish events go to the chat store
    pub chat_id: Option<String>,

    /// User binding, propagated to observers
    pub user_id: Option<String>,

    /// Per-step invocation counts (survive serialization)
    #[serde(default)]
    pub invocations: HashMap<String, u32>,

    /// Message id of the in-flight async task, if any
    pub async_task: Option<Uuid>,

    /// Step id of the most recent output
    pub last_step_id: Option<String>,
}

impl ContextSnapshot {
    fn new(instance_id: String, trigger: Option<TypedValue>) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            instance_id,
            trigger,
            outputs: IndexMap::new(),
            custom: HashMap::new(),
            final_result: None,
            user_input: None,
            resumed_step_input: None,
            chat_id: None,
            user_id: None,
            invocations: HashMap::new(),
            async_task: None,
            last_step_id: None,
        }
    }
}

/// Thread-safe per-instance key/value store
///
/// Step outputs and custom data are disjoint namespaces; output insertion
/// order is preserved because input preparation scans outputs newest
/// first. Writing a null output deletes the entry.
#[derive(Debug)]
pub struct WorkflowContext {
    inner: RwLock<ContextSnapshot>,
}

impl WorkflowContext {
    /// Create a context for a new execution
    pub fn new(instance_id: impl Into<String>, trigger: Option<TypedValue>) -> Self {
        Self {
            inner: RwLock::new(ContextSnapshot::new(instance_id.into(), trigger)),
        }
    }

    /// Create a context whose instance id is its run id
    pub fn anonymous(trigger: Option<TypedValue>) -> Self {
        let run_id = Uuid::now_v7();
        let mut snapshot = ContextSnapshot::new(run_id.to_string(), trigger);
        snapshot.run_id = run_id;
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    /// Rebuild a context from a persisted snapshot
    pub fn from_snapshot(snapshot: ContextSnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    /// Take a serializable snapshot of the current state
    pub fn snapshot(&self) -> ContextSnapshot {
        self.inner.read().clone()
    }

    /// Run id of this execution
    pub fn run_id(&self) -> Uuid {
        self.inner.read().run_id
    }

    /// Stable external instance id
    pub fn instance_id(&self) -> String {
        self.inner.read().instance_id.clone()
    }

    // =========================================================================
    // Trigger data and step outputs
    // =========================================================================

    /// The trigger data the workflow started with
    pub fn trigger(&self) -> Option<TypedValue> {
        self.inner.read().trigger.clone()
    }

    /// Output of a step, if present
    pub fn output(&self, step_id: &str) -> Option<TypedValue> {
        self.inner.read().outputs.get(step_id).cloned()
    }

    /// Record a step output; `None` or a null payload deletes the entry
    ///
    /// Re-executing a step moves its entry to the end of the insertion
    /// order, keeping "newest first" scans truthful.
    pub fn set_output(&self, step_id: &str, output: Option<TypedValue>) {
        let mut inner = self.inner.write();
        match output {
            Some(value) if !value.is_null() => {
                // shift_remove keeps the remaining entries ordered
                inner.outputs.shift_remove(step_id);
                inner.outputs.insert(step_id.to_string(), value);
                inner.last_step_id = Some(step_id.to_string());
            }
            _ => {
                inner.outputs.shift_remove(step_id);
            }
        }
    }

    /// Step outputs, newest first
    pub fn outputs_newest_first(&self) -> Vec<(String, TypedValue)> {
        self.inner
            .read()
            .outputs
            .iter()
            .rev()
            .map(|(id, value)| (id.clone(), value.clone()))
            .collect()
    }

    /// Step ids with outputs, in insertion order
    pub fn output_order(&self) -> Vec<String> {
        self.inner.read().outputs.keys().cloned().collect()
    }

    /// Step id of the most recent output
    pub fn last_step_id(&self) -> Option<String> {
        self.inner.read().last_step_id.clone()
    }

    // =========================================================================
    // Custom data
    // =========================================================================

    /// Read a custom value
    pub fn custom(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().custom.get(key).cloned()
    }

    /// Read a custom value, structurally converted to a concrete type
    pub fn custom_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.inner.read().custom.get(key).cloned()?;
        serde_json::from_value(value).ok()
    }

    /// Write a custom value
    pub fn set_custom(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.write().custom.insert(key.into(), value);
    }

    /// Remove a custom value
    pub fn remove_custom(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.write().custom.remove(key)
    }

    // =========================================================================
    // Reserved slots
    // =========================================================================

    /// Final result, if the workflow completed
    pub fn final_result(&self) -> Option<TypedValue> {
        self.inner.read().final_result.clone()
    }

    /// Record the final result (set once, on completion)
    pub fn set_final_result(&self, result: TypedValue) {
        self.inner.write().final_result = Some(result);
    }

    /// Peek at pending resume input without consuming it
    pub fn user_input(&self) -> Option<TypedValue> {
        self.inner.read().user_input.clone()
    }

    /// The tag of pending resume input, if any
    pub fn user_input_tag(&self) -> Option<TypeTag> {
        self.inner.read().user_input.as_ref().map(|v| v.tag.clone())
    }

    /// Store resume input for the next input preparation
    pub fn set_user_input(&self, input: TypedValue) {
        self.inner.write().user_input = Some(input);
    }

    /// Consume pending resume input
    pub fn take_user_input(&self) -> Option<TypedValue> {
        self.inner.write().user_input.take()
    }

    /// Peek at the explicit resumed-step input without consuming it
    pub fn resumed_step_input(&self) -> Option<TypedValue> {
        self.inner.read().resumed_step_input.clone()
    }

    /// Store an explicit input for the resumed step
    pub fn set_resumed_step_input(&self, input: TypedValue) {
        self.inner.write().resumed_step_input = Some(input);
    }

    /// Consume the explicit resumed-step input
    pub fn take_resumed_step_input(&self) -> Option<TypedValue> {
        self.inner.write().resumed_step_input.take()
    }

    /// Chat the instance is bound to, if any
    pub fn chat_id(&self) -> Option<String> {
        self.inner.read().chat_id.clone()
    }

    /// Bind the instance to a chat
    pub fn set_chat_id(&self, chat_id: impl Into<String>) {
        self.inner.write().chat_id = Some(chat_id.into());
    }

    /// User the instance is bound to, if any
    pub fn user_id(&self) -> Option<String> {
        self.inner.read().user_id.clone()
    }

    /// Bind the instance to a user
    pub fn set_user_id(&self, user_id: impl Into<String>) {
        self.inner.write().user_id = Some(user_id.into());
    }

    /// Message id of the in-flight async task
    pub fn async_task(&self) -> Option<Uuid> {
        self.inner.read().async_task
    }

    /// Attach or clear the in-flight async task handle
    pub fn set_async_task(&self, message_id: Option<Uuid>) {
        self.inner.write().async_task = message_id;
    }

    // =========================================================================
    // Invocation counts
    // =========================================================================

    /// Increment and return the invocation count for a step
    pub fn record_invocation(&self, step_id: &str) -> u32 {
        let mut inner = self.inner.write();
        let count = inner.invocations.entry(step_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Invocation count for a step
    pub fn invocations(&self, step_id: &str) -> u32 {
        self.inner
            .read()
            .invocations
            .get(step_id)
            .copied()
            .unwrap_or(0)
    }
}
