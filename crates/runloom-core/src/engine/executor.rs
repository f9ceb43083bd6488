//! The per-instance executor loop
//!
//! Drives one instance: prepares inputs, runs steps through the retry
//! executor, interprets step results, persists after every step and
//! yields on suspension, async hand-off or a terminal status. Entered on
//! `execute`, on `resume`, and on async task completion; the instance
//! record lock serializes all three.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::ChatEvent;
use crate::context::WorkflowContext;
use crate::graph::WorkflowGraph;
use crate::instance::{
    FailureKind, InstanceStatus, SuspensionPayload, WorkflowFailure, WorkflowInstance,
};
use crate::persistence::RepositoryError;
use crate::reliability::{RetryError, RetryRequest};
use crate::step::{AsyncRequest, OnLimitExceeded, StepError, StepNode, StepResult};
use crate::task::{AsyncTaskState, ProgressReporter};
use crate::value::TypedValue;

use super::input::prepare_input;
use super::{EngineShared, InstanceCell, PersistenceMode};

/// Drive an instance until it yields or terminates
///
/// `pending` carries an async handler's result back into interpretation;
/// a fresh entry starts at the current (or initial) step instead.
pub(crate) async fn run(
    shared: Arc<EngineShared>,
    cell: Arc<InstanceCell>,
    graph: Arc<WorkflowGraph>,
    mut pending: Option<(Arc<StepNode>, StepResult)>,
) {
    let mut record = cell.record.lock().await;
    if record.status.is_terminal() {
        return;
    }

    let ctx = cell.context.clone();
    let mut steps_run = 0usize;

    loop {
        if cell.cancellation.is_cancelled() {
            cancel_locked(&shared, &cell, &mut record).await;
            return;
        }

        let (step, result) = match pending.take() {
            Some((step, result)) => {
                // Re-entry with an async handler's result: interpret it as
                // if the handler step had just returned it.
                record.current_step = Some(step.id().to_string());
                record.async_task = None;
                ctx.set_async_task(None);
                (step, result)
            }
            None => {
                let step = match record.current_step.as_deref().and_then(|id| graph.step(id)) {
                    Some(step) => step.clone(),
                    None => graph.initial_step().clone(),
                };
                record.current_step = Some(step.id().to_string());

                steps_run += 1;
                if steps_run > shared.config.max_steps_per_run {
                    let failure = WorkflowFailure::new(
                        FailureKind::InvocationLimit,
                        format!(
                            "run exceeded the step budget of {}",
                            shared.config.max_steps_per_run
                        ),
                    )
                    .at_step(step.id());
                    fail_instance(&shared, &cell, &mut record, failure).await;
                    return;
                }

                // Check the limit before counting so the recorded count
                // never exceeds it for the error/stop behaviors
                let invocations = ctx.invocations(step.id()) + 1;
                if invocations > step.invocation_limit() {
                    match step.on_limit() {
                        OnLimitExceeded::Error => {
                            let failure = WorkflowFailure::new(
                                FailureKind::InvocationLimit,
                                format!(
                                    "step reached its invocation limit of {}",
                                    step.invocation_limit()
                                ),
                            )
                            .at_step(step.id())
                            .with_attempts(invocations - 1);
                            fail_instance(&shared, &cell, &mut record, failure).await;
                            return;
                        }
                        OnLimitExceeded::Stop => {
                            let result = most_recent_output(&ctx, step.id());
                            complete_instance(&shared, &cell, &mut record, result).await;
                            return;
                        }
                        OnLimitExceeded::Continue => {
                            warn!(
                                instance_id = %record.instance_id,
                                step_id = step.id(),
                                invocations,
                                "invocation limit exceeded, continuing"
                            );
                        }
                    }
                }
                ctx.record_invocation(step.id());

                let input = prepare_input(&graph, &step, &ctx);
                let policy = step
                    .retry()
                    .cloned()
                    .unwrap_or_else(|| shared.config.default_retry_policy.clone());
                let breaker_config = step
                    .circuit_breaker()
                    .cloned()
                    .or_else(|| shared.config.default_circuit_breaker.clone());
                let breaker =
                    breaker_config.map(|config| shared.breaker(graph.id(), step.id(), config));

                let request = RetryRequest {
                    graph_id: graph.id(),
                    instance_id: &record.instance_id,
                    step_id: step.id(),
                    policy: &policy,
                    breaker: breaker.as_deref(),
                    cancellation: &cell.cancellation,
                };

                debug!(
                    instance_id = %record.instance_id,
                    step_id = step.id(),
                    "executing step"
                );

                let invoke_step = step.clone();
                let invoke_ctx = ctx.clone();
                let outcome = shared
                    .retry
                    .execute(request, || {
                        invoke_step.invoke(input.clone(), invoke_ctx.clone())
                    })
                    .await;

                let result = match outcome {
                    Ok(result) => result,
                    Err(RetryError::Cancelled { .. }) => {
                        cancel_locked(&shared, &cell, &mut record).await;
                        return;
                    }
                    Err(error) => {
                        let failure = failure_from_retry_error(error);
                        fail_instance(&shared, &cell, &mut record, failure).await;
                        return;
                    }
                };
                (step, result)
            }
        };

        if cell.cancellation.is_cancelled() {
            // A body that ignored cancellation ran to completion; its
            // result is discarded.
            cancel_locked(&shared, &cell, &mut record).await;
            return;
        }

        shared
            .workflow_listeners
            .notify(|l| l.on_step_completed(&record.instance_id, step.id(), &result));

        match result {
            StepResult::Continue { payload } => {
                ctx.set_output(step.id(), payload.clone());
                // Continue with no payload routes on the trigger data
                let routing_payload = payload.clone().or_else(|| ctx.trigger());
                let Some(routing_payload) = routing_payload else {
                    complete_instance(&shared, &cell, &mut record, TypedValue::null()).await;
                    return;
                };
                match advance(
                    &shared,
                    &cell,
                    &mut record,
                    &graph,
                    &step,
                    &routing_payload,
                )
                .await
                {
                    Advance::Continued => {}
                    Advance::Finished => {
                        let result = payload.unwrap_or_else(TypedValue::null);
                        complete_instance(&shared, &cell, &mut record, result).await;
                        return;
                    }
                    Advance::Stopped => return,
                }
            }

            StepResult::Branch { payload } => {
                ctx.set_output(step.id(), Some(payload.clone()));
                match advance(&shared, &cell, &mut record, &graph, &step, &payload).await {
                    Advance::Continued => {}
                    Advance::Finished => {
                        complete_instance(&shared, &cell, &mut record, payload).await;
                        return;
                    }
                    Advance::Stopped => return,
                }
            }

            StepResult::Suspend(request) => {
                let suspension = SuspensionPayload {
                    instance_id: record.instance_id.clone(),
                    step_id: step.id().to_string(),
                    prompt: request.prompt,
                    expected_input: request.expected_input,
                    metadata: request.metadata,
                };
                // A suspended instance must have a resolvable payload, so
                // this write is synchronous regardless of persistence mode.
                if let Err(error) = shared.repository.save_suspension(&suspension).await {
                    let failure = repository_failure(step.id(), &error);
                    fail_instance(&shared, &cell, &mut record, failure).await;
                    return;
                }
                record.suspended_step = Some(step.id().to_string());
                set_status(&cell, &mut record, InstanceStatus::Suspended);
                if let Err(error) = persist(&shared, &cell, &mut record, false).await {
                    let failure = repository_failure(step.id(), &error);
                    fail_instance(&shared, &cell, &mut record, failure).await;
                    return;
                }

                info!(
                    instance_id = %record.instance_id,
                    step_id = step.id(),
                    "instance suspended awaiting input"
                );
                emit_chat_assistant(
                    &shared,
                    &ctx,
                    suspension.prompt.clone(),
                    schema_of(&suspension.metadata),
                )
                .await;
                shared
                    .workflow_listeners
                    .notify(|l| l.on_suspended(&record.instance_id, &suspension));
                return;
            }

            StepResult::Async(request) => {
                let Some(handler) = graph.find_async_handler(&request.task_id).cloned() else {
                    let failure = WorkflowFailure::new(
                        FailureKind::Routing,
                        format!("no async handler matches task id '{}'", request.task_id),
                    )
                    .at_step(step.id());
                    fail_instance(&shared, &cell, &mut record, failure).await;
                    return;
                };

                let task_state = AsyncTaskState::started(
                    record.instance_id.clone(),
                    request.task_id.clone(),
                    request.immediate.clone(),
                );
                if let Err(error) = shared
                    .repository
                    .save_async_task(&record.instance_id, &task_state)
                    .await
                {
                    let failure = repository_failure(step.id(), &error);
                    fail_instance(&shared, &cell, &mut record, failure).await;
                    return;
                }

                ctx.set_async_task(Some(task_state.message_id));
                ctx.set_output(step.id(), request.immediate.clone());
                record.async_task = Some(request.task_id.clone());
                if let Err(error) = persist(&shared, &cell, &mut record, false).await {
                    let failure = repository_failure(step.id(), &error);
                    fail_instance(&shared, &cell, &mut record, failure).await;
                    return;
                }

                info!(
                    instance_id = %record.instance_id,
                    step_id = step.id(),
                    task_id = %request.task_id,
                    handler = handler.id(),
                    "async task started"
                );
                spawn_async_task(
                    shared.clone(),
                    cell.clone(),
                    graph.clone(),
                    handler,
                    request,
                    task_state,
                );
                return;
            }

            StepResult::Finish { result } => {
                complete_instance(&shared, &cell, &mut record, result).await;
                return;
            }

            StepResult::Fail { error } => {
                let failure = WorkflowFailure::new(FailureKind::StepFailed, error.message.clone())
                    .at_step(step.id())
                    .with_attempts(1)
                    .with_cause(error.to_string());
                fail_instance(&shared, &cell, &mut record, failure).await;
                return;
            }
        }
    }
}

/// Result of routing after Continue/Branch
enum Advance {
    /// Moved to the next step; keep looping
    Continued,

    /// No step wants the payload; finish with it
    Finished,

    /// The instance failed while advancing
    Stopped,
}

async fn advance(
    shared: &Arc<EngineShared>,
    cell: &Arc<InstanceCell>,
    record: &mut WorkflowInstance,
    graph: &Arc<WorkflowGraph>,
    step: &Arc<StepNode>,
    payload: &TypedValue,
) -> Advance {
    match graph.route_from(step, payload) {
        Ok(Some(next)) => {
            debug!(
                instance_id = %record.instance_id,
                from = step.id(),
                to = next.id(),
                tag = %payload.tag,
                "routing to next step"
            );
            record.current_step = Some(next.id().to_string());
            match persist(shared, cell, record, false).await {
                Ok(()) => Advance::Continued,
                Err(error) => {
                    let failure = repository_failure(step.id(), &error);
                    fail_instance(shared, cell, record, failure).await;
                    Advance::Stopped
                }
            }
        }
        Ok(None) => Advance::Finished,
        Err(routing_error) => {
            let failure = WorkflowFailure::new(FailureKind::Routing, routing_error.to_string())
                .at_step(step.id());
            fail_instance(shared, cell, record, failure).await;
            Advance::Stopped
        }
    }
}

/// Launch the async handler with its watchdog and completion re-entry
fn spawn_async_task(
    shared: Arc<EngineShared>,
    cell: Arc<InstanceCell>,
    graph: Arc<WorkflowGraph>,
    handler: Arc<StepNode>,
    request: AsyncRequest,
    task_state: AsyncTaskState,
) {
    let token = CancellationToken::new();
    cell.tasks.insert(request.task_id.clone(), token.clone());

    let state = Arc::new(Mutex::new(task_state));
    let reporter = ProgressReporter::new(state.clone(), shared.repository.clone(), token.clone());

    tokio::spawn(async move {
        enum Outcome {
            Finished(Result<StepResult, StepError>),
            TimedOut,
            Cancelled,
        }

        let handler_fut = match handler.invoke_async(request.args.clone(), cell.context.clone(), reporter)
        {
            Some(fut) => fut,
            None => {
                // Graph validation keeps handler kinds consistent; treat a
                // mismatch as a failed task.
                Box::pin(std::future::ready(Err(StepError::non_retryable(
                    "async handler step has no async body",
                ))))
            }
        };

        let watchdog = async {
            match request.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            result = handler_fut => Outcome::Finished(result),
            _ = watchdog => Outcome::TimedOut,
            _ = token.cancelled() => Outcome::Cancelled,
        };

        cell.tasks.remove(&request.task_id);

        let fed_result = match outcome {
            Outcome::Finished(Ok(result)) => {
                let snapshot = {
                    let mut state = state.lock();
                    state.complete(result.clone());
                    state.clone()
                };
                save_task_state(&shared, &snapshot).await;
                Some(result)
            }
            Outcome::Finished(Err(error)) => {
                let snapshot = {
                    let mut state = state.lock();
                    state.fail(error.message.clone());
                    state.clone()
                };
                save_task_state(&shared, &snapshot).await;
                Some(StepResult::Fail { error })
            }
            Outcome::TimedOut => {
                token.cancel();
                let snapshot = {
                    let mut state = state.lock();
                    state.cancel();
                    state.clone()
                };
                save_task_state(&shared, &snapshot).await;
                warn!(
                    instance_id = %snapshot.instance_id,
                    task_id = %snapshot.task_id,
                    "async task timed out"
                );
                Some(StepResult::Fail {
                    error: StepError::non_retryable("async task timed out").with_kind("timeout"),
                })
            }
            Outcome::Cancelled => {
                let snapshot = {
                    let mut state = state.lock();
                    state.cancel();
                    state.clone()
                };
                save_task_state(&shared, &snapshot).await;
                None
            }
        };

        if let Some(result) = fed_result {
            reenter(shared, cell, graph, handler, result).await;
        }
    });
}

/// Boxed re-entry into the executor loop
///
/// The completion path would otherwise make `run`'s future type refer to
/// itself through the spawned task.
fn reenter(
    shared: Arc<EngineShared>,
    cell: Arc<InstanceCell>,
    graph: Arc<WorkflowGraph>,
    handler: Arc<StepNode>,
    result: StepResult,
) -> futures::future::BoxFuture<'static, ()> {
    Box::pin(run(shared, cell, graph, Some((handler, result))))
}

async fn save_task_state(shared: &Arc<EngineShared>, state: &AsyncTaskState) {
    if let Err(error) = shared
        .repository
        .save_async_task(&state.instance_id, state)
        .await
    {
        warn!(
            instance_id = %state.instance_id,
            task_id = %state.task_id,
            %error,
            "failed to persist async task state"
        );
    }
}

/// Flip the live status and the watch channel together
pub(crate) fn set_status(
    cell: &Arc<InstanceCell>,
    record: &mut WorkflowInstance,
    status: InstanceStatus,
) {
    record.transition(status);
    let _ = cell.status_tx.send(status);
}

/// Persist the instance record, honoring the persistence mode
///
/// Terminal writes that fail leave the error on the cell so the
/// execution handle can surface it.
pub(crate) async fn persist(
    shared: &Arc<EngineShared>,
    cell: &Arc<InstanceCell>,
    record: &mut WorkflowInstance,
    terminal: bool,
) -> Result<(), RepositoryError> {
    record.context = cell.context.snapshot();
    record.updated_at = Utc::now();

    match shared.config.persistence_mode {
        PersistenceMode::Sync => match shared.repository.save_instance(record).await {
            Ok(()) => Ok(()),
            Err(error) => {
                if terminal {
                    *cell.persist_error.lock() = Some(error.to_string());
                }
                Err(error)
            }
        },
        PersistenceMode::Async => {
            let snapshot = record.clone();
            let repository = shared.repository.clone();
            let cell = cell.clone();
            tokio::spawn(async move {
                if let Err(error) = repository.save_instance(&snapshot).await {
                    warn!(
                        instance_id = %snapshot.instance_id,
                        %error,
                        "asynchronous persistence failed"
                    );
                    if terminal {
                        *cell.persist_error.lock() = Some(error.to_string());
                    }
                }
            });
            Ok(())
        }
    }
}

pub(crate) async fn complete_instance(
    shared: &Arc<EngineShared>,
    cell: &Arc<InstanceCell>,
    record: &mut WorkflowInstance,
    result: TypedValue,
) {
    cell.context.set_final_result(result.clone());
    record.suspended_step = None;
    record.async_task = None;
    set_status(cell, record, InstanceStatus::Completed);
    if let Err(error) = persist(shared, cell, record, true).await {
        warn!(instance_id = %record.instance_id, %error, "failed to persist completed instance");
    }
    let _ = shared.repository.delete_suspension(&record.instance_id).await;

    info!(instance_id = %record.instance_id, "instance completed");
    emit_chat_assistant(shared, &cell.context, result.value.clone(), None).await;
    shared
        .workflow_listeners
        .notify(|l| l.on_completed(&record.instance_id, &result));
}

pub(crate) async fn fail_instance(
    shared: &Arc<EngineShared>,
    cell: &Arc<InstanceCell>,
    record: &mut WorkflowInstance,
    failure: WorkflowFailure,
) {
    warn!(
        instance_id = %record.instance_id,
        kind = %failure.kind,
        message = %failure.message,
        "instance failed"
    );
    record.failure = Some(failure.clone());
    set_status(cell, record, InstanceStatus::Failed);
    if let Err(error) = persist(shared, cell, record, true).await {
        warn!(instance_id = %record.instance_id, %error, "failed to persist failed instance");
    }
    shared
        .workflow_listeners
        .notify(|l| l.on_failed(&record.instance_id, &failure));
}

/// Mark the instance cancelled; never a failure
pub(crate) async fn cancel_locked(
    shared: &Arc<EngineShared>,
    cell: &Arc<InstanceCell>,
    record: &mut WorkflowInstance,
) {
    if record.status.is_terminal() {
        return;
    }

    for entry in cell.tasks.iter() {
        entry.value().cancel();
    }

    if let Some(task_id) = record.async_task.clone() {
        if let Ok(Some(mut state)) = shared
            .repository
            .load_async_task(&record.instance_id, &task_id)
            .await
        {
            if !state.is_finished() {
                state.cancel();
                save_task_state(shared, &state).await;
            }
        }
    }

    record.suspended_step = None;
    let _ = shared.repository.delete_suspension(&record.instance_id).await;
    set_status(cell, record, InstanceStatus::Cancelled);
    if let Err(error) = persist(shared, cell, record, true).await {
        warn!(instance_id = %record.instance_id, %error, "failed to persist cancelled instance");
    }
    info!(instance_id = %record.instance_id, "instance cancelled");
}

/// The value a `stop` invocation limit finishes with
fn most_recent_output(ctx: &WorkflowContext, step_id: &str) -> TypedValue {
    if let Some(own) = ctx.output(step_id) {
        return own;
    }
    if let Some((_, newest)) = ctx.outputs_newest_first().into_iter().next() {
        return newest;
    }
    ctx.trigger().unwrap_or_else(TypedValue::null)
}

fn failure_from_retry_error(error: RetryError) -> WorkflowFailure {
    match error {
        RetryError::CircuitOpen {
            step_id,
            last_error,
        } => {
            let mut failure =
                WorkflowFailure::new(FailureKind::CircuitOpen, "circuit breaker open")
                    .at_step(step_id);
            if let Some(cause) = last_error {
                failure = failure.with_cause(cause);
            }
            failure
        }
        RetryError::Exhausted {
            step_id,
            attempts,
            source,
        } => WorkflowFailure::new(
            FailureKind::RetryExhausted,
            format!("retry attempts exhausted: {source}"),
        )
        .at_step(step_id)
        .with_attempts(attempts)
        .with_cause(source.message),
        RetryError::Aborted {
            step_id,
            attempts,
            source,
        } => WorkflowFailure::new(FailureKind::RetryAborted, format!("retry aborted: {source}"))
            .at_step(step_id)
            .with_attempts(attempts)
            .with_cause(source.message),
        RetryError::Repository(error) => {
            WorkflowFailure::new(FailureKind::Repository, error.to_string())
        }
        RetryError::Cancelled { step_id } => {
            // Handled before mapping; kept total for completeness
            WorkflowFailure::new(FailureKind::StepFailed, "cancelled").at_step(step_id)
        }
    }
}

fn repository_failure(step_id: &str, error: &RepositoryError) -> WorkflowFailure {
    WorkflowFailure::new(FailureKind::Repository, error.to_string()).at_step(step_id)
}

fn schema_of(metadata: &serde_json::Map<String, serde_json::Value>) -> Option<String> {
    metadata
        .get("schema_name")
        .and_then(|value| value.as_str())
        .map(String::from)
}

/// Mirror an engine-produced payload into the bound chat, if any
pub(crate) async fn emit_chat_assistant(
    shared: &Arc<EngineShared>,
    ctx: &Arc<WorkflowContext>,
    payload: serde_json::Value,
    schema: Option<String>,
) {
    let Some(chat) = &shared.chat else { return };
    let Some(chat_id) = ctx.chat_id() else { return };

    let event = ChatEvent::assistant(chat_id, payload)
        .with_user(ctx.user_id())
        .with_schema(schema);
    if let Err(error) = chat.append(event).await {
        warn!(%error, "chat store append failed");
    }
}

/// Mirror resume input into the bound chat, if any
pub(crate) async fn emit_chat_user(
    shared: &Arc<EngineShared>,
    ctx: &Arc<WorkflowContext>,
    input: &TypedValue,
) {
    let Some(chat) = &shared.chat else { return };
    let Some(chat_id) = ctx.chat_id() else { return };

    let event = ChatEvent::user(chat_id, input.value.clone()).with_user(ctx.user_id());
    if let Err(error) = chat.append(event).await {
        warn!(%error, "chat store append failed");
    }
}
