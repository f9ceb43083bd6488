//! End-to-end engine scenarios: happy path, suspend/resume, retries,
//! circuit breaking, async steps with progress, cancellation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use async_trait::async_trait;
use runloom_core::prelude::*;

/// Listener that records the event sequence as strings
#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl WorkflowListener for RecordingListener {
    fn on_started(&self, _instance_id: &str, graph_id: &str) {
        self.events.lock().push(format!("started:{graph_id}"));
    }

    fn on_step_completed(&self, _instance_id: &str, step_id: &str, _result: &StepResult) {
        self.events.lock().push(format!("step:{step_id}"));
    }

    fn on_suspended(&self, _instance_id: &str, suspension: &SuspensionPayload) {
        self.events.lock().push(format!("suspended:{}", suspension.step_id));
    }

    fn on_resumed(&self, _instance_id: &str) {
        self.events.lock().push("resumed".to_string());
    }

    fn on_completed(&self, _instance_id: &str, result: &TypedValue) {
        self.events.lock().push(format!("completed:{}", result.value));
    }

    fn on_failed(&self, _instance_id: &str, failure: &WorkflowFailure) {
        self.events.lock().push(format!("failed:{}", failure.kind));
    }
}

/// Chat store that records appended events
#[derive(Default)]
struct RecordingChatStore {
    events: Mutex<Vec<ChatEvent>>,
}

#[async_trait]
impl ChatStore for RecordingChatStore {
    async fn append(&self, event: ChatEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

fn value(tag: &str, v: serde_json::Value) -> TypedValue {
    TypedValue::new(tag, v)
}

// =============================================================================
// Scenario 1: happy path A -> B -> C
// =============================================================================

#[test_log::test(tokio::test)]
async fn happy_path_runs_three_steps_in_order() {
    let graph = WorkflowGraph::builder("onboard", 1)
        .trigger_tag("signup")
        .step(
            StepNode::builder("a")
                .initial()
                .handler(|input, _ctx| async move {
                    let name = input
                        .and_then(|v| v.value.get("name").cloned())
                        .unwrap_or(json!("stranger"));
                    Ok(value("a_out", json!({ "greeting": name })))
                })
                .build()
                .unwrap(),
        )
        .step(
            StepNode::builder("b")
                .input_tag("a_out")
                .handler(|input, _ctx| async move {
                    Ok(value("b_out", input.map(|v| v.value).unwrap_or_default()))
                })
                .build()
                .unwrap(),
        )
        .step(
            StepNode::builder("c")
                .input_tag("b_out")
                .handler(|_input, _ctx| async move {
                    Ok(StepResult::finish(value("done", json!("welcome Ada"))))
                })
                .build()
                .unwrap(),
        )
        .build()
        .expect("graph should build");

    let engine = WorkflowEngine::builder().build();
    engine.register(graph).unwrap();

    let listener = Arc::new(RecordingListener::default());
    engine.add_listener(listener.clone());

    let handle = engine
        .execute(
            "onboard",
            Some(value("signup", json!({ "name": "Ada" }))),
            ExecuteOptions::new(),
        )
        .await
        .expect("should execute");

    assert_eq!(handle.status(), InstanceStatus::Completed);
    assert_eq!(
        handle.final_result().expect("should have result").value,
        json!("welcome Ada")
    );

    // Step outputs keyed by step id, in completion order
    let instance = engine
        .get_instance(handle.instance_id())
        .await
        .unwrap()
        .expect("should exist");
    let order: Vec<&String> = instance.context.outputs.keys().collect();
    assert_eq!(order, vec!["a", "b"]);
    assert_eq!(
        instance.context.outputs["a"].value,
        json!({ "greeting": "Ada" })
    );

    assert_eq!(
        listener.events(),
        vec![
            "started:onboard",
            "step:a",
            "step:b",
            "step:c",
            "completed:\"welcome Ada\"",
        ]
    );
}

// =============================================================================
// Scenario 2: suspend and resume
// =============================================================================

fn ask_name_graph() -> WorkflowGraph {
    WorkflowGraph::builder("ask-name", 1)
        .trigger_tag("start")
        .step(
            StepNode::builder("ask")
                .initial()
                .input_tag("name_input")
                .handler(|input, _ctx| async move {
                    match input {
                        Some(v) if v.tag.as_str() == "name_input" => {
                            let name = v.value.get("name").cloned().unwrap_or(json!(null));
                            Ok(StepResult::finish(value("done", name)))
                        }
                        _ => Ok(StepResult::suspend(json!({ "q": "name?" }), "name_input")),
                    }
                })
                .build()
                .unwrap(),
        )
        .build()
        .expect("graph should build")
}

#[tokio::test]
async fn suspend_then_resume_completes() {
    let engine = WorkflowEngine::builder().build();
    engine.register(ask_name_graph()).unwrap();

    let handle = engine
        .execute("ask-name", Some(value("start", json!({}))), ExecuteOptions::new())
        .await
        .expect("should execute");

    assert_eq!(handle.status(), InstanceStatus::Suspended);

    // The prompt is retrievable while suspended, with its expected input type
    let suspension = handle
        .suspension()
        .await
        .unwrap()
        .expect("suspension should be retrievable");
    assert_eq!(suspension.prompt, json!({ "q": "name?" }));
    assert_eq!(suspension.expected_input.as_str(), "name_input");
    assert_eq!(suspension.step_id, "ask");

    let handle = engine
        .resume(
            handle.instance_id(),
            value("name_input", json!({ "name": "Ada" })),
        )
        .await
        .expect("should resume");

    assert_eq!(handle.status(), InstanceStatus::Completed);
    assert_eq!(handle.final_result().unwrap().value, json!("Ada"));

    // Resume consumed the suspension payload
    assert!(handle.suspension().await.unwrap().is_none());
}

#[tokio::test]
async fn resume_refused_for_running_or_missing_instances() {
    let engine = WorkflowEngine::builder().build();
    engine.register(ask_name_graph()).unwrap();

    let missing = engine.resume("no-such-instance", value("name_input", json!({}))).await;
    assert!(matches!(missing, Err(EngineError::InstanceNotFound { .. })));

    let handle = engine
        .execute("ask-name", Some(value("start", json!({}))), ExecuteOptions::new())
        .await
        .unwrap();
    engine
        .resume(handle.instance_id(), value("name_input", json!({ "name": "Ada" })))
        .await
        .unwrap();

    // Second resume: the instance already completed
    let again = engine
        .resume(handle.instance_id(), value("name_input", json!({ "name": "Bob" })))
        .await;
    assert!(matches!(again, Err(EngineError::NotSuspended { .. })));
}

// =============================================================================
// Scenario 2b: suspended instances survive an engine restart
// =============================================================================

#[tokio::test]
async fn suspended_instance_resumes_after_restart() {
    let repository = Arc::new(MemoryRepository::new());

    let instance_id = {
        let engine = WorkflowEngine::builder()
            .repository(repository.clone())
            .build();
        engine.register(ask_name_graph()).unwrap();
        let handle = engine
            .execute("ask-name", Some(value("start", json!({}))), ExecuteOptions::new())
            .await
            .unwrap();
        assert_eq!(handle.status(), InstanceStatus::Suspended);
        handle.instance_id().to_string()
        // engine dropped here: simulated process exit
    };

    let engine = WorkflowEngine::builder().repository(repository).build();
    engine.register(ask_name_graph()).unwrap();

    let handle = engine
        .resume(&instance_id, value("name_input", json!({ "name": "Ada" })))
        .await
        .expect("restored instance should resume");

    assert_eq!(handle.status(), InstanceStatus::Completed);
    assert_eq!(handle.final_result().unwrap().value, json!("Ada"));
}

// =============================================================================
// Scenario 3: retry with eventual success
// =============================================================================

#[tokio::test]
async fn retry_succeeds_on_third_attempt() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in = calls.clone();

    let graph = WorkflowGraph::builder("flaky", 1)
        .trigger_tag("start")
        .step(
            StepNode::builder("fetch")
                .initial()
                .retry(
                    RetryPolicy::exponential()
                        .with_max_attempts(5)
                        .with_initial_interval(Duration::from_millis(10))
                        .with_backoff_coefficient(2.0)
                        .with_jitter(0.0)
                        .with_retry_on("io"),
                )
                .handler(move |_input, _ctx| {
                    let calls = calls_in.clone();
                    async move {
                        let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        if attempt < 3 {
                            Err(StepError::retryable("connection reset").with_kind("io"))
                        } else {
                            Ok(value("fetch_out", json!("ok")))
                        }
                    }
                })
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let engine = WorkflowEngine::builder().build();
    engine.register(graph).unwrap();

    let handle = engine
        .execute("flaky", Some(value("start", json!({}))), ExecuteOptions::new())
        .await
        .unwrap();

    assert_eq!(handle.status(), InstanceStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // The step output is present under the step's id
    let instance = engine
        .get_instance(handle.instance_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.context.outputs["fetch"].value, json!("ok"));

    let metrics = engine.step_metrics("flaky", "fetch");
    assert_eq!(metrics.retries, 2);
    assert_eq!(metrics.successes, 1);
    assert_eq!(metrics.failures, 2);
}

// =============================================================================
// Scenario 4: retry exhaustion
// =============================================================================

#[tokio::test]
async fn retry_exhaustion_fails_the_instance() {
    let repository = Arc::new(MemoryRepository::new());
    let graph = WorkflowGraph::builder("doomed", 1)
        .trigger_tag("start")
        .step(
            StepNode::builder("fetch")
                .initial()
                .retry(
                    RetryPolicy::exponential()
                        .with_max_attempts(3)
                        .with_initial_interval(Duration::from_millis(5))
                        .with_jitter(0.0),
                )
                .handler(|_input, _ctx| async move {
                    Err::<StepResult, _>(StepError::retryable("always down"))
                })
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let engine = WorkflowEngine::builder().repository(repository.clone()).build();
    engine.register(graph).unwrap();

    let handle = engine
        .execute("doomed", Some(value("start", json!({}))), ExecuteOptions::new())
        .await
        .unwrap();

    assert_eq!(handle.status(), InstanceStatus::Failed);

    let failure = handle.failure().await.expect("should have failure");
    assert_eq!(failure.kind, FailureKind::RetryExhausted);
    assert_eq!(failure.step_id.as_deref(), Some("fetch"));
    assert_eq!(failure.attempts, 3);

    let metrics = engine.step_metrics("doomed", "fetch");
    assert_eq!(metrics.failures, 3);
    assert_eq!(metrics.exhausted, 1);

    // Retry state deleted on exhaustion
    assert_eq!(repository.retry_state_count(), 0);
}

// =============================================================================
// Scenario 5: circuit opens across instances
// =============================================================================

#[tokio::test]
async fn circuit_opens_after_two_failing_instances() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in = calls.clone();

    let graph = WorkflowGraph::builder("guarded", 1)
        .trigger_tag("start")
        .step(
            StepNode::builder("fragile")
                .initial()
                .retry(RetryPolicy::no_retry())
                .circuit_breaker(
                    CircuitBreakerConfig::default()
                        .with_failure_threshold(2)
                        .with_open_duration(Duration::from_secs(5)),
                )
                .handler(move |_input, _ctx| {
                    let calls = calls_in.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<StepResult, _>(StepError::retryable("boom"))
                    }
                })
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let engine = WorkflowEngine::builder().build();
    engine.register(graph).unwrap();

    for _ in 0..2 {
        let handle = engine
            .execute("guarded", Some(value("start", json!({}))), ExecuteOptions::new())
            .await
            .unwrap();
        assert_eq!(handle.status(), InstanceStatus::Failed);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Third instance fails fast without invoking the step body
    let handle = engine
        .execute("guarded", Some(value("start", json!({}))), ExecuteOptions::new())
        .await
        .unwrap();
    assert_eq!(handle.status(), InstanceStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let failure = handle.failure().await.unwrap();
    assert_eq!(failure.kind, FailureKind::CircuitOpen);
    assert_eq!(failure.cause.as_deref(), Some("boom"));
}

// =============================================================================
// Scenario 6: async step with progress
// =============================================================================

#[tokio::test]
async fn async_step_reports_progress_and_completes() {
    let repository = Arc::new(MemoryRepository::new());
    let gate = Arc::new(tokio::sync::Notify::new());
    let seen_percents = Arc::new(Mutex::new(Vec::<u8>::new()));

    let gate_in = gate.clone();
    let percents_in = seen_percents.clone();

    let graph = WorkflowGraph::builder("encode", 1)
        .trigger_tag("start")
        .step(
            StepNode::builder("kickoff")
                .initial()
                .handler(|_input, _ctx| async move {
                    Ok(StepResult::run_async(
                        AsyncRequest::new("t1", Some(value("queued", json!("queued"))))
                            .with_args(json!({ "chunks": 4 }))
                            .with_timeout(Duration::from_secs(10)),
                    ))
                })
                .build()
                .unwrap(),
        )
        .step(
            StepNode::builder("worker")
                .async_handler("t1*", move |_args, _ctx, progress| {
                    let gate = gate_in.clone();
                    let percents = percents_in.clone();
                    async move {
                        gate.notified().await;
                        for step in 1..=4u8 {
                            progress.update(step * 25, format!("chunk {step}")).await;
                            percents.lock().push(progress.percent());
                        }
                        Ok(StepResult::finish(value("done", json!("done"))))
                    }
                })
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let engine = WorkflowEngine::builder().repository(repository.clone()).build();
    engine.register(graph).unwrap();

    let handle = engine
        .execute("encode", Some(value("start", json!({}))), ExecuteOptions::new())
        .await
        .unwrap();

    // execute() returned promptly; the task is still gated
    assert_eq!(handle.status(), InstanceStatus::Running);

    let task = repository
        .load_async_task(handle.instance_id(), "t1")
        .await
        .unwrap()
        .expect("async state should be persisted");
    assert_eq!(task.status, AsyncTaskStatus::InProgress);
    assert_eq!(task.percent, 0);
    assert_eq!(task.initial_data.as_ref().unwrap().value, json!("queued"));

    // The context carries the task's external tracking id
    let instance = engine
        .get_instance(handle.instance_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.context.async_task, Some(task.message_id));
    assert_eq!(instance.context.outputs["kickoff"].value, json!("queued"));

    gate.notify_one();
    let status = handle
        .wait_for_terminal(Duration::from_secs(5))
        .await
        .expect("should finish");
    assert_eq!(status, InstanceStatus::Completed);
    assert_eq!(handle.final_result().unwrap().value, json!("done"));

    // Percent climbed monotonically to 100
    assert_eq!(seen_percents.lock().clone(), vec![25, 50, 75, 100]);

    let task = repository
        .load_async_task(handle.instance_id(), "t1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, AsyncTaskStatus::Completed);
    assert_eq!(task.percent, 100);
}

#[tokio::test]
async fn async_task_timeout_fails_the_instance() {
    let graph = WorkflowGraph::builder("stuck", 1)
        .trigger_tag("start")
        .step(
            StepNode::builder("kickoff")
                .initial()
                .handler(|_input, _ctx| async move {
                    Ok(StepResult::run_async(
                        AsyncRequest::new("slow-job", None)
                            .with_timeout(Duration::from_millis(50)),
                    ))
                })
                .build()
                .unwrap(),
        )
        .step(
            StepNode::builder("worker")
                .async_handler("slow-*", |_args, _ctx, _progress| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(StepResult::finish(value("done", json!("never"))))
                })
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let repository = Arc::new(MemoryRepository::new());
    let engine = WorkflowEngine::builder().repository(repository.clone()).build();
    engine.register(graph).unwrap();

    let handle = engine
        .execute("stuck", Some(value("start", json!({}))), ExecuteOptions::new())
        .await
        .unwrap();

    let status = handle
        .wait_for_terminal(Duration::from_secs(5))
        .await
        .expect("watchdog should fire");
    assert_eq!(status, InstanceStatus::Failed);

    let failure = handle.failure().await.unwrap();
    assert_eq!(failure.kind, FailureKind::StepFailed);
    assert!(failure.message.contains("timed out"));

    let task = repository
        .load_async_task(handle.instance_id(), "slow-job")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, AsyncTaskStatus::Cancelled);
}

// =============================================================================
// Terminal fail results and invocation limits
// =============================================================================

#[tokio::test]
async fn fail_result_is_terminal_without_retry_on_fail_result() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in = calls.clone();

    let graph = WorkflowGraph::builder("bizfail", 1)
        .trigger_tag("start")
        .step(
            StepNode::builder("check")
                .initial()
                .retry(RetryPolicy::exponential().with_max_attempts(5))
                .handler(move |_input, _ctx| {
                    let calls = calls_in.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(StepResult::fail(StepError::non_retryable("rejected")))
                    }
                })
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let engine = WorkflowEngine::builder().build();
    engine.register(graph).unwrap();

    let handle = engine
        .execute("bizfail", Some(value("start", json!({}))), ExecuteOptions::new())
        .await
        .unwrap();

    assert_eq!(handle.status(), InstanceStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(handle.failure().await.unwrap().kind, FailureKind::StepFailed);
}

fn looping_graph(on_limit: OnLimitExceeded) -> WorkflowGraph {
    WorkflowGraph::builder("loop", 1)
        .trigger_tag("start")
        .step(
            StepNode::builder("kick")
                .initial()
                .handler(|_input, _ctx| async move { Ok(value("ping", json!(0))) })
                .build()
                .unwrap(),
        )
        .step(
            StepNode::builder("bounce")
                .input_tag("ping")
                .invocation_limit(3)
                .on_limit(on_limit)
                .next("bounce")
                .handler(|input, _ctx| async move {
                    let n = input.and_then(|v| v.value.as_i64()).unwrap_or(0);
                    Ok(value("ping", json!(n + 1)))
                })
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn invocation_limit_stop_finishes_with_latest_output() {
    let engine = WorkflowEngine::builder().build();
    engine.register(looping_graph(OnLimitExceeded::Stop)).unwrap();

    let handle = engine
        .execute("loop", Some(value("start", json!({}))), ExecuteOptions::new())
        .await
        .unwrap();

    assert_eq!(handle.status(), InstanceStatus::Completed);
    // Three bounces ran (0 -> 1 -> 2 -> 3); the fourth invocation stopped
    assert_eq!(handle.final_result().unwrap().value, json!(3));
}

#[tokio::test]
async fn invocation_limit_error_fails_the_instance() {
    let engine = WorkflowEngine::builder().build();
    engine.register(looping_graph(OnLimitExceeded::Error)).unwrap();

    let handle = engine
        .execute("loop", Some(value("start", json!({}))), ExecuteOptions::new())
        .await
        .unwrap();

    assert_eq!(handle.status(), InstanceStatus::Failed);
    let failure = handle.failure().await.unwrap();
    assert_eq!(failure.kind, FailureKind::InvocationLimit);
    assert_eq!(failure.step_id.as_deref(), Some("bounce"));
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn cancel_interrupts_retry_delay() {
    let graph = WorkflowGraph::builder("slow-retry", 1)
        .trigger_tag("start")
        .step(
            StepNode::builder("fetch")
                .initial()
                .retry(
                    RetryPolicy::exponential()
                        .with_max_attempts(5)
                        .with_initial_interval(Duration::from_secs(60))
                        .with_jitter(0.0),
                )
                .handler(|_input, _ctx| async move {
                    Err::<StepResult, _>(StepError::retryable("down"))
                })
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let engine = WorkflowEngine::builder().build();
    engine.register(graph).unwrap();

    // execute() blocks in the 60s retry delay, so run it on the side with
    // a known instance id and cancel from here.
    let engine_bg = engine.clone();
    let execute_task = tokio::spawn(async move {
        engine_bg
            .execute(
                "slow-retry",
                Some(value("start", json!({}))),
                ExecuteOptions::new().with_instance_id("retrying-1"),
            )
            .await
    });

    // Let the first attempt fail and the delay begin
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    engine.cancel("retrying-1").await.expect("should cancel");

    let handle = tokio::time::timeout(Duration::from_secs(5), execute_task)
        .await
        .expect("cancel should wake the retry sleep")
        .expect("execute task should not panic")
        .expect("execute should return a handle");

    assert_eq!(handle.status(), InstanceStatus::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn cancelled_instance_refuses_resume() {
    let engine = WorkflowEngine::builder().build();
    engine.register(ask_name_graph()).unwrap();

    let handle = engine
        .execute("ask-name", Some(value("start", json!({}))), ExecuteOptions::new())
        .await
        .unwrap();
    assert_eq!(handle.status(), InstanceStatus::Suspended);

    engine.cancel(handle.instance_id()).await.unwrap();
    assert_eq!(handle.status(), InstanceStatus::Cancelled);

    let result = engine
        .resume(handle.instance_id(), value("name_input", json!({ "name": "Ada" })))
        .await;
    assert!(matches!(result, Err(EngineError::NotSuspended { .. })));

    // Cancellation also consumed the suspension payload
    assert!(handle.suspension().await.unwrap().is_none());
}

// =============================================================================
// Chat integration
// =============================================================================

#[tokio::test]
async fn chat_bound_instances_mirror_suspend_resume_and_finish() {
    let chat = Arc::new(RecordingChatStore::default());
    let engine = WorkflowEngine::builder().chat_store(chat.clone()).build();
    engine.register(ask_name_graph()).unwrap();

    let handle = engine
        .execute(
            "ask-name",
            Some(value("start", json!({}))),
            ExecuteOptions::new().with_chat_id("chat-7").with_user_id("u-1"),
        )
        .await
        .unwrap();
    assert_eq!(handle.status(), InstanceStatus::Suspended);

    engine
        .resume(handle.instance_id(), value("name_input", json!({ "name": "Ada" })))
        .await
        .unwrap();

    let events = chat.events.lock().clone();
    assert_eq!(events.len(), 3);

    assert_eq!(events[0].role, ChatRole::Assistant);
    assert_eq!(events[0].payload, json!({ "q": "name?" }));
    assert_eq!(events[0].chat_id, "chat-7");
    assert_eq!(events[0].user_id.as_deref(), Some("u-1"));

    assert_eq!(events[1].role, ChatRole::User);
    assert_eq!(events[1].payload, json!({ "name": "Ada" }));

    assert_eq!(events[2].role, ChatRole::Assistant);
    assert_eq!(events[2].payload, json!("Ada"));
}

// =============================================================================
// Registration validation
// =============================================================================

#[tokio::test]
async fn duplicate_graph_version_is_rejected() {
    let engine = WorkflowEngine::builder().build();
    engine.register(ask_name_graph()).unwrap();

    let duplicate = engine.register(ask_name_graph());
    assert!(matches!(duplicate, Err(EngineError::DuplicateGraph { .. })));

    let missing = engine
        .execute("unknown", None, ExecuteOptions::new())
        .await;
    assert!(matches!(missing, Err(EngineError::GraphNotFound { .. })));
}

#[tokio::test]
async fn explicit_instance_ids_must_be_unique() {
    let engine = WorkflowEngine::builder().build();
    engine.register(ask_name_graph()).unwrap();

    let options = ExecuteOptions::new().with_instance_id("dialog-1");
    engine
        .execute("ask-name", Some(value("start", json!({}))), options.clone())
        .await
        .unwrap();

    let second = engine
        .execute("ask-name", Some(value("start", json!({}))), options)
        .await;
    assert!(matches!(second, Err(EngineError::InstanceExists { .. })));
}
