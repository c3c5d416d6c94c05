//! End-to-end scenarios over the in-memory store
//!
//! The worker loops are driven one tick at a time (`dispatch_once`,
//! `wake_once`, `reap_once`) and time is advanced through a manual clock, so
//! every scenario is deterministic.

use std::sync::Arc;

use chrono::Duration;
use serde_json::{json, Value};

use stepflow_core::{
    shallow_merge, Clock, HandlerRegistry, ManualClock, TaskResult,
};
use stepflow_engine::{
    Engine, EngineConfig, EngineError, StartOutcome, StartRequest, Worker, WorkerConfig,
};
use stepflow_storage::{
    ExecutionFilter, ExecutionStatus, ExecutionStore, HistoryEventType, HistoryRecord,
    InMemoryExecutionStore, StepStatus,
};

struct Harness {
    store: Arc<InMemoryExecutionStore>,
    clock: Arc<ManualClock>,
    engine: Engine,
    worker: Arc<Worker>,
}

fn harness(registry: HandlerRegistry) -> Harness {
    harness_with_config(registry, WorkerConfig::default(), EngineConfig::default())
}

fn harness_with_config(
    registry: HandlerRegistry,
    worker_config: WorkerConfig,
    engine_config: EngineConfig,
) -> Harness {
    let store = Arc::new(InMemoryExecutionStore::new());
    let clock = Arc::new(ManualClock::start_now());
    let dyn_store: Arc<dyn ExecutionStore> = store.clone();
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let engine = Engine::new(dyn_store.clone(), dyn_clock.clone(), engine_config);
    let worker = Arc::new(Worker::new(
        dyn_store,
        Arc::new(registry),
        dyn_clock,
        worker_config,
    ));
    Harness {
        store,
        clock,
        engine,
        worker,
    }
}

/// The "mock" handler of the scenarios: echo the input plus a marker.
fn mock_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("mock", |input, _ctx| async move {
        TaskResult::success(shallow_merge(&input, &json!({"processedAt": 1})))
    });
    registry.register_fn("echo", |input, _ctx| async move { TaskResult::success(input) });
    registry.register_fn("decline", |_input, _ctx| async move {
        TaskResult::failure("PaymentDeclined", "card expired")
    });
    registry
}

async fn start(harness: &Harness, workflow: &str, input: Value) -> String {
    match harness
        .engine
        .start_execution(StartRequest {
            workflow: workflow.to_string(),
            version: None,
            input,
            idempotency_key: None,
        })
        .await
        .expect("start_execution failed")
    {
        StartOutcome::Started(view) => view.execution_id,
        StartOutcome::Existing(view) => view.execution_id,
    }
}

/// Drive dispatch and wake ticks until the execution reaches a terminal
/// status. Panics if it fails to settle.
async fn run_until_terminal(harness: &Harness, execution_id: &str) {
    for _ in 0..50 {
        let view = harness.engine.get_execution(execution_id).await.unwrap();
        if view.status != "running" {
            return;
        }
        let dispatched = harness.worker.dispatch_once().await.unwrap();
        let woken = harness.worker.wake_once().await.unwrap();
        if dispatched == 0 && woken == 0 {
            // Nothing eligible: a Wait gate is the only legitimate reason
            harness.clock.advance(Duration::seconds(1));
        }
    }
    panic!("execution {execution_id} did not settle");
}

fn event_types(history: &[stepflow_engine::HistoryView]) -> Vec<(String, Option<String>)> {
    history
        .iter()
        .map(|h| (h.event_type.clone(), h.step_name.clone()))
        .collect()
}

/// Property 6: EXECUTION_STARTED first, one terminal event last, and every
/// STEP_STARTED closed by exactly one step event unless STEP_RECOVERED
/// intervenes.
fn assert_history_wellformed(history: &[HistoryRecord]) {
    assert!(!history.is_empty());
    assert_eq!(
        history[0].event_type,
        HistoryEventType::ExecutionStarted,
        "first event must be execution_started"
    );

    let terminal_count = history
        .iter()
        .filter(|h| {
            matches!(
                h.event_type,
                HistoryEventType::ExecutionCompleted
                    | HistoryEventType::ExecutionFailed
                    | HistoryEventType::ExecutionCancelled
            )
        })
        .count();
    assert_eq!(terminal_count, 1, "exactly one terminal event");

    let mut names: Vec<&str> = history
        .iter()
        .filter_map(|h| h.step_name.as_deref())
        .collect();
    names.sort_unstable();
    names.dedup();

    for name in names {
        let mut open = false;
        for event in history.iter().filter(|h| h.step_name.as_deref() == Some(name)) {
            match event.event_type {
                HistoryEventType::StepStarted => {
                    assert!(!open, "step '{name}' started twice without being closed");
                    open = true;
                }
                HistoryEventType::StepCompleted
                | HistoryEventType::StepFailed
                | HistoryEventType::StepError => open = false,
                HistoryEventType::StepRecovered => open = false,
                _ => {}
            }
        }
        assert!(!open, "step '{name}' was never closed");
    }
}

async fn assert_invariants(harness: &Harness, execution_id: &str) {
    let view = harness.engine.get_execution(execution_id).await.unwrap();
    let record = harness
        .store
        .find_execution_by_public_id(execution_id)
        .await
        .unwrap()
        .unwrap();
    let steps = harness.store.list_steps(record.id).await.unwrap();
    let history = harness.store.list_history(record.id).await.unwrap();

    if view.status == "running" {
        let frontier = steps
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    StepStatus::Pending | StepStatus::Running | StepStatus::Waiting
                )
            })
            .count();
        assert_eq!(frontier, 1, "running execution must have a single frontier");
    } else {
        assert_history_wellformed(&history);
        for step in &steps {
            if step.status == StepStatus::Completed {
                let completed = step.completed_at.expect("completed step needs completed_at");
                if let Some(started) = step.started_at {
                    assert!(completed >= started);
                }
            }
            if step.status == StepStatus::Failed {
                assert!(step.error_message.is_some());
            }
        }
    }
}

fn linear_definition() -> Value {
    json!({
        "startAt": "a",
        "states": {
            "a": {"type": "Task", "resource": "mock", "next": "b"},
            "b": {"type": "Task", "resource": "mock", "next": "c"},
            "c": {"type": "Success"}
        }
    })
}

fn choice_definition() -> Value {
    json!({
        "startAt": "a",
        "states": {
            "a": {"type": "Task", "resource": "echo", "next": "dec"},
            "dec": {
                "type": "Choice",
                "choices": [
                    {"condition": {"operator": "booleanEquals", "variable": "$.inStock", "value": true},
                     "next": "ok"}
                ],
                "defaultChoice": "bad"
            },
            "ok": {"type": "Success"},
            "bad": {"type": "Fail", "error": "OOS"}
        }
    })
}

fn wait_definition(seconds: i64) -> Value {
    json!({
        "startAt": "a",
        "states": {
            "a": {"type": "Task", "resource": "echo", "next": "w"},
            "w": {"type": "Wait", "seconds": seconds, "next": "done"},
            "done": {"type": "Success"}
        }
    })
}

// ============================================
// Scenario A — linear task chain
// ============================================

#[test_log::test(tokio::test)]
async fn scenario_a_linear_task_chain() {
    let harness = harness(mock_registry());
    harness
        .engine
        .register_workflow("order-flow", None, "1.0", &linear_definition())
        .await
        .unwrap();

    let execution_id = start(&harness, "order-flow", json!({"orderId": "X"})).await;
    assert_invariants(&harness, &execution_id).await;

    run_until_terminal(&harness, &execution_id).await;

    let view = harness.engine.get_execution(&execution_id).await.unwrap();
    assert_eq!(view.status, "completed");
    assert_eq!(view.output, Some(json!({"orderId": "X", "processedAt": 1})));

    let steps = harness.engine.list_steps(&execution_id).await.unwrap();
    assert_eq!(
        steps.iter().map(|s| s.step_name.as_str()).collect::<Vec<_>>(),
        vec!["a", "b", "c"]
    );
    assert!(steps.iter().all(|s| s.status == "completed"));

    let history = harness.engine.get_history(&execution_id).await.unwrap();
    let expected: Vec<(String, Option<String>)> = vec![
        ("execution_started".into(), None),
        ("step_started".into(), Some("a".into())),
        ("step_completed".into(), Some("a".into())),
        ("next_state_queued".into(), Some("b".into())),
        ("step_started".into(), Some("b".into())),
        ("step_completed".into(), Some("b".into())),
        ("next_state_queued".into(), Some("c".into())),
        ("step_started".into(), Some("c".into())),
        ("step_completed".into(), Some("c".into())),
        ("execution_completed".into(), None),
    ];
    assert_eq!(event_types(&history), expected);

    assert_eq!(harness.store.queue_len(), 0, "terminal execution leaves no queue rows");
    assert_invariants(&harness, &execution_id).await;
}

// ============================================
// Scenario B — choice branch
// ============================================

#[tokio::test]
async fn scenario_b_choice_routes_to_success() {
    let harness = harness(mock_registry());
    harness
        .engine
        .register_workflow("stock-check", None, "1.0", &choice_definition())
        .await
        .unwrap();

    let execution_id = start(&harness, "stock-check", json!({"inStock": true})).await;
    run_until_terminal(&harness, &execution_id).await;

    let view = harness.engine.get_execution(&execution_id).await.unwrap();
    assert_eq!(view.status, "completed");
    // The routing object never leaks into the data flow
    assert_eq!(view.output, Some(json!({"inStock": true})));
    assert_invariants(&harness, &execution_id).await;
}

#[tokio::test]
async fn scenario_b_choice_default_routes_to_fail() {
    let harness = harness(mock_registry());
    harness
        .engine
        .register_workflow("stock-check", None, "1.0", &choice_definition())
        .await
        .unwrap();

    let execution_id = start(&harness, "stock-check", json!({"inStock": false})).await;
    run_until_terminal(&harness, &execution_id).await;

    let view = harness.engine.get_execution(&execution_id).await.unwrap();
    assert_eq!(view.status, "failed");
    assert_eq!(view.error_message, Some("OOS".to_string()));
    assert_invariants(&harness, &execution_id).await;
}

// ============================================
// Scenario C — wait
// ============================================

#[tokio::test]
async fn scenario_c_wait_gates_until_due() {
    let harness = harness_with_config(
        mock_registry(),
        WorkerConfig::new().with_batch_size(1),
        EngineConfig::default(),
    );
    harness
        .engine
        .register_workflow("delayed", None, "1.0", &wait_definition(2))
        .await
        .unwrap();

    let execution_id = start(&harness, "delayed", json!({"orderId": "X"})).await;

    // Task `a` runs; the wait step is scheduled 2s out
    assert_eq!(harness.worker.dispatch_once().await.unwrap(), 1);
    let view = harness.engine.get_execution(&execution_id).await.unwrap();
    assert_eq!(view.current_state, "w");

    // Before the deadline nothing is claimable and nothing wakes
    assert_eq!(harness.worker.dispatch_once().await.unwrap(), 0);
    assert_eq!(harness.worker.wake_once().await.unwrap(), 0);

    harness.clock.advance(Duration::seconds(2));
    assert_eq!(harness.worker.wake_once().await.unwrap(), 1);

    // The successor runs as a normal dispatch
    assert_eq!(harness.worker.dispatch_once().await.unwrap(), 1);
    let view = harness.engine.get_execution(&execution_id).await.unwrap();
    assert_eq!(view.status, "completed");

    let history = harness.engine.get_history(&execution_id).await.unwrap();
    assert!(history.iter().any(|h| h.event_type == "wait_completed"));
    // waitCompleted flows into the successor's input
    let steps = harness.engine.list_steps(&execution_id).await.unwrap();
    let done = steps.iter().find(|s| s.step_name == "done").unwrap();
    assert_eq!(done.input, json!({"orderId": "X", "waitCompleted": true}));
    assert_invariants(&harness, &execution_id).await;
}

#[tokio::test]
async fn wait_zero_seconds_is_immediately_eligible() {
    let harness = harness(mock_registry());
    harness
        .engine
        .register_workflow("instant", None, "1.0", &wait_definition(0))
        .await
        .unwrap();

    let execution_id = start(&harness, "instant", json!({})).await;
    assert_eq!(harness.worker.dispatch_once().await.unwrap(), 1);
    // Due within the very first wake tick
    assert_eq!(harness.worker.wake_once().await.unwrap(), 1);
    assert_eq!(harness.worker.dispatch_once().await.unwrap(), 1);

    let view = harness.engine.get_execution(&execution_id).await.unwrap();
    assert_eq!(view.status, "completed");
}

#[tokio::test]
async fn wait_timestamp_in_past_is_immediately_eligible() {
    let harness = harness(mock_registry());
    let past = harness.clock.now() - Duration::hours(1);
    let definition = json!({
        "startAt": "w",
        "states": {
            "w": {"type": "Wait", "timestamp": past.to_rfc3339(), "next": "done"},
            "done": {"type": "Success"}
        }
    });
    harness
        .engine
        .register_workflow("past-wait", None, "1.0", &definition)
        .await
        .unwrap();

    let execution_id = start(&harness, "past-wait", json!({})).await;
    assert_eq!(harness.worker.wake_once().await.unwrap(), 1);
    assert_eq!(harness.worker.dispatch_once().await.unwrap(), 1);

    let view = harness.engine.get_execution(&execution_id).await.unwrap();
    assert_eq!(view.status, "completed");
}

// ============================================
// Scenario D — crash recovery via the reaper
// ============================================

#[tokio::test]
async fn scenario_d_stuck_step_is_reaped_and_rerun() {
    let harness = harness(mock_registry());
    harness
        .engine
        .register_workflow("order-flow", None, "1.0", &linear_definition())
        .await
        .unwrap();

    let execution_id = start(&harness, "order-flow", json!({"orderId": "X"})).await;
    let record = harness
        .store
        .find_execution_by_public_id(&execution_id)
        .await
        .unwrap()
        .unwrap();

    // A worker claims the row, marks the step running, then dies mid-handler:
    // the running mark is durable, the claim is rolled back
    let now = harness.clock.now();
    let step = harness.store.find_step(record.id, "a").await.unwrap().unwrap();
    {
        let batch = harness.store.claim_batch(now, 10).await.unwrap();
        assert_eq!(batch.items().len(), 1);
        harness.store.start_step(step.id, now).await.unwrap();
        // Dropped without commit — the crash
    }

    // Another dispatcher consumes the released row; the step stays running
    assert_eq!(harness.worker.dispatch_once().await.unwrap(), 1);
    let step = harness.store.get_step(step.id).await.unwrap();
    assert_eq!(step.status, StepStatus::Running);
    assert_eq!(harness.store.queue_len(), 0);

    // Not yet past the stuck threshold: the reaper leaves it alone
    assert_eq!(harness.worker.reap_once().await.unwrap(), 0);

    harness.clock.advance(Duration::minutes(31));
    assert_eq!(harness.worker.reap_once().await.unwrap(), 1);

    let step = harness.store.get_step(step.id).await.unwrap();
    assert_eq!(step.status, StepStatus::Pending);

    run_until_terminal(&harness, &execution_id).await;
    let view = harness.engine.get_execution(&execution_id).await.unwrap();
    assert_eq!(view.status, "completed");

    let history = harness.engine.get_history(&execution_id).await.unwrap();
    assert!(history
        .iter()
        .any(|h| h.event_type == "step_recovered" && h.step_name.as_deref() == Some("a")));
    assert_invariants(&harness, &execution_id).await;
}

// ============================================
// Scenario E — concurrent claim
// ============================================

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn scenario_e_concurrent_dispatchers() {
    let harness = harness(mock_registry());
    harness
        .engine
        .register_workflow("order-flow", None, "1.0", &linear_definition())
        .await
        .unwrap();

    let mut execution_ids = Vec::new();
    for i in 0..100 {
        execution_ids.push(start(&harness, "order-flow", json!({"orderId": i})).await);
    }

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let worker = Arc::clone(&harness.worker);
        tasks.push(tokio::spawn(async move {
            let mut idle_polls = 0;
            while idle_polls < 10 {
                match worker.dispatch_once().await {
                    Ok(0) => {
                        idle_polls += 1;
                        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                    }
                    Ok(_) => idle_polls = 0,
                    Err(e) => panic!("dispatch failed: {e}"),
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    // Drain anything the racing pollers gave up on
    while harness.worker.dispatch_once().await.unwrap() > 0 {}

    for execution_id in &execution_ids {
        let view = harness.engine.get_execution(execution_id).await.unwrap();
        assert_eq!(view.status, "completed", "execution {execution_id}");
        assert_invariants(&harness, execution_id).await;
    }
    assert_eq!(harness.store.queue_len(), 0);
}

// ============================================
// Scenario F — idempotent start
// ============================================

#[tokio::test]
async fn scenario_f_idempotent_start() {
    let harness = harness(mock_registry());
    harness
        .engine
        .register_workflow("order-flow", None, "1.0", &linear_definition())
        .await
        .unwrap();

    let request = StartRequest {
        workflow: "order-flow".to_string(),
        version: None,
        input: json!({"orderId": "X"}),
        idempotency_key: Some("k1".to_string()),
    };

    let first = harness.engine.start_execution(request.clone()).await.unwrap();
    let StartOutcome::Started(first_view) = &first else {
        panic!("first start must create");
    };

    let second = harness.engine.start_execution(request.clone()).await.unwrap();
    match &second {
        StartOutcome::Existing(view) => {
            assert_eq!(view.execution_id, first_view.execution_id)
        }
        other => panic!("second start must reuse, got {other:?}"),
    }
    assert_eq!(harness.store.execution_count(), 1);

    // Past the TTL a fresh execution is created
    harness.clock.advance(Duration::hours(25));
    let third = harness.engine.start_execution(request).await.unwrap();
    match &third {
        StartOutcome::Started(view) => {
            assert_ne!(view.execution_id, first_view.execution_id)
        }
        other => panic!("third start must create, got {other:?}"),
    }
    assert_eq!(harness.store.execution_count(), 2);
}

// ============================================
// Failure paths
// ============================================

#[tokio::test]
async fn handler_failure_fails_the_execution() {
    let harness = harness(mock_registry());
    let definition = json!({
        "startAt": "pay",
        "states": {
            "pay": {"type": "Task", "resource": "decline", "next": "done"},
            "done": {"type": "Success"}
        }
    });
    harness
        .engine
        .register_workflow("payment", None, "1.0", &definition)
        .await
        .unwrap();

    let execution_id = start(&harness, "payment", json!({})).await;
    run_until_terminal(&harness, &execution_id).await;

    let view = harness.engine.get_execution(&execution_id).await.unwrap();
    assert_eq!(view.status, "failed");
    assert_eq!(view.error_message, Some("card expired".to_string()));

    let steps = harness.engine.list_steps(&execution_id).await.unwrap();
    let pay = steps.iter().find(|s| s.step_name == "pay").unwrap();
    assert_eq!(pay.status, "failed");
    assert_eq!(pay.error_type, Some("PaymentDeclined".to_string()));

    let history = harness.engine.get_history(&execution_id).await.unwrap();
    let types: Vec<&str> = history.iter().map(|h| h.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec!["execution_started", "step_started", "step_failed", "execution_failed"]
    );
    assert_invariants(&harness, &execution_id).await;
}

#[tokio::test]
async fn unknown_resource_fails_the_execution() {
    let harness = harness(HandlerRegistry::new());
    let definition = json!({
        "startAt": "a",
        "states": {
            "a": {"type": "Task", "resource": "ghost", "next": "done"},
            "done": {"type": "Success"}
        }
    });
    harness
        .engine
        .register_workflow("ghostly", None, "1.0", &definition)
        .await
        .unwrap();

    let execution_id = start(&harness, "ghostly", json!({})).await;
    run_until_terminal(&harness, &execution_id).await;

    let view = harness.engine.get_execution(&execution_id).await.unwrap();
    assert_eq!(view.status, "failed");
    let steps = harness.engine.list_steps(&execution_id).await.unwrap();
    assert_eq!(steps[0].error_type, Some("UnknownHandler".to_string()));
}

#[tokio::test]
async fn no_matching_choice_without_default_fails_with_choice_error() {
    let harness = harness(mock_registry());
    let definition = json!({
        "startAt": "dec",
        "states": {
            "dec": {
                "type": "Choice",
                "choices": [
                    {"condition": {"operator": "booleanEquals", "variable": "$.missing", "value": true},
                     "next": "done"}
                ]
            },
            "done": {"type": "Success"}
        }
    });
    harness
        .engine
        .register_workflow("no-default", None, "1.0", &definition)
        .await
        .unwrap();

    let execution_id = start(&harness, "no-default", json!({})).await;
    run_until_terminal(&harness, &execution_id).await;

    let view = harness.engine.get_execution(&execution_id).await.unwrap();
    assert_eq!(view.status, "failed");
    let steps = harness.engine.list_steps(&execution_id).await.unwrap();
    assert_eq!(steps[0].error_type, Some("ChoiceError".to_string()));
    assert_eq!(
        steps[0].error_message,
        Some("No matching choice and no default".to_string())
    );
}

// ============================================
// Cancellation
// ============================================

#[tokio::test]
async fn cancel_removes_queued_work_and_locks_the_terminal_state() {
    let harness = harness(mock_registry());
    harness
        .engine
        .register_workflow("order-flow", None, "1.0", &linear_definition())
        .await
        .unwrap();

    let execution_id = start(&harness, "order-flow", json!({"orderId": "X"})).await;
    let view = harness.engine.cancel_execution(&execution_id).await.unwrap();
    assert_eq!(view.status, "cancelled");
    assert_eq!(harness.store.queue_len(), 0);

    // Nothing left to dispatch
    assert_eq!(harness.worker.dispatch_once().await.unwrap(), 0);

    // Cancelling a cancelled execution is InvalidState, and a no-op
    match harness.engine.cancel_execution(&execution_id).await {
        Err(EngineError::InvalidState(_)) => {}
        other => panic!("expected InvalidState, got {other:?}"),
    }

    let history = harness.engine.get_history(&execution_id).await.unwrap();
    assert_eq!(
        history.last().map(|h| h.event_type.as_str()),
        Some("execution_cancelled")
    );
    assert_eq!(
        history
            .iter()
            .filter(|h| h.event_type == "execution_cancelled")
            .count(),
        1
    );
}

// ============================================
// Start-time errors and versioning
// ============================================

#[tokio::test]
async fn start_unknown_workflow_and_version() {
    let harness = harness(mock_registry());
    harness
        .engine
        .register_workflow("order-flow", None, "1.0", &linear_definition())
        .await
        .unwrap();

    match harness
        .engine
        .start_execution(StartRequest {
            workflow: "nope".to_string(),
            version: None,
            input: json!({}),
            idempotency_key: None,
        })
        .await
    {
        Err(EngineError::WorkflowNotFound(name)) => assert_eq!(name, "nope"),
        other => panic!("expected WorkflowNotFound, got {other:?}"),
    }

    match harness
        .engine
        .start_execution(StartRequest {
            workflow: "order-flow".to_string(),
            version: Some("9.9".to_string()),
            input: json!({}),
            idempotency_key: None,
        })
        .await
    {
        Err(EngineError::VersionNotFound { version, .. }) => assert_eq!(version, "9.9"),
        other => panic!("expected VersionNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn start_uses_latest_version_lexicographically() {
    let harness = harness(mock_registry());
    harness
        .engine
        .register_workflow("order-flow", None, "1.0", &linear_definition())
        .await
        .unwrap();
    // A later version whose chain stops at `b`
    let v2 = json!({
        "startAt": "a",
        "states": {
            "a": {"type": "Task", "resource": "mock", "next": "b"},
            "b": {"type": "Success"}
        }
    });
    harness
        .engine
        .register_workflow("order-flow", None, "2.0", &v2)
        .await
        .unwrap();

    let execution_id = start(&harness, "order-flow", json!({})).await;
    run_until_terminal(&harness, &execution_id).await;

    let steps = harness.engine.list_steps(&execution_id).await.unwrap();
    assert_eq!(steps.len(), 2, "v2 has a two-state chain");
}

#[tokio::test]
async fn invalid_definition_is_rejected_at_registration() {
    let harness = harness(mock_registry());
    let bad = json!({
        "startAt": "a",
        "states": {
            "a": {"type": "Task", "resource": "mock", "next": "missing"}
        }
    });
    match harness
        .engine
        .register_workflow("broken", None, "1.0", &bad)
        .await
    {
        Err(EngineError::Definition(_)) => {}
        other => panic!("expected DefinitionError, got {other:?}"),
    }
}

// ============================================
// Batch-size equivalence
// ============================================

#[tokio::test]
async fn batch_size_one_and_one_hundred_settle_identically() {
    let mut results = Vec::new();
    for batch_size in [1, 100] {
        let harness = harness_with_config(
            mock_registry(),
            WorkerConfig::new().with_batch_size(batch_size),
            EngineConfig::default(),
        );
        harness
            .engine
            .register_workflow("order-flow", None, "1.0", &linear_definition())
            .await
            .unwrap();

        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(start(&harness, "order-flow", json!({"orderId": i})).await);
        }
        for id in &ids {
            run_until_terminal(&harness, id).await;
        }

        let mut outcome = Vec::new();
        for id in &ids {
            let view = harness.engine.get_execution(id).await.unwrap();
            let steps = harness.engine.list_steps(id).await.unwrap();
            outcome.push((
                view.status,
                view.output,
                steps
                    .iter()
                    .map(|s| (s.step_name.clone(), s.status.clone()))
                    .collect::<Vec<_>>(),
            ));
        }
        results.push(outcome);
    }
    assert_eq!(results[0], results[1]);
}

// ============================================
// Listing
// ============================================

#[tokio::test]
async fn list_executions_filters_by_status() {
    let harness = harness(mock_registry());
    harness
        .engine
        .register_workflow("order-flow", None, "1.0", &linear_definition())
        .await
        .unwrap();

    let done = start(&harness, "order-flow", json!({"orderId": 1})).await;
    run_until_terminal(&harness, &done).await;
    let pending = start(&harness, "order-flow", json!({"orderId": 2})).await;

    let running = harness
        .engine
        .list_executions(ExecutionFilter {
            status: Some(ExecutionStatus::Running),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].execution_id, pending);

    let completed = harness
        .engine
        .list_executions(ExecutionFilter {
            status: Some(ExecutionStatus::Completed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].execution_id, done);
}
