use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tessera_types::config::EngineConfig;
use tessera_types::delayed_call::DelayedCallTarget;
use tessera_types::event::EngineEvent;
use tessera_types::execution::{ExecutionRef, TaskExecution, WorkflowExecution, WorkflowExecutionFilter};
use tessera_types::result::ActionResult;
use tessera_types::spec::{JsonMap, WorkflowSpec};
use tessera_types::state::{ActionState, TaskState, WorkflowState};
use uuid::Uuid;

use super::*;
use crate::repository::InMemoryExecutionStore;
use crate::workflow::catalog::InMemoryCatalog;
use crate::workflow::executor::{ActionRequest, ExecutorError};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Records requests instead of running them; the test decides the results.
#[derive(Clone, Default)]
struct RecordingExecutor {
    requests: Arc<Mutex<Vec<ActionRequest>>>,
    rejected: Arc<Mutex<HashSet<String>>>,
}

impl RecordingExecutor {
    fn take(&self) -> Vec<ActionRequest> {
        std::mem::take(&mut *self.requests.lock().unwrap())
    }

    fn reject(&self, action: &str) {
        self.rejected.lock().unwrap().insert(action.to_string());
    }
}

impl ActionExecutor for RecordingExecutor {
    async fn dispatch(&self, request: ActionRequest) -> Result<(), ExecutorError> {
        if self.rejected.lock().unwrap().contains(&request.action) {
            return Err(ExecutorError::UnknownAction(request.action));
        }
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}

type TestEngine = Engine<InMemoryExecutionStore, RecordingExecutor>;

fn engine(yamls: &[&str]) -> (TestEngine, RecordingExecutor) {
    let catalog = InMemoryCatalog::new();
    for yaml in yamls {
        catalog.register(spec(yaml));
    }
    let executor = RecordingExecutor::default();
    let config = EngineConfig {
        transaction_retry_backoff_ms: 1,
        ..Default::default()
    };
    let engine = Engine::new(
        InMemoryExecutionStore::new(),
        executor.clone(),
        Arc::new(catalog),
        config,
    );
    (engine, executor)
}

fn spec(yaml: &str) -> WorkflowSpec {
    serde_yaml_ng::from_str(yaml).unwrap()
}

fn map(value: Value) -> JsonMap {
    match value {
        Value::Object(map) => map,
        _ => unreachable!("expected an object"),
    }
}

/// `std.echo` returns its `output` input, `std.fail` always fails.
fn respond(request: &ActionRequest) -> ActionResult {
    match request.action.as_str() {
        "std.echo" => ActionResult::data(request.input.get("output").cloned().unwrap_or(Value::Null)),
        "std.fail" => ActionResult::error("boom"),
        _ => ActionResult::data(Value::Null),
    }
}

/// Answer every outstanding request (and the ones they cause) until idle.
async fn run_pending(engine: &TestEngine, executor: &RecordingExecutor) -> usize {
    let mut handled = 0;
    loop {
        let requests = executor.take();
        if requests.is_empty() {
            return handled;
        }
        for request in requests {
            engine
                .on_action_complete(request.action_execution_id, respond(&request), false)
                .await
                .unwrap();
            handled += 1;
        }
    }
}

async fn start(engine: &TestEngine, name: &str, input: Value) -> WorkflowExecution {
    engine
        .start_workflow(name, &map(input), None, JsonMap::new())
        .await
        .unwrap()
}

async fn reload(engine: &TestEngine, id: Uuid) -> WorkflowExecution {
    engine.get_workflow_execution(id).await.unwrap().unwrap()
}

async fn task(engine: &TestEngine, wf_id: Uuid, name: &str) -> TaskExecution {
    engine
        .list_task_executions(wf_id)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.name == name)
        .unwrap_or_else(|| panic!("no task execution named {name}"))
}

fn later() -> chrono::DateTime<Utc> {
    Utc::now() + Duration::seconds(10)
}

// ---------------------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------------------

const GREETING: &str = r#"
name: greeting
tasks:
  - name: task1
    action: std.echo
    input:
      output: Hi
      sender: "{{ __env.from }}"
    publish:
      hi: "{{ result }}"
    on_success: [task2]
  - name: task2
    action: std.echo
    input:
      output: Morpheus
    publish:
      to: "{{ result }}"
    on_success: [task3]
  - name: task3
    action: std.noop
    publish:
      result: "{{ hi }}, {{ to }}!"
"#;

#[tokio::test]
async fn test_sequential_tasks_publish_into_context() {
    let (engine, executor) = engine(&[GREETING]);
    let params = env_params(map(json!({"from": "Neo"})));
    let wf = engine
        .start_workflow("greeting", &JsonMap::new(), Some("hello".into()), params)
        .await
        .unwrap();
    assert_eq!(wf.state, WorkflowState::Running);

    let first = executor.take();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].input["sender"], json!("Neo"));
    assert_eq!(first[0].attributes["task_name"], json!("task1"));
    engine
        .on_action_complete(first[0].action_execution_id, respond(&first[0]), false)
        .await
        .unwrap();
    assert_eq!(run_pending(&engine, &executor).await, 2);

    let wf = reload(&engine, wf.id).await;
    assert_eq!(wf.state, WorkflowState::Success);
    assert_eq!(wf.description.as_deref(), Some("hello"));
    let task3 = task(&engine, wf.id, "task3").await;
    assert_eq!(task3.published, map(json!({"result": "Hi, Morpheus!"})));
    assert_eq!(wf.output.unwrap()["result"], json!("Hi, Morpheus!"));
}

#[tokio::test]
async fn test_retry_exhausts_then_fails_workflow() {
    let (engine, executor) = engine(&[r#"
name: flaky
tasks:
  - name: t
    action: std.fail
    retry: { count: 3, delay: 1 }
"#]);
    let wf = start(&engine, "flaky", json!({})).await;

    let mut attempts = 0;
    for _ in 0..10 {
        attempts += run_pending(&engine, &executor).await;
        if engine.process_due_calls(later()).await.unwrap() == 0 {
            break;
        }
    }

    assert_eq!(attempts, 4);
    let wf = reload(&engine, wf.id).await;
    assert_eq!(wf.state, WorkflowState::Error);
    assert_eq!(wf.state_info.as_deref(), Some("boom"));
    let t = task(&engine, wf.id, "t").await;
    assert_eq!(t.state, TaskState::Error);
    assert_eq!(runtime::retry_no(&t.runtime_context), 3);
    assert!(engine.list_delayed_calls(wf.id).await.unwrap().is_empty());
}

const FAN_IN: &str = r#"
name: fan_in
tasks:
  - name: left
    action: std.echo
    input: { output: L }
    publish: { left_var: "{{ result }}" }
    on_success: [merge]
  - name: right
    action: std.echo
    input: { output: R }
    publish: { right_var: "{{ result }}" }
    on_success: [merge]
  - name: merge
    join: all
    action: std.noop
"#;

async fn run_fan_in(reverse_order: bool) -> WorkflowExecution {
    let (engine, executor) = engine(&[FAN_IN]);
    let wf = start(&engine, "fan_in", json!({})).await;

    let mut starts = executor.take();
    assert_eq!(starts.len(), 2);
    if reverse_order {
        starts.reverse();
    }
    let (first, second) = (&starts[0], &starts[1]);

    engine
        .on_action_complete(first.action_execution_id, respond(first), false)
        .await
        .unwrap();
    assert!(executor.take().is_empty(), "join must wait for both branches");
    assert_eq!(task(&engine, wf.id, "merge").await.state, TaskState::Waiting);

    engine
        .on_action_complete(second.action_execution_id, respond(second), false)
        .await
        .unwrap();
    assert_eq!(run_pending(&engine, &executor).await, 1);
    reload(&engine, wf.id).await
}

#[tokio::test]
async fn test_join_all_collects_both_branches_in_either_order() {
    for reverse_order in [false, true] {
        let wf = run_fan_in(reverse_order).await;
        assert_eq!(wf.state, WorkflowState::Success);
        let output = wf.output.unwrap();
        assert_eq!(output["left_var"], json!("L"));
        assert_eq!(output["right_var"], json!("R"));
    }
}

// ---------------------------------------------------------------------------
// Action results
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_redundant_continue_schedules_each_task_once() {
    let (engine, executor) = engine(&[FAN_IN]);
    let wf = start(&engine, "fan_in", json!({})).await;
    let starts = executor.take();
    assert_eq!(starts.len(), 2);

    for _ in 0..2 {
        engine.continue_workflow(wf.id).await.unwrap();
    }
    assert!(executor.take().is_empty());

    engine
        .on_action_complete(starts[0].action_execution_id, respond(&starts[0]), false)
        .await
        .unwrap();
    for _ in 0..2 {
        engine.continue_workflow(wf.id).await.unwrap();
    }
    assert!(executor.take().is_empty(), "join must still wait");

    engine
        .on_action_complete(starts[1].action_execution_id, respond(&starts[1]), false)
        .await
        .unwrap();
    for _ in 0..3 {
        engine.continue_workflow(wf.id).await.unwrap();
    }
    let merge = executor.take();
    assert_eq!(merge.len(), 1, "merge is dispatched exactly once");
    assert_eq!(engine.list_task_executions(wf.id).await.unwrap().len(), 3);

    engine
        .on_action_complete(merge[0].action_execution_id, respond(&merge[0]), false)
        .await
        .unwrap();
    engine.continue_workflow(wf.id).await.unwrap();
    assert!(executor.take().is_empty());
    assert_eq!(engine.list_task_executions(wf.id).await.unwrap().len(), 3);
    assert_eq!(reload(&engine, wf.id).await.state, WorkflowState::Success);
}

#[tokio::test]
async fn test_duplicate_completion_is_a_noop() {
    let (engine, executor) = engine(&[GREETING]);
    let wf = start(&engine, "greeting", json!({})).await;
    let request = executor.take().remove(0);

    let first = engine
        .on_action_complete(request.action_execution_id, ActionResult::data("Hi"), false)
        .await
        .unwrap();
    assert_eq!(first, Some(ExecutionRef::Action(request.action_execution_id)));
    let second = engine
        .on_action_complete(request.action_execution_id, ActionResult::error("late"), false)
        .await
        .unwrap();
    assert_eq!(second, None);

    let task1 = task(&engine, wf.id, "task1").await;
    assert_eq!(task1.state, TaskState::Success);
    let actions = engine.list_action_executions(task1.id).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].state, ActionState::Success);
    assert!(actions[0].accepted);
}

#[tokio::test]
async fn test_unknown_action_execution_is_not_found() {
    let (engine, _executor) = engine(&[GREETING]);
    let err = engine
        .on_action_complete(Uuid::now_v7(), ActionResult::data(1), false)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn test_rejected_dispatch_fails_the_task() {
    let (engine, executor) = engine(&[r#"
name: missing
tasks:
  - name: t
    action: std.missing
"#]);
    executor.reject("std.missing");
    let wf = start(&engine, "missing", json!({})).await;

    let wf = reload(&engine, wf.id).await;
    assert_eq!(wf.state, WorkflowState::Error);
    let t = task(&engine, wf.id, "t").await;
    assert_eq!(t.state, TaskState::Error);
    assert!(t.state_info.unwrap().starts_with("Failed to run action"));
}

// ---------------------------------------------------------------------------
// With-items
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_with_items_respects_concurrency_and_keeps_positions() {
    let (engine, executor) = engine(&[r#"
name: fan_out
input: [xs]
tasks:
  - name: each
    action: std.echo
    with_items: "x in {{ xs }}"
    concurrency: 2
    input: { output: "{{ x }}" }
"#]);
    let wf = start(&engine, "fan_out", json!({"xs": [10, 20, 30]})).await;

    let batch = executor.take();
    assert_eq!(batch.len(), 2);
    let index_of = |r: &ActionRequest| r.attributes["index"].as_u64().unwrap();
    assert_eq!(batch.iter().map(index_of).collect::<Vec<_>>(), vec![0, 1]);

    // Finish out of order; the third iteration starts once a slot frees up.
    for request in batch.iter().rev() {
        engine
            .on_action_complete(request.action_execution_id, respond(request), false)
            .await
            .unwrap();
    }
    let third = executor.take();
    assert_eq!(third.len(), 1);
    assert_eq!(index_of(&third[0]), 2);
    engine
        .on_action_complete(third[0].action_execution_id, respond(&third[0]), false)
        .await
        .unwrap();

    let wf = reload(&engine, wf.id).await;
    assert_eq!(wf.state, WorkflowState::Success);
    let each = task(&engine, wf.id, "each").await;
    assert_eq!(each.published["each"], json!([10, 20, 30]));
    assert_eq!(each.runtime_context["result"], json!([10, 20, 30]));
}

#[tokio::test]
async fn test_empty_with_items_succeeds_immediately() {
    let (engine, executor) = engine(&[r#"
name: nothing
input: [xs]
tasks:
  - name: each
    action: std.echo
    with_items: "x in {{ xs }}"
"#]);
    let wf = start(&engine, "nothing", json!({"xs": []})).await;
    assert!(executor.take().is_empty());
    assert_eq!(reload(&engine, wf.id).await.state, WorkflowState::Success);
}

#[tokio::test]
async fn test_with_items_publish_error_fails_the_task() {
    let (engine, executor) = engine(&[r#"
name: bad_publish
input: [xs]
tasks:
  - name: each
    action: std.echo
    with_items: "x in {{ xs }}"
    input: { output: "{{ x }}" }
    publish: { v: "{{ result | nosuchtransform }}" }
"#]);
    let wf = start(&engine, "bad_publish", json!({"xs": [1]})).await;
    let request = executor.take().remove(0);

    let first = engine
        .on_action_complete(request.action_execution_id, respond(&request), false)
        .await
        .unwrap();
    assert_eq!(first, Some(ExecutionRef::Action(request.action_execution_id)));

    let wf = reload(&engine, wf.id).await;
    assert_eq!(wf.state, WorkflowState::Error);
    let each = task(&engine, wf.id, "each").await;
    assert_eq!(each.state, TaskState::Error);
    assert!(each.state_info.unwrap().contains("nosuchtransform"));
    let actions = engine.list_action_executions(each.id).await.unwrap();
    assert!(actions[0].accepted);

    // Redelivery is a no-op rather than the same failure again.
    let again = engine
        .on_action_complete(request.action_execution_id, respond(&request), false)
        .await
        .unwrap();
    assert_eq!(again, None);
}

const PARTIAL: &str = r#"
name: partial
input: [xs]
tasks:
  - name: each
    action: std.echo
    safe_rerun: true
    with_items: "x in {{ xs }}"
    input: { output: "{{ x }}" }
    publish: { doubled: "{{ result }}" }
"#;

#[tokio::test]
async fn test_partial_rerun_only_repeats_failed_iterations() {
    let (engine, executor) = engine(&[PARTIAL]);
    let wf = start(&engine, "partial", json!({"xs": ["a", "b", "c"]})).await;

    for request in executor.take() {
        let result = if request.attributes["index"] == json!(1) {
            ActionResult::error("second failed")
        } else {
            respond(&request)
        };
        engine
            .on_action_complete(request.action_execution_id, result, false)
            .await
            .unwrap();
    }
    let wf = reload(&engine, wf.id).await;
    assert_eq!(wf.state, WorkflowState::Error);
    let each = task(&engine, wf.id, "each").await;
    assert_eq!(each.state_info.as_deref(), Some("second failed"));

    let wf = engine.rerun_workflow(each.id, false, &JsonMap::new()).await.unwrap();
    assert_eq!(wf.state, WorkflowState::Running);
    let retried = executor.take();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].attributes["index"], json!(1));
    assert_eq!(retried[0].input["output"], json!("b"));
    engine
        .on_action_complete(retried[0].action_execution_id, respond(&retried[0]), false)
        .await
        .unwrap();

    let wf = reload(&engine, wf.id).await;
    assert_eq!(wf.state, WorkflowState::Success);
    assert_eq!(wf.output.unwrap()["doubled"], json!(["a", "b", "c"]));
}

#[tokio::test]
async fn test_partial_rerun_requires_safe_rerun() {
    let yaml = PARTIAL.replace("safe_rerun: true", "safe_rerun: false");
    let (engine, executor) = engine(&[yaml.as_str()]);
    let wf = start(&engine, "partial", json!({"xs": ["a"]})).await;
    for request in executor.take() {
        engine
            .on_action_complete(request.action_execution_id, ActionResult::error("no"), false)
            .await
            .unwrap();
    }
    let each = task(&engine, wf.id, "each").await;

    let err = engine.rerun_workflow(each.id, false, &JsonMap::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Input(_)));
    assert!(engine.rerun_workflow(each.id, true, &JsonMap::new()).await.is_ok());
    assert_eq!(executor.take().len(), 1);
}

#[tokio::test]
async fn test_partial_rerun_rearms_the_timeout() {
    let yaml = PARTIAL.replace("safe_rerun: true", "safe_rerun: true\n    timeout: 30");
    let (engine, executor) = engine(&[yaml.as_str()]);
    let wf = start(&engine, "partial", json!({"xs": ["a"]})).await;
    for request in executor.take() {
        engine
            .on_action_complete(request.action_execution_id, ActionResult::error("no"), false)
            .await
            .unwrap();
    }
    assert!(engine.list_delayed_calls(wf.id).await.unwrap().is_empty());
    let each = task(&engine, wf.id, "each").await;

    engine.rerun_workflow(each.id, false, &JsonMap::new()).await.unwrap();
    assert_eq!(executor.take().len(), 1);
    let calls = engine.list_delayed_calls(wf.id).await.unwrap();
    assert_eq!(calls.len(), 1);
    assert!(matches!(
        calls[0].target,
        DelayedCallTarget::TaskTimeout { task_execution_id, timeout_secs: 30 } if task_execution_id == each.id
    ));

    engine
        .process_due_calls(Utc::now() + Duration::seconds(60))
        .await
        .unwrap();
    let each = task(&engine, wf.id, "each").await;
    assert_eq!(each.state, TaskState::Error);
    assert_eq!(each.state_info.as_deref(), Some("Task timed out after 30 seconds"));
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_handled_error_lets_workflow_succeed() {
    let (engine, executor) = engine(&[r#"
name: recovering
tasks:
  - name: risky
    action: std.fail
    publish_on_error: { reason: "{{ result }}" }
    on_error: [recover]
  - name: recover
    action: std.noop
"#]);
    let wf = start(&engine, "recovering", json!({})).await;
    assert_eq!(run_pending(&engine, &executor).await, 2);

    let wf = reload(&engine, wf.id).await;
    assert_eq!(wf.state, WorkflowState::Success);
    assert_eq!(wf.context["reason"], json!("boom"));
    let risky = task(&engine, wf.id, "risky").await;
    assert_eq!(risky.state, TaskState::Error);
    assert!(runtime::error_handled(&risky.runtime_context));
}

#[tokio::test]
async fn test_fail_command_ends_workflow() {
    let (engine, executor) = engine(&[r#"
name: failing
tasks:
  - name: check
    action: std.echo
    input: { output: bad }
    on_success:
      - task: fail
        when: "result == 'bad'"
      - task: next
        when: "result == 'good'"
  - name: next
    action: std.noop
"#]);
    let wf = start(&engine, "failing", json!({})).await;
    run_pending(&engine, &executor).await;

    let wf = reload(&engine, wf.id).await;
    assert_eq!(wf.state, WorkflowState::Error);
    assert_eq!(wf.state_info.as_deref(), Some("Failed by task 'check'"));
    assert!(engine.list_task_executions(wf.id).await.unwrap().iter().all(|t| t.name != "next"));
}

#[tokio::test]
async fn test_reverse_workflow_runs_only_required_tasks() {
    let (engine, executor) = engine(&[r#"
name: build
type: reverse
tasks:
  - name: fetch
    action: std.noop
  - name: compile
    action: std.noop
    requires: [fetch]
  - name: package
    action: std.noop
    requires: [compile]
  - name: docs
    action: std.noop
"#]);
    let params = map(json!({"task_name": "compile"}));
    let wf = engine
        .start_workflow("build", &JsonMap::new(), None, params)
        .await
        .unwrap();
    assert_eq!(run_pending(&engine, &executor).await, 2);

    let wf = reload(&engine, wf.id).await;
    assert_eq!(wf.state, WorkflowState::Success);
    let mut names: Vec<String> = engine
        .list_task_executions(wf.id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["compile".to_string(), "fetch".to_string()]);
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_wait_before_defers_the_action() {
    let (engine, executor) = engine(&[r#"
name: patient
tasks:
  - name: t
    action: std.noop
    wait_before: 3
"#]);
    let wf = start(&engine, "patient", json!({})).await;
    assert!(executor.take().is_empty());
    assert_eq!(task(&engine, wf.id, "t").await.state, TaskState::RunningDelayed);
    assert_eq!(engine.list_delayed_calls(wf.id).await.unwrap().len(), 1);

    // Not due yet.
    assert_eq!(engine.process_due_calls(Utc::now()).await.unwrap(), 0);
    assert_eq!(engine.process_due_calls(later()).await.unwrap(), 1);
    assert_eq!(run_pending(&engine, &executor).await, 1);
    assert_eq!(reload(&engine, wf.id).await.state, WorkflowState::Success);
}

#[tokio::test]
async fn test_wait_after_holds_transitions() {
    let (engine, executor) = engine(&[r#"
name: cooldown
tasks:
  - name: first
    action: std.noop
    wait_after: 2
    on_success: [second]
  - name: second
    action: std.noop
"#]);
    let wf = start(&engine, "cooldown", json!({})).await;
    assert_eq!(run_pending(&engine, &executor).await, 1);
    assert_eq!(task(&engine, wf.id, "first").await.state, TaskState::Success);
    assert_eq!(engine.list_task_executions(wf.id).await.unwrap().len(), 1);

    engine.process_due_calls(later()).await.unwrap();
    assert_eq!(run_pending(&engine, &executor).await, 1);
    assert_eq!(reload(&engine, wf.id).await.state, WorkflowState::Success);
}

#[tokio::test]
async fn test_timeout_fails_a_running_task() {
    let (engine, executor) = engine(&[r#"
name: slow
tasks:
  - name: t
    action: std.noop
    timeout: 5
"#]);
    let wf = start(&engine, "slow", json!({})).await;
    let request = executor.take().remove(0);

    engine.process_due_calls(later()).await.unwrap();
    let wf = reload(&engine, wf.id).await;
    assert_eq!(wf.state, WorkflowState::Error);
    let t = task(&engine, wf.id, "t").await;
    assert_eq!(t.state_info.as_deref(), Some("Task timed out after 5 seconds"));

    // The late result is recorded but changes nothing.
    engine
        .on_action_complete(request.action_execution_id, ActionResult::data(1), false)
        .await
        .unwrap();
    assert_eq!(task(&engine, wf.id, "t").await.state, TaskState::Error);
}

#[tokio::test]
async fn test_retry_count_must_be_a_number() {
    let (engine, executor) = engine(&[r#"
name: typed
tasks:
  - name: t
    action: std.fail
    retry: { count: "3" }
"#]);
    let wf = start(&engine, "typed", json!({})).await;
    assert_eq!(run_pending(&engine, &executor).await, 1);

    let t = task(&engine, wf.id, "t").await;
    assert_eq!(t.state, TaskState::Error);
    assert!(t.state_info.unwrap().contains("retry.count"));
    assert_eq!(reload(&engine, wf.id).await.state, WorkflowState::Error);
}

#[tokio::test]
async fn test_pause_before_then_resume() {
    let (engine, executor) = engine(&[r#"
name: gated
tasks:
  - name: prepare
    action: std.noop
    on_success: [deploy]
  - name: deploy
    action: std.echo
    pause_before: true
    input: { output: "{{ __env.stage }}" }
"#]);
    let wf = start(&engine, "gated", json!({})).await;
    assert_eq!(run_pending(&engine, &executor).await, 1);

    let paused = reload(&engine, wf.id).await;
    assert_eq!(paused.state, WorkflowState::Paused);
    assert_eq!(task(&engine, wf.id, "deploy").await.state, TaskState::Idle);

    let resumed = engine
        .resume_workflow(wf.id, &map(json!({"stage": "prod"})))
        .await
        .unwrap();
    assert_eq!(resumed.state, WorkflowState::Running);
    let requests = executor.take();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].input["output"], json!("prod"));
    engine
        .on_action_complete(requests[0].action_execution_id, respond(&requests[0]), false)
        .await
        .unwrap();
    assert_eq!(reload(&engine, wf.id).await.state, WorkflowState::Success);
}

#[tokio::test]
async fn test_pause_before_holds_sibling_start_tasks() {
    let (engine, executor) = engine(&[r#"
name: siblings
tasks:
  - name: a
    action: std.echo
    pause_before: true
    input: { output: A }
  - name: b
    action: std.echo
    input: { output: B }
"#]);
    let wf = start(&engine, "siblings", json!({})).await;
    assert_eq!(wf.state, WorkflowState::Paused);
    assert!(executor.take().is_empty(), "nothing runs while paused");
    assert_eq!(task(&engine, wf.id, "a").await.state, TaskState::Idle);
    assert_eq!(task(&engine, wf.id, "b").await.state, TaskState::Idle);

    engine.resume_workflow(wf.id, &JsonMap::new()).await.unwrap();
    assert_eq!(task(&engine, wf.id, "b").await.state, TaskState::Running);
    assert_eq!(run_pending(&engine, &executor).await, 2);
    assert_eq!(reload(&engine, wf.id).await.state, WorkflowState::Success);
}

// ---------------------------------------------------------------------------
// Lifecycle operations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pause_and_resume_state_checks() {
    let (engine, executor) = engine(&[GREETING]);
    let wf = start(&engine, "greeting", json!({})).await;

    let err = engine.resume_workflow(wf.id, &JsonMap::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition(_)));

    engine.pause_workflow(wf.id).await.unwrap();
    let err = engine.pause_workflow(wf.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition(_)));

    // A result arriving while paused completes the task but nothing new starts.
    let request = executor.take().remove(0);
    engine
        .on_action_complete(request.action_execution_id, respond(&request), false)
        .await
        .unwrap();
    assert!(executor.take().is_empty());

    engine.resume_workflow(wf.id, &JsonMap::new()).await.unwrap();
    assert_eq!(run_pending(&engine, &executor).await, 2);
    assert_eq!(reload(&engine, wf.id).await.state, WorkflowState::Success);
}

#[tokio::test]
async fn test_stop_cancels_running_tasks() {
    let (engine, executor) = engine(&[FAN_IN]);
    let wf = start(&engine, "fan_in", json!({})).await;
    let requests = executor.take();

    let err = engine
        .stop_workflow(wf.id, WorkflowState::Running, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Input(_)));

    let stopped = engine
        .stop_workflow(wf.id, WorkflowState::Cancelled, Some("operator".into()))
        .await
        .unwrap();
    assert_eq!(stopped.state, WorkflowState::Cancelled);
    assert_eq!(stopped.state_info.as_deref(), Some("operator"));
    for t in engine.list_task_executions(wf.id).await.unwrap() {
        assert_eq!(t.state, TaskState::Cancelled);
    }

    let err = engine
        .stop_workflow(wf.id, WorkflowState::Error, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition(_)));

    // Running actions are not interrupted; their results are just recorded.
    engine
        .on_action_complete(requests[0].action_execution_id, respond(&requests[0]), false)
        .await
        .unwrap();
    assert!(executor.take().is_empty());
    assert_eq!(reload(&engine, wf.id).await.state, WorkflowState::Cancelled);
}

#[tokio::test]
async fn test_rerun_failed_task() {
    let (engine, executor) = engine(&[r#"
name: rerunnable
tasks:
  - name: t
    action: std.fail
    on_success: [after]
  - name: after
    action: std.noop
"#]);
    let wf = start(&engine, "rerunnable", json!({})).await;
    run_pending(&engine, &executor).await;
    assert_eq!(reload(&engine, wf.id).await.state, WorkflowState::Error);
    let failed = task(&engine, wf.id, "t").await;

    let wf = engine
        .rerun_workflow(failed.id, true, &map(json!({"attempt": 2})))
        .await
        .unwrap();
    assert_eq!(wf.state, WorkflowState::Running);
    assert_eq!(wf.params["env"], json!({"attempt": 2}));
    let request = executor.take().remove(0);
    assert_eq!(request.action, "std.fail");
    engine
        .on_action_complete(request.action_execution_id, ActionResult::data("fixed"), false)
        .await
        .unwrap();
    assert_eq!(run_pending(&engine, &executor).await, 1);
    assert_eq!(reload(&engine, wf.id).await.state, WorkflowState::Success);

    let t = task(&engine, wf.id, "t").await;
    assert_eq!(engine.list_action_executions(t.id).await.unwrap().len(), 1);
    let err = engine.rerun_workflow(t.id, true, &JsonMap::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition(_)));
}

#[tokio::test]
async fn test_start_rejects_bad_input() {
    let (engine, _executor) = engine(&[r#"
name: typed_input
input: [name, { greeting: Hello }]
tasks:
  - name: t
    action: std.noop
"#]);
    let err = engine
        .start_workflow("typed_input", &JsonMap::new(), None, JsonMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Input(_)));

    let err = engine
        .start_workflow("typed_input", &map(json!({"name": "a", "extra": 1})), None, JsonMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Input(_)));

    let err = engine
        .start_workflow("ghost", &JsonMap::new(), None, JsonMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let wf = start(&engine, "typed_input", json!({"name": "Neo"})).await;
    assert_eq!(wf.input["greeting"], json!("Hello"));
}

#[tokio::test]
async fn test_delete_requires_terminal_state_unless_forced() {
    let (engine, executor) = engine(&[GREETING]);
    let wf = start(&engine, "greeting", json!({})).await;

    let err = engine.delete_workflow_execution(wf.id, false).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition(_)));

    run_pending(&engine, &executor).await;
    assert_eq!(engine.delete_workflow_execution(wf.id, false).await.unwrap(), 1);
    assert!(engine.get_workflow_execution(wf.id).await.unwrap().is_none());
    assert!(engine.list_task_executions(wf.id).await.unwrap().is_empty());

    let forced = start(&engine, "greeting", json!({})).await;
    assert_eq!(engine.delete_workflow_execution(forced.id, true).await.unwrap(), 1);
}

#[tokio::test]
async fn test_state_changes_are_published() {
    let (engine, executor) = engine(&[GREETING]);
    let mut events = engine.events().subscribe();
    let wf = start(&engine, "greeting", json!({})).await;
    run_pending(&engine, &executor).await;

    let mut workflow_states = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.workflow_execution_id(), wf.id);
        if let EngineEvent::WorkflowStateChanged { to, .. } = event {
            workflow_states.push(to);
        }
    }
    assert_eq!(workflow_states, vec![WorkflowState::Running, WorkflowState::Success]);
}

// ---------------------------------------------------------------------------
// Sub-workflows
// ---------------------------------------------------------------------------

const PARENT: &str = r#"
name: parent
tasks:
  - name: call
    workflow: child
    input: { name: "{{ __env.who }}" }
    publish: { got: "{{ result.greeting }}" }
"#;

const CHILD: &str = r#"
name: child
input: [name]
tasks:
  - name: greet
    action: std.echo
    input: { output: "{{ name }}" }
    publish: { greeting: "{{ result }}" }
"#;

#[tokio::test]
async fn test_sub_workflow_reports_to_parent() {
    let (engine, executor) = engine(&[PARENT, CHILD]);
    let params = env_params(map(json!({"who": "Trinity"})));
    let parent = engine
        .start_workflow("parent", &JsonMap::new(), None, params)
        .await
        .unwrap();

    let call = task(&engine, parent.id, "call").await;
    let children = engine
        .list_workflow_executions(&WorkflowExecutionFilter {
            parent_task_id: Some(call.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(children.len(), 1);
    let child = &children[0];
    assert_eq!(child.root_execution_id, parent.id);
    assert_eq!(child.input["name"], json!("Trinity"));
    assert_eq!(child.env()["who"], json!("Trinity"));

    assert_eq!(run_pending(&engine, &executor).await, 1);
    assert_eq!(reload(&engine, child.id).await.state, WorkflowState::Success);
    let parent = reload(&engine, parent.id).await;
    assert_eq!(parent.state, WorkflowState::Success);
    assert_eq!(parent.context["got"], json!("Trinity"));

    assert_eq!(engine.delete_workflow_execution(parent.id, false).await.unwrap(), 2);
    assert!(engine.get_workflow_execution(child.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_sub_workflow_fails_parent_task() {
    let child = CHILD.replace("std.echo", "std.fail");
    let (engine, executor) = engine(&[PARENT, child.as_str()]);
    let parent = engine
        .start_workflow("parent", &JsonMap::new(), None, env_params(map(json!({"who": "x"}))))
        .await
        .unwrap();
    run_pending(&engine, &executor).await;

    let parent = reload(&engine, parent.id).await;
    assert_eq!(parent.state, WorkflowState::Error);
    let call = task(&engine, parent.id, "call").await;
    assert_eq!(call.state_info.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_unknown_sub_workflow_fails_task() {
    let (engine, _executor) = engine(&[PARENT]);
    let parent = engine
        .start_workflow("parent", &JsonMap::new(), None, JsonMap::new())
        .await
        .unwrap();
    let parent = reload(&engine, parent.id).await;
    assert_eq!(parent.state, WorkflowState::Error);
    let call = task(&engine, parent.id, "call").await;
    assert_eq!(call.state_info.as_deref(), Some("Workflow 'child' not found"));
}
