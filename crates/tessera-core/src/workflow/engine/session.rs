//! One dispatcher operation's unit of work.
//!
//! A [`Session`] owns the open transaction and collects everything that must
//! only happen after it commits (action dispatch, sub-workflow follow-ups,
//! events) in a [`PostCommit`]. Task lifecycles are driven by an explicit
//! step loop rather than recursion:
//!
//! ```text
//! Start -> Run -> (action in flight) ... Complete -> After -> Settle -> Done
//!   |       ^                                          |
//!   +-------+-- halted by a policy: Done               +-- retry: Run / Done
//! ```

use chrono::Utc;
use serde_json::{json, Value};
use tessera_types::delayed_call::{DelayedCall, DelayedCallTarget};
use tessera_types::event::EngineEvent;
use tessera_types::execution::{ActionExecution, TaskExecution, WorkflowExecution};
use tessera_types::result::ActionResult;
use tessera_types::spec::{JsonMap, WorkflowType};
use tessera_types::state::{TaskState, WorkflowState};
use uuid::Uuid;

use crate::repository::{ExecutionStore, ExecutionTx};
use crate::workflow::context::{
    evaluate_publish, merge_published, outbound_view, workflow_view, ContextView, ENV_KEY,
    RESULT_KEY,
};
use crate::workflow::controller::{
    controller_for, TaskCommand, WorkflowController, WorkflowOutcome, WorkflowSnapshot,
};
use crate::workflow::definition::validate_spec;
use crate::workflow::executor::{ActionExecutor, ActionRequest};
use crate::workflow::expression::{evaluate_recursively, ExpressionError, ExpressionEvaluator};
use crate::workflow::policy::{
    build_policies, run_after, run_before, PolicyContext, PolicyEffect, TaskPolicy, TimeoutPolicy,
};
use crate::workflow::runtime::{self, ERROR_HANDLED_KEY, NEXT_TASKS_KEY};
use crate::workflow::with_items::{expand, get_for_each_output, WithItemsState};

use super::input::resolve_input;
use super::{offset_ms, Engine, EngineError};

/// Action run by tasks that name neither an action nor a workflow.
pub const NOOP_ACTION: &str = "std.noop";

/// Upper bound on controller passes per operation.
const MAX_CONTROLLER_PASSES: usize = 10_000;

// ---------------------------------------------------------------------------
// Post-commit work
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(super) struct PostCommit {
    pub dispatches: Vec<ActionRequest>,
    pub followups: Vec<Followup>,
    pub events: Vec<EngineEvent>,
}

#[derive(Debug)]
pub(super) enum Followup {
    /// Run the controller of a freshly started sub-workflow.
    Continue(Uuid),
    /// A sub-workflow finished; deliver its result to the parent task.
    Report {
        execution_id: Uuid,
        result: ActionResult,
    },
}

// ---------------------------------------------------------------------------
// Task steps
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(super) enum TaskStep {
    /// Run the before-start policy chain.
    Start,
    /// Launch the action, sub-workflow or with-items iterations.
    Run,
    /// Record the final state and publish.
    Complete {
        state: TaskState,
        info: Option<String>,
        /// Run the after-completion chain (retry, wait-after).
        after: bool,
    },
    After,
    /// Merge what a terminal task published into the workflow context.
    Settle,
    Done,
}

fn failed(info: impl Into<String>) -> TaskStep {
    TaskStep::Complete {
        state: TaskState::Error,
        info: Some(info.into()),
        after: true,
    }
}

/// Point a task at the workflow's current environment before it (re)starts.
pub(super) fn refresh_env(wf: &WorkflowExecution, task: &mut TaskExecution) {
    task.in_context
        .insert(ENV_KEY.to_string(), Value::Object(wf.env()));
}

enum Launch {
    Started,
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub(super) struct Session<'e, S: ExecutionStore, X: ActionExecutor> {
    engine: &'e Engine<S, X>,
    pub tx: S::Tx,
    post: PostCommit,
}

impl<'e, S: ExecutionStore, X: ActionExecutor> Session<'e, S, X> {
    pub async fn begin(engine: &'e Engine<S, X>) -> Result<Self, EngineError> {
        Ok(Self {
            engine,
            tx: engine.store.begin().await?,
            post: PostCommit::default(),
        })
    }

    pub async fn commit(self) -> Result<PostCommit, EngineError> {
        self.tx.commit().await?;
        Ok(self.post)
    }

    fn evaluator(&self) -> &'e dyn ExpressionEvaluator {
        self.engine.evaluator.as_ref()
    }

    // -----------------------------------------------------------------------
    // State changes
    // -----------------------------------------------------------------------

    pub fn set_workflow_state(
        &mut self,
        wf: &mut WorkflowExecution,
        to: WorkflowState,
        info: Option<String>,
    ) {
        let from = wf.state;
        wf.state = to;
        wf.state_info = info;
        wf.updated_at = Utc::now();
        if from == to {
            return;
        }
        tracing::info!(
            workflow_execution_id = %wf.id,
            workflow = %wf.workflow_name,
            %from,
            %to,
            "workflow state changed"
        );
        self.post.events.push(EngineEvent::WorkflowStateChanged {
            workflow_execution_id: wf.id,
            workflow_name: wf.workflow_name.clone(),
            from,
            to,
            state_info: wf.state_info.clone(),
            at: wf.updated_at,
        });
    }

    pub fn task_changed(&mut self, task: &TaskExecution, from: TaskState) {
        if task.state == from {
            return;
        }
        tracing::debug!(
            workflow_execution_id = %task.workflow_execution_id,
            task = %task.name,
            %from,
            to = %task.state,
            "task state changed"
        );
        self.post.events.push(EngineEvent::TaskStateChanged {
            workflow_execution_id: task.workflow_execution_id,
            task_execution_id: task.id,
            task_name: task.name.clone(),
            from,
            to: task.state,
            at: Utc::now(),
        });
    }

    pub async fn schedule(
        &mut self,
        workflow_execution_id: Uuid,
        target: DelayedCallTarget,
        delay_secs: u64,
    ) -> Result<(), EngineError> {
        let run_at = offset_ms(Utc::now(), delay_secs.saturating_mul(1_000));
        let call = DelayedCall::new(target, workflow_execution_id, run_at);
        tracing::debug!(
            %workflow_execution_id,
            kind = target.kind(),
            delay_secs,
            "scheduled delayed call"
        );
        self.tx.create_delayed_call(&call).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Task lifecycle
    // -----------------------------------------------------------------------

    /// Advance `task` from `step` until it waits on something external,
    /// then persist it.
    pub async fn drive(
        &mut self,
        wf: &mut WorkflowExecution,
        task: &mut TaskExecution,
        mut step: TaskStep,
    ) -> Result<(), EngineError> {
        loop {
            step = match step {
                TaskStep::Start => self.start_task(wf, task).await?,
                TaskStep::Run => self.run_task(wf, task).await?,
                TaskStep::Complete { state, info, after } => {
                    self.complete_task(task, state, info, after)
                }
                TaskStep::After => self.after_task(wf, task).await?,
                TaskStep::Settle => {
                    if task.state.is_terminal() {
                        wf.context = merge_published(&wf.context, &task.published);
                    }
                    TaskStep::Done
                }
                TaskStep::Done => break,
            };
        }
        task.updated_at = Utc::now();
        self.tx.update_task_execution(task).await?;
        Ok(())
    }

    async fn start_task(
        &mut self,
        wf: &mut WorkflowExecution,
        task: &mut TaskExecution,
    ) -> Result<TaskStep, EngineError> {
        let from = task.state;
        let policies = build_policies(&task.spec);
        let context = Value::Object(task.in_context.clone());
        let ctx = PolicyContext {
            evaluator: self.evaluator(),
            context: &context,
        };
        let outcome = match run_before(&policies, task, &ctx) {
            Ok(outcome) => outcome,
            Err(e) => {
                return Ok(TaskStep::Complete {
                    state: TaskState::Error,
                    info: Some(e.to_string()),
                    after: false,
                });
            }
        };
        self.task_changed(task, from);

        let halted = outcome.halted;
        Ok(match self.apply_effects(wf, task, outcome.effects).await? {
            Some(step) => step,
            None if halted => TaskStep::Done,
            None => TaskStep::Run,
        })
    }

    /// Arm the timeout of a task that restarts without its before-chain
    /// (a partial with-items rerun). Returns the failing step when the
    /// timeout value is invalid.
    pub async fn rearm_timeout(
        &mut self,
        wf: &mut WorkflowExecution,
        task: &mut TaskExecution,
    ) -> Result<Option<TaskStep>, EngineError> {
        let Some(seconds) = task.spec.timeout.clone() else {
            return Ok(None);
        };
        let context = Value::Object(task.in_context.clone());
        let ctx = PolicyContext {
            evaluator: self.evaluator(),
            context: &context,
        };
        match (TimeoutPolicy { seconds }).before_task_start(task, &ctx) {
            Ok(outcome) => self.apply_effects(wf, task, outcome.effects).await,
            Err(e) => Ok(Some(TaskStep::Complete {
                state: TaskState::Error,
                info: Some(e.to_string()),
                after: false,
            })),
        }
    }

    async fn run_task(
        &mut self,
        wf: &mut WorkflowExecution,
        task: &mut TaskExecution,
    ) -> Result<TaskStep, EngineError> {
        let from = task.state;
        task.state = TaskState::Running;
        task.runtime_context.remove(RESULT_KEY);
        self.task_changed(task, from);

        let Some(with_items) = task.spec.with_items.clone() else {
            let input = match self.evaluate_input(task, JsonMap::new()) {
                Ok(input) => input,
                Err(e) => return Ok(failed(e.to_string())),
            };
            return Ok(match self.launch(wf, task, input, 0).await? {
                Launch::Started => TaskStep::Done,
                Launch::Rejected(message) => failed(message),
            });
        };

        let view = ContextView::from_map(task.in_context.clone());
        let items = match expand(self.evaluator(), &with_items, &view) {
            Ok(items) => items,
            Err(e) => return Ok(failed(e.to_string())),
        };
        let state = WithItemsState::new(items, runtime::concurrency(&task.runtime_context));
        tracing::debug!(
            task = %task.name,
            count = state.count,
            concurrency = state.concurrency,
            "expanding with-items"
        );
        self.dispatch_iterations(wf, task, state).await
    }

    /// Launch queued iterations while capacity allows. Completes the task
    /// once every iteration has reported.
    pub async fn dispatch_iterations(
        &mut self,
        wf: &WorkflowExecution,
        task: &mut TaskExecution,
        mut state: WithItemsState,
    ) -> Result<TaskStep, EngineError> {
        loop {
            let batch = state.next_batch();
            if batch.is_empty() {
                break;
            }
            for index in batch {
                let iteration = state.items.get(index).cloned().unwrap_or_default();
                let launched = match self.evaluate_input(task, iteration) {
                    Ok(input) => self.launch(wf, task, input, index).await?,
                    Err(e) => Launch::Rejected(e.to_string()),
                };
                if let Launch::Rejected(message) = launched {
                    get_for_each_output(
                        self.evaluator(),
                        task,
                        &mut state,
                        index,
                        &ActionResult::error(message),
                    );
                }
            }
        }

        state.save(task);
        if !state.is_complete() {
            return Ok(TaskStep::Done);
        }
        task.runtime_context
            .insert(RESULT_KEY.to_string(), Value::Array(state.results.clone()));
        Ok(match state.first_failure() {
            Some((_, message)) => failed(message),
            None => TaskStep::Complete {
                state: TaskState::Success,
                info: None,
                after: true,
            },
        })
    }

    fn complete_task(
        &mut self,
        task: &mut TaskExecution,
        state: TaskState,
        info: Option<String>,
        after: bool,
    ) -> TaskStep {
        let from = task.state;
        task.state = state;
        task.state_info = info;
        task.published = match state {
            TaskState::Success => match self.success_published(task) {
                Ok(published) => published,
                Err(e) => {
                    task.state = TaskState::Error;
                    task.state_info = Some(e.to_string());
                    self.error_published(task)
                }
            },
            TaskState::Error => self.error_published(task),
            _ => JsonMap::new(),
        };
        self.task_changed(task, from);
        tracing::info!(
            workflow_execution_id = %task.workflow_execution_id,
            task = %task.name,
            state = %task.state,
            "task completed"
        );
        if after {
            TaskStep::After
        } else {
            TaskStep::Settle
        }
    }

    async fn after_task(
        &mut self,
        wf: &mut WorkflowExecution,
        task: &mut TaskExecution,
    ) -> Result<TaskStep, EngineError> {
        let from = task.state;
        let policies = build_policies(&task.spec);
        let context = outbound_view(task).to_value();
        let ctx = PolicyContext {
            evaluator: self.evaluator(),
            context: &context,
        };
        match run_after(&policies, task, &ctx) {
            Ok(outcome) => {
                self.task_changed(task, from);
                Ok(self
                    .apply_effects(wf, task, outcome.effects)
                    .await?
                    .unwrap_or(TaskStep::Settle))
            }
            Err(e) => {
                task.state = TaskState::Error;
                task.state_info = Some(e.to_string());
                task.published = self.error_published(task);
                self.task_changed(task, from);
                Ok(TaskStep::Settle)
            }
        }
    }

    /// Apply policy effects. Returns the step an immediate retry continues with.
    async fn apply_effects(
        &mut self,
        wf: &mut WorkflowExecution,
        task: &mut TaskExecution,
        effects: Vec<PolicyEffect>,
    ) -> Result<Option<TaskStep>, EngineError> {
        let mut next = None;
        for effect in effects {
            match effect {
                PolicyEffect::Schedule { target, delay_secs } => {
                    self.schedule(wf.id, target, delay_secs).await?;
                }
                PolicyEffect::PauseWorkflow => {
                    if wf.state == WorkflowState::Running {
                        tracing::info!(task = %task.name, "pausing workflow before task");
                        self.set_workflow_state(wf, WorkflowState::Paused, None);
                    }
                }
                PolicyEffect::RetryTask { delay_secs } => {
                    for action in self.tx.list_action_executions(&task.id).await? {
                        self.tx.delete_action_execution(&action.id).await?;
                    }
                    tracing::info!(
                        workflow_execution_id = %wf.id,
                        task = %task.name,
                        retry_no = runtime::retry_no(&task.runtime_context),
                        delay_secs,
                        "retrying task"
                    );
                    if delay_secs > 0 {
                        let target = DelayedCallTarget::RetryTask {
                            task_execution_id: task.id,
                        };
                        self.schedule(wf.id, target, delay_secs).await?;
                    } else {
                        next = Some(TaskStep::Run);
                    }
                }
            }
        }
        Ok(next)
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    fn success_published(&self, task: &TaskExecution) -> Result<JsonMap, ExpressionError> {
        if task.spec.with_items.is_some() {
            return Ok(WithItemsState::load(task)
                .map(|state| state.outputs)
                .unwrap_or_default());
        }
        match &task.spec.publish {
            Some(clause) => {
                let result = task.runtime_context.get(RESULT_KEY).cloned().unwrap_or(Value::Null);
                let base = ContextView::from_map(task.in_context.clone());
                evaluate_publish(self.evaluator(), clause, &result, &base)
            }
            None => Ok(JsonMap::new()),
        }
    }

    fn error_published(&self, task: &TaskExecution) -> JsonMap {
        let result = task
            .runtime_context
            .get(RESULT_KEY)
            .cloned()
            .unwrap_or_else(|| Value::String(task.state_info.clone().unwrap_or_default()));
        self.clause_published(task, task.spec.publish_on_error.as_ref(), result)
    }

    fn clause_published(&self, task: &TaskExecution, clause: Option<&JsonMap>, result: Value) -> JsonMap {
        let Some(clause) = clause else {
            return JsonMap::new();
        };
        let base = ContextView::from_map(task.in_context.clone());
        evaluate_publish(self.evaluator(), clause, &result, &base).unwrap_or_else(|e| {
            tracing::warn!(task = %task.name, error = %e, "publish clause failed, publishing nothing");
            JsonMap::new()
        })
    }

    fn evaluate_input(&self, task: &TaskExecution, iteration: JsonMap) -> Result<JsonMap, ExpressionError> {
        let context = ContextView::from_map(task.in_context.clone())
            .with_layer(iteration)
            .to_value();
        match evaluate_recursively(self.evaluator(), &Value::Object(task.spec.input.clone()), &context)? {
            Value::Object(input) => Ok(input),
            other => Err(ExpressionError::InvalidContext(format!(
                "task input evaluated to a non-object: {other}"
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Launching
    // -----------------------------------------------------------------------

    async fn launch(
        &mut self,
        wf: &WorkflowExecution,
        task: &TaskExecution,
        input: JsonMap,
        index: usize,
    ) -> Result<Launch, EngineError> {
        if let Some(name) = &task.spec.workflow {
            return self.launch_subworkflow(wf, task, name, input, index).await;
        }

        let name = task.spec.action.clone().unwrap_or_else(|| NOOP_ACTION.to_string());
        let action = ActionExecution::new(task, name, input, index);
        self.tx.create_action_execution(&action).await?;

        let mut attributes = JsonMap::new();
        attributes.insert("workflow_execution_id".into(), json!(wf.id.to_string()));
        attributes.insert("workflow_name".into(), json!(wf.workflow_name));
        attributes.insert("task_execution_id".into(), json!(task.id.to_string()));
        attributes.insert("task_name".into(), json!(task.name));
        attributes.insert("index".into(), json!(index));
        self.post.dispatches.push(ActionRequest {
            action_execution_id: action.id,
            action: action.name,
            attributes,
            input: action.input,
        });
        Ok(Launch::Started)
    }

    /// Start a nested workflow whose id doubles as the action execution id
    /// the parent task waits on.
    async fn launch_subworkflow(
        &mut self,
        wf: &WorkflowExecution,
        task: &TaskExecution,
        name: &str,
        input: JsonMap,
        index: usize,
    ) -> Result<Launch, EngineError> {
        let Some(spec) = self.engine.catalog.get(name) else {
            return Ok(Launch::Rejected(format!("Workflow '{name}' not found")));
        };
        let max_depth = self.engine.config.max_nesting_depth;
        if self.nesting_depth(wf).await? + 1 > max_depth {
            return Ok(Launch::Rejected(format!(
                "Workflow nesting depth exceeds {max_depth}"
            )));
        }
        if spec.workflow_type == WorkflowType::Reverse {
            return Ok(Launch::Rejected(format!(
                "Workflow '{name}' is a reverse workflow and can't run as a task"
            )));
        }
        if let Err(e) = validate_spec(&spec, self.evaluator()) {
            return Ok(Launch::Rejected(e.to_string()));
        }
        let input = match resolve_input(&spec, &input) {
            Ok(input) => input,
            Err(e) => return Ok(Launch::Rejected(e.to_string())),
        };

        let action = ActionExecution::new(task, format!("workflow:{name}"), input.clone(), index);
        self.tx.create_action_execution(&action).await?;

        let mut params = JsonMap::new();
        params.insert("env".to_string(), Value::Object(wf.env()));
        let mut child = WorkflowExecution::new((*spec).clone(), input, params);
        child.id = action.id;
        child.root_execution_id = wf.root_execution_id;
        child.parent_task_id = Some(task.id);
        self.set_workflow_state(&mut child, WorkflowState::Running, None);
        self.tx.create_workflow_execution(&child).await?;

        tracing::info!(
            workflow_execution_id = %wf.id,
            task = %task.name,
            child_execution_id = %child.id,
            workflow = %name,
            "started sub-workflow"
        );
        self.post.followups.push(Followup::Continue(child.id));
        Ok(Launch::Started)
    }

    /// Number of ancestors of `wf` (0 for a top-level execution).
    async fn nesting_depth(&mut self, wf: &WorkflowExecution) -> Result<u32, EngineError> {
        let mut depth = 0;
        let mut parent_task = wf.parent_task_id;
        while let Some(task_id) = parent_task {
            depth += 1;
            let Some(task) = self.tx.get_task_execution(&task_id).await? else {
                break;
            };
            parent_task = self
                .tx
                .get_workflow_execution(&task.workflow_execution_id)
                .await?
                .and_then(|parent| parent.parent_task_id);
        }
        Ok(depth)
    }

    // -----------------------------------------------------------------------
    // Controller
    // -----------------------------------------------------------------------

    /// Run the controller until it has nothing more to decide.
    pub async fn continue_workflow(&mut self, wf: &mut WorkflowExecution) -> Result<(), EngineError> {
        for _ in 0..MAX_CONTROLLER_PASSES {
            if wf.state != WorkflowState::Running {
                return Ok(());
            }
            let tasks = self.tx.list_task_executions(&wf.id).await?;
            let decision = {
                let controller = controller_for(wf);
                let snapshot = WorkflowSnapshot {
                    execution: wf,
                    tasks: &tasks,
                    evaluator: self.evaluator(),
                };
                controller.continue_workflow(&snapshot)
            };
            let decision = match decision {
                Ok(decision) => decision,
                Err(e) => {
                    self.finish_workflow(wf, WorkflowState::Error, Some(e.to_string()))
                        .await?;
                    return Ok(());
                }
            };
            if decision.is_empty() {
                return Ok(());
            }

            for processed in &decision.processed {
                let Some(task) = tasks.iter().find(|t| t.id == processed.id) else {
                    continue;
                };
                let mut task = task.clone();
                task.processed = true;
                runtime::store(&mut task.runtime_context, NEXT_TASKS_KEY, &processed.next_tasks);
                if processed.error_handled {
                    task.runtime_context
                        .insert(ERROR_HANDLED_KEY.to_string(), Value::Bool(true));
                }
                task.updated_at = Utc::now();
                self.tx.update_task_execution(&task).await?;
            }

            match decision.outcome {
                Some(WorkflowOutcome::Succeed) => {
                    self.finish_workflow(wf, WorkflowState::Success, None).await?;
                    return Ok(());
                }
                Some(WorkflowOutcome::Fail { state_info }) => {
                    self.finish_workflow(wf, WorkflowState::Error, Some(state_info))
                        .await?;
                    return Ok(());
                }
                Some(WorkflowOutcome::Pause) => {
                    if wf.state == WorkflowState::Running {
                        self.set_workflow_state(wf, WorkflowState::Paused, None);
                    }
                    self.apply_commands(wf, decision.commands).await?;
                    return Ok(());
                }
                None => self.apply_commands(wf, decision.commands).await?,
            }
        }
        tracing::warn!(workflow_execution_id = %wf.id, "controller did not settle");
        Ok(())
    }

    async fn apply_commands(
        &mut self,
        wf: &mut WorkflowExecution,
        commands: Vec<TaskCommand>,
    ) -> Result<(), EngineError> {
        for command in commands {
            match command {
                TaskCommand::Run { task, existing } => {
                    let Some(mut task) = self.prepare_task(wf, &task, existing, TaskState::Idle).await? else {
                        continue;
                    };
                    // A paused workflow starts nothing; resume drives IDLE tasks.
                    if wf.state == WorkflowState::Running {
                        self.drive(wf, &mut task, TaskStep::Start).await?;
                    } else {
                        tracing::debug!(
                            workflow_execution_id = %wf.id,
                            task = %task.name,
                            workflow_state = %wf.state,
                            "workflow not running, task left idle"
                        );
                    }
                }
                TaskCommand::Wait { task } => {
                    self.prepare_task(wf, &task, None, TaskState::Waiting).await?;
                }
                TaskCommand::Skip { task, existing } => {
                    if let Some(mut task) = self.prepare_task(wf, &task, existing, TaskState::Skipped).await? {
                        task.published = self.clause_published(&task, task.spec.publish_on_skip.as_ref(), Value::Null);
                        self.drive(wf, &mut task, TaskStep::Settle).await?;
                    }
                }
                TaskCommand::Fail {
                    task,
                    existing,
                    message,
                } => {
                    if let Some(mut task) = self.prepare_task(wf, &task, existing, TaskState::Error).await? {
                        task.state_info = Some(message);
                        task.published = self.error_published(&task);
                        self.drive(wf, &mut task, TaskStep::Settle).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Create the execution for `name` (or reset `existing`) in `state`,
    /// with a fresh inbound context.
    async fn prepare_task(
        &mut self,
        wf: &WorkflowExecution,
        name: &str,
        existing: Option<Uuid>,
        state: TaskState,
    ) -> Result<Option<TaskExecution>, EngineError> {
        let in_context = workflow_view(wf).snapshot();

        if let Some(id) = existing {
            let Some(mut task) = self.tx.get_task_execution(&id).await? else {
                return Ok(None);
            };
            let from = task.state;
            if from == TaskState::Skipped {
                task.runtime_context.clear();
                task.published.clear();
                task.state_info = None;
                task.processed = false;
            }
            task.in_context = in_context;
            task.state = state;
            task.updated_at = Utc::now();
            self.task_changed(&task, from);
            self.tx.update_task_execution(&task).await?;
            return Ok(Some(task));
        }

        let Some(spec) = wf.spec.effective_task(name) else {
            tracing::warn!(workflow_execution_id = %wf.id, task = %name, "controller named an unknown task");
            return Ok(None);
        };
        let mut task = TaskExecution::new(wf.id, spec, in_context);
        task.state = state;
        self.tx.create_task_execution(&task).await?;
        tracing::debug!(workflow_execution_id = %wf.id, task = %name, state = %state, "task created");
        self.task_changed(&task, TaskState::Idle);
        Ok(Some(task))
    }

    // -----------------------------------------------------------------------
    // Workflow completion
    // -----------------------------------------------------------------------

    /// Move the workflow to a terminal state, compute its output and drop
    /// its pending delayed calls. A nested workflow reports to its parent
    /// task after commit.
    pub async fn finish_workflow(
        &mut self,
        wf: &mut WorkflowExecution,
        state: WorkflowState,
        info: Option<String>,
    ) -> Result<(), EngineError> {
        let (state, info, output) = if state == WorkflowState::Success {
            match self.workflow_output(wf) {
                Ok(output) => (state, info, output),
                Err(e) => (WorkflowState::Error, Some(e.to_string()), wf.context.clone()),
            }
        } else {
            (state, info, wf.context.clone())
        };
        wf.output = Some(output.clone());
        self.set_workflow_state(wf, state, info);
        let dropped = self.tx.delete_delayed_calls_for_workflow(&wf.id).await?;
        tracing::info!(
            workflow_execution_id = %wf.id,
            state = %wf.state,
            dropped_calls = dropped,
            "workflow finished"
        );

        if wf.parent_task_id.is_some() {
            let result = match wf.state {
                WorkflowState::Success => ActionResult::Data(Value::Object(output)),
                WorkflowState::Cancelled => ActionResult::error(
                    wf.state_info.clone().unwrap_or_else(|| "Workflow was cancelled".to_string()),
                ),
                _ => ActionResult::error(
                    wf.state_info.clone().unwrap_or_else(|| "Workflow failed".to_string()),
                ),
            };
            self.post.followups.push(Followup::Report {
                execution_id: wf.id,
                result,
            });
        }
        Ok(())
    }

    fn workflow_output(&self, wf: &WorkflowExecution) -> Result<JsonMap, ExpressionError> {
        let Some(clause) = &wf.spec.output else {
            return Ok(wf.context.clone());
        };
        match evaluate_recursively(self.evaluator(), clause, &workflow_view(wf).to_value())? {
            Value::Object(output) => Ok(output),
            other => {
                let mut output = JsonMap::new();
                output.insert("output".to_string(), other);
                Ok(output)
            }
        }
    }
}
