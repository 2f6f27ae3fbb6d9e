//! The command dispatcher.
//!
//! Every public operation opens one transaction, locks the workflow execution
//! it touches, drives controllers and policies through a [`Session`], and
//! commits. Work with side effects outside the store (dispatching actions,
//! reporting nested workflows, publishing events) is collected during the
//! transaction and performed in [`Engine::after_commit`]. Each operation is
//! wrapped in [`retry_transient`] so a busy store is retried as a whole.

mod error;
mod input;
mod retry;
mod session;
#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tessera_types::config::EngineConfig;
use tessera_types::delayed_call::{DelayedCall, DelayedCallTarget};
use tessera_types::execution::{
    ActionExecution, ExecutionRef, TaskExecution, WorkflowExecution, WorkflowExecutionFilter,
};
use tessera_types::result::ActionResult;
use tessera_types::spec::JsonMap;
use tessera_types::state::{ActionState, TaskState, WorkflowState};
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::{ExecutionStore, ExecutionTx};

use super::catalog::WorkflowCatalog;
use super::context::RESULT_KEY;
use super::definition::validate_spec;
use super::executor::ActionExecutor;
use super::expression::{ExpressionEvaluator, JexlEvaluator};
use super::runtime::{
    self, WaitAfterState, ERROR_HANDLED_KEY, NEXT_TASKS_KEY, RETRY_KEY, TIMEOUT_KEY,
    WAIT_AFTER_KEY, WITH_ITEMS_KEY,
};
use super::with_items::{get_for_each_output, WithItemsState};

pub use error::{EngineError, ErrorKind};
pub use input::{check_params, merge_env, resolve_input};
pub use retry::retry_transient;
pub use session::NOOP_ACTION;

use session::{refresh_env, Followup, PostCommit, Session, TaskStep};

/// Drives workflow executions stored in `S`, running actions through `X`.
pub struct Engine<S: ExecutionStore, X: ActionExecutor> {
    store: S,
    executor: X,
    evaluator: Arc<dyn ExpressionEvaluator>,
    catalog: Arc<dyn WorkflowCatalog>,
    config: EngineConfig,
    events: EventBus,
}

impl<S: ExecutionStore, X: ActionExecutor> Engine<S, X> {
    pub fn new(store: S, executor: X, catalog: Arc<dyn WorkflowCatalog>, config: EngineConfig) -> Self {
        Self {
            store,
            executor,
            evaluator: Arc::new(JexlEvaluator::new()),
            catalog,
            config,
            events: EventBus::default(),
        }
    }

    /// Replace the expression evaluator.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Publish state changes on an existing bus.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn executor(&self) -> &X {
        &self.executor
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Start a workflow from the catalog.
    ///
    /// `params` may carry `env` (an object merged into `__env`) and, for
    /// reverse workflows, `task_name`.
    pub async fn start_workflow(
        &self,
        identifier: &str,
        input: &JsonMap,
        description: Option<String>,
        params: JsonMap,
    ) -> Result<WorkflowExecution, EngineError> {
        let (wf, post) = retry_transient(&self.config, "start_workflow", || {
            self.start_tx(identifier, input, description.clone(), params.clone())
        })
        .await?;
        self.after_commit(post).await;
        Ok(wf)
    }

    /// Fold an action (or nested workflow) result into its task.
    ///
    /// Returns `None` when the result was already accepted.
    pub async fn on_action_complete(
        &self,
        id: Uuid,
        result: ActionResult,
        as_workflow: bool,
    ) -> Result<Option<ExecutionRef>, EngineError> {
        let (reference, post) = retry_transient(&self.config, "on_action_complete", || {
            self.action_complete_tx(id, result.clone(), as_workflow)
        })
        .await?;
        self.after_commit(post).await;
        Ok(reference)
    }

    /// Run the controller of a RUNNING workflow.
    pub async fn continue_workflow(&self, id: Uuid) -> Result<(), EngineError> {
        let post = retry_transient(&self.config, "continue_workflow", || self.continue_tx(id)).await?;
        self.after_commit(post).await;
        Ok(())
    }

    pub async fn pause_workflow(&self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        let (wf, post) = retry_transient(&self.config, "pause_workflow", || self.pause_tx(id)).await?;
        self.after_commit(post).await;
        Ok(wf)
    }

    pub async fn resume_workflow(&self, id: Uuid, env: &JsonMap) -> Result<WorkflowExecution, EngineError> {
        let (wf, post) = retry_transient(&self.config, "resume_workflow", || self.resume_tx(id, env)).await?;
        self.after_commit(post).await;
        Ok(wf)
    }

    /// Force a workflow into a terminal `state`.
    pub async fn stop_workflow(
        &self,
        id: Uuid,
        state: WorkflowState,
        message: Option<String>,
    ) -> Result<WorkflowExecution, EngineError> {
        let (wf, post) = retry_transient(&self.config, "stop_workflow", || {
            self.stop_tx(id, state, message.clone())
        })
        .await?;
        self.after_commit(post).await;
        Ok(wf)
    }

    /// Run a failed task again. With `reset` false a with-items task keeps its
    /// successful iterations and re-runs only the failed ones.
    pub async fn rerun_workflow(
        &self,
        task_execution_id: Uuid,
        reset: bool,
        env: &JsonMap,
    ) -> Result<WorkflowExecution, EngineError> {
        let (wf, post) = retry_transient(&self.config, "rerun_workflow", || {
            self.rerun_tx(task_execution_id, reset, env)
        })
        .await?;
        self.after_commit(post).await;
        Ok(wf)
    }

    /// Consume one delayed call.
    pub async fn process_delayed_call(&self, call: &DelayedCall) -> Result<(), EngineError> {
        let post = retry_transient(&self.config, "process_delayed_call", || {
            self.delayed_call_tx(call)
        })
        .await?;
        self.after_commit(post).await;
        Ok(())
    }

    /// Claim the calls due at `now` and process them one by one. Returns the
    /// number claimed.
    pub async fn process_due_calls(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let lease_until = offset_ms(now, self.config.delayed_call_lease_secs.saturating_mul(1_000));
        let calls = retry_transient(&self.config, "claim_due_delayed_calls", || {
            self.claim_tx(now, lease_until)
        })
        .await?;

        for call in &calls {
            if let Err(e) = self.process_delayed_call(call).await {
                tracing::warn!(
                    call_id = %call.id,
                    kind = call.target.kind(),
                    error = %e,
                    "failed to process delayed call"
                );
            }
        }
        Ok(calls.len())
    }

    /// Delete a workflow execution and everything below it, nested workflows
    /// included. Returns how many workflow executions were removed.
    pub async fn delete_workflow_execution(&self, id: Uuid, force: bool) -> Result<usize, EngineError> {
        retry_transient(&self.config, "delete_workflow_execution", || self.delete_tx(id, force)).await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_workflow_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, EngineError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.get_workflow_execution(&id).await?)
    }

    pub async fn list_workflow_executions(
        &self,
        filter: &WorkflowExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.list_workflow_executions(filter).await?)
    }

    pub async fn get_task_execution(&self, id: Uuid) -> Result<Option<TaskExecution>, EngineError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.get_task_execution(&id).await?)
    }

    pub async fn list_task_executions(&self, workflow_execution_id: Uuid) -> Result<Vec<TaskExecution>, EngineError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.list_task_executions(&workflow_execution_id).await?)
    }

    pub async fn list_action_executions(&self, task_execution_id: Uuid) -> Result<Vec<ActionExecution>, EngineError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.list_action_executions(&task_execution_id).await?)
    }

    pub async fn list_delayed_calls(&self, workflow_execution_id: Uuid) -> Result<Vec<DelayedCall>, EngineError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.list_delayed_calls(&workflow_execution_id).await?)
    }

    // -----------------------------------------------------------------------
    // Post-commit work
    // -----------------------------------------------------------------------

    /// Publish events, dispatch actions and run follow-ups. Follow-ups commit
    /// their own transactions and may queue more work.
    async fn after_commit(&self, post: PostCommit) {
        let mut pending = VecDeque::from([post]);
        while let Some(post) = pending.pop_front() {
            self.events.publish_all(post.events);

            for request in post.dispatches {
                let id = request.action_execution_id;
                let action = request.action.clone();
                let Err(e) = self.executor.dispatch(request).await else {
                    continue;
                };
                tracing::warn!(action_execution_id = %id, %action, error = %e, "action dispatch failed");
                let result = ActionResult::error(format!("Failed to run action: {e}"));
                let completed = retry_transient(&self.config, "on_action_complete", || {
                    self.action_complete_tx(id, result.clone(), false)
                })
                .await;
                match completed {
                    Ok((_, next)) => pending.push_back(next),
                    Err(e) => {
                        tracing::error!(action_execution_id = %id, error = %e, "failed to record dispatch failure")
                    }
                }
            }

            for followup in post.followups {
                let next = match followup {
                    Followup::Continue(id) => {
                        retry_transient(&self.config, "continue_workflow", || self.continue_tx(id)).await
                    }
                    Followup::Report { execution_id, result } => retry_transient(
                        &self.config,
                        "on_action_complete",
                        || self.action_complete_tx(execution_id, result.clone(), true),
                    )
                    .await
                    .map(|(_, next)| next),
                };
                match next {
                    Ok(next) => pending.push_back(next),
                    Err(e) => tracing::error!(error = %e, "post-commit follow-up failed"),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    async fn start_tx(
        &self,
        identifier: &str,
        input: &JsonMap,
        description: Option<String>,
        params: JsonMap,
    ) -> Result<(WorkflowExecution, PostCommit), EngineError> {
        let spec = self
            .catalog
            .get(identifier)
            .ok_or_else(|| EngineError::NotFound(format!("workflow '{identifier}'")))?;
        validate_spec(&spec, self.evaluator.as_ref())?;
        let input = resolve_input(&spec, input)?;
        check_params(&spec, &params)?;

        let mut session = Session::begin(self).await?;
        let mut wf = WorkflowExecution::new((*spec).clone(), input, params);
        wf.description = description;
        session.set_workflow_state(&mut wf, WorkflowState::Running, None);
        session.tx.create_workflow_execution(&wf).await?;
        session.tx.lock_workflow_execution(&wf.id).await?;

        session.continue_workflow(&mut wf).await?;
        session.tx.update_workflow_execution(&wf).await?;
        let post = session.commit().await?;
        Ok((wf, post))
    }

    async fn action_complete_tx(
        &self,
        id: Uuid,
        result: ActionResult,
        as_workflow: bool,
    ) -> Result<(Option<ExecutionRef>, PostCommit), EngineError> {
        let mut session = Session::begin(self).await?;
        if as_workflow && session.tx.get_workflow_execution(&id).await?.is_none() {
            return Err(EngineError::NotFound(format!("workflow execution {id}")));
        }
        let action = session
            .tx
            .get_action_execution(&id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("action execution {id}")))?;
        if action.accepted {
            tracing::debug!(action_execution_id = %id, "result already accepted");
            return Ok((None, PostCommit::default()));
        }

        let mut wf = session
            .tx
            .lock_workflow_execution(&action.workflow_execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow execution {}", action.workflow_execution_id)))?;
        // Re-read under the lock; a concurrent delivery may have won.
        let Some(mut action) = session.tx.get_action_execution(&id).await? else {
            return Ok((None, PostCommit::default()));
        };
        if action.accepted {
            return Ok((None, PostCommit::default()));
        }

        action.state = if result.is_success() {
            ActionState::Success
        } else {
            ActionState::Error
        };
        action.output = Some(result.clone());
        action.accepted = true;
        action.updated_at = Utc::now();
        session.tx.update_action_execution(&action).await?;

        let task = session.tx.get_task_execution(&action.task_execution_id).await?;
        match task {
            Some(mut task) if !wf.state.is_terminal() && task.state == TaskState::Running => {
                let step = match WithItemsState::load(&task) {
                    Some(mut state) if task.spec.with_items.is_some() => {
                        get_for_each_output(
                            self.evaluator.as_ref(),
                            &task,
                            &mut state,
                            action.index(),
                            &result,
                        );
                        session.dispatch_iterations(&wf, &mut task, state).await?
                    }
                    _ => {
                        task.runtime_context
                            .insert(RESULT_KEY.to_string(), result.to_value());
                        match &result {
                            ActionResult::Data(_) => TaskStep::Complete {
                                state: TaskState::Success,
                                info: None,
                                after: true,
                            },
                            ActionResult::Error(message) => TaskStep::Complete {
                                state: TaskState::Error,
                                info: Some(message.clone()),
                                after: true,
                            },
                        }
                    }
                };
                session.drive(&mut wf, &mut task, step).await?;
                session.continue_workflow(&mut wf).await?;
                session.tx.update_workflow_execution(&wf).await?;
            }
            _ => {
                tracing::debug!(
                    action_execution_id = %id,
                    workflow_state = %wf.state,
                    "late result recorded, task no longer running"
                );
            }
        }

        let post = session.commit().await?;
        let reference = if as_workflow {
            ExecutionRef::Workflow(id)
        } else {
            ExecutionRef::Action(id)
        };
        Ok((Some(reference), post))
    }

    async fn continue_tx(&self, id: Uuid) -> Result<PostCommit, EngineError> {
        let mut session = Session::begin(self).await?;
        let mut wf = lock(&mut session, id).await?;
        session.continue_workflow(&mut wf).await?;
        session.tx.update_workflow_execution(&wf).await?;
        session.commit().await
    }

    async fn pause_tx(&self, id: Uuid) -> Result<(WorkflowExecution, PostCommit), EngineError> {
        let mut session = Session::begin(self).await?;
        let mut wf = lock(&mut session, id).await?;
        if wf.state != WorkflowState::Running {
            return Err(EngineError::InvalidTransition(format!(
                "can't pause workflow {id} in state {}",
                wf.state
            )));
        }
        session.set_workflow_state(&mut wf, WorkflowState::Paused, None);
        session.tx.update_workflow_execution(&wf).await?;
        let post = session.commit().await?;
        Ok((wf, post))
    }

    async fn resume_tx(&self, id: Uuid, env: &JsonMap) -> Result<(WorkflowExecution, PostCommit), EngineError> {
        let mut session = Session::begin(self).await?;
        let mut wf = lock(&mut session, id).await?;
        if wf.state != WorkflowState::Paused {
            return Err(EngineError::InvalidTransition(format!(
                "can't resume workflow {id} in state {}",
                wf.state
            )));
        }
        merge_env(&mut wf.params, env);
        session.set_workflow_state(&mut wf, WorkflowState::Running, None);

        let idle: Vec<TaskExecution> = session
            .tx
            .list_task_executions(&wf.id)
            .await?
            .into_iter()
            .filter(|t| t.state == TaskState::Idle)
            .collect();
        for mut task in idle {
            if wf.state != WorkflowState::Running {
                break;
            }
            refresh_env(&wf, &mut task);
            session.drive(&mut wf, &mut task, TaskStep::Start).await?;
        }

        session.continue_workflow(&mut wf).await?;
        session.tx.update_workflow_execution(&wf).await?;
        let post = session.commit().await?;
        Ok((wf, post))
    }

    async fn stop_tx(
        &self,
        id: Uuid,
        state: WorkflowState,
        message: Option<String>,
    ) -> Result<(WorkflowExecution, PostCommit), EngineError> {
        if !state.is_terminal() {
            return Err(EngineError::Input(format!(
                "workflow can only be stopped in a terminal state, got {state}"
            )));
        }
        let mut session = Session::begin(self).await?;
        let mut wf = lock(&mut session, id).await?;
        if wf.state.is_terminal() {
            return Err(EngineError::InvalidTransition(format!(
                "workflow {id} is already {}",
                wf.state
            )));
        }

        if state == WorkflowState::Cancelled {
            for mut task in session.tx.list_task_executions(&wf.id).await? {
                if task.state.is_terminal() {
                    continue;
                }
                let from = task.state;
                task.state = TaskState::Cancelled;
                task.state_info = message.clone();
                task.updated_at = Utc::now();
                session.task_changed(&task, from);
                session.tx.update_task_execution(&task).await?;
            }
        }

        session.finish_workflow(&mut wf, state, message).await?;
        session.tx.update_workflow_execution(&wf).await?;
        let post = session.commit().await?;
        Ok((wf, post))
    }

    async fn rerun_tx(
        &self,
        task_execution_id: Uuid,
        reset: bool,
        env: &JsonMap,
    ) -> Result<(WorkflowExecution, PostCommit), EngineError> {
        let mut session = Session::begin(self).await?;
        let found = session
            .tx
            .get_task_execution(&task_execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("task execution {task_execution_id}")))?;
        let mut wf = lock(&mut session, found.workflow_execution_id).await?;
        let mut task = session
            .tx
            .get_task_execution(&task_execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("task execution {task_execution_id}")))?;

        if task.state != TaskState::Error {
            return Err(EngineError::InvalidTransition(format!(
                "task '{}' is {}, only failed tasks can be rerun",
                task.name, task.state
            )));
        }
        if !wf.state.can_rerun() {
            return Err(EngineError::InvalidTransition(format!(
                "workflow {} is {} and can't be rerun",
                wf.id, wf.state
            )));
        }
        let partial = task.spec.with_items.is_some() && !reset;
        if partial && !task.spec.safe_rerun {
            return Err(EngineError::Input(format!(
                "task '{}' is not marked safe_rerun, rerun it with reset",
                task.name
            )));
        }

        for key in [RETRY_KEY, NEXT_TASKS_KEY, ERROR_HANDLED_KEY, RESULT_KEY, WAIT_AFTER_KEY, TIMEOUT_KEY] {
            task.runtime_context.remove(key);
        }
        task.processed = false;
        task.state_info = None;
        task.published.clear();

        wf.output = None;
        merge_env(&mut wf.params, env);
        refresh_env(&wf, &mut task);
        session.set_workflow_state(&mut wf, WorkflowState::Running, None);
        tracing::info!(
            workflow_execution_id = %wf.id,
            task = %task.name,
            reset,
            "rerunning task"
        );

        let from = task.state;
        let step = match WithItemsState::load(&task) {
            Some(mut state) if partial => {
                let failed = state.requeue_failed();
                for action in session.tx.list_action_executions(&task.id).await? {
                    if failed.contains(&action.index()) {
                        session.tx.delete_action_execution(&action.id).await?;
                    }
                }
                task.state = TaskState::Running;
                session.task_changed(&task, from);
                match session.rearm_timeout(&mut wf, &mut task).await? {
                    Some(step) => step,
                    None => session.dispatch_iterations(&wf, &mut task, state).await?,
                }
            }
            _ => {
                for action in session.tx.list_action_executions(&task.id).await? {
                    session.tx.delete_action_execution(&action.id).await?;
                }
                task.runtime_context.remove(WITH_ITEMS_KEY);
                task.state = TaskState::Idle;
                session.task_changed(&task, from);
                TaskStep::Start
            }
        };
        session.drive(&mut wf, &mut task, step).await?;
        session.continue_workflow(&mut wf).await?;
        session.tx.update_workflow_execution(&wf).await?;
        let post = session.commit().await?;
        Ok((wf, post))
    }

    async fn claim_tx(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<DelayedCall>, EngineError> {
        let mut tx = self.store.begin().await?;
        let calls = tx
            .claim_due_delayed_calls(now, lease_until, self.config.delayed_call_batch_size)
            .await?;
        tx.commit().await?;
        Ok(calls)
    }

    async fn delayed_call_tx(&self, call: &DelayedCall) -> Result<PostCommit, EngineError> {
        let mut session = Session::begin(self).await?;
        let Some(mut wf) = session
            .tx
            .lock_workflow_execution(&call.workflow_execution_id)
            .await?
        else {
            session.tx.delete_delayed_call(&call.id).await?;
            return session.commit().await;
        };
        // Another poller may have consumed it after its lease ran out.
        let Some(call) = session.tx.get_delayed_call(&call.id).await? else {
            return Ok(PostCommit::default());
        };

        match wf.state {
            WorkflowState::Paused => {
                let later = offset_ms(Utc::now(), self.config.poll_interval_ms);
                session.tx.reschedule_delayed_call(&call.id, later).await?;
                tracing::debug!(call_id = %call.id, kind = call.target.kind(), "workflow paused, delayed call postponed");
                return session.commit().await;
            }
            state if state.is_terminal() => {
                session.tx.delete_delayed_call(&call.id).await?;
                return session.commit().await;
            }
            _ => {}
        }

        session.tx.delete_delayed_call(&call.id).await?;
        let Some(mut task) = session
            .tx
            .get_task_execution(&call.target.task_execution_id())
            .await?
        else {
            return session.commit().await;
        };

        let step = match call.target {
            DelayedCallTarget::WaitBeforeElapsed { .. } if task.state == TaskState::RunningDelayed => {
                Some(TaskStep::Start)
            }
            DelayedCallTarget::WaitAfterElapsed { .. } if runtime::wait_after_pending(&task.runtime_context) => {
                runtime::store(
                    &mut task.runtime_context,
                    WAIT_AFTER_KEY,
                    &WaitAfterState {
                        skip: true,
                        pending: false,
                    },
                );
                Some(TaskStep::After)
            }
            DelayedCallTarget::RetryTask { .. } if task.state == TaskState::RunningDelayed => {
                Some(TaskStep::Run)
            }
            DelayedCallTarget::TaskTimeout { timeout_secs, .. } if !task.state.is_terminal() => {
                tracing::warn!(task = %task.name, timeout_secs, "task timed out");
                Some(TaskStep::Complete {
                    state: TaskState::Error,
                    info: Some(format!("Task timed out after {timeout_secs} seconds")),
                    after: false,
                })
            }
            _ => None,
        };
        let Some(step) = step else {
            tracing::debug!(call_id = %call.id, kind = call.target.kind(), task_state = %task.state, "stale delayed call dropped");
            return session.commit().await;
        };

        session.drive(&mut wf, &mut task, step).await?;
        session.continue_workflow(&mut wf).await?;
        session.tx.update_workflow_execution(&wf).await?;
        session.commit().await
    }

    async fn delete_tx(&self, id: Uuid, force: bool) -> Result<usize, EngineError> {
        let mut tx = self.store.begin().await?;
        let wf = tx
            .lock_workflow_execution(&id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow execution {id}")))?;
        if !wf.state.is_terminal() && !force {
            return Err(EngineError::InvalidTransition(format!(
                "workflow {id} is {}, stop it first or force the delete",
                wf.state
            )));
        }

        // Breadth-first over nested executions, deleted leaves first.
        let mut order = vec![wf.id];
        let mut next = 0;
        while let Some(&current) = order.get(next) {
            for task in tx.list_task_executions(&current).await? {
                let filter = WorkflowExecutionFilter {
                    parent_task_id: Some(task.id),
                    ..Default::default()
                };
                order.extend(tx.list_workflow_executions(&filter).await?.iter().map(|c| c.id));
            }
            next += 1;
        }
        for execution_id in order.iter().rev() {
            tx.delete_workflow_execution(execution_id).await?;
        }
        tx.commit().await?;

        tracing::info!(workflow_execution_id = %id, deleted = order.len(), "workflow execution deleted");
        Ok(order.len())
    }
}

async fn lock<S: ExecutionStore, X: ActionExecutor>(
    session: &mut Session<'_, S, X>,
    id: Uuid,
) -> Result<WorkflowExecution, EngineError> {
    session
        .tx
        .lock_workflow_execution(&id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("workflow execution {id}")))
}

/// `at` plus `millis`, saturating at the latest representable instant.
pub(crate) fn offset_ms(at: DateTime<Utc>, millis: u64) -> DateTime<Utc> {
    i64::try_from(millis)
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `params` for [`Engine::start_workflow`] with just an environment.
pub fn env_params(env: JsonMap) -> JsonMap {
    let mut params = JsonMap::new();
    if !env.is_empty() {
        params.insert("env".to_string(), Value::Object(env));
    }
    params
}
