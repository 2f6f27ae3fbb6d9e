//! Task policies: hooks around a task's lifecycle transitions.
//!
//! A policy never touches storage. It inspects and mutates the
//! [`TaskExecution`] it is given (state and `runtime_context`) and returns
//! [`PolicyEffect`]s the dispatcher applies inside the same transaction.
//! The chain for a task is built once from its spec (with workflow task
//! defaults already folded in) in a fixed order:
//!
//! wait-before → pause-before → concurrency → (task runs) → wait-after →
//! retry → timeout
//!
//! A policy that halts the chain stops later policies from running; every
//! halting policy records a `skip` flag so that re-entering the chain after
//! the delay (or resume) passes through it.

use std::fmt;

use serde_json::Value;
use tessera_types::delayed_call::DelayedCallTarget;
use tessera_types::execution::TaskExecution;
use tessera_types::spec::{RetrySpec, TaskSpec};
use tessera_types::state::TaskState;
use thiserror::Error;

use super::context::RESULT_KEY;
use super::expression::{evaluate_condition, evaluate_recursively, ExpressionError, ExpressionEvaluator};
use super::runtime::{
    self, RetryState, SkipState, WaitAfterState, CONCURRENCY_KEY, PAUSE_BEFORE_KEY, RETRY_KEY,
    TIMEOUT_KEY, WAIT_AFTER_KEY, WAIT_BEFORE_KEY, WITH_ITEMS_KEY,
};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What a policy's expressions are evaluated with.
pub struct PolicyContext<'a> {
    pub evaluator: &'a dyn ExpressionEvaluator,
    /// Inbound context before start, outbound context after completion.
    pub context: &'a Value,
}

/// Work a policy asks the dispatcher to do.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEffect {
    /// Persist a delayed call firing after `delay_secs`.
    Schedule {
        target: DelayedCallTarget,
        delay_secs: u64,
    },
    /// Move the owning workflow to PAUSED.
    PauseWorkflow,
    /// Drop the task's action executions and run it again, now or after
    /// `delay_secs`.
    RetryTask { delay_secs: u64 },
}

/// Accumulated result of running (part of) a policy chain.
#[derive(Debug, Default, PartialEq)]
pub struct PolicyOutcome {
    pub effects: Vec<PolicyEffect>,
    /// A policy stopped the chain; the task must not proceed now.
    pub halted: bool,
}

impl PolicyOutcome {
    fn proceed() -> Self {
        Self::default()
    }

    fn halt(effect: PolicyEffect) -> Self {
        Self {
            effects: vec![effect],
            halted: true,
        }
    }
}

/// A policy value could not be used.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("Invalid value for '{field}': expected {expected}, got {value}")]
    Validation {
        field: &'static str,
        expected: &'static str,
        value: Value,
    },

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// Lifecycle hooks. Both default to doing nothing.
pub trait TaskPolicy: Send + Sync + fmt::Debug {
    fn before_task_start(
        &self,
        _task: &mut TaskExecution,
        _ctx: &PolicyContext<'_>,
    ) -> Result<PolicyOutcome, PolicyError> {
        Ok(PolicyOutcome::proceed())
    }

    fn after_task_complete(
        &self,
        _task: &mut TaskExecution,
        _ctx: &PolicyContext<'_>,
    ) -> Result<PolicyOutcome, PolicyError> {
        Ok(PolicyOutcome::proceed())
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// The ordered policy chain for a task spec.
pub fn build_policies(spec: &TaskSpec) -> Vec<Box<dyn TaskPolicy>> {
    let mut policies: Vec<Box<dyn TaskPolicy>> = Vec::new();
    if let Some(delay) = &spec.wait_before {
        policies.push(Box::new(WaitBeforePolicy { delay: delay.clone() }));
    }
    if let Some(flag) = &spec.pause_before {
        policies.push(Box::new(PauseBeforePolicy { flag: flag.clone() }));
    }
    if let Some(limit) = &spec.concurrency {
        policies.push(Box::new(ConcurrencyPolicy { limit: limit.clone() }));
    }
    if let Some(delay) = &spec.wait_after {
        policies.push(Box::new(WaitAfterPolicy { delay: delay.clone() }));
    }
    if let Some(retry) = &spec.retry {
        policies.push(Box::new(RetryPolicy { spec: retry.clone() }));
    }
    if let Some(seconds) = &spec.timeout {
        policies.push(Box::new(TimeoutPolicy { seconds: seconds.clone() }));
    }
    policies
}

/// Run every `before_task_start` hook until one halts.
pub fn run_before(
    policies: &[Box<dyn TaskPolicy>],
    task: &mut TaskExecution,
    ctx: &PolicyContext<'_>,
) -> Result<PolicyOutcome, PolicyError> {
    run_chain(policies, |p| p.before_task_start(task, ctx))
}

/// Run every `after_task_complete` hook until one halts.
pub fn run_after(
    policies: &[Box<dyn TaskPolicy>],
    task: &mut TaskExecution,
    ctx: &PolicyContext<'_>,
) -> Result<PolicyOutcome, PolicyError> {
    run_chain(policies, |p| p.after_task_complete(task, ctx))
}

fn run_chain(
    policies: &[Box<dyn TaskPolicy>],
    mut hook: impl FnMut(&dyn TaskPolicy) -> Result<PolicyOutcome, PolicyError>,
) -> Result<PolicyOutcome, PolicyError> {
    let mut outcome = PolicyOutcome::proceed();
    for policy in policies {
        let step = hook(policy.as_ref())?;
        outcome.effects.extend(step.effects);
        if step.halted {
            outcome.halted = true;
            break;
        }
    }
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Value checks
// ---------------------------------------------------------------------------

/// A JSON number that is a non-negative integer (`3` or `3.0`, never `"3"`).
pub fn as_count(value: &Value) -> Option<u64> {
    let Value::Number(n) = value else {
        return None;
    };
    n.as_u64().or_else(|| {
        n.as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u32::MAX as f64)
            .map(|f| f as u64)
    })
}

fn eval_count(field: &'static str, value: &Value, ctx: &PolicyContext<'_>) -> Result<u64, PolicyError> {
    let evaluated = evaluate_recursively(ctx.evaluator, value, ctx.context)?;
    as_count(&evaluated).ok_or(PolicyError::Validation {
        field,
        expected: "a non-negative integer",
        value: evaluated,
    })
}

fn eval_flag(field: &'static str, value: &Value, ctx: &PolicyContext<'_>) -> Result<bool, PolicyError> {
    match evaluate_recursively(ctx.evaluator, value, ctx.context)? {
        Value::Bool(b) => Ok(b),
        other => Err(PolicyError::Validation {
            field,
            expected: "a boolean",
            value: other,
        }),
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Delays the task start by `delay` seconds.
#[derive(Debug)]
pub struct WaitBeforePolicy {
    pub delay: Value,
}

impl TaskPolicy for WaitBeforePolicy {
    fn before_task_start(
        &self,
        task: &mut TaskExecution,
        ctx: &PolicyContext<'_>,
    ) -> Result<PolicyOutcome, PolicyError> {
        let state: SkipState = runtime::load(&task.runtime_context, WAIT_BEFORE_KEY);
        if state.skip {
            return Ok(PolicyOutcome::proceed());
        }
        let delay = eval_count("wait_before", &self.delay, ctx)?;
        if delay == 0 {
            return Ok(PolicyOutcome::proceed());
        }

        runtime::store(&mut task.runtime_context, WAIT_BEFORE_KEY, &SkipState { skip: true });
        task.state = TaskState::RunningDelayed;
        Ok(PolicyOutcome::halt(PolicyEffect::Schedule {
            target: DelayedCallTarget::WaitBeforeElapsed {
                task_execution_id: task.id,
            },
            delay_secs: delay,
        }))
    }
}

/// Pauses the whole workflow before the task starts.
#[derive(Debug)]
pub struct PauseBeforePolicy {
    pub flag: Value,
}

impl TaskPolicy for PauseBeforePolicy {
    fn before_task_start(
        &self,
        task: &mut TaskExecution,
        ctx: &PolicyContext<'_>,
    ) -> Result<PolicyOutcome, PolicyError> {
        let state: SkipState = runtime::load(&task.runtime_context, PAUSE_BEFORE_KEY);
        if state.skip || !eval_flag("pause_before", &self.flag, ctx)? {
            return Ok(PolicyOutcome::proceed());
        }

        runtime::store(&mut task.runtime_context, PAUSE_BEFORE_KEY, &SkipState { skip: true });
        task.state = TaskState::Idle;
        Ok(PolicyOutcome::halt(PolicyEffect::PauseWorkflow))
    }
}

/// Caps simultaneously running with-items iterations (0 = unlimited).
#[derive(Debug)]
pub struct ConcurrencyPolicy {
    pub limit: Value,
}

impl TaskPolicy for ConcurrencyPolicy {
    fn before_task_start(
        &self,
        task: &mut TaskExecution,
        ctx: &PolicyContext<'_>,
    ) -> Result<PolicyOutcome, PolicyError> {
        let limit = eval_count("concurrency", &self.limit, ctx)?;
        task.runtime_context
            .insert(CONCURRENCY_KEY.to_string(), Value::from(limit));
        Ok(PolicyOutcome::proceed())
    }
}

/// Holds back downstream transitions of a successful task for `delay` seconds.
#[derive(Debug)]
pub struct WaitAfterPolicy {
    pub delay: Value,
}

impl TaskPolicy for WaitAfterPolicy {
    fn after_task_complete(
        &self,
        task: &mut TaskExecution,
        ctx: &PolicyContext<'_>,
    ) -> Result<PolicyOutcome, PolicyError> {
        let state: WaitAfterState = runtime::load(&task.runtime_context, WAIT_AFTER_KEY);
        if state.skip || task.state != TaskState::Success {
            return Ok(PolicyOutcome::proceed());
        }
        let delay = eval_count("wait_after", &self.delay, ctx)?;
        if delay == 0 {
            return Ok(PolicyOutcome::proceed());
        }

        runtime::store(
            &mut task.runtime_context,
            WAIT_AFTER_KEY,
            &WaitAfterState {
                skip: true,
                pending: true,
            },
        );
        Ok(PolicyOutcome::halt(PolicyEffect::Schedule {
            target: DelayedCallTarget::WaitAfterElapsed {
                task_execution_id: task.id,
            },
            delay_secs: delay,
        }))
    }
}

/// Re-runs a finished task up to `count` times.
///
/// After an ERROR the task is retried unless `break_on` holds or
/// `continue_on` is set and does not hold. After a SUCCESS it is retried
/// only while `continue_on` holds (polling until a condition changes).
#[derive(Debug)]
pub struct RetryPolicy {
    pub spec: RetrySpec,
}

impl RetryPolicy {
    fn should_retry(&self, task: &TaskExecution, ctx: &PolicyContext<'_>) -> Result<bool, PolicyError> {
        let holds = |condition: &Option<String>| -> Result<Option<bool>, PolicyError> {
            condition
                .as_deref()
                .map(|c| evaluate_condition(ctx.evaluator, c, ctx.context))
                .transpose()
                .map_err(PolicyError::from)
        };

        match task.state {
            TaskState::Error => {
                if holds(&self.spec.break_on)? == Some(true) {
                    return Ok(false);
                }
                Ok(holds(&self.spec.continue_on)?.unwrap_or(true))
            }
            TaskState::Success => Ok(holds(&self.spec.continue_on)? == Some(true)),
            _ => Ok(false),
        }
    }
}

impl TaskPolicy for RetryPolicy {
    fn after_task_complete(
        &self,
        task: &mut TaskExecution,
        ctx: &PolicyContext<'_>,
    ) -> Result<PolicyOutcome, PolicyError> {
        let mut state: RetryState = runtime::load(&task.runtime_context, RETRY_KEY);
        let count = eval_count("retry.count", &self.spec.count, ctx)?;
        if state.retry_no >= count || !self.should_retry(task, ctx)? {
            return Ok(PolicyOutcome::proceed());
        }
        let delay = match &self.spec.delay {
            Some(delay) => eval_count("retry.delay", delay, ctx)?,
            None => 0,
        };

        state.retry_no += 1;
        runtime::store(&mut task.runtime_context, RETRY_KEY, &state);
        task.runtime_context.remove(WITH_ITEMS_KEY);
        task.runtime_context.remove(RESULT_KEY);
        task.published.clear();
        task.state_info = None;
        task.state = if delay > 0 {
            TaskState::RunningDelayed
        } else {
            TaskState::Running
        };

        Ok(PolicyOutcome::halt(PolicyEffect::RetryTask { delay_secs: delay }))
    }
}

/// Forces the task to ERROR if it is still running after `seconds`.
#[derive(Debug)]
pub struct TimeoutPolicy {
    pub seconds: Value,
}

impl TaskPolicy for TimeoutPolicy {
    fn before_task_start(
        &self,
        task: &mut TaskExecution,
        ctx: &PolicyContext<'_>,
    ) -> Result<PolicyOutcome, PolicyError> {
        let state: SkipState = runtime::load(&task.runtime_context, TIMEOUT_KEY);
        if state.skip {
            return Ok(PolicyOutcome::proceed());
        }
        let seconds = eval_count("timeout", &self.seconds, ctx)?;
        if seconds == 0 {
            return Ok(PolicyOutcome::proceed());
        }

        runtime::store(&mut task.runtime_context, TIMEOUT_KEY, &SkipState { skip: true });
        Ok(PolicyOutcome {
            effects: vec![PolicyEffect::Schedule {
                target: DelayedCallTarget::TaskTimeout {
                    task_execution_id: task.id,
                    timeout_secs: seconds,
                },
                delay_secs: seconds,
            }],
            halted: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::expression::JexlEvaluator;
    use serde_json::json;
    use uuid::Uuid;

    fn task(spec: TaskSpec) -> TaskExecution {
        TaskExecution::new(Uuid::now_v7(), spec, Default::default())
    }

    fn before(spec: &TaskSpec, task: &mut TaskExecution, context: &Value) -> Result<PolicyOutcome, PolicyError> {
        let ev = JexlEvaluator::new();
        let ctx = PolicyContext { evaluator: &ev, context };
        run_before(&build_policies(spec), task, &ctx)
    }

    fn after(spec: &TaskSpec, task: &mut TaskExecution, context: &Value) -> Result<PolicyOutcome, PolicyError> {
        let ev = JexlEvaluator::new();
        let ctx = PolicyContext { evaluator: &ev, context };
        run_after(&build_policies(spec), task, &ctx)
    }

    #[test]
    fn test_wait_before_delays_once() {
        let spec = TaskSpec {
            wait_before: Some(json!(5)),
            timeout: Some(json!(30)),
            ..TaskSpec::action("t", "std.noop")
        };
        let mut t = task(spec.clone());

        let first = before(&spec, &mut t, &json!({})).unwrap();
        assert!(first.halted);
        assert_eq!(t.state, TaskState::RunningDelayed);
        assert_eq!(
            first.effects,
            vec![PolicyEffect::Schedule {
                target: DelayedCallTarget::WaitBeforeElapsed { task_execution_id: t.id },
                delay_secs: 5,
            }]
        );

        let second = before(&spec, &mut t, &json!({})).unwrap();
        assert!(!second.halted, "re-entry must skip the delay");
        assert!(matches!(
            second.effects.as_slice(),
            [PolicyEffect::Schedule { target: DelayedCallTarget::TaskTimeout { timeout_secs: 30, .. }, .. }]
        ));
    }

    #[test]
    fn test_zero_wait_before_proceeds() {
        let spec = TaskSpec {
            wait_before: Some(json!(0)),
            ..TaskSpec::action("t", "std.noop")
        };
        let mut t = task(spec.clone());
        let outcome = before(&spec, &mut t, &json!({})).unwrap();
        assert_eq!(outcome, PolicyOutcome::default());
    }

    #[test]
    fn test_pause_before_from_expression() {
        let spec = TaskSpec {
            pause_before: Some(json!("{{ hold }}")),
            ..TaskSpec::action("t", "std.noop")
        };
        let mut t = task(spec.clone());
        let outcome = before(&spec, &mut t, &json!({"hold": true})).unwrap();
        assert_eq!(outcome.effects, vec![PolicyEffect::PauseWorkflow]);
        assert!(outcome.halted);
        assert_eq!(t.state, TaskState::Idle);

        let resumed = before(&spec, &mut t, &json!({"hold": true})).unwrap();
        assert!(!resumed.halted);
    }

    #[test]
    fn test_pause_before_rejects_non_boolean() {
        let spec = TaskSpec {
            pause_before: Some(json!("yes")),
            ..TaskSpec::action("t", "std.noop")
        };
        let mut t = task(spec.clone());
        let err = before(&spec, &mut t, &json!({})).unwrap_err();
        assert!(matches!(err, PolicyError::Validation { field: "pause_before", .. }));
    }

    #[test]
    fn test_concurrency_recorded() {
        let spec = TaskSpec {
            concurrency: Some(json!(2)),
            ..TaskSpec::action("t", "std.noop")
        };
        let mut t = task(spec.clone());
        before(&spec, &mut t, &json!({})).unwrap();
        assert_eq!(runtime::concurrency(&t.runtime_context), 2);
    }

    #[test]
    fn test_retry_until_exhausted() {
        let spec = TaskSpec {
            retry: Some(RetrySpec::new(2, 0)),
            ..TaskSpec::action("t", "std.fail")
        };
        let mut t = task(spec.clone());

        for expected in 1..=2 {
            t.state = TaskState::Error;
            let outcome = after(&spec, &mut t, &json!({})).unwrap();
            assert_eq!(outcome.effects, vec![PolicyEffect::RetryTask { delay_secs: 0 }]);
            assert_eq!(t.state, TaskState::Running);
            assert_eq!(runtime::retry_no(&t.runtime_context), expected);
        }

        t.state = TaskState::Error;
        let outcome = after(&spec, &mut t, &json!({})).unwrap();
        assert!(outcome.effects.is_empty());
        assert_eq!(t.state, TaskState::Error);
        assert_eq!(runtime::retry_no(&t.runtime_context), 2);
    }

    #[test]
    fn test_retry_with_delay_goes_delayed() {
        let spec = TaskSpec {
            retry: Some(RetrySpec::new(1, 3)),
            ..TaskSpec::action("t", "std.fail")
        };
        let mut t = task(spec.clone());
        t.state = TaskState::Error;
        let outcome = after(&spec, &mut t, &json!({})).unwrap();
        assert_eq!(outcome.effects, vec![PolicyEffect::RetryTask { delay_secs: 3 }]);
        assert_eq!(t.state, TaskState::RunningDelayed);
    }

    #[test]
    fn test_retry_break_on() {
        let mut retry = RetrySpec::new(5, 0);
        retry.break_on = Some("result == 'fatal'".into());
        let spec = TaskSpec {
            retry: Some(retry),
            ..TaskSpec::action("t", "std.fail")
        };
        let mut t = task(spec.clone());
        t.state = TaskState::Error;
        let outcome = after(&spec, &mut t, &json!({"result": "fatal"})).unwrap();
        assert!(outcome.effects.is_empty());

        let outcome = after(&spec, &mut t, &json!({"result": "flaky"})).unwrap();
        assert_eq!(outcome.effects.len(), 1);
    }

    #[test]
    fn test_retry_continue_on_success() {
        let mut retry = RetrySpec::new(5, 0);
        retry.continue_on = Some("result.status != 'done'".into());
        let spec = TaskSpec {
            retry: Some(retry),
            ..TaskSpec::action("t", "std.echo")
        };
        let mut t = task(spec.clone());

        t.state = TaskState::Success;
        let polling = after(&spec, &mut t, &json!({"result": {"status": "pending"}})).unwrap();
        assert_eq!(polling.effects.len(), 1);

        t.state = TaskState::Success;
        let done = after(&spec, &mut t, &json!({"result": {"status": "done"}})).unwrap();
        assert!(done.effects.is_empty());
        assert_eq!(t.state, TaskState::Success);
    }

    #[test]
    fn test_success_without_continue_on_is_not_retried() {
        let spec = TaskSpec {
            retry: Some(RetrySpec::new(5, 0)),
            ..TaskSpec::action("t", "std.echo")
        };
        let mut t = task(spec.clone());
        t.state = TaskState::Success;
        assert!(after(&spec, &mut t, &json!({})).unwrap().effects.is_empty());
    }

    #[test]
    fn test_retry_count_is_type_checked() {
        let spec = TaskSpec {
            retry: Some(RetrySpec {
                count: json!("3"),
                delay: None,
                break_on: None,
                continue_on: None,
            }),
            ..TaskSpec::action("t", "std.fail")
        };
        let mut t = task(spec.clone());
        t.state = TaskState::Error;
        let err = after(&spec, &mut t, &json!({})).unwrap_err();
        assert!(err.to_string().contains("retry.count"));
    }

    #[test]
    fn test_count_accepts_whole_numbers_only() {
        assert_eq!(as_count(&json!(3)), Some(3));
        assert_eq!(as_count(&json!(3.0)), Some(3));
        assert_eq!(as_count(&json!(2.5)), None);
        assert_eq!(as_count(&json!(-1)), None);
        assert_eq!(as_count(&json!("3")), None);
        assert_eq!(as_count(&json!(true)), None);
    }

    #[test]
    fn test_wait_after_only_on_success() {
        let spec = TaskSpec {
            wait_after: Some(json!(2)),
            retry: Some(RetrySpec::new(1, 0)),
            ..TaskSpec::action("t", "std.echo")
        };
        let mut t = task(spec.clone());

        t.state = TaskState::Error;
        let outcome = after(&spec, &mut t, &json!({})).unwrap();
        assert_eq!(outcome.effects, vec![PolicyEffect::RetryTask { delay_secs: 0 }]);
        assert!(!runtime::wait_after_pending(&t.runtime_context));

        t.state = TaskState::Success;
        let outcome = after(&spec, &mut t, &json!({})).unwrap();
        assert!(outcome.halted);
        assert!(runtime::wait_after_pending(&t.runtime_context));
        assert_eq!(t.state, TaskState::Success);
    }
}
