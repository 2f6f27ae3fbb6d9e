//! Reverse workflows: resolve backward from a target task.
//!
//! Only the target and what it transitively `requires` ever run. A task is
//! ready once every task it requires has succeeded.

use std::collections::HashMap;

use tessera_types::execution::TaskExecution;
use tessera_types::spec::WorkflowSpec;
use tessera_types::state::TaskState;

use super::{
    first_unhandled_error, ControllerDecision, ProcessedTask, TaskCommand, WorkflowController,
    WorkflowOutcome, WorkflowSnapshot,
};
use crate::workflow::dag::requires_closure;
use crate::workflow::expression::ExpressionError;
use crate::workflow::runtime;

#[derive(Debug)]
pub struct ReverseController<'a> {
    spec: &'a WorkflowSpec,
    target: Option<&'a str>,
}

impl<'a> ReverseController<'a> {
    pub fn new(spec: &'a WorkflowSpec, target: Option<&'a str>) -> Self {
        Self { spec, target }
    }
}

fn succeeded(task: Option<&&TaskExecution>) -> bool {
    task.is_some_and(|t| {
        t.state == TaskState::Success && !runtime::wait_after_pending(&t.runtime_context)
    })
}

impl WorkflowController for ReverseController<'_> {
    fn continue_workflow(
        &self,
        snapshot: &WorkflowSnapshot<'_>,
    ) -> Result<ControllerDecision, ExpressionError> {
        let mut decision = ControllerDecision::default();

        let Some(target) = self.target else {
            decision.outcome = Some(WorkflowOutcome::Fail {
                state_info: "Reverse workflow needs a 'task_name' parameter".to_string(),
            });
            return Ok(decision);
        };
        let closure = requires_closure(self.spec, target);
        if closure.is_empty() {
            decision.outcome = Some(WorkflowOutcome::Fail {
                state_info: format!("Task '{target}' not found"),
            });
            return Ok(decision);
        }

        let by_name: HashMap<&str, &TaskExecution> =
            snapshot.tasks.iter().map(|t| (t.name.as_str(), t)).collect();

        for task in snapshot.tasks {
            if !task.processed
                && task.state.is_terminal()
                && !runtime::wait_after_pending(&task.runtime_context)
            {
                decision.processed.push(ProcessedTask {
                    id: task.id,
                    next_tasks: Vec::new(),
                    error_handled: false,
                });
            }
        }

        for name in &closure {
            if by_name.contains_key(name) {
                continue;
            }
            let Some(spec) = self.spec.task(name) else {
                continue;
            };
            if spec.requires.iter().all(|req| succeeded(by_name.get(req.as_str()))) {
                decision.commands.push(TaskCommand::Run {
                    task: name.to_string(),
                    existing: None,
                });
            }
        }

        if decision.commands.is_empty() {
            if succeeded(by_name.get(target)) {
                decision.outcome = Some(WorkflowOutcome::Succeed);
            } else if snapshot
                .tasks
                .iter()
                .all(|t| t.state.is_terminal() && !runtime::wait_after_pending(&t.runtime_context))
            {
                let state_info = first_unhandled_error(snapshot.tasks.iter(), |_| false)
                    .unwrap_or_else(|| format!("Task '{target}' can not be reached"));
                decision.outcome = Some(WorkflowOutcome::Fail { state_info });
            }
        }

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::expression::JexlEvaluator;
    use tessera_types::execution::WorkflowExecution;
    use tessera_types::spec::{TaskSpec, WorkflowType};

    fn workflow() -> WorkflowExecution {
        let task = |name: &str, requires: &[&str]| TaskSpec {
            requires: requires.iter().map(|s| s.to_string()).collect(),
            ..TaskSpec::action(name, "std.noop")
        };
        WorkflowExecution::new(
            WorkflowSpec {
                name: "rev".into(),
                description: None,
                workflow_type: WorkflowType::Reverse,
                input: vec![],
                output: None,
                task_defaults: Default::default(),
                tasks: vec![
                    task("a", &[]),
                    task("b", &[]),
                    task("c", &["a", "b"]),
                    task("unrelated", &[]),
                ],
            },
            Default::default(),
            Default::default(),
        )
    }

    fn ex(wf: &WorkflowExecution, name: &str, state: TaskState) -> TaskExecution {
        let mut task = TaskExecution::new(wf.id, wf.spec.effective_task(name).unwrap(), Default::default());
        task.state = state;
        task
    }

    fn decide(wf: &WorkflowExecution, target: Option<&str>, tasks: &[TaskExecution]) -> ControllerDecision {
        let ev = JexlEvaluator::new();
        let snapshot = WorkflowSnapshot {
            execution: wf,
            tasks,
            evaluator: &ev,
        };
        ReverseController::new(&wf.spec, target)
            .continue_workflow(&snapshot)
            .unwrap()
    }

    fn names(decision: &ControllerDecision) -> Vec<&str> {
        decision
            .commands
            .iter()
            .filter_map(|c| match c {
                TaskCommand::Run { task, .. } => Some(task.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_runs_only_the_closure() {
        let wf = workflow();
        assert_eq!(names(&decide(&wf, Some("c"), &[])), vec!["a", "b"]);
    }

    #[test]
    fn test_target_waits_for_all_requirements() {
        let wf = workflow();
        let a = ex(&wf, "a", TaskState::Success);
        let b = ex(&wf, "b", TaskState::Running);
        let decision = decide(&wf, Some("c"), &[a.clone(), b.clone()]);
        assert!(decision.commands.is_empty());
        assert_eq!(decision.processed.len(), 1);

        let mut b = b;
        b.state = TaskState::Success;
        assert_eq!(names(&decide(&wf, Some("c"), &[a, b])), vec!["c"]);
    }

    #[test]
    fn test_target_success_completes() {
        let wf = workflow();
        let tasks = [
            ex(&wf, "a", TaskState::Success),
            ex(&wf, "b", TaskState::Success),
            ex(&wf, "c", TaskState::Success),
        ];
        assert_eq!(decide(&wf, Some("c"), &tasks).outcome, Some(WorkflowOutcome::Succeed));
    }

    #[test]
    fn test_error_with_nothing_running_fails() {
        let wf = workflow();
        let mut a = ex(&wf, "a", TaskState::Error);
        a.state_info = Some("broken".into());
        let b = ex(&wf, "b", TaskState::Success);
        assert_eq!(
            decide(&wf, Some("c"), &[a, b]).outcome,
            Some(WorkflowOutcome::Fail {
                state_info: "broken".into()
            })
        );
    }

    #[test]
    fn test_missing_target_fails() {
        let wf = workflow();
        assert!(matches!(
            decide(&wf, None, &[]).outcome,
            Some(WorkflowOutcome::Fail { .. })
        ));
        assert!(matches!(
            decide(&wf, Some("ghost"), &[]).outcome,
            Some(WorkflowOutcome::Fail { .. })
        ));
    }
}
