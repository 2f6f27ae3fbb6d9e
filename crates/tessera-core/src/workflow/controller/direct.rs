//! Direct workflows: a forward transition graph.
//!
//! Every terminal, unprocessed task has its outbound edges evaluated once
//! against its outbound context. Targets without an execution are started;
//! joins wait until enough inbound edges are satisfied, and are skipped or
//! failed once that can no longer happen.

use std::collections::{HashMap, HashSet};

use tessera_types::execution::TaskExecution;
use tessera_types::spec::{EngineCommand, Transition, WorkflowSpec};
use tessera_types::state::TaskState;
use uuid::Uuid;

use super::{
    first_unhandled_error, ControllerDecision, ProcessedTask, TaskCommand, WorkflowController,
    WorkflowOutcome, WorkflowSnapshot,
};
use crate::workflow::context::outbound_view;
use crate::workflow::dag::TransitionGraph;
use crate::workflow::expression::{evaluate_condition, ExpressionError, ExpressionEvaluator};
use crate::workflow::runtime;

pub const JOIN_UNSATISFIABLE: &str = "Join condition can't be satisfied";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    Satisfied,
    Pending,
    Impossible,
}

/// Per-call view of the snapshot.
struct Pass<'s> {
    by_name: HashMap<&'s str, &'s TaskExecution>,
    /// Targets taken by every processed task, including those processed in
    /// this pass.
    taken: HashMap<&'s str, Vec<String>>,
}

#[derive(Debug)]
pub struct DirectController<'a> {
    spec: &'a WorkflowSpec,
    graph: TransitionGraph<'a>,
}

impl<'a> DirectController<'a> {
    pub fn new(spec: &'a WorkflowSpec) -> Self {
        Self {
            spec,
            graph: TransitionGraph::build(spec),
        }
    }

    fn edge_state(
        &self,
        pass: &Pass<'_>,
        source: &str,
        target: &str,
        path: &mut HashSet<String>,
    ) -> EdgeState {
        if let Some(next) = pass.taken.get(source) {
            return if next.iter().any(|n| n == target) {
                EdgeState::Satisfied
            } else {
                EdgeState::Impossible
            };
        }
        if pass.by_name.contains_key(source) || !self.never_runs(pass, source, path) {
            EdgeState::Pending
        } else {
            EdgeState::Impossible
        }
    }

    /// A task without an execution can never run when every inbound edge
    /// is impossible. Start tasks always run.
    fn never_runs(&self, pass: &Pass<'_>, task: &str, path: &mut HashSet<String>) -> bool {
        if !path.insert(task.to_string()) {
            return true;
        }
        let inbound = self.graph.inbound(task);
        let never = !inbound.is_empty()
            && inbound
                .iter()
                .all(|src| self.edge_state(pass, src, task, path) == EdgeState::Impossible);
        path.remove(task);
        never
    }

    fn resolve_target(
        &self,
        pass: &Pass<'_>,
        name: &str,
        commanded: &mut HashSet<String>,
        commands: &mut Vec<TaskCommand>,
    ) {
        if commanded.contains(name) {
            return;
        }
        let Some(spec) = self.spec.task(name) else {
            return;
        };
        let existing = pass.by_name.get(name).copied();
        let existing_id = existing.map(|t| t.id);

        let command = match spec.join {
            None => match existing {
                None => Some(TaskCommand::Run {
                    task: name.to_string(),
                    existing: None,
                }),
                Some(t) if t.state == TaskState::Skipped => Some(TaskCommand::Run {
                    task: name.to_string(),
                    existing: Some(t.id),
                }),
                Some(_) => None,
            },
            Some(join) => {
                if existing.is_some_and(|t| !matches!(t.state, TaskState::Waiting | TaskState::Skipped)) {
                    return;
                }
                let inbound = self.graph.inbound(name);
                let states: Vec<(&str, EdgeState)> = inbound
                    .iter()
                    .map(|src| (*src, self.edge_state(pass, src, name, &mut HashSet::new())))
                    .collect();
                let satisfied = states.iter().filter(|(_, s)| *s == EdgeState::Satisfied).count();
                let impossible = states.iter().filter(|(_, s)| *s == EdgeState::Impossible).count();
                let required = join.required(inbound.len());

                if satisfied >= required {
                    Some(TaskCommand::Run {
                        task: name.to_string(),
                        existing: existing_id,
                    })
                } else if inbound.len() - impossible < required {
                    let failed_upstream = states.iter().any(|(src, state)| {
                        *state == EdgeState::Impossible
                            && pass
                                .by_name
                                .get(src)
                                .is_some_and(|t| matches!(t.state, TaskState::Error | TaskState::Skipped))
                    });
                    if existing.is_some_and(|t| t.state == TaskState::Skipped) {
                        None
                    } else if failed_upstream {
                        Some(TaskCommand::Skip {
                            task: name.to_string(),
                            existing: existing_id,
                        })
                    } else {
                        Some(TaskCommand::Fail {
                            task: name.to_string(),
                            existing: existing_id,
                            message: JOIN_UNSATISFIABLE.to_string(),
                        })
                    }
                } else if existing.is_none() {
                    Some(TaskCommand::Wait {
                        task: name.to_string(),
                    })
                } else {
                    None
                }
            }
        };

        if let Some(command) = command {
            commanded.insert(name.to_string());
            commands.push(command);
        }
    }
}

impl WorkflowController for DirectController<'_> {
    fn continue_workflow(
        &self,
        snapshot: &WorkflowSnapshot<'_>,
    ) -> Result<ControllerDecision, ExpressionError> {
        let mut decision = ControllerDecision::default();

        if snapshot.tasks.is_empty() {
            decision.commands = self
                .graph
                .start_tasks()
                .into_iter()
                .map(|task| TaskCommand::Run {
                    task: task.to_string(),
                    existing: None,
                })
                .collect();
            return Ok(decision);
        }

        let mut pass = Pass {
            by_name: snapshot.tasks.iter().map(|t| (t.name.as_str(), t)).collect(),
            taken: snapshot
                .tasks
                .iter()
                .filter(|t| t.processed)
                .map(|t| (t.name.as_str(), runtime::next_tasks(&t.runtime_context)))
                .collect(),
        };
        let mut targets: Vec<String> = Vec::new();
        let mut skip_candidates: Vec<String> = Vec::new();
        let mut handled_now: HashSet<Uuid> = HashSet::new();

        for task in snapshot.tasks {
            if task.processed
                || !task.state.is_terminal()
                || runtime::wait_after_pending(&task.runtime_context)
            {
                continue;
            }

            let next = take_transitions(task, snapshot.evaluator)?;
            for name in &next {
                match EngineCommand::parse(name) {
                    Some(command) => {
                        if decision.outcome.is_none() {
                            decision.outcome = Some(outcome_for(command, task));
                        }
                    }
                    None => push_unique(&mut targets, name),
                }
            }

            if next.is_empty() && matches!(task.state, TaskState::Error | TaskState::Skipped) {
                for transition in &task.spec.on_success {
                    if transition.engine_command().is_none() {
                        push_unique(&mut skip_candidates, &transition.task);
                    }
                }
            }

            let error_handled = task.state == TaskState::Error && !next.is_empty();
            if error_handled {
                handled_now.insert(task.id);
            }
            tracing::debug!(task = %task.name, state = %task.state, next = ?next, "processed task");
            decision.processed.push(ProcessedTask {
                id: task.id,
                next_tasks: next.clone(),
                error_handled,
            });
            pass.taken.insert(task.name.as_str(), next);
        }

        for task in snapshot.tasks.iter().filter(|t| t.state == TaskState::Waiting) {
            push_unique(&mut targets, &task.name);
        }

        let mut commanded = HashSet::new();
        for target in &targets {
            self.resolve_target(&pass, target, &mut commanded, &mut decision.commands);
        }

        for candidate in &skip_candidates {
            if pass.by_name.contains_key(candidate.as_str()) || commanded.contains(candidate) {
                continue;
            }
            match self.spec.task(candidate) {
                Some(spec) if spec.is_join() => {
                    self.resolve_target(&pass, candidate, &mut commanded, &mut decision.commands);
                }
                Some(_) => {
                    let unreachable = self.graph.inbound(candidate).iter().all(|src| {
                        self.edge_state(&pass, src, candidate, &mut HashSet::new()) == EdgeState::Impossible
                    });
                    if unreachable {
                        commanded.insert(candidate.clone());
                        decision.commands.push(TaskCommand::Skip {
                            task: candidate.clone(),
                            existing: None,
                        });
                    }
                }
                None => {}
            }
        }

        if decision.commands.is_empty() && decision.outcome.is_none() {
            let settled = snapshot.tasks.iter().all(|t| {
                t.state.is_terminal()
                    && pass.taken.contains_key(t.name.as_str())
                    && !runtime::wait_after_pending(&t.runtime_context)
            });
            if settled {
                let unhandled = first_unhandled_error(snapshot.tasks.iter(), |t| {
                    runtime::error_handled(&t.runtime_context) || handled_now.contains(&t.id)
                });
                decision.outcome = Some(match unhandled {
                    Some(state_info) => WorkflowOutcome::Fail { state_info },
                    None => WorkflowOutcome::Succeed,
                });
            }
        }

        Ok(decision)
    }
}

/// Targets of the edges a terminal task takes, deduplicated in order.
fn take_transitions(
    task: &TaskExecution,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<Vec<String>, ExpressionError> {
    let spec = &task.spec;
    let edges: Vec<&Transition> = match task.state {
        TaskState::Success => spec.on_success.iter().chain(&spec.on_complete).collect(),
        TaskState::Error => spec.on_error.iter().chain(&spec.on_complete).collect(),
        _ => Vec::new(),
    };
    if edges.is_empty() {
        return Ok(Vec::new());
    }

    let context = outbound_view(task).to_value();
    let mut next: Vec<String> = Vec::new();
    for edge in edges {
        let take = match &edge.when {
            None => true,
            Some(condition) => evaluate_condition(evaluator, condition, &context)?,
        };
        if take && !next.contains(&edge.task) {
            next.push(edge.task.clone());
        }
    }
    Ok(next)
}

fn outcome_for(command: EngineCommand, task: &TaskExecution) -> WorkflowOutcome {
    match command {
        EngineCommand::Succeed => WorkflowOutcome::Succeed,
        EngineCommand::Pause => WorkflowOutcome::Pause,
        EngineCommand::Fail => WorkflowOutcome::Fail {
            state_info: format!("Failed by task '{}'", task.name),
        },
    }
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|n| n == name) {
        list.push(name.to_string());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
