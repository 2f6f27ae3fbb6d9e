//! Workflow controllers: decide what runs next from the current state.
//!
//! A controller is a pure function of a [`WorkflowSnapshot`]. It never
//! writes; the dispatcher applies the returned [`ControllerDecision`]
//! (marking tasks processed, creating task executions, finishing the
//! workflow) inside the transaction that read the snapshot. Running a
//! controller twice on the same committed state therefore yields nothing
//! new the second time.
//!
//! The workflow type is a closed set, so dispatch is a `match` over
//! [`Controller`] rather than a trait object.

mod direct;
mod reverse;

pub use direct::DirectController;
pub use reverse::ReverseController;

use tessera_types::execution::{TaskExecution, WorkflowExecution};
use tessera_types::spec::WorkflowType;
use uuid::Uuid;

use super::expression::{ExpressionError, ExpressionEvaluator};

/// What a controller sees.
pub struct WorkflowSnapshot<'a> {
    pub execution: &'a WorkflowExecution,
    /// Task executions in creation order.
    pub tasks: &'a [TaskExecution],
    pub evaluator: &'a dyn ExpressionEvaluator,
}

/// A change to the set of task executions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCommand {
    /// Start the task; `existing` is a WAITING join or a SKIPPED task being
    /// brought back by a rerun.
    Run { task: String, existing: Option<Uuid> },
    /// Record a join that is still waiting for inbound edges.
    Wait { task: String },
    /// Record the task as SKIPPED.
    Skip { task: String, existing: Option<Uuid> },
    /// Record the task as ERROR without running it.
    Fail {
        task: String,
        existing: Option<Uuid>,
        message: String,
    },
}

/// Outbound transitions evaluated for a terminal task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedTask {
    pub id: Uuid,
    pub next_tasks: Vec<String>,
    /// An ERROR task took at least one edge.
    pub error_handled: bool,
}

/// How the workflow should end (or pause).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOutcome {
    Succeed,
    Fail { state_info: String },
    Pause,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerDecision {
    pub commands: Vec<TaskCommand>,
    pub processed: Vec<ProcessedTask>,
    pub outcome: Option<WorkflowOutcome>,
}

impl ControllerDecision {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.processed.is_empty() && self.outcome.is_none()
    }
}

pub trait WorkflowController {
    fn continue_workflow(
        &self,
        snapshot: &WorkflowSnapshot<'_>,
    ) -> Result<ControllerDecision, ExpressionError>;
}

/// The controller for a workflow type.
#[derive(Debug)]
pub enum Controller<'a> {
    Direct(DirectController<'a>),
    Reverse(ReverseController<'a>),
}

/// Pick the controller for an execution.
pub fn controller_for(execution: &WorkflowExecution) -> Controller<'_> {
    match execution.spec.workflow_type {
        WorkflowType::Direct => Controller::Direct(DirectController::new(&execution.spec)),
        WorkflowType::Reverse => {
            let target = execution.params.get("task_name").and_then(|v| v.as_str());
            Controller::Reverse(ReverseController::new(&execution.spec, target))
        }
    }
}

impl WorkflowController for Controller<'_> {
    fn continue_workflow(
        &self,
        snapshot: &WorkflowSnapshot<'_>,
    ) -> Result<ControllerDecision, ExpressionError> {
        match self {
            Self::Direct(c) => c.continue_workflow(snapshot),
            Self::Reverse(c) => c.continue_workflow(snapshot),
        }
    }
}

/// State info of the earliest task in ERROR that nothing handled.
fn first_unhandled_error<'a>(
    tasks: impl Iterator<Item = &'a TaskExecution>,
    handled: impl Fn(&TaskExecution) -> bool,
) -> Option<String> {
    tasks
        .filter(|t| t.state == tessera_types::state::TaskState::Error && !handled(t))
        .min_by_key(|t| (t.created_at, t.id))
        .map(|t| {
            t.state_info
                .clone()
                .unwrap_or_else(|| format!("Task '{}' failed", t.name))
        })
}
