//! Durable execution records.
//!
//! A `WorkflowExecution` owns `TaskExecution`s, which own `ActionExecution`s
//! (one per with-items iteration) and possibly nested `WorkflowExecution`s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::result::ActionResult;
use crate::spec::{JsonMap, TaskSpec, WorkflowSpec};
use crate::state::{ActionState, TaskState, WorkflowState};

/// One run of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// UUIDv7, time-sortable.
    pub id: Uuid,
    pub workflow_name: String,
    /// Snapshot of the definition this run executes.
    pub spec: WorkflowSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input: JsonMap,
    /// Start parameters: `env` (environment map), `task_name` (reverse target).
    pub params: JsonMap,
    pub state: WorkflowState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_info: Option<String>,
    /// Variables published by tasks so far.
    pub context: JsonMap,
    /// Set once the workflow reaches a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonMap>,
    /// Top-most execution of a nested chain (self for top-level runs).
    pub root_execution_id: Uuid,
    /// Task that started this execution as a sub-workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    /// Build a fresh top-level execution in IDLE.
    pub fn new(spec: WorkflowSpec, input: JsonMap, params: JsonMap) -> Self {
        let id = Uuid::now_v7();
        let now = Utc::now();
        Self {
            id,
            workflow_name: spec.name.clone(),
            spec,
            description: None,
            input,
            params,
            state: WorkflowState::Idle,
            state_info: None,
            context: JsonMap::new(),
            output: None,
            root_execution_id: id,
            parent_task_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The environment map from `params.env` (empty if unset).
    pub fn env(&self) -> JsonMap {
        match self.params.get("env") {
            Some(Value::Object(env)) => env.clone(),
            _ => JsonMap::new(),
        }
    }
}

/// One task of a workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: Uuid,
    pub workflow_execution_id: Uuid,
    pub name: String,
    /// Task spec with workflow task-defaults applied.
    pub spec: TaskSpec,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_info: Option<String>,
    /// Frozen flattened context the task started with.
    pub in_context: JsonMap,
    /// Result of the publish clause applicable to the final state.
    pub published: JsonMap,
    /// Policy and with-items bookkeeping.
    pub runtime_context: JsonMap,
    /// Outbound transitions have been evaluated.
    pub processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskExecution {
    pub fn new(workflow_execution_id: Uuid, spec: TaskSpec, in_context: JsonMap) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_execution_id,
            name: spec.name.clone(),
            spec,
            state: TaskState::Idle,
            state_info: None,
            in_context,
            published: JsonMap::new(),
            runtime_context: JsonMap::new(),
            processed: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One invocation of an action on behalf of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionExecution {
    pub id: Uuid,
    pub task_execution_id: Uuid,
    pub workflow_execution_id: Uuid,
    /// Action name, e.g. `std.echo`.
    pub name: String,
    pub input: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ActionResult>,
    pub state: ActionState,
    /// The result has been folded into the owning task.
    pub accepted: bool,
    /// `index` of the with-items iteration (0 for plain tasks).
    pub runtime_context: JsonMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActionExecution {
    pub fn new(task: &TaskExecution, name: impl Into<String>, input: JsonMap, index: usize) -> Self {
        let now = Utc::now();
        let mut runtime_context = JsonMap::new();
        runtime_context.insert("index".to_string(), Value::from(index));
        Self {
            id: Uuid::now_v7(),
            task_execution_id: task.id,
            workflow_execution_id: task.workflow_execution_id,
            name: name.into(),
            input,
            output: None,
            state: ActionState::Running,
            accepted: false,
            runtime_context,
            created_at: now,
            updated_at: now,
        }
    }

    /// With-items iteration index.
    pub fn index(&self) -> usize {
        self.runtime_context
            .get("index")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize
    }
}

/// Filter for listing workflow executions.
#[derive(Debug, Clone, Default)]
pub struct WorkflowExecutionFilter {
    pub state: Option<WorkflowState>,
    pub workflow_name: Option<String>,
    pub parent_task_id: Option<Uuid>,
    pub limit: Option<u32>,
}

/// What `on_action_complete` resolved its id to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionRef {
    Action(Uuid),
    Workflow(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{TaskSpec, WorkflowSpec};
    use serde_json::json;

    fn spec() -> WorkflowSpec {
        WorkflowSpec {
            name: "wf".into(),
            description: None,
            workflow_type: Default::default(),
            input: vec![],
            output: None,
            task_defaults: Default::default(),
            tasks: vec![TaskSpec::action("t", "std.noop")],
        }
    }

    #[test]
    fn test_new_workflow_is_its_own_root() {
        let wf = WorkflowExecution::new(spec(), JsonMap::new(), JsonMap::new());
        assert_eq!(wf.root_execution_id, wf.id);
        assert_eq!(wf.state, WorkflowState::Idle);
        assert!(wf.output.is_none());
    }

    #[test]
    fn test_env_reads_params() {
        let mut params = JsonMap::new();
        params.insert("env".into(), json!({"from": "Neo"}));
        let wf = WorkflowExecution::new(spec(), JsonMap::new(), params);
        assert_eq!(wf.env().get("from"), Some(&json!("Neo")));
    }

    #[test]
    fn test_action_execution_index() {
        let wf = WorkflowExecution::new(spec(), JsonMap::new(), JsonMap::new());
        let task = TaskExecution::new(wf.id, TaskSpec::action("t", "std.noop"), JsonMap::new());
        let action = ActionExecution::new(&task, "std.noop", JsonMap::new(), 4);
        assert_eq!(action.index(), 4);
        assert_eq!(action.workflow_execution_id, wf.id);
        assert!(!action.accepted);
    }

    #[test]
    fn test_workflow_execution_serde_round_trip() {
        let wf = WorkflowExecution::new(spec(), JsonMap::new(), JsonMap::new());
        let json = serde_json::to_string(&wf).unwrap();
        let back: WorkflowExecution = serde_json::from_str(&json).unwrap();
        assert_eq!(back, wf);
    }
}
