//! Engine events broadcast after each committed transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{TaskState, WorkflowState};

/// A state change observed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    WorkflowStateChanged {
        workflow_execution_id: Uuid,
        workflow_name: String,
        from: WorkflowState,
        to: WorkflowState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_info: Option<String>,
        at: DateTime<Utc>,
    },
    TaskStateChanged {
        workflow_execution_id: Uuid,
        task_execution_id: Uuid,
        task_name: String,
        from: TaskState,
        to: TaskState,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn workflow_execution_id(&self) -> Uuid {
        match self {
            Self::WorkflowStateChanged {
                workflow_execution_id,
                ..
            }
            | Self::TaskStateChanged {
                workflow_execution_id,
                ..
            } => *workflow_execution_id,
        }
    }
}
