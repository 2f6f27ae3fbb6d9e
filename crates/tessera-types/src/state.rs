//! Execution state enums and their transition rules.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Workflow states
// ---------------------------------------------------------------------------

/// Lifecycle state of a workflow execution.
///
/// ```text
/// IDLE -> RUNNING -> { SUCCESS, ERROR, CANCELLED }
///            ^  |
///            |  v
///           PAUSED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Idle,
    Running,
    Paused,
    Success,
    Error,
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    /// Whether a direct transition `self -> next` is legal.
    ///
    /// Rerun (ERROR -> RUNNING) is not a transition in this sense; it is
    /// checked separately by [`WorkflowState::can_rerun`].
    pub fn can_transition_to(self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        match (self, next) {
            (Idle, Running) => true,
            (Running, Paused) => true,
            (Paused, Running) => true,
            (Idle | Running | Paused, Success | Error | Cancelled) => true,
            _ => false,
        }
    }

    /// States from which a task of this workflow may be rerun.
    pub fn can_rerun(self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task states
// ---------------------------------------------------------------------------

/// Lifecycle state of a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created but not started (e.g. held by a pause-before).
    Idle,
    /// A join task waiting for more inbound tasks.
    Waiting,
    /// Delayed by wait-before or a retry back-off.
    RunningDelayed,
    Running,
    Success,
    Error,
    Cancelled,
    /// Never reached because every inbound path failed.
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Error | Self::Cancelled | Self::Skipped
        )
    }

    /// States that still hold a slot in the workflow (not finished).
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::RunningDelayed => "running_delayed",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "waiting" => Some(Self::Waiting),
            "running_delayed" => Some(Self::RunningDelayed),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Action states
// ---------------------------------------------------------------------------

/// Lifecycle state of a single action invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Running,
    Success,
    Error,
    Cancelled,
}

impl ActionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_terminal_states_are_final() {
        for terminal in [
            WorkflowState::Success,
            WorkflowState::Error,
            WorkflowState::Cancelled,
        ] {
            for next in [
                WorkflowState::Idle,
                WorkflowState::Running,
                WorkflowState::Paused,
                WorkflowState::Success,
                WorkflowState::Error,
                WorkflowState::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_pause_only_from_running() {
        assert!(WorkflowState::Running.can_transition_to(WorkflowState::Paused));
        assert!(!WorkflowState::Idle.can_transition_to(WorkflowState::Paused));
        assert!(WorkflowState::Paused.can_transition_to(WorkflowState::Running));
        assert!(!WorkflowState::Paused.can_transition_to(WorkflowState::Paused));
    }

    #[test]
    fn test_rerun_allowed_from_error() {
        assert!(WorkflowState::Error.can_rerun());
        assert!(!WorkflowState::Success.can_rerun());
        assert!(!WorkflowState::Cancelled.can_rerun());
    }

    #[test]
    fn test_task_state_serde_names() {
        let json = serde_json::to_string(&TaskState::RunningDelayed).unwrap();
        assert_eq!(json, "\"running_delayed\"");
        assert_eq!(TaskState::parse("skipped"), Some(TaskState::Skipped));
        assert!(TaskState::Skipped.is_terminal());
        assert!(TaskState::Waiting.is_active());
    }

    #[test]
    fn test_parse_round_trips_as_str() {
        for s in [ActionState::Running, ActionState::Error] {
            assert_eq!(ActionState::parse(s.as_str()), Some(s));
        }
        assert_eq!(WorkflowState::parse("bogus"), None);
    }
}
