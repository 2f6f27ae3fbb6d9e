//! Persisted future invocations.
//!
//! Waits, timeouts and retry back-off never sleep in-process. A policy writes a
//! `DelayedCall` row in the same transaction as its state change, and the
//! poller hands due rows back to the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What the engine should do when a delayed call comes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DelayedCallTarget {
    /// Wait-before elapsed: start the task.
    WaitBeforeElapsed { task_execution_id: Uuid },
    /// Wait-after elapsed: let the controller evaluate the task's transitions.
    WaitAfterElapsed { task_execution_id: Uuid },
    /// Retry back-off elapsed: run the task's action again.
    RetryTask { task_execution_id: Uuid },
    /// Timeout watchdog: fail the task if it is still running.
    TaskTimeout {
        task_execution_id: Uuid,
        timeout_secs: u64,
    },
}

impl DelayedCallTarget {
    pub fn task_execution_id(&self) -> Uuid {
        match self {
            Self::WaitBeforeElapsed { task_execution_id }
            | Self::WaitAfterElapsed { task_execution_id }
            | Self::RetryTask { task_execution_id }
            | Self::TaskTimeout {
                task_execution_id, ..
            } => *task_execution_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::WaitBeforeElapsed { .. } => "wait_before_elapsed",
            Self::WaitAfterElapsed { .. } => "wait_after_elapsed",
            Self::RetryTask { .. } => "retry_task",
            Self::TaskTimeout { .. } => "task_timeout",
        }
    }
}

/// A scheduled callback row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedCall {
    pub id: Uuid,
    pub target: DelayedCallTarget,
    pub workflow_execution_id: Uuid,
    /// Earliest time the call may run.
    pub run_at: DateTime<Utc>,
    /// Lease held by a poller; the call is invisible to other pollers until then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DelayedCall {
    pub fn new(target: DelayedCallTarget, workflow_execution_id: Uuid, run_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            target,
            workflow_execution_id,
            run_at,
            claimed_until: None,
            created_at: Utc::now(),
        }
    }

    /// Due at `now` and not leased by someone else.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.run_at <= now && self.claimed_until.is_none_or(|until| until <= now)
    }
}
