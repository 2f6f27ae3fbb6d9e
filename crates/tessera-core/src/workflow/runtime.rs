//! Typed access to a task execution's `runtime_context`.
//!
//! Policies, the with-items engine and the controllers keep their
//! bookkeeping under fixed keys of this JSON map so it persists with the
//! task record. Each section is a small serde struct loaded and stored as a
//! whole.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_types::spec::JsonMap;

pub const RETRY_KEY: &str = "retry_task_policy";
pub const WAIT_BEFORE_KEY: &str = "wait_before_policy";
pub const WAIT_AFTER_KEY: &str = "wait_after_policy";
pub const PAUSE_BEFORE_KEY: &str = "pause_before_policy";
pub const TIMEOUT_KEY: &str = "timeout_policy";
pub const CONCURRENCY_KEY: &str = "concurrency";
pub const WITH_ITEMS_KEY: &str = "with_items";
pub const NEXT_TASKS_KEY: &str = "next_tasks";
pub const ERROR_HANDLED_KEY: &str = "error_handled";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub retry_no: u64,
}

/// Shared by wait-before, pause-before and timeout: the policy already fired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipState {
    #[serde(default)]
    pub skip: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitAfterState {
    #[serde(default)]
    pub skip: bool,
    /// Downstream transitions are held back until the delay elapses.
    #[serde(default)]
    pub pending: bool,
}

/// Load a section, falling back to its default when absent or malformed.
pub fn load<T: DeserializeOwned + Default>(runtime: &JsonMap, key: &str) -> T {
    runtime
        .get(key)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

/// Store a section, replacing whatever was there.
pub fn store<T: Serialize>(runtime: &mut JsonMap, key: &str, value: &T) {
    if let Ok(v) = serde_json::to_value(value) {
        runtime.insert(key.to_string(), v);
    }
}

pub fn wait_after_pending(runtime: &JsonMap) -> bool {
    load::<WaitAfterState>(runtime, WAIT_AFTER_KEY).pending
}

pub fn retry_no(runtime: &JsonMap) -> u64 {
    load::<RetryState>(runtime, RETRY_KEY).retry_no
}

/// With-items concurrency recorded by the concurrency policy (0 = unlimited).
pub fn concurrency(runtime: &JsonMap) -> usize {
    runtime
        .get(CONCURRENCY_KEY)
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize
}

/// Targets taken when the task was processed.
pub fn next_tasks(runtime: &JsonMap) -> Vec<String> {
    load(runtime, NEXT_TASKS_KEY)
}

pub fn error_handled(runtime: &JsonMap) -> bool {
    runtime
        .get(ERROR_HANDLED_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
