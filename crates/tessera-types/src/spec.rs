//! Workflow and task specifications.
//!
//! These are the immutable value objects the engine executes. They are
//! produced by a definition loader (YAML files in the CLI, hand-built structs
//! in tests) and snapshotted into every execution record so a running
//! workflow never observes later edits to its definition.
//!
//! ```yaml
//! name: greet
//! input: [name, { greeting: "Hello" }]
//! tasks:
//!   - name: say
//!     action: std.echo
//!     input: { output: "{{ greeting }}, {{ name }}" }
//!     publish: { message: "{{ result }}" }
//!     retry: { count: 3, delay: 1 }
//!     on_success: [done]
//!   - name: done
//!     action: std.noop
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON object used for inputs, params, contexts and publish clauses.
pub type JsonMap = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// How the controller decides which tasks run next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    /// Forward transition graph (`on_success` / `on_error` / `on_complete`).
    #[default]
    Direct,
    /// Dependency graph resolved backward from a target task (`requires`).
    Reverse,
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Unique workflow name, used to start executions.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub workflow_type: WorkflowType,
    /// Declared input parameters.
    #[serde(default)]
    pub input: Vec<InputParam>,
    /// Output clause evaluated against the final context. When absent the
    /// workflow output is its published context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Policies and transitions applied to every task that does not set its own.
    #[serde(default)]
    pub task_defaults: TaskDefaults,
    pub tasks: Vec<TaskSpec>,
}

impl WorkflowSpec {
    /// Look up a task by name.
    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// The task spec with workflow-level defaults folded in.
    pub fn effective_task(&self, name: &str) -> Option<TaskSpec> {
        self.task(name).map(|t| t.merged_with(&self.task_defaults))
    }
}

/// A declared workflow input parameter.
///
/// In YAML either a bare name (required) or a single-entry map giving the
/// default value: `input: [name, { greeting: "Hello" }]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "InputParamRepr", into = "InputParamRepr")]
pub struct InputParam {
    pub name: String,
    pub default: Option<Value>,
}

impl InputParam {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    pub fn with_default(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            default: Some(default.into()),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum InputParamRepr {
    Name(String),
    Defaulted(BTreeMap<String, Value>),
}

impl TryFrom<InputParamRepr> for InputParam {
    type Error = String;

    fn try_from(repr: InputParamRepr) -> Result<Self, Self::Error> {
        match repr {
            InputParamRepr::Name(name) => Ok(Self::required(name)),
            InputParamRepr::Defaulted(map) => {
                if map.len() != 1 {
                    return Err(format!(
                        "input parameter with a default must have exactly one key, got {}",
                        map.len()
                    ));
                }
                let (name, default) = map.into_iter().next().ok_or("empty input parameter")?;
                Ok(Self::with_default(name, default))
            }
        }
    }
}

impl From<InputParam> for InputParamRepr {
    fn from(param: InputParam) -> Self {
        match param.default {
            None => Self::Name(param.name),
            Some(default) => Self::Defaulted(BTreeMap::from([(param.name, default)])),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One node of the workflow graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique within the workflow.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Action to invoke (e.g. `std.echo`). Mutually exclusive with `workflow`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Sub-workflow to start instead of an action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    /// Action (or sub-workflow) input; values may contain expressions.
    #[serde(default)]
    pub input: JsonMap,
    /// Variables published into the workflow context on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<JsonMap>,
    /// Variables published when the task ends in ERROR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_on_error: Option<JsonMap>,
    /// Variables published when the task is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_on_skip: Option<JsonMap>,
    /// Fan-out bindings: `"x in {{ items }}"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_items: Option<WithItems>,

    // Policies. Numeric and boolean values may be expressions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_after: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<Value>,

    // Direct workflow edges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_error: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_complete: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinSpec>,

    // Reverse workflow edges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,

    /// The action may be re-invoked without side effects; required for
    /// partial with-items reruns.
    #[serde(default)]
    pub safe_rerun: bool,
}

impl TaskSpec {
    /// A task running `action` with no input.
    pub fn action(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: Some(action.into()),
            ..Default::default()
        }
    }

    pub fn is_join(&self) -> bool {
        self.join.is_some()
    }

    /// Every outbound edge regardless of the outcome it fires on.
    pub fn all_transitions(&self) -> impl Iterator<Item = &Transition> {
        self.on_success
            .iter()
            .chain(self.on_error.iter())
            .chain(self.on_complete.iter())
    }

    /// Fill unset policies and empty transition lists from `defaults`.
    pub fn merged_with(&self, defaults: &TaskDefaults) -> TaskSpec {
        let mut merged = self.clone();
        if merged.retry.is_none() {
            merged.retry = defaults.retry.clone();
        }
        if merged.wait_before.is_none() {
            merged.wait_before = defaults.wait_before.clone();
        }
        if merged.wait_after.is_none() {
            merged.wait_after = defaults.wait_after.clone();
        }
        if merged.timeout.is_none() {
            merged.timeout = defaults.timeout.clone();
        }
        if merged.pause_before.is_none() {
            merged.pause_before = defaults.pause_before.clone();
        }
        if merged.concurrency.is_none() {
            merged.concurrency = defaults.concurrency.clone();
        }
        if merged.on_success.is_empty() {
            merged.on_success = defaults.on_success.clone();
        }
        if merged.on_error.is_empty() {
            merged.on_error = defaults.on_error.clone();
        }
        if merged.on_complete.is_empty() {
            merged.on_complete = defaults.on_complete.clone();
        }
        merged
    }
}

/// Workflow-level defaults for task policies and transitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_after: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_error: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_complete: Vec<Transition>,
}

/// Retry policy definition. `count` and `delay` may be expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySpec {
    pub count: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<Value>,
    /// Stop retrying when this condition holds after an error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_on: Option<String>,
    /// Keep retrying (even on success) while this condition holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on: Option<String>,
}

impl RetrySpec {
    pub fn new(count: u64, delay: u64) -> Self {
        Self {
            count: Value::from(count),
            delay: Some(Value::from(delay)),
            break_on: None,
            continue_on: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// An outbound edge: the next task (or engine command) and an optional guard.
///
/// In YAML either a bare name or `{ task: name, when: "expr" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TransitionRepr", into = "TransitionRepr")]
pub struct Transition {
    pub task: String,
    pub when: Option<String>,
}

impl Transition {
    pub fn to(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            when: None,
        }
    }

    pub fn when(task: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            when: Some(condition.into()),
        }
    }

    /// The engine command this edge names, if it is not a task.
    pub fn engine_command(&self) -> Option<EngineCommand> {
        EngineCommand::parse(&self.task)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TransitionRepr {
    Name(String),
    Guarded {
        task: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<String>,
    },
}

impl From<TransitionRepr> for Transition {
    fn from(repr: TransitionRepr) -> Self {
        match repr {
            TransitionRepr::Name(task) => Self { task, when: None },
            TransitionRepr::Guarded { task, when } => Self { task, when },
        }
    }
}

impl From<Transition> for TransitionRepr {
    fn from(t: Transition) -> Self {
        match t.when {
            None => Self::Name(t.task),
            Some(when) => Self::Guarded {
                task: t.task,
                when: Some(when),
            },
        }
    }
}

/// Reserved transition targets that act on the workflow instead of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Fail,
    Succeed,
    Pause,
}

impl EngineCommand {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "fail" => Some(Self::Fail),
            "succeed" => Some(Self::Succeed),
            "pause" => Some(Self::Pause),
            _ => None,
        }
    }
}

/// How many inbound edges a join task waits for.
///
/// `join: all`, `join: one` or `join: 2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JoinSpec {
    Mode(JoinMode),
    Count(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    All,
    One,
}

impl JoinSpec {
    pub fn all() -> Self {
        Self::Mode(JoinMode::All)
    }

    /// Satisfied inbound edges needed out of `inbound`.
    pub fn required(&self, inbound: usize) -> usize {
        match self {
            Self::Mode(JoinMode::All) => inbound,
            Self::Mode(JoinMode::One) => 1.min(inbound),
            Self::Count(n) => (*n).min(inbound),
        }
    }
}

/// With-items bindings, one `"<var> in <expr>"` string per iterable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WithItemsRepr", into = "WithItemsRepr")]
pub struct WithItems(pub Vec<String>);

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WithItemsRepr {
    One(String),
    Many(Vec<String>),
}

impl From<WithItemsRepr> for WithItems {
    fn from(repr: WithItemsRepr) -> Self {
        match repr {
            WithItemsRepr::One(s) => Self(vec![s]),
            WithItemsRepr::Many(v) => Self(v),
        }
    }
}

impl From<WithItems> for WithItemsRepr {
    fn from(w: WithItems) -> Self {
        Self::Many(w.0)
    }
}
