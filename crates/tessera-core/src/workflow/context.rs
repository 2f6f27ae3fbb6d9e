//! Execution context and data flow.
//!
//! A [`ContextView`] is a stack of immutable maps searched top-down. The
//! workflow view layers published variables over the workflow input over the
//! environment; a task's outbound view adds its published values and
//! `result` on top. Views have no mutating operations: adding a layer
//! produces a new view and existing layers are shared `Arc` snapshots, so a
//! view handed to one evaluation can never be altered by another.
//!
//! Publishing is an explicit merge step: [`merge_published`] returns a new
//! workflow context in which the completing task's values overwrite earlier
//! ones with the same name (last writer wins, in processing order).

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tessera_types::execution::{TaskExecution, WorkflowExecution};
use tessera_types::spec::JsonMap;

use super::expression::{evaluate_recursively, ExpressionError, ExpressionEvaluator};

/// Reserved key exposing the environment map to expressions.
pub const ENV_KEY: &str = "__env";
/// Reserved key exposing `{id, name}` of the running workflow execution.
pub const EXECUTION_KEY: &str = "__execution";
/// Reserved key exposing `{id, name, state, state_info}` of the source task
/// in outbound contexts.
pub const TASK_KEY: &str = "__task";
/// Key under which the action (or aggregated with-items) result is visible.
pub const RESULT_KEY: &str = "result";

// ---------------------------------------------------------------------------
// ContextView
// ---------------------------------------------------------------------------

/// Layered read-only dictionary. The first layer wins.
#[derive(Debug, Clone, Default)]
pub struct ContextView {
    layers: Vec<Arc<JsonMap>>,
}

impl ContextView {
    /// Build a view from layers ordered highest priority first.
    pub fn new(layers: impl IntoIterator<Item = Arc<JsonMap>>) -> Self {
        Self {
            layers: layers.into_iter().collect(),
        }
    }

    /// A view over a single map.
    pub fn from_map(map: JsonMap) -> Self {
        Self::new([Arc::new(map)])
    }

    /// A new view with `layer` searched before every existing layer.
    pub fn with_layer(&self, layer: JsonMap) -> Self {
        let mut layers = Vec::with_capacity(self.layers.len() + 1);
        layers.push(Arc::new(layer));
        layers.extend(self.layers.iter().cloned());
        Self { layers }
    }

    /// A new view with `layer` searched after every existing layer.
    pub fn with_fallback(&self, layer: JsonMap) -> Self {
        let mut layers = self.layers.clone();
        layers.push(Arc::new(layer));
        Self { layers }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.layers.iter().find_map(|layer| layer.get(key))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.layers.iter().any(|layer| layer.contains_key(key))
    }

    /// Every visible key, deduplicated.
    pub fn keys(&self) -> BTreeSet<&str> {
        self.layers
            .iter()
            .flat_map(|layer| layer.keys().map(String::as_str))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|layer| layer.is_empty())
    }

    /// Flatten into a fresh owned map (what the view shows, no sharing).
    pub fn snapshot(&self) -> JsonMap {
        let mut flat = JsonMap::new();
        for layer in self.layers.iter().rev() {
            for (key, value) in layer.iter() {
                flat.insert(key.clone(), value.clone());
            }
        }
        flat
    }

    /// The flattened view as the JSON object expressions evaluate against.
    pub fn to_value(&self) -> Value {
        Value::Object(self.snapshot())
    }
}

// ---------------------------------------------------------------------------
// Building contexts
// ---------------------------------------------------------------------------

/// Layer published variables over workflow input over environment.
///
/// The environment is additionally reachable as `__env`, so a published or
/// input key never hides it completely.
pub fn build_context(workflow_input: &JsonMap, environment: &JsonMap, published: &JsonMap) -> ContextView {
    let mut reserved = JsonMap::new();
    reserved.insert(ENV_KEY.to_string(), Value::Object(environment.clone()));
    ContextView::new([
        Arc::new(reserved),
        Arc::new(published.clone()),
        Arc::new(workflow_input.clone()),
        Arc::new(environment.clone()),
    ])
}

/// The current data-flow view of a workflow execution.
pub fn workflow_view(wf_ex: &WorkflowExecution) -> ContextView {
    build_context(&wf_ex.input, &wf_ex.env(), &wf_ex.context).with_layer(execution_layer(wf_ex))
}

fn execution_layer(wf_ex: &WorkflowExecution) -> JsonMap {
    let mut layer = JsonMap::new();
    layer.insert(
        EXECUTION_KEY.to_string(),
        json!({ "id": wf_ex.id.to_string(), "name": wf_ex.workflow_name }),
    );
    layer
}

/// The view a task's transitions, publish clause and retry conditions see:
/// its inbound context, then what it published, then `result` and `__task`.
pub fn outbound_view(task_ex: &TaskExecution) -> ContextView {
    let mut top = JsonMap::new();
    top.insert(
        RESULT_KEY.to_string(),
        task_ex
            .runtime_context
            .get(RESULT_KEY)
            .cloned()
            .unwrap_or(Value::Null),
    );
    top.insert(
        TASK_KEY.to_string(),
        json!({
            "id": task_ex.id.to_string(),
            "name": task_ex.name,
            "state": task_ex.state.as_str(),
            "state_info": task_ex.state_info,
        }),
    );
    ContextView::from_map(task_ex.in_context.clone())
        .with_layer(task_ex.published.clone())
        .with_layer(top)
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// Evaluate a publish clause with `result` layered over `base`.
///
/// The clause is deep-copied first; the task definition is never touched.
pub fn evaluate_publish(
    evaluator: &dyn ExpressionEvaluator,
    clause: &JsonMap,
    result: &Value,
    base: &ContextView,
) -> Result<JsonMap, ExpressionError> {
    let clause = Value::Object(clause.clone());
    let mut top = JsonMap::new();
    top.insert(RESULT_KEY.to_string(), result.clone());
    let context = base.with_layer(top).to_value();

    match evaluate_recursively(evaluator, &clause, &context)? {
        Value::Object(map) => Ok(map),
        other => Err(ExpressionError::InvalidContext(format!(
            "publish clause evaluated to a non-object: {other}"
        ))),
    }
}

/// New workflow context with `published` merged over `context`.
pub fn merge_published(context: &JsonMap, published: &JsonMap) -> JsonMap {
    let mut merged = context.clone();
    for (key, value) in published {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
