//! With-items: fan one task out into indexed action executions and fold
//! their results back in position.
//!
//! Bindings are `"<var> in <expr>"` strings. Several bindings are zipped
//! positionally and the shortest collection decides the iteration count.
//! Bookkeeping lives in the task's `runtime_context.with_items` as a
//! [`WithItemsState`], which also acts as the per-task semaphore enforcing
//! the concurrency policy.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_types::execution::TaskExecution;
use tessera_types::result::ActionResult;
use tessera_types::spec::{JsonMap, WithItems};
use thiserror::Error;

use super::context::{evaluate_publish, ContextView};
use super::expression::{evaluate_recursively, has_expression, ExpressionError, ExpressionEvaluator};
use super::runtime::{self, WITH_ITEMS_KEY};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WithItemsError {
    #[error("malformed with-items binding '{0}', expected '<var> in <expr>'")]
    Malformed(String),

    #[error("with-items expression for '{var}' must evaluate to an array, got {value}")]
    NotAnArray { var: String, value: Value },

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// One `"<var> in <expr>"` binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub var: String,
    pub expr: String,
}

/// Parse every binding of a with-items clause.
pub fn parse_bindings(with_items: &WithItems) -> Result<Vec<Binding>, WithItemsError> {
    if with_items.0.is_empty() {
        return Err(WithItemsError::Malformed(String::new()));
    }
    with_items
        .0
        .iter()
        .map(|raw| {
            let (var, expr) = raw
                .split_once(" in ")
                .ok_or_else(|| WithItemsError::Malformed(raw.clone()))?;
            let var = var.trim();
            let expr = expr.trim();
            let valid_var = !var.is_empty()
                && var.chars().all(|c| c.is_alphanumeric() || c == '_')
                && !var.starts_with(|c: char| c.is_ascii_digit());
            if !valid_var || expr.is_empty() {
                return Err(WithItemsError::Malformed(raw.clone()));
            }
            Ok(Binding {
                var: var.to_string(),
                expr: expr.to_string(),
            })
        })
        .collect()
}

/// Evaluate each binding's collection against `context`.
pub fn evaluate_collections(
    evaluator: &dyn ExpressionEvaluator,
    bindings: &[Binding],
    context: &Value,
) -> Result<Vec<(String, Vec<Value>)>, WithItemsError> {
    bindings
        .iter()
        .map(|binding| {
            let value = if has_expression(&binding.expr) {
                evaluate_recursively(evaluator, &Value::String(binding.expr.clone()), context)?
            } else {
                evaluator.evaluate(&binding.expr, context)?
            };
            match value {
                Value::Array(items) => Ok((binding.var.clone(), items)),
                value => Err(WithItemsError::NotAnArray {
                    var: binding.var.clone(),
                    value,
                }),
            }
        })
        .collect()
}

/// Zip named collections into one variable map per iteration.
///
/// The result is as long as the shortest collection.
pub fn calc_for_each_input(collections: &[(String, Vec<Value>)]) -> Vec<JsonMap> {
    let count = collections
        .iter()
        .map(|(_, items)| items.len())
        .min()
        .unwrap_or(0);
    (0..count)
        .map(|i| {
            collections
                .iter()
                .map(|(var, items)| (var.clone(), items[i].clone()))
                .collect()
        })
        .collect()
}

/// Parse, evaluate and zip a with-items clause in one step.
pub fn expand(
    evaluator: &dyn ExpressionEvaluator,
    with_items: &WithItems,
    context: &ContextView,
) -> Result<Vec<JsonMap>, WithItemsError> {
    let bindings = parse_bindings(with_items)?;
    let collections = evaluate_collections(evaluator, &bindings, &context.to_value())?;
    Ok(calc_for_each_input(&collections))
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Fan-out bookkeeping for one task execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WithItemsState {
    pub count: usize,
    /// Maximum iterations in flight (0 = unlimited).
    pub concurrency: usize,
    /// Iteration variables per index.
    pub items: Vec<JsonMap>,
    /// Indices waiting for capacity.
    pub queue: VecDeque<usize>,
    pub running: BTreeSet<usize>,
    /// Indices whose result has been folded in.
    pub accepted: BTreeSet<usize>,
    /// Error message per failed index.
    pub failed: BTreeMap<usize, String>,
    /// Positional results.
    pub results: Vec<Value>,
    /// Positional value lists per publish key.
    pub outputs: JsonMap,
}

impl WithItemsState {
    pub fn new(items: Vec<JsonMap>, concurrency: usize) -> Self {
        let count = items.len();
        Self {
            count,
            concurrency,
            items,
            queue: (0..count).collect(),
            results: vec![Value::Null; count],
            ..Default::default()
        }
    }

    pub fn load(task: &TaskExecution) -> Option<Self> {
        task.runtime_context
            .get(WITH_ITEMS_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn save(&self, task: &mut TaskExecution) {
        runtime::store(&mut task.runtime_context, WITH_ITEMS_KEY, self);
    }

    /// Take queued indices while capacity allows, marking them running.
    pub fn next_batch(&mut self) -> Vec<usize> {
        let capacity = if self.concurrency == 0 {
            usize::MAX
        } else {
            self.concurrency
        };
        let mut batch = Vec::new();
        while self.running.len() < capacity {
            let Some(index) = self.queue.pop_front() else {
                break;
            };
            self.running.insert(index);
            batch.push(index);
        }
        batch
    }

    /// Every iteration has reported.
    pub fn is_complete(&self) -> bool {
        self.queue.is_empty() && self.running.is_empty() && self.accepted.len() >= self.count
    }

    /// Lowest failed index and its message.
    pub fn first_failure(&self) -> Option<(usize, &str)> {
        self.failed.iter().next().map(|(i, m)| (*i, m.as_str()))
    }

    /// Forget failed iterations and queue them again. Returns their indices.
    pub fn requeue_failed(&mut self) -> Vec<usize> {
        let failed: Vec<usize> = std::mem::take(&mut self.failed).into_keys().collect();
        for &index in &failed {
            self.accepted.remove(&index);
            if let Some(slot) = self.results.get_mut(index) {
                *slot = Value::Null;
            }
            for list in self.outputs.values_mut() {
                if let Some(slot) = list.as_array_mut().and_then(|l| l.get_mut(index)) {
                    *slot = Value::Null;
                }
            }
            self.queue.push_back(index);
        }
        failed
    }

    fn put_output(&mut self, key: &str, index: usize, value: Value) {
        let count = self.count;
        let list = self
            .outputs
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(vec![Value::Null; count]));
        if let Some(list) = list.as_array_mut() {
            if list.len() <= index {
                list.resize(index + 1, Value::Null);
            }
            list[index] = value;
        }
    }
}

/// Fold the result of iteration `index` into `state` and return the merged
/// output so far.
///
/// With a publish clause each key's value for this iteration lands at
/// position `index` of that key's list; without one the raw result is
/// collected under the task name. A failed iteration contributes `null` to
/// every publish key. So does a publish clause that fails to evaluate, and
/// the iteration is then recorded as failed with the evaluation error.
/// Re-delivery of an accepted index changes nothing.
pub fn get_for_each_output(
    evaluator: &dyn ExpressionEvaluator,
    task: &TaskExecution,
    state: &mut WithItemsState,
    index: usize,
    result: &ActionResult,
) -> JsonMap {
    if state.accepted.contains(&index) {
        return state.outputs.clone();
    }

    let value = result.to_value();
    let mut failure = match result {
        ActionResult::Error(message) => Some(message.clone()),
        ActionResult::Data(_) => None,
    };
    match &task.spec.publish {
        Some(clause) => {
            let nulls = || clause.keys().map(|k| (k.clone(), Value::Null)).collect::<JsonMap>();
            let published = match result {
                ActionResult::Data(data) => {
                    let base = ContextView::from_map(task.in_context.clone())
                        .with_layer(state.items.get(index).cloned().unwrap_or_default());
                    evaluate_publish(evaluator, clause, data, &base).unwrap_or_else(|e| {
                        failure = Some(e.to_string());
                        nulls()
                    })
                }
                ActionResult::Error(_) => nulls(),
            };
            for (key, item) in published {
                state.put_output(&key, index, item);
            }
        }
        None => state.put_output(&task.name, index, value.clone()),
    }

    if let Some(slot) = state.results.get_mut(index) {
        *slot = value;
    }
    if let Some(message) = failure {
        state.failed.insert(index, message);
    }
    state.running.remove(&index);
    state.accepted.insert(index);

    state.outputs.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::expression::JexlEvaluator;
    use serde_json::json;
    use tessera_types::spec::TaskSpec;
    use uuid::Uuid;

    fn map(value: Value) -> JsonMap {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_parse_bindings() {
        let parsed = parse_bindings(&WithItems(vec![
            "x in {{ items }}".into(),
            "y in [1, 2]".into(),
        ]))
        .unwrap();
        assert_eq!(parsed[0], Binding { var: "x".into(), expr: "{{ items }}".into() });
        assert_eq!(parsed[1].var, "y");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["items", " in items", "1x in items", "x in ", "a b in items"] {
            assert!(
                parse_bindings(&WithItems(vec![bad.into()])).is_err(),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_zip_truncates_to_shortest() {
        let inputs = calc_for_each_input(&[
            ("x".into(), vec![json!(1), json!(2), json!(3)]),
            ("y".into(), vec![json!("a"), json!("b")]),
        ]);
        assert_eq!(
            inputs,
            vec![map(json!({"x": 1, "y": "a"})), map(json!({"x": 2, "y": "b"}))]
        );
    }

    #[test]
    fn test_expand_requires_array() {
        let ev = JexlEvaluator::new();
        let ctx = ContextView::from_map(map(json!({"items": ["a", "b"], "name": "n"})));
        let items = expand(&ev, &WithItems(vec!["i in {{ items }}".into()]), &ctx).unwrap();
        assert_eq!(items.len(), 2);

        let err = expand(&ev, &WithItems(vec!["i in name".into()]), &ctx).unwrap_err();
        assert!(matches!(err, WithItemsError::NotAnArray { .. }));
    }

    #[test]
    fn test_concurrency_batches() {
        let mut state = WithItemsState::new(vec![JsonMap::new(); 3], 2);
        assert_eq!(state.next_batch(), vec![0, 1]);
        assert!(state.next_batch().is_empty());
        state.running.remove(&1);
        assert_eq!(state.next_batch(), vec![2]);
    }

    #[test]
    fn test_output_is_positional_and_idempotent() {
        let ev = JexlEvaluator::new();
        let spec = TaskSpec {
            publish: Some(map(json!({"greetings": "{{ greeting }} {{ x }}", "raw": "{{ result }}"}))),
            ..TaskSpec::action("greet", "std.echo")
        };
        let task = TaskExecution::new(Uuid::now_v7(), spec, map(json!({"greeting": "hi"})));
        let items: Vec<JsonMap> = ["a", "b", "c"].iter().map(|x| map(json!({"x": x}))).collect();
        let mut state = WithItemsState::new(items, 0);
        state.next_batch();

        for index in [2, 0, 1, 0] {
            let result = ActionResult::data(json!(index));
            get_for_each_output(&ev, &task, &mut state, index, &result);
        }

        assert!(state.is_complete());
        assert_eq!(state.outputs["greetings"], json!(["hi a", "hi b", "hi c"]));
        assert_eq!(state.outputs["raw"], json!([0, 1, 2]));
        assert_eq!(state.results, vec![json!(0), json!(1), json!(2)]);
    }

    #[test]
    fn test_failures_recorded_and_requeued() {
        let ev = JexlEvaluator::new();
        let task = TaskExecution::new(Uuid::now_v7(), TaskSpec::action("t", "std.echo"), JsonMap::new());
        let mut state = WithItemsState::new(vec![JsonMap::new(); 3], 0);
        state.next_batch();

        get_for_each_output(&ev, &task, &mut state, 0, &ActionResult::data("ok"));
        get_for_each_output(&ev, &task, &mut state, 2, &ActionResult::error("boom"));
        get_for_each_output(&ev, &task, &mut state, 1, &ActionResult::error("bang"));

        assert_eq!(state.first_failure(), Some((1, "bang")));
        assert_eq!(state.outputs["t"], json!(["ok", "bang", "boom"]));

        assert_eq!(state.requeue_failed(), vec![1, 2]);
        assert!(!state.is_complete());
        assert_eq!(state.next_batch(), vec![1, 2]);
        assert_eq!(state.accepted, BTreeSet::from([0]));
    }

    #[test]
    fn test_failed_publish_marks_iteration_failed() {
        let ev = JexlEvaluator::new();
        let spec = TaskSpec {
            publish: Some(map(json!({"v": "{{ result | nosuchtransform }}"}))),
            ..TaskSpec::action("t", "std.echo")
        };
        let task = TaskExecution::new(Uuid::now_v7(), spec, JsonMap::new());
        let mut state = WithItemsState::new(vec![JsonMap::new(); 2], 0);
        state.next_batch();

        get_for_each_output(&ev, &task, &mut state, 0, &ActionResult::data(1));
        get_for_each_output(&ev, &task, &mut state, 1, &ActionResult::data(2));

        assert!(state.is_complete());
        assert_eq!(state.outputs["v"], json!([null, null]));
        let (index, message) = state.first_failure().unwrap();
        assert_eq!(index, 0);
        assert!(message.contains("nosuchtransform"), "{message}");
    }
}
