//! Structural validation of workflow specs.
//!
//! Parsing is the loader's job; this module checks that a parsed spec can be
//! executed: unique task names, known edge targets, an acyclic requires
//! graph, well-formed with-items bindings and syntactically valid
//! expressions. Validation runs before an execution is created, so a broken
//! definition never leaves records behind.

use std::collections::HashSet;

use serde_json::Value;
use tessera_types::spec::{EngineCommand, TaskSpec, WorkflowSpec, WorkflowType};
use thiserror::Error;

use super::dag::validate_requires;
use super::expression::{validate_condition, validate_recursively, ExpressionError, ExpressionEvaluator};
use super::with_items::parse_bindings;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Why a workflow spec cannot be executed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpecError {
    /// Structural problem with the workflow or one of its tasks.
    #[error("invalid workflow '{workflow}': {message}")]
    Invalid { workflow: String, message: String },

    /// An edge or `requires` entry names a task that does not exist.
    #[error("task '{task}' in workflow '{workflow}' references unknown task '{target}'")]
    UnknownTask {
        workflow: String,
        task: String,
        target: String,
    },

    /// The `requires` graph of a reverse workflow contains a cycle.
    #[error("requires cycle in workflow '{workflow}' involving task '{task}'")]
    Cycle { workflow: String, task: String },

    /// A task carries a malformed expression.
    #[error("task '{task}' in workflow '{workflow}': {source}")]
    Expression {
        workflow: String,
        task: String,
        #[source]
        source: ExpressionError,
    },
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a workflow spec before executing it.
pub fn validate_spec(
    spec: &WorkflowSpec,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<(), SpecError> {
    let invalid = |message: String| SpecError::Invalid {
        workflow: spec.name.clone(),
        message,
    };

    if spec.name.trim().is_empty() {
        return Err(invalid("workflow name must not be empty".to_string()));
    }
    if spec.tasks.is_empty() {
        return Err(invalid("workflow must have at least one task".to_string()));
    }

    let mut params = HashSet::new();
    for param in &spec.input {
        if !params.insert(param.name.as_str()) {
            return Err(invalid(format!("duplicate input parameter '{}'", param.name)));
        }
    }

    let mut names = HashSet::new();
    for task in &spec.tasks {
        if task.name.trim().is_empty() {
            return Err(invalid("task name must not be empty".to_string()));
        }
        if EngineCommand::parse(&task.name).is_some() {
            return Err(invalid(format!(
                "task name '{}' is reserved for an engine command",
                task.name
            )));
        }
        if !names.insert(task.name.as_str()) {
            return Err(invalid(format!("duplicate task name '{}'", task.name)));
        }
    }

    for task in &spec.tasks {
        if task.action.is_some() && task.workflow.is_some() {
            return Err(invalid(format!(
                "task '{}' sets both 'action' and 'workflow'",
                task.name
            )));
        }
        if let Some(with_items) = &task.with_items {
            parse_bindings(with_items).map_err(|e| invalid(format!("task '{}': {e}", task.name)))?;
        }
        let effective = task.merged_with(&spec.task_defaults);
        for transition in effective.all_transitions() {
            if transition.engine_command().is_none() && !names.contains(transition.task.as_str()) {
                return Err(SpecError::UnknownTask {
                    workflow: spec.name.clone(),
                    task: task.name.clone(),
                    target: transition.task.clone(),
                });
            }
        }
        validate_task_expressions(&effective, evaluator).map_err(|source| SpecError::Expression {
            workflow: spec.name.clone(),
            task: task.name.clone(),
            source,
        })?;
    }

    if spec.workflow_type == WorkflowType::Reverse {
        validate_requires(spec)?;
    } else {
        for task in &spec.tasks {
            for dep in &task.requires {
                if !names.contains(dep.as_str()) {
                    return Err(SpecError::UnknownTask {
                        workflow: spec.name.clone(),
                        task: task.name.clone(),
                        target: dep.clone(),
                    });
                }
            }
        }
    }

    if let Some(output) = &spec.output {
        validate_recursively(evaluator, output).map_err(|source| SpecError::Expression {
            workflow: spec.name.clone(),
            task: "<output>".to_string(),
            source,
        })?;
    }

    Ok(())
}

fn validate_task_expressions(
    task: &TaskSpec,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<(), ExpressionError> {
    validate_recursively(evaluator, &Value::Object(task.input.clone()))?;
    for clause in [&task.publish, &task.publish_on_error, &task.publish_on_skip]
        .into_iter()
        .flatten()
    {
        validate_recursively(evaluator, &Value::Object(clause.clone()))?;
    }
    for policy in [
        &task.wait_before,
        &task.wait_after,
        &task.timeout,
        &task.pause_before,
        &task.concurrency,
    ]
    .into_iter()
    .flatten()
    {
        validate_recursively(evaluator, policy)?;
    }
    if let Some(retry) = &task.retry {
        validate_recursively(evaluator, &retry.count)?;
        if let Some(delay) = &retry.delay {
            validate_recursively(evaluator, delay)?;
        }
        for condition in [&retry.break_on, &retry.continue_on].into_iter().flatten() {
            validate_condition(evaluator, condition)?;
        }
    }
    for transition in task.all_transitions() {
        if let Some(when) = &transition.when {
            validate_condition(evaluator, when)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::expression::JexlEvaluator;
    use serde_json::json;
    use tessera_types::spec::{RetrySpec, Transition, WithItems};

    fn workflow(tasks: Vec<TaskSpec>) -> WorkflowSpec {
        WorkflowSpec {
            name: "wf".into(),
            description: None,
            workflow_type: WorkflowType::Direct,
            input: vec![],
            output: None,
            task_defaults: Default::default(),
            tasks,
        }
    }

    fn validate(spec: &WorkflowSpec) -> Result<(), SpecError> {
        validate_spec(spec, &JexlEvaluator::new())
    }

    #[test]
    fn test_valid_spec_passes() {
        let spec = workflow(vec![
            TaskSpec {
                on_success: vec![Transition::when("b", "result != null")],
                on_error: vec![Transition::to("fail")],
                retry: Some(RetrySpec::new(2, 0)),
                ..TaskSpec::action("a", "std.echo")
            },
            TaskSpec::action("b", "std.noop"),
        ]);
        assert!(validate(&spec).is_ok());
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let err = validate(&workflow(vec![])).unwrap_err();
        assert!(err.to_string().contains("at least one task"));
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let spec = workflow(vec![
            TaskSpec::action("a", "std.noop"),
            TaskSpec::action("a", "std.noop"),
        ]);
        let err = validate(&spec).unwrap_err();
        assert!(err.to_string().contains("duplicate task name 'a'"));
    }

    #[test]
    fn test_reserved_task_name_rejected() {
        let spec = workflow(vec![TaskSpec::action("fail", "std.noop")]);
        assert!(matches!(validate(&spec), Err(SpecError::Invalid { .. })));
    }

    #[test]
    fn test_unknown_target_rejected() {
        let spec = workflow(vec![TaskSpec {
            on_success: vec![Transition::to("ghost")],
            ..TaskSpec::action("a", "std.noop")
        }]);
        match validate(&spec).unwrap_err() {
            SpecError::UnknownTask { target, .. } => assert_eq!(target, "ghost"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_action_and_workflow_rejected() {
        let spec = workflow(vec![TaskSpec {
            workflow: Some("child".into()),
            ..TaskSpec::action("a", "std.noop")
        }]);
        assert!(validate(&spec).is_err());
    }

    #[test]
    fn test_malformed_with_items_rejected() {
        let spec = workflow(vec![TaskSpec {
            with_items: Some(WithItems(vec!["no binding here".into()])),
            ..TaskSpec::action("a", "std.noop")
        }]);
        let err = validate(&spec).unwrap_err();
        assert!(err.to_string().contains("with-items"));
    }

    #[test]
    fn test_bad_condition_rejected() {
        let spec = workflow(vec![
            TaskSpec {
                on_success: vec![Transition::when("b", "result ==")],
                ..TaskSpec::action("a", "std.noop")
            },
            TaskSpec::action("b", "std.noop"),
        ]);
        assert!(matches!(validate(&spec), Err(SpecError::Expression { .. })));
    }

    #[test]
    fn test_bad_input_expression_rejected() {
        let mut input = serde_json::Map::new();
        input.insert("x".into(), json!("{{ unterminated"));
        let spec = workflow(vec![TaskSpec {
            input,
            ..TaskSpec::action("a", "std.noop")
        }]);
        assert!(matches!(validate(&spec), Err(SpecError::Expression { .. })));
    }

    #[test]
    fn test_reverse_cycle_rejected() {
        let mut spec = workflow(vec![
            TaskSpec {
                requires: vec!["b".into()],
                ..TaskSpec::action("a", "std.noop")
            },
            TaskSpec {
                requires: vec!["a".into()],
                ..TaskSpec::action("b", "std.noop")
            },
        ]);
        spec.workflow_type = WorkflowType::Reverse;
        assert!(matches!(validate(&spec), Err(SpecError::Cycle { .. })));
    }
}
