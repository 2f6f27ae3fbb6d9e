//! Workflow input and start parameter checks.

use std::collections::HashSet;

use serde_json::Value;
use tessera_types::spec::{JsonMap, WorkflowSpec, WorkflowType};

use super::error::EngineError;

/// Check `input` against the declared parameters and fill in defaults.
pub fn resolve_input(spec: &WorkflowSpec, input: &JsonMap) -> Result<JsonMap, EngineError> {
    let declared: HashSet<&str> = spec.input.iter().map(|p| p.name.as_str()).collect();

    let mut unexpected: Vec<&str> = input
        .keys()
        .map(String::as_str)
        .filter(|k| !declared.contains(k))
        .collect();
    if !unexpected.is_empty() {
        unexpected.sort();
        return Err(EngineError::Input(format!(
            "workflow '{}' got unexpected input parameter(s): {}",
            spec.name,
            unexpected.join(", ")
        )));
    }

    let missing: Vec<&str> = spec
        .input
        .iter()
        .filter(|p| p.default.is_none() && !input.contains_key(&p.name))
        .map(|p| p.name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(EngineError::Input(format!(
            "workflow '{}' is missing required input parameter(s): {}",
            spec.name,
            missing.join(", ")
        )));
    }

    let mut resolved = input.clone();
    for param in &spec.input {
        if let Some(default) = &param.default {
            resolved
                .entry(param.name.clone())
                .or_insert_with(|| default.clone());
        }
    }
    Ok(resolved)
}

/// Check start parameters: `env` must be an object, and a reverse workflow
/// needs `task_name` naming one of its tasks.
pub fn check_params(spec: &WorkflowSpec, params: &JsonMap) -> Result<(), EngineError> {
    if let Some(env) = params.get("env") {
        if !env.is_object() {
            return Err(EngineError::Input(format!(
                "'env' must be an object, got {env}"
            )));
        }
    }

    if spec.workflow_type == WorkflowType::Reverse {
        match params.get("task_name") {
            Some(Value::String(task)) if spec.task(task).is_some() => {}
            Some(Value::String(task)) => {
                return Err(EngineError::Input(format!(
                    "task '{task}' not found in workflow '{}'",
                    spec.name
                )));
            }
            _ => {
                return Err(EngineError::Input(format!(
                    "reverse workflow '{}' needs a 'task_name' parameter",
                    spec.name
                )));
            }
        }
    }
    Ok(())
}

/// Merge `env` into `params.env`, new keys winning.
pub fn merge_env(params: &mut JsonMap, env: &JsonMap) {
    if env.is_empty() {
        return;
    }
    let slot = params
        .entry("env".to_string())
        .or_insert_with(|| Value::Object(JsonMap::new()));
    if !slot.is_object() {
        *slot = Value::Object(JsonMap::new());
    }
    if let Value::Object(existing) = slot {
        for (key, value) in env {
            existing.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_types::spec::{InputParam, TaskSpec};

    fn spec(input: Vec<InputParam>) -> WorkflowSpec {
        WorkflowSpec {
            name: "wf".into(),
            description: None,
            workflow_type: WorkflowType::Direct,
            input,
            output: None,
            task_defaults: Default::default(),
            tasks: vec![TaskSpec::action("t", "std.noop")],
        }
    }

    fn map(value: Value) -> JsonMap {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_defaults_are_applied() {
        let spec = spec(vec![
            InputParam::required("name"),
            InputParam::with_default("greeting", "Hello"),
        ]);
        let resolved = resolve_input(&spec, &map(json!({"name": "Neo"}))).unwrap();
        assert_eq!(resolved["greeting"], json!("Hello"));
        assert_eq!(resolved["name"], json!("Neo"));

        let overridden = resolve_input(&spec, &map(json!({"name": "Neo", "greeting": "Hi"}))).unwrap();
        assert_eq!(overridden["greeting"], json!("Hi"));
    }

    #[test]
    fn test_missing_and_unexpected_rejected() {
        let spec = spec(vec![InputParam::required("name")]);
        let err = resolve_input(&spec, &JsonMap::new()).unwrap_err();
        assert!(err.to_string().contains("missing required input parameter(s): name"));

        let err = resolve_input(&spec, &map(json!({"name": 1, "extra": 2}))).unwrap_err();
        assert!(matches!(err, EngineError::Input(ref m) if m.contains("extra")));
    }

    #[test]
    fn test_reverse_needs_known_task_name() {
        let mut spec = spec(vec![]);
        spec.workflow_type = WorkflowType::Reverse;
        assert!(check_params(&spec, &JsonMap::new()).is_err());
        assert!(check_params(&spec, &map(json!({"task_name": "ghost"}))).is_err());
        assert!(check_params(&spec, &map(json!({"task_name": "t"}))).is_ok());
    }

    #[test]
    fn test_env_must_be_object() {
        let spec = spec(vec![]);
        assert!(check_params(&spec, &map(json!({"env": "nope"}))).is_err());
        assert!(check_params(&spec, &map(json!({"env": {"a": 1}}))).is_ok());
    }

    #[test]
    fn test_merge_env_overwrites_keys() {
        let mut params = map(json!({"env": {"a": 1, "b": 2}}));
        merge_env(&mut params, &map(json!({"b": 3, "c": 4})));
        assert_eq!(params["env"], json!({"a": 1, "b": 3, "c": 4}));

        let mut empty = JsonMap::new();
        merge_env(&mut empty, &map(json!({"x": true})));
        assert_eq!(empty["env"], json!({"x": true}));
    }
}
