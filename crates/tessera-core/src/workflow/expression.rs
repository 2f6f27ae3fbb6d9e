//! Expression evaluation for conditions, publish clauses, inputs and policy
//! values.
//!
//! The engine talks to an [`ExpressionEvaluator`] port; [`JexlEvaluator`]
//! is the bundled implementation wrapping `jexl_eval::Evaluator` with a set
//! of standard transforms.
//!
//! Two syntaxes are in play:
//! - **Conditions** (`when`, `break_on`, `continue_on`) are bare expressions:
//!   `result.status == 'ok'`. A condition may also be wrapped in `{{ }}`.
//! - **Values** (inputs, publish clauses, policy fields, outputs) are JSON
//!   where any string may embed `{{ expr }}`. A string that is exactly one
//!   `{{ expr }}` evaluates to the raw typed value; otherwise every embedded
//!   expression is rendered as text.
//!
//! **Security note:** payloads are always passed as context objects, never
//! interpolated into expression strings.

use serde_json::{json, Value};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("Invalid expression '{expression}': {message}")]
    Grammar { expression: String, message: String },

    #[error("Failed to evaluate '{expression}': {message}")]
    EvalFailed { expression: String, message: String },

    #[error("Invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// Evaluator port
// ---------------------------------------------------------------------------

/// Side-effect-free expression evaluation.
///
/// Implementations must be deterministic for a given expression and context.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate a bare expression against a JSON object context.
    fn evaluate(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError>;

    /// Check the expression's syntax without evaluating it.
    fn validate(&self, expression: &str) -> Result<(), ExpressionError>;
}

// ---------------------------------------------------------------------------
// JexlEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with standard transforms pre-registered.
///
/// Transforms: `lower`, `upper`, `trim`, `split`, `join`, `not`, `contains`,
/// `startsWith`, `endsWith`, `length`, `keys`, `string`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JexlEvaluator;

impl JexlEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn jexl() -> jexl_eval::Evaluator<'static> {
        jexl_eval::Evaluator::new()
            // String transforms
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("join", |args: &[Value]| {
                let items = args.first().and_then(|v| v.as_array()).cloned().unwrap_or_default();
                let separator = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<String> = items.iter().map(render).collect();
                Ok(json!(parts.join(separator)))
            })
            .with_transform("string", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(render(&val)))
            })
            // Boolean transforms
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!is_truthy(&val)))
            })
            // String search transforms
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            // Collection transforms
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len))
            })
            .with_transform("keys", |args: &[Value]| {
                let keys: Vec<String> = match args.first() {
                    Some(Value::Object(o)) => o.keys().cloned().collect(),
                    _ => Vec::new(),
                };
                Ok(json!(keys))
            })
    }
}

impl ExpressionEvaluator for JexlEvaluator {
    fn evaluate(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        Self::jexl()
            .eval_in_context(expression, context)
            .map_err(|e| {
                let message = e.to_string();
                if is_parse_error(&e) {
                    ExpressionError::Grammar {
                        expression: expression.to_string(),
                        message,
                    }
                } else {
                    ExpressionError::EvalFailed {
                        expression: expression.to_string(),
                        message,
                    }
                }
            })
    }

    fn validate(&self, expression: &str) -> Result<(), ExpressionError> {
        if expression.trim().is_empty() {
            return Err(ExpressionError::Grammar {
                expression: expression.to_string(),
                message: "empty expression".to_string(),
            });
        }
        match self.evaluate(expression, &json!({})) {
            Err(err @ ExpressionError::Grammar { .. }) => Err(err),
            // Runtime failures against an empty context say nothing about syntax.
            _ => Ok(()),
        }
    }
}

fn is_parse_error(err: &impl std::fmt::Debug) -> bool {
    format!("{err:?}").starts_with("ParseError")
}

// ---------------------------------------------------------------------------
// Helpers over any evaluator
// ---------------------------------------------------------------------------

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a value the way string interpolation shows it.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Strip a single `{{ }}` wrapper, if present.
fn unwrap_expression(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
    if inner.contains(OPEN) || inner.contains(CLOSE) {
        return None;
    }
    Some(inner.trim())
}

/// Split a template into literal text and expression segments.
fn segments(s: &str) -> Result<Vec<Segment<'_>>, ExpressionError> {
    let mut out = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find(OPEN) {
        if start > 0 {
            out.push(Segment::Text(&rest[..start]));
        }
        let after = &rest[start + OPEN.len()..];
        let end = after.find(CLOSE).ok_or_else(|| ExpressionError::Grammar {
            expression: s.to_string(),
            message: "unterminated '{{'".to_string(),
        })?;
        out.push(Segment::Expr(after[..end].trim()));
        rest = &after[end + CLOSE.len()..];
    }
    if !rest.is_empty() {
        out.push(Segment::Text(rest));
    }
    Ok(out)
}

enum Segment<'a> {
    Text(&'a str),
    Expr(&'a str),
}

/// Whether a string contains any `{{ }}` expression.
pub fn has_expression(s: &str) -> bool {
    s.contains(OPEN)
}

/// Evaluate a condition to a boolean. Accepts bare or `{{ }}`-wrapped syntax.
pub fn evaluate_condition(
    evaluator: &dyn ExpressionEvaluator,
    condition: &str,
    context: &Value,
) -> Result<bool, ExpressionError> {
    let expression = unwrap_expression(condition).unwrap_or(condition);
    let value = evaluator.evaluate(expression, context)?;
    Ok(is_truthy(&value))
}

/// Evaluate a JSON value, resolving every embedded expression.
///
/// Works on a copy; the input is never modified.
pub fn evaluate_recursively(
    evaluator: &dyn ExpressionEvaluator,
    value: &Value,
    context: &Value,
) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) => evaluate_string(evaluator, s, context),
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate_recursively(evaluator, item, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), evaluate_recursively(evaluator, item, context)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn evaluate_string(
    evaluator: &dyn ExpressionEvaluator,
    s: &str,
    context: &Value,
) -> Result<Value, ExpressionError> {
    if !has_expression(s) {
        return Ok(Value::String(s.to_string()));
    }
    if let Some(expression) = unwrap_expression(s) {
        return evaluator.evaluate(expression, context);
    }

    let mut rendered = String::with_capacity(s.len());
    for segment in segments(s)? {
        match segment {
            Segment::Text(text) => rendered.push_str(text),
            Segment::Expr(expression) => {
                rendered.push_str(&render(&evaluator.evaluate(expression, context)?));
            }
        }
    }
    Ok(Value::String(rendered))
}

/// Check the syntax of every expression embedded in a JSON value.
pub fn validate_recursively(
    evaluator: &dyn ExpressionEvaluator,
    value: &Value,
) -> Result<(), ExpressionError> {
    match value {
        Value::String(s) if has_expression(s) => {
            for segment in segments(s)? {
                if let Segment::Expr(expression) = segment {
                    evaluator.validate(expression)?;
                }
            }
            Ok(())
        }
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| validate_recursively(evaluator, item)),
        Value::Object(map) => map
            .values()
            .try_for_each(|item| validate_recursively(evaluator, item)),
        _ => Ok(()),
    }
}

/// Check the syntax of a condition (bare or `{{ }}`-wrapped).
pub fn validate_condition(
    evaluator: &dyn ExpressionEvaluator,
    condition: &str,
) -> Result<(), ExpressionError> {
    evaluator.validate(unwrap_expression(condition).unwrap_or(condition))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
