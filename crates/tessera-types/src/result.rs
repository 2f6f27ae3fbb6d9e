//! The outcome of one action invocation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result reported by an action executor (or a finished sub-workflow).
///
/// Serialized as `{"data": ...}` or `{"error": "..."}`. Branch on it with
/// [`ActionResult::is_success`] / [`ActionResult::is_error`] or a `match`;
/// the two payloads never coexist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionResult {
    Data(Value),
    Error(String),
}

impl ActionResult {
    pub fn data(value: impl Into<Value>) -> Self {
        Self::Data(value.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Data(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// The value expressions see as `result`.
    ///
    /// For an error this is the error message, so `on_error` conditions and
    /// `publish_on_error` clauses can inspect it.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Data(v) => v.clone(),
            Self::Error(msg) => Value::String(msg.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_result_wire_shape() {
        let ok = ActionResult::data(json!({"x": 1}));
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({"data": {"x": 1}}));

        let err = ActionResult::error("boom");
        assert_eq!(serde_json::to_value(&err).unwrap(), json!({"error": "boom"}));

        let parsed: ActionResult = serde_json::from_value(json!({"error": "nope"})).unwrap();
        assert!(parsed.is_error());
        assert!(!parsed.is_success());
    }

    #[test]
    fn test_to_value_exposes_message_for_errors() {
        assert_eq!(ActionResult::error("bad").to_value(), json!("bad"));
        assert_eq!(ActionResult::data(3).to_value(), json!(3));
    }
}
