//! In-process action executor with the built-in `std.*` actions.
//!
//! Each accepted request runs on its own tokio task and reports an
//! [`ActionCompletion`] on the executor's channel; pair the receiver with a
//! `CompletionListener` to feed results back into the engine.

use std::time::Duration;

use serde_json::Value;
use tessera_core::workflow::executor::{
    ActionCompletion, ActionExecutor, ActionRequest, ExecutorError,
};
use tessera_types::result::ActionResult;
use tessera_types::spec::JsonMap;
use tokio::sync::mpsc;

/// Upper bound for `std.sleep`.
const MAX_SLEEP_SECS: f64 = 3_600.0;

/// The actions this executor knows how to run.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Builtin {
    /// Returns `input.output` (null when absent).
    Echo,
    /// Returns null.
    Noop,
    /// Fails with `input.error` (or a fixed message).
    Fail,
    /// Waits `input.seconds`, then returns `input.output`.
    Sleep(f64),
}

impl Builtin {
    fn parse(action: &str, input: &JsonMap) -> Result<Self, ExecutorError> {
        match action {
            "std.echo" => Ok(Self::Echo),
            "std.noop" => Ok(Self::Noop),
            "std.fail" => Ok(Self::Fail),
            "std.sleep" => {
                let seconds = input.get("seconds").and_then(Value::as_f64).ok_or_else(|| {
                    ExecutorError::InvalidInput("std.sleep needs a numeric 'seconds'".to_string())
                })?;
                if !(0.0..=MAX_SLEEP_SECS).contains(&seconds) {
                    return Err(ExecutorError::InvalidInput(format!(
                        "std.sleep 'seconds' must be between 0 and {MAX_SLEEP_SECS}, got {seconds}"
                    )));
                }
                Ok(Self::Sleep(seconds))
            }
            other => Err(ExecutorError::UnknownAction(other.to_string())),
        }
    }

    async fn run(self, input: &JsonMap) -> ActionResult {
        let output = || input.get("output").cloned().unwrap_or(Value::Null);
        match self {
            Self::Echo => ActionResult::data(output()),
            Self::Noop => ActionResult::data(Value::Null),
            Self::Fail => match input.get("error") {
                Some(Value::String(message)) => ActionResult::error(message.clone()),
                Some(other) => ActionResult::error(other.to_string()),
                None => ActionResult::error("Action failed"),
            },
            Self::Sleep(seconds) => {
                tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                ActionResult::data(output())
            }
        }
    }
}

/// Runs built-in actions on the current tokio runtime.
#[derive(Debug, Clone)]
pub struct LocalActionExecutor {
    sender: mpsc::Sender<ActionCompletion>,
}

impl LocalActionExecutor {
    /// Create an executor and the receiving end of its completion channel.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ActionCompletion>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self { sender }, receiver)
    }
}

impl ActionExecutor for LocalActionExecutor {
    async fn dispatch(&self, request: ActionRequest) -> Result<(), ExecutorError> {
        let builtin = Builtin::parse(&request.action, &request.input)?;
        if self.sender.is_closed() {
            return Err(ExecutorError::Unavailable(
                "completion channel closed".to_string(),
            ));
        }

        let sender = self.sender.clone();
        tokio::spawn(async move {
            let id = request.action_execution_id;
            let result = builtin.run(&request.input).await;
            tracing::debug!(
                action_execution_id = %id,
                action = %request.action,
                success = result.is_success(),
                "action finished"
            );
            let completion = ActionCompletion {
                action_execution_id: id,
                result,
            };
            if sender.send(completion).await.is_err() {
                tracing::warn!(action_execution_id = %id, "completion dropped, listener is gone");
            }
        });
        Ok(())
    }
}
