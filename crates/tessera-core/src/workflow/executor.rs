//! Action executor port and the completion listener.
//!
//! The engine never runs actions itself. After a transaction commits it hands
//! every new action execution to an [`ActionExecutor`] as an
//! [`ActionRequest`]. Results come back later, from any task or process, as
//! [`ActionCompletion`]s correlated by `action_execution_id`; the
//! [`CompletionListener`] drains them into [`Engine::on_action_complete`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessera_types::result::ActionResult;
use tessera_types::spec::JsonMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::ExecutionStore;

use super::engine::Engine;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One action to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Correlation token; report the result under this id.
    pub action_execution_id: Uuid,
    pub action: String,
    /// `workflow_execution_id`, `workflow_name`, `task_execution_id`,
    /// `task_name` and the with-items `index`.
    pub attributes: JsonMap,
    pub input: JsonMap,
}

/// The outcome of a dispatched action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCompletion {
    pub action_execution_id: Uuid,
    pub result: ActionResult,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("executor unavailable: {0}")]
    Unavailable(String),

    #[error("invalid action input: {0}")]
    InvalidInput(String),
}

// ---------------------------------------------------------------------------
// ActionExecutor trait
// ---------------------------------------------------------------------------

/// Accepts action requests for asynchronous execution.
///
/// `dispatch` only hands the request over. An `Err` means the request was
/// not accepted, and the engine records it as a failed action.
pub trait ActionExecutor: Send + Sync {
    fn dispatch(
        &self,
        request: ActionRequest,
    ) -> impl std::future::Future<Output = Result<(), ExecutorError>> + Send;
}

// ---------------------------------------------------------------------------
// CompletionListener
// ---------------------------------------------------------------------------

/// Feeds completions from a channel into the engine until cancelled or the
/// channel closes.
pub struct CompletionListener<S: ExecutionStore, X: ActionExecutor> {
    engine: Arc<Engine<S, X>>,
    receiver: mpsc::Receiver<ActionCompletion>,
    cancel: CancellationToken,
}

impl<S, X> CompletionListener<S, X>
where
    S: ExecutionStore + 'static,
    X: ActionExecutor + 'static,
{
    pub fn new(
        engine: Arc<Engine<S, X>>,
        receiver: mpsc::Receiver<ActionCompletion>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            receiver,
            cancel,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                completion = self.receiver.recv() => {
                    let Some(completion) = completion else {
                        break;
                    };
                    let id = completion.action_execution_id;
                    if let Err(e) = self
                        .engine
                        .on_action_complete(id, completion.result, false)
                        .await
                    {
                        tracing::warn!(action_execution_id = %id, error = %e, "failed to apply action result");
                    }
                }
            }
        }
        tracing::debug!("completion listener stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
