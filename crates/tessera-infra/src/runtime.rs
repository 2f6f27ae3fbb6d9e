//! A self-contained engine: store, local executor, completion listener and
//! delayed-call poller wired together on the current tokio runtime.

use std::sync::Arc;

use tessera_core::repository::ExecutionStore;
use tessera_core::workflow::catalog::WorkflowCatalog;
use tessera_core::workflow::executor::CompletionListener;
use tessera_core::workflow::scheduler::DelayedCallPoller;
use tessera_core::workflow::{Engine, EngineError};
use tessera_types::config::EngineConfig;
use tessera_types::event::EngineEvent;
use tessera_types::execution::WorkflowExecution;
use tessera_types::spec::JsonMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::executor::LocalActionExecutor;

const COMPLETION_BUFFER: usize = 256;

pub struct LocalRuntime<S: ExecutionStore> {
    engine: Arc<Engine<S, LocalActionExecutor>>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl<S: ExecutionStore + 'static> LocalRuntime<S> {
    /// Build the engine and spawn its listener and poller.
    pub fn start(store: S, catalog: Arc<dyn WorkflowCatalog>, config: EngineConfig) -> Self {
        let (executor, completions) = LocalActionExecutor::channel(COMPLETION_BUFFER);
        let engine = Arc::new(Engine::new(store, executor, catalog, config));
        let cancel = CancellationToken::new();

        let workers = vec![
            CompletionListener::new(Arc::clone(&engine), completions, cancel.child_token()).spawn(),
            DelayedCallPoller::new(Arc::clone(&engine), cancel.child_token()).spawn(),
        ];
        tracing::debug!("local runtime started");

        Self {
            engine,
            cancel,
            workers,
        }
    }

    pub fn engine(&self) -> &Arc<Engine<S, LocalActionExecutor>> {
        &self.engine
    }

    /// Start a workflow and wait until it reaches a terminal state.
    pub async fn run_to_completion(
        &self,
        identifier: &str,
        input: &JsonMap,
        params: JsonMap,
    ) -> Result<WorkflowExecution, EngineError> {
        let mut events = self.engine.events().subscribe();
        let wf = self
            .engine
            .start_workflow(identifier, input, None, params)
            .await?;
        tracing::info!(workflow_execution_id = %wf.id, workflow = %wf.workflow_name, "workflow started");
        self.wait_for(wf.id, &mut events).await
    }

    /// Wait on `events` until workflow `id` is terminal.
    ///
    /// Subscribe before the operation that starts or resumes the workflow so
    /// no state change is missed.
    pub async fn wait_for(
        &self,
        id: Uuid,
        events: &mut broadcast::Receiver<EngineEvent>,
    ) -> Result<WorkflowExecution, EngineError> {
        loop {
            let wf = self
                .engine
                .get_workflow_execution(id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("workflow execution {id}")))?;
            if wf.state.is_terminal() {
                return Ok(wf);
            }

            loop {
                match events.recv().await {
                    Ok(EngineEvent::WorkflowStateChanged {
                        workflow_execution_id,
                        to,
                        ..
                    }) if workflow_execution_id == id && to.is_terminal() => break,
                    Ok(_) => {}
                    // Missed events; the store is the source of truth.
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "event receiver lagged");
                        break;
                    }
                    Err(RecvError::Closed) => {
                        return Err(EngineError::NotFound(format!(
                            "event bus closed while waiting for {id}"
                        )));
                    }
                }
            }
        }
    }

    /// Stop the listener and poller and wait for them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "runtime worker panicked");
            }
        }
        tracing::debug!("local runtime stopped");
    }
}
