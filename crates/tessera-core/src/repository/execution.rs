//! Transactional storage interface for execution records.
//!
//! Every dispatcher operation opens one transaction, locks the workflow
//! execution it is about to modify, reads and writes through the transaction
//! handle, and commits. Dropping a handle without calling
//! [`ExecutionTx::commit`] rolls the transaction back, so an early `?` return
//! never leaves partial writes behind.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use chrono::{DateTime, Utc};
use tessera_types::delayed_call::DelayedCall;
use tessera_types::error::RepositoryError;
use tessera_types::execution::{
    ActionExecution, TaskExecution, WorkflowExecution, WorkflowExecutionFilter,
};
use uuid::Uuid;

/// Factory for transactions.
pub trait ExecutionStore: Send + Sync {
    type Tx: ExecutionTx;

    /// Open a new transaction.
    fn begin(&self) -> impl std::future::Future<Output = Result<Self::Tx, RepositoryError>> + Send;
}

/// A scoped unit of work against the execution tables.
pub trait ExecutionTx: Send {
    // -----------------------------------------------------------------------
    // Workflow executions
    // -----------------------------------------------------------------------

    /// Load a workflow execution and hold its lock until commit or drop.
    ///
    /// Two transactions locking the same id are serialized; different ids
    /// never contend.
    fn lock_workflow_execution(
        &mut self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    /// Read a workflow execution without locking it.
    fn get_workflow_execution(
        &mut self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    fn create_workflow_execution(
        &mut self,
        wf_ex: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn update_workflow_execution(
        &mut self,
        wf_ex: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete a workflow execution with its tasks, actions and delayed calls.
    /// Returns `true` if it existed.
    fn delete_workflow_execution(
        &mut self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// List workflow executions, newest first.
    fn list_workflow_executions(
        &mut self,
        filter: &WorkflowExecutionFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Task executions
    // -----------------------------------------------------------------------

    fn get_task_execution(
        &mut self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<TaskExecution>, RepositoryError>> + Send;

    /// All task executions of a workflow execution in creation order.
    fn list_task_executions(
        &mut self,
        workflow_execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<TaskExecution>, RepositoryError>> + Send;

    fn create_task_execution(
        &mut self,
        task_ex: &TaskExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn update_task_execution(
        &mut self,
        task_ex: &TaskExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Action executions
    // -----------------------------------------------------------------------

    fn get_action_execution(
        &mut self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ActionExecution>, RepositoryError>> + Send;

    /// All action executions of a task execution in creation order.
    fn list_action_executions(
        &mut self,
        task_execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ActionExecution>, RepositoryError>> + Send;

    fn create_action_execution(
        &mut self,
        action_ex: &ActionExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn update_action_execution(
        &mut self,
        action_ex: &ActionExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete one action execution. Returns `true` if it existed.
    fn delete_action_execution(
        &mut self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Delayed calls
    // -----------------------------------------------------------------------

    fn create_delayed_call(
        &mut self,
        call: &DelayedCall,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_delayed_call(
        &mut self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<DelayedCall>, RepositoryError>> + Send;

    /// Push a call's `run_at` forward and release its lease.
    fn reschedule_delayed_call(
        &mut self,
        id: &Uuid,
        run_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn delete_delayed_call(
        &mut self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Delete every pending call of a workflow execution.
    fn delete_delayed_calls_for_workflow(
        &mut self,
        workflow_execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Pending calls of a workflow execution ordered by `run_at`.
    fn list_delayed_calls(
        &mut self,
        workflow_execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<DelayedCall>, RepositoryError>> + Send;

    /// Lease up to `limit` calls due at `now` until `lease_until`, oldest
    /// `run_at` first.
    fn claim_due_delayed_calls(
        &mut self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<DelayedCall>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Make every write of this transaction durable.
    fn commit(self) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
