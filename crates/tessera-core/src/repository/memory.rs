//! In-memory implementation of the execution store.
//!
//! Each transaction buffers its writes in an overlay and applies them on
//! commit; dropping the transaction discards the overlay. Per-workflow
//! serialization comes from a `tokio::sync::Mutex` per workflow execution id,
//! held by the transaction that locked it until commit or drop.
//!
//! Delayed-call leases are the one exception: a claim is applied immediately
//! so concurrent pollers never see the same due call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tessera_types::delayed_call::DelayedCall;
use tessera_types::error::RepositoryError;
use tessera_types::execution::{
    ActionExecution, TaskExecution, WorkflowExecution, WorkflowExecutionFilter,
};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::execution::{ExecutionStore, ExecutionTx};

#[derive(Default)]
struct Tables {
    workflows: HashMap<Uuid, WorkflowExecution>,
    tasks: HashMap<Uuid, TaskExecution>,
    actions: HashMap<Uuid, ActionExecution>,
    calls: HashMap<Uuid, DelayedCall>,
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Process-local store, cheap to clone (shared state behind an `Arc`).
#[derive(Clone, Default)]
pub struct InMemoryExecutionStore {
    shared: Arc<Shared>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx, RepositoryError> {
        Ok(InMemoryTx {
            shared: Arc::clone(&self.shared),
            workflows: HashMap::new(),
            tasks: HashMap::new(),
            actions: HashMap::new(),
            calls: HashMap::new(),
            locks: HeldLocks {
                shared: Arc::clone(&self.shared),
                guards: HashMap::new(),
            },
        })
    }
}

/// Overlay of pending writes; `None` marks a deletion.
type Overlay<T> = HashMap<Uuid, Option<T>>;

/// A transaction over [`InMemoryExecutionStore`].
pub struct InMemoryTx {
    shared: Arc<Shared>,
    workflows: Overlay<WorkflowExecution>,
    tasks: Overlay<TaskExecution>,
    actions: Overlay<ActionExecution>,
    calls: Overlay<DelayedCall>,
    locks: HeldLocks,
}

/// Workflow locks held by one transaction. Released on drop; a lock nobody
/// else holds or waits on leaves the map with it.
struct HeldLocks {
    shared: Arc<Shared>,
    guards: HashMap<Uuid, OwnedMutexGuard<()>>,
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        for (id, guard) in self.guards.drain() {
            drop(guard);
            self.shared
                .locks
                .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

fn read<T: Clone>(overlay: &Overlay<T>, base: &HashMap<Uuid, T>, id: &Uuid) -> Option<T> {
    match overlay.get(id) {
        Some(pending) => pending.clone(),
        None => base.get(id).cloned(),
    }
}

fn merged<T: Clone>(
    overlay: &Overlay<T>,
    base: &HashMap<Uuid, T>,
    keep: impl Fn(&T) -> bool,
) -> Vec<T> {
    let mut out: Vec<T> = base
        .iter()
        .filter(|(id, _)| !overlay.contains_key(id))
        .map(|(_, v)| v)
        .filter(|v| keep(v))
        .cloned()
        .collect();
    out.extend(overlay.values().flatten().filter(|v| keep(v)).cloned());
    out
}

fn apply<T>(overlay: Overlay<T>, base: &mut HashMap<Uuid, T>) {
    for (id, pending) in overlay {
        match pending {
            Some(v) => {
                base.insert(id, v);
            }
            None => {
                base.remove(&id);
            }
        }
    }
}

impl InMemoryTx {
    fn task_ids_of(&self, workflow_execution_id: &Uuid) -> Vec<Uuid> {
        let tables = self.shared.tables();
        merged(&self.tasks, &tables.tasks, |t| {
            t.workflow_execution_id == *workflow_execution_id
        })
        .into_iter()
        .map(|t| t.id)
        .collect()
    }
}

impl ExecutionTx for InMemoryTx {
    async fn lock_workflow_execution(
        &mut self,
        id: &Uuid,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        if !self.locks.guards.contains_key(id) {
            let lock = self.shared.locks.entry(*id).or_default().clone();
            let guard = lock.lock_owned().await;
            self.locks.guards.insert(*id, guard);
        }
        self.get_workflow_execution(id).await
    }

    async fn get_workflow_execution(
        &mut self,
        id: &Uuid,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let tables = self.shared.tables();
        Ok(read(&self.workflows, &tables.workflows, id))
    }

    async fn create_workflow_execution(
        &mut self,
        wf_ex: &WorkflowExecution,
    ) -> Result<(), RepositoryError> {
        if self.get_workflow_execution(&wf_ex.id).await?.is_some() {
            return Err(RepositoryError::Conflict(format!(
                "workflow execution {} already exists",
                wf_ex.id
            )));
        }
        self.workflows.insert(wf_ex.id, Some(wf_ex.clone()));
        Ok(())
    }

    async fn update_workflow_execution(
        &mut self,
        wf_ex: &WorkflowExecution,
    ) -> Result<(), RepositoryError> {
        if self.get_workflow_execution(&wf_ex.id).await?.is_none() {
            return Err(RepositoryError::NotFound);
        }
        self.workflows.insert(wf_ex.id, Some(wf_ex.clone()));
        Ok(())
    }

    async fn delete_workflow_execution(&mut self, id: &Uuid) -> Result<bool, RepositoryError> {
        if self.get_workflow_execution(id).await?.is_none() {
            return Ok(false);
        }
        for task_id in self.task_ids_of(id) {
            for action in self.list_action_executions(&task_id).await? {
                self.actions.insert(action.id, None);
            }
            self.tasks.insert(task_id, None);
        }
        self.delete_delayed_calls_for_workflow(id).await?;
        self.workflows.insert(*id, None);
        Ok(true)
    }

    async fn list_workflow_executions(
        &mut self,
        filter: &WorkflowExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let tables = self.shared.tables();
        let mut out = merged(&self.workflows, &tables.workflows, |wf| {
            filter.state.is_none_or(|s| wf.state == s)
                && filter
                    .workflow_name
                    .as_deref()
                    .is_none_or(|n| wf.workflow_name == n)
                && filter
                    .parent_task_id
                    .is_none_or(|p| wf.parent_task_id == Some(p))
        });
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            out.truncate(limit as usize);
        }
        Ok(out)
    }

    async fn get_task_execution(
        &mut self,
        id: &Uuid,
    ) -> Result<Option<TaskExecution>, RepositoryError> {
        let tables = self.shared.tables();
        Ok(read(&self.tasks, &tables.tasks, id))
    }

    async fn list_task_executions(
        &mut self,
        workflow_execution_id: &Uuid,
    ) -> Result<Vec<TaskExecution>, RepositoryError> {
        let tables = self.shared.tables();
        let mut out = merged(&self.tasks, &tables.tasks, |t| {
            t.workflow_execution_id == *workflow_execution_id
        });
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn create_task_execution(&mut self, task_ex: &TaskExecution) -> Result<(), RepositoryError> {
        if self.get_task_execution(&task_ex.id).await?.is_some() {
            return Err(RepositoryError::Conflict(format!(
                "task execution {} already exists",
                task_ex.id
            )));
        }
        self.tasks.insert(task_ex.id, Some(task_ex.clone()));
        Ok(())
    }

    async fn update_task_execution(&mut self, task_ex: &TaskExecution) -> Result<(), RepositoryError> {
        if self.get_task_execution(&task_ex.id).await?.is_none() {
            return Err(RepositoryError::NotFound);
        }
        self.tasks.insert(task_ex.id, Some(task_ex.clone()));
        Ok(())
    }

    async fn get_action_execution(
        &mut self,
        id: &Uuid,
    ) -> Result<Option<ActionExecution>, RepositoryError> {
        let tables = self.shared.tables();
        Ok(read(&self.actions, &tables.actions, id))
    }

    async fn list_action_executions(
        &mut self,
        task_execution_id: &Uuid,
    ) -> Result<Vec<ActionExecution>, RepositoryError> {
        let tables = self.shared.tables();
        let mut out = merged(&self.actions, &tables.actions, |a| {
            a.task_execution_id == *task_execution_id
        });
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn create_action_execution(
        &mut self,
        action_ex: &ActionExecution,
    ) -> Result<(), RepositoryError> {
        if self.get_action_execution(&action_ex.id).await?.is_some() {
            return Err(RepositoryError::Conflict(format!(
                "action execution {} already exists",
                action_ex.id
            )));
        }
        self.actions.insert(action_ex.id, Some(action_ex.clone()));
        Ok(())
    }

    async fn update_action_execution(
        &mut self,
        action_ex: &ActionExecution,
    ) -> Result<(), RepositoryError> {
        if self.get_action_execution(&action_ex.id).await?.is_none() {
            return Err(RepositoryError::NotFound);
        }
        self.actions.insert(action_ex.id, Some(action_ex.clone()));
        Ok(())
    }

    async fn delete_action_execution(&mut self, id: &Uuid) -> Result<bool, RepositoryError> {
        let existed = self.get_action_execution(id).await?.is_some();
        if existed {
            self.actions.insert(*id, None);
        }
        Ok(existed)
    }

    async fn create_delayed_call(&mut self, call: &DelayedCall) -> Result<(), RepositoryError> {
        self.calls.insert(call.id, Some(call.clone()));
        Ok(())
    }

    async fn get_delayed_call(&mut self, id: &Uuid) -> Result<Option<DelayedCall>, RepositoryError> {
        let tables = self.shared.tables();
        Ok(read(&self.calls, &tables.calls, id))
    }

    async fn reschedule_delayed_call(
        &mut self,
        id: &Uuid,
        run_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut call = self
            .get_delayed_call(id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        call.run_at = run_at;
        call.claimed_until = None;
        self.calls.insert(*id, Some(call));
        Ok(())
    }

    async fn delete_delayed_call(&mut self, id: &Uuid) -> Result<bool, RepositoryError> {
        let existed = self.get_delayed_call(id).await?.is_some();
        if existed {
            self.calls.insert(*id, None);
        }
        Ok(existed)
    }

    async fn delete_delayed_calls_for_workflow(
        &mut self,
        workflow_execution_id: &Uuid,
    ) -> Result<u64, RepositoryError> {
        let calls = self.list_delayed_calls(workflow_execution_id).await?;
        for call in &calls {
            self.calls.insert(call.id, None);
        }
        Ok(calls.len() as u64)
    }

    async fn list_delayed_calls(
        &mut self,
        workflow_execution_id: &Uuid,
    ) -> Result<Vec<DelayedCall>, RepositoryError> {
        let tables = self.shared.tables();
        let mut out = merged(&self.calls, &tables.calls, |c| {
            c.workflow_execution_id == *workflow_execution_id
        });
        out.sort_by(|a, b| a.run_at.cmp(&b.run_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn claim_due_delayed_calls(
        &mut self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DelayedCall>, RepositoryError> {
        let mut tables = self.shared.tables();
        let mut due: Vec<&mut DelayedCall> = tables
            .calls
            .values_mut()
            .filter(|c| c.is_claimable(now))
            .collect();
        due.sort_by(|a, b| a.run_at.cmp(&b.run_at).then(a.id.cmp(&b.id)));
        let claimed: Vec<DelayedCall> = due
            .into_iter()
            .take(limit as usize)
            .map(|call| {
                call.claimed_until = Some(lease_until);
                call.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn commit(self) -> Result<(), RepositoryError> {
        let InMemoryTx {
            shared,
            workflows,
            tasks,
            actions,
            calls,
            locks,
        } = self;
        {
            let mut tables = shared.tables();
            apply(workflows, &mut tables.workflows);
            apply(tasks, &mut tables.tasks);
            apply(actions, &mut tables.actions);
            apply(calls, &mut tables.calls);
        }
        drop(locks);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
