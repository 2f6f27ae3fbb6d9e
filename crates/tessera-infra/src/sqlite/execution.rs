//! SQLite execution store.
//!
//! Implements `ExecutionStore` / `ExecutionTx` from `tessera-core` on top of
//! the single-connection writer pool. Each `begin` takes that connection and
//! opens a transaction on it, so engine transactions never interleave and
//! `lock_workflow_execution` is a plain read. Dropping an uncommitted
//! [`SqliteTx`] rolls back when the connection returns to the pool.
//!
//! Specs and maps are stored as JSON text. Timestamps are RFC 3339 with a
//! fixed nanosecond width so that text ordering matches time ordering.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tessera_core::repository::{ExecutionStore, ExecutionTx};
use tessera_types::delayed_call::{DelayedCall, DelayedCallTarget};
use tessera_types::error::RepositoryError;
use tessera_types::execution::{
    ActionExecution, TaskExecution, WorkflowExecution, WorkflowExecutionFilter,
};
use tessera_types::result::ActionResult;
use tessera_types::spec::{JsonMap, TaskSpec, WorkflowSpec};
use tessera_types::state::{ActionState, TaskState, WorkflowState};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ExecutionStore`.
#[derive(Clone)]
pub struct SqliteExecutionStore {
    pool: DatabasePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

impl ExecutionStore for SqliteExecutionStore {
    type Tx = SqliteTx;

    async fn begin(&self) -> Result<SqliteTx, RepositoryError> {
        let tx = self.pool.writer.begin().await.map_err(db_err)?;
        Ok(SqliteTx { tx })
    }
}

/// A transaction on the writer connection.
pub struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Classify a sqlx error: lock contention is `Busy`, a lost pool is
/// `Connection`, key collisions are `Conflict`.
fn db_err(e: sqlx::Error) -> RepositoryError {
    match &e {
        sqlx::Error::PoolTimedOut => RepositoryError::Busy(e.to_string()),
        sqlx::Error::PoolClosed | sqlx::Error::Io(_) => RepositoryError::Connection,
        sqlx::Error::Database(db) => {
            let code = db.code();
            let message = db.message();
            if matches!(code.as_deref(), Some("5" | "6")) || message.contains("locked") {
                RepositoryError::Busy(message.to_string())
            } else if message.contains("UNIQUE") {
                RepositoryError::Conflict(message.to_string())
            } else {
                RepositoryError::Query(message.to_string())
            }
        }
        _ => RepositoryError::Query(e.to_string()),
    }
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(column)
        .map_err(|e| RepositoryError::Query(e.to_string()))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

fn from_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_workflow(row: &SqliteRow) -> Result<WorkflowExecution, RepositoryError> {
    let state: String = get(row, "state")?;
    let state = WorkflowState::parse(&state)
        .ok_or_else(|| RepositoryError::Query(format!("invalid workflow state: {state}")))?;
    let spec: String = get(row, "spec")?;
    let input: String = get(row, "input")?;
    let params: String = get(row, "params")?;
    let context: String = get(row, "context")?;
    let output: Option<String> = get(row, "output")?;
    let parent_task_id: Option<String> = get(row, "parent_task_id")?;
    let id: String = get(row, "id")?;
    let root: String = get(row, "root_execution_id")?;
    let created_at: String = get(row, "created_at")?;
    let updated_at: String = get(row, "updated_at")?;

    Ok(WorkflowExecution {
        id: parse_uuid(&id)?,
        workflow_name: get(row, "workflow_name")?,
        spec: from_json::<WorkflowSpec>(&spec, "spec")?,
        description: get(row, "description")?,
        input: from_json::<JsonMap>(&input, "input")?,
        params: from_json::<JsonMap>(&params, "params")?,
        state,
        state_info: get(row, "state_info")?,
        context: from_json::<JsonMap>(&context, "context")?,
        output: output
            .as_deref()
            .map(|s| from_json::<JsonMap>(s, "output"))
            .transpose()?,
        root_execution_id: parse_uuid(&root)?,
        parent_task_id: parent_task_id.as_deref().map(parse_uuid).transpose()?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

fn row_to_task(row: &SqliteRow) -> Result<TaskExecution, RepositoryError> {
    let state: String = get(row, "state")?;
    let state = TaskState::parse(&state)
        .ok_or_else(|| RepositoryError::Query(format!("invalid task state: {state}")))?;
    let id: String = get(row, "id")?;
    let wf_id: String = get(row, "workflow_execution_id")?;
    let spec: String = get(row, "spec")?;
    let in_context: String = get(row, "in_context")?;
    let published: String = get(row, "published")?;
    let runtime_context: String = get(row, "runtime_context")?;
    let processed: i64 = get(row, "processed")?;
    let created_at: String = get(row, "created_at")?;
    let updated_at: String = get(row, "updated_at")?;

    Ok(TaskExecution {
        id: parse_uuid(&id)?,
        workflow_execution_id: parse_uuid(&wf_id)?,
        name: get(row, "name")?,
        spec: from_json::<TaskSpec>(&spec, "task spec")?,
        state,
        state_info: get(row, "state_info")?,
        in_context: from_json(&in_context, "in_context")?,
        published: from_json(&published, "published")?,
        runtime_context: from_json(&runtime_context, "runtime_context")?,
        processed: processed != 0,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

fn row_to_action(row: &SqliteRow) -> Result<ActionExecution, RepositoryError> {
    let state: String = get(row, "state")?;
    let state = ActionState::parse(&state)
        .ok_or_else(|| RepositoryError::Query(format!("invalid action state: {state}")))?;
    let id: String = get(row, "id")?;
    let task_id: String = get(row, "task_execution_id")?;
    let wf_id: String = get(row, "workflow_execution_id")?;
    let input: String = get(row, "input")?;
    let output: Option<String> = get(row, "output")?;
    let accepted: i64 = get(row, "accepted")?;
    let runtime_context: String = get(row, "runtime_context")?;
    let created_at: String = get(row, "created_at")?;
    let updated_at: String = get(row, "updated_at")?;

    Ok(ActionExecution {
        id: parse_uuid(&id)?,
        task_execution_id: parse_uuid(&task_id)?,
        workflow_execution_id: parse_uuid(&wf_id)?,
        name: get(row, "name")?,
        input: from_json(&input, "action input")?,
        output: output
            .as_deref()
            .map(|s| from_json::<ActionResult>(s, "action output"))
            .transpose()?,
        state,
        accepted: accepted != 0,
        runtime_context: from_json(&runtime_context, "runtime_context")?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

fn row_to_call(row: &SqliteRow) -> Result<DelayedCall, RepositoryError> {
    let id: String = get(row, "id")?;
    let wf_id: String = get(row, "workflow_execution_id")?;
    let target: String = get(row, "target")?;
    let run_at: String = get(row, "run_at")?;
    let claimed_until: Option<String> = get(row, "claimed_until")?;
    let created_at: String = get(row, "created_at")?;

    Ok(DelayedCall {
        id: parse_uuid(&id)?,
        target: from_json::<DelayedCallTarget>(&target, "delayed call target")?,
        workflow_execution_id: parse_uuid(&wf_id)?,
        run_at: parse_datetime(&run_at)?,
        claimed_until: claimed_until.as_deref().map(parse_datetime).transpose()?,
        created_at: parse_datetime(&created_at)?,
    })
}

fn collect<T>(
    rows: &[SqliteRow],
    map: fn(&SqliteRow) -> Result<T, RepositoryError>,
) -> Result<Vec<T>, RepositoryError> {
    rows.iter().map(map).collect()
}

// ---------------------------------------------------------------------------
// ExecutionTx impl
// ---------------------------------------------------------------------------

impl ExecutionTx for SqliteTx {
    async fn lock_workflow_execution(
        &mut self,
        id: &Uuid,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        // The writer connection is exclusive for the life of the transaction.
        self.get_workflow_execution(id).await
    }

    async fn get_workflow_execution(
        &mut self,
        id: &Uuid,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_workflow).transpose()
    }

    async fn create_workflow_execution(
        &mut self,
        wf_ex: &WorkflowExecution,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_executions
               (id, workflow_name, spec, description, input, params, state, state_info,
                context, output, root_execution_id, parent_task_id, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(wf_ex.id.to_string())
        .bind(&wf_ex.workflow_name)
        .bind(to_json(&wf_ex.spec)?)
        .bind(&wf_ex.description)
        .bind(to_json(&wf_ex.input)?)
        .bind(to_json(&wf_ex.params)?)
        .bind(wf_ex.state.as_str())
        .bind(&wf_ex.state_info)
        .bind(to_json(&wf_ex.context)?)
        .bind(wf_ex.output.as_ref().map(to_json).transpose()?)
        .bind(wf_ex.root_execution_id.to_string())
        .bind(wf_ex.parent_task_id.map(|id| id.to_string()))
        .bind(format_datetime(&wf_ex.created_at))
        .bind(format_datetime(&wf_ex.updated_at))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match db_err(e) {
            RepositoryError::Conflict(_) => RepositoryError::Conflict(format!(
                "workflow execution {} already exists",
                wf_ex.id
            )),
            other => other,
        })?;
        Ok(())
    }

    async fn update_workflow_execution(
        &mut self,
        wf_ex: &WorkflowExecution,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_executions SET
                 workflow_name = ?, spec = ?, description = ?, input = ?, params = ?,
                 state = ?, state_info = ?, context = ?, output = ?,
                 root_execution_id = ?, parent_task_id = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&wf_ex.workflow_name)
        .bind(to_json(&wf_ex.spec)?)
        .bind(&wf_ex.description)
        .bind(to_json(&wf_ex.input)?)
        .bind(to_json(&wf_ex.params)?)
        .bind(wf_ex.state.as_str())
        .bind(&wf_ex.state_info)
        .bind(to_json(&wf_ex.context)?)
        .bind(wf_ex.output.as_ref().map(to_json).transpose()?)
        .bind(wf_ex.root_execution_id.to_string())
        .bind(wf_ex.parent_task_id.map(|id| id.to_string()))
        .bind(format_datetime(&wf_ex.updated_at))
        .bind(wf_ex.id.to_string())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete_workflow_execution(&mut self, id: &Uuid) -> Result<bool, RepositoryError> {
        let id = id.to_string();
        sqlx::query(
            "DELETE FROM action_executions WHERE task_execution_id IN
               (SELECT id FROM task_executions WHERE workflow_execution_id = ?)",
        )
        .bind(&id)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        sqlx::query("DELETE FROM task_executions WHERE workflow_execution_id = ?")
            .bind(&id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM delayed_calls WHERE workflow_execution_id = ?")
            .bind(&id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        let result = sqlx::query("DELETE FROM workflow_executions WHERE id = ?")
            .bind(&id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_workflow_executions(
        &mut self,
        filter: &WorkflowExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let state = filter.state.map(WorkflowState::as_str);
        let parent = filter.parent_task_id.map(|id| id.to_string());
        // SQLite treats a negative LIMIT as unbounded.
        let limit = filter.limit.map_or(-1, i64::from);

        let rows = sqlx::query(
            r#"SELECT * FROM workflow_executions
               WHERE (? IS NULL OR state = ?)
                 AND (? IS NULL OR workflow_name = ?)
                 AND (? IS NULL OR parent_task_id = ?)
               ORDER BY created_at DESC, id DESC
               LIMIT ?"#,
        )
        .bind(state)
        .bind(state)
        .bind(filter.workflow_name.as_deref())
        .bind(filter.workflow_name.as_deref())
        .bind(parent.as_deref())
        .bind(parent.as_deref())
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;

        collect(&rows, row_to_workflow)
    }

    async fn get_task_execution(
        &mut self,
        id: &Uuid,
    ) -> Result<Option<TaskExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM task_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn list_task_executions(
        &mut self,
        workflow_execution_id: &Uuid,
    ) -> Result<Vec<TaskExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM task_executions WHERE workflow_execution_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(workflow_execution_id.to_string())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        collect(&rows, row_to_task)
    }

    async fn create_task_execution(&mut self, task_ex: &TaskExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO task_executions
               (id, workflow_execution_id, name, spec, state, state_info, in_context,
                published, runtime_context, processed, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task_ex.id.to_string())
        .bind(task_ex.workflow_execution_id.to_string())
        .bind(&task_ex.name)
        .bind(to_json(&task_ex.spec)?)
        .bind(task_ex.state.as_str())
        .bind(&task_ex.state_info)
        .bind(to_json(&task_ex.in_context)?)
        .bind(to_json(&task_ex.published)?)
        .bind(to_json(&task_ex.runtime_context)?)
        .bind(task_ex.processed)
        .bind(format_datetime(&task_ex.created_at))
        .bind(format_datetime(&task_ex.updated_at))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match db_err(e) {
            RepositoryError::Conflict(_) => {
                RepositoryError::Conflict(format!("task execution {} already exists", task_ex.id))
            }
            other => other,
        })?;
        Ok(())
    }

    async fn update_task_execution(&mut self, task_ex: &TaskExecution) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE task_executions SET
                 name = ?, spec = ?, state = ?, state_info = ?, in_context = ?,
                 published = ?, runtime_context = ?, processed = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&task_ex.name)
        .bind(to_json(&task_ex.spec)?)
        .bind(task_ex.state.as_str())
        .bind(&task_ex.state_info)
        .bind(to_json(&task_ex.in_context)?)
        .bind(to_json(&task_ex.published)?)
        .bind(to_json(&task_ex.runtime_context)?)
        .bind(task_ex.processed)
        .bind(format_datetime(&task_ex.updated_at))
        .bind(task_ex.id.to_string())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_action_execution(
        &mut self,
        id: &Uuid,
    ) -> Result<Option<ActionExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM action_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_action).transpose()
    }

    async fn list_action_executions(
        &mut self,
        task_execution_id: &Uuid,
    ) -> Result<Vec<ActionExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM action_executions WHERE task_execution_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(task_execution_id.to_string())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        collect(&rows, row_to_action)
    }

    async fn create_action_execution(
        &mut self,
        action_ex: &ActionExecution,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO action_executions
               (id, task_execution_id, workflow_execution_id, name, input, output, state,
                accepted, runtime_context, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(action_ex.id.to_string())
        .bind(action_ex.task_execution_id.to_string())
        .bind(action_ex.workflow_execution_id.to_string())
        .bind(&action_ex.name)
        .bind(to_json(&action_ex.input)?)
        .bind(action_ex.output.as_ref().map(to_json).transpose()?)
        .bind(action_ex.state.as_str())
        .bind(action_ex.accepted)
        .bind(to_json(&action_ex.runtime_context)?)
        .bind(format_datetime(&action_ex.created_at))
        .bind(format_datetime(&action_ex.updated_at))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match db_err(e) {
            RepositoryError::Conflict(_) => RepositoryError::Conflict(format!(
                "action execution {} already exists",
                action_ex.id
            )),
            other => other,
        })?;
        Ok(())
    }

    async fn update_action_execution(
        &mut self,
        action_ex: &ActionExecution,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE action_executions SET
                 name = ?, input = ?, output = ?, state = ?, accepted = ?,
                 runtime_context = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&action_ex.name)
        .bind(to_json(&action_ex.input)?)
        .bind(action_ex.output.as_ref().map(to_json).transpose()?)
        .bind(action_ex.state.as_str())
        .bind(action_ex.accepted)
        .bind(to_json(&action_ex.runtime_context)?)
        .bind(format_datetime(&action_ex.updated_at))
        .bind(action_ex.id.to_string())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete_action_execution(&mut self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM action_executions WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_delayed_call(&mut self, call: &DelayedCall) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO delayed_calls
               (id, workflow_execution_id, kind, target, run_at, claimed_until, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(call.id.to_string())
        .bind(call.workflow_execution_id.to_string())
        .bind(call.target.kind())
        .bind(to_json(&call.target)?)
        .bind(format_datetime(&call.run_at))
        .bind(call.claimed_until.as_ref().map(format_datetime))
        .bind(format_datetime(&call.created_at))
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_delayed_call(&mut self, id: &Uuid) -> Result<Option<DelayedCall>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM delayed_calls WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_call).transpose()
    }

    async fn reschedule_delayed_call(
        &mut self,
        id: &Uuid,
        run_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("UPDATE delayed_calls SET run_at = ?, claimed_until = NULL WHERE id = ?")
                .bind(format_datetime(&run_at))
                .bind(id.to_string())
                .execute(&mut *self.tx)
                .await
                .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete_delayed_call(&mut self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM delayed_calls WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_delayed_calls_for_workflow(
        &mut self,
        workflow_execution_id: &Uuid,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM delayed_calls WHERE workflow_execution_id = ?")
            .bind(workflow_execution_id.to_string())
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn list_delayed_calls(
        &mut self,
        workflow_execution_id: &Uuid,
    ) -> Result<Vec<DelayedCall>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM delayed_calls WHERE workflow_execution_id = ? ORDER BY run_at ASC, id ASC",
        )
        .bind(workflow_execution_id.to_string())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        collect(&rows, row_to_call)
    }

    async fn claim_due_delayed_calls(
        &mut self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DelayedCall>, RepositoryError> {
        let now = format_datetime(&now);
        let rows = sqlx::query(
            r#"SELECT * FROM delayed_calls
               WHERE run_at <= ? AND (claimed_until IS NULL OR claimed_until <= ?)
               ORDER BY run_at ASC, id ASC
               LIMIT ?"#,
        )
        .bind(&now)
        .bind(&now)
        .bind(i64::from(limit))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;

        let mut calls = collect(&rows, row_to_call)?;
        let lease = format_datetime(&lease_until);
        for call in &mut calls {
            sqlx::query("UPDATE delayed_calls SET claimed_until = ? WHERE id = ?")
                .bind(&lease)
                .bind(call.id.to_string())
                .execute(&mut *self.tx)
                .await
                .map_err(db_err)?;
            call.claimed_until = Some(lease_until);
        }
        Ok(calls)
    }

    async fn commit(self) -> Result<(), RepositoryError> {
        self.tx.commit().await.map_err(db_err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
