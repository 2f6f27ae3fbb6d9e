//! Execution management subcommands: list, show, stop, pause, resume, rerun
//! and delete.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use tessera_infra::runtime::LocalRuntime;
use tessera_infra::sqlite::SqliteExecutionStore;
use tessera_types::event::EngineEvent;
use tessera_types::execution::{WorkflowExecution, WorkflowExecutionFilter};
use tessera_types::state::WorkflowState;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::run::print_outcome;
use super::{format_state, format_task_state, parse_id, parse_pairs, short_id};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn handle_list(
    state: &AppState,
    filter_state: Option<WorkflowState>,
    name: Option<String>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let filter = WorkflowExecutionFilter {
        state: filter_state,
        workflow_name: name,
        parent_task_id: None,
        limit: Some(limit),
    };
    let executions = state
        .engine()
        .list_workflow_executions(&filter)
        .await
        .context("Failed to list executions")?;

    if json {
        let out: Vec<_> = executions
            .iter()
            .map(|wf| {
                serde_json::json!({
                    "id": wf.id.to_string(),
                    "workflow": wf.workflow_name,
                    "state": wf.state.as_str(),
                    "state_info": wf.state_info,
                    "parent_task_id": wf.parent_task_id.map(|id| id.to_string()),
                    "created_at": wf.created_at.to_rfc3339(),
                    "updated_at": wf.updated_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!();
        println!(
            "  No workflow executions in {}.",
            style(state.data_dir.display()).dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("State"),
            Cell::new("Created"),
            Cell::new("Info"),
        ]);

    for wf in &executions {
        let name = match wf.parent_task_id {
            Some(_) => format!("{} (nested)", wf.workflow_name),
            None => wf.workflow_name.clone(),
        };
        table.add_row(vec![
            Cell::new(short_id(&wf.id)),
            Cell::new(name),
            format_state(wf.state),
            Cell::new(wf.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(wf.state_info.as_deref().unwrap_or("-")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

pub async fn handle_show(state: &AppState, id: &str, json: bool) -> Result<()> {
    let id = parse_id(id)?;
    let engine = state.engine();
    let wf = engine
        .get_workflow_execution(id)
        .await
        .context("Failed to load execution")?
        .ok_or_else(|| anyhow::anyhow!("Workflow execution {id} not found"))?;
    let tasks = engine
        .list_task_executions(wf.id)
        .await
        .context("Failed to list task executions")?;

    if json {
        let out = serde_json::json!({
            "execution": wf,
            "tasks": tasks,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style("Workflow").bold(),
        style(&wf.workflow_name).cyan()
    );
    println!("  ID:       {}", wf.id);
    println!("  State:    {}", wf.state);
    if let Some(info) = &wf.state_info {
        println!("  Info:     {info}");
    }
    if let Some(description) = &wf.description {
        println!("  About:    {description}");
    }
    if let Some(parent) = wf.parent_task_id {
        println!("  Parent:   task {parent}");
    }
    println!("  Created:  {}", wf.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated:  {}", wf.updated_at.format("%Y-%m-%d %H:%M:%S"));

    if !tasks.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Task ID").fg(Color::Cyan),
                Cell::new("Name"),
                Cell::new("State"),
                Cell::new("Info"),
            ]);
        for task in &tasks {
            table.add_row(vec![
                Cell::new(task.id.to_string()),
                Cell::new(&task.name),
                format_task_state(task.state),
                Cell::new(task.state_info.as_deref().unwrap_or("-")),
            ]);
        }
        println!();
        println!("{table}");
    }

    if let Some(output) = &wf.output {
        println!();
        println!("  {}", style("Output").bold());
        println!("{}", serde_json::to_string_pretty(output)?);
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Stop / pause
// ---------------------------------------------------------------------------

pub async fn handle_stop(
    state: &AppState,
    id: &str,
    target: WorkflowState,
    message: Option<String>,
    json: bool,
) -> Result<()> {
    let id = parse_id(id)?;
    let wf = state
        .engine()
        .stop_workflow(id, target, message)
        .await
        .with_context(|| format!("Failed to stop execution {id}"))?;
    print_state_change(&wf, "Stopped", json)
}

pub async fn handle_pause(state: &AppState, id: &str, json: bool) -> Result<()> {
    let id = parse_id(id)?;
    let wf = state
        .engine()
        .pause_workflow(id)
        .await
        .with_context(|| format!("Failed to pause execution {id}"))?;
    print_state_change(&wf, "Paused", json)
}

fn print_state_change(wf: &WorkflowExecution, verb: &str, json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "id": wf.id.to_string(),
            "state": wf.state.as_str(),
            "state_info": wf.state_info,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} {verb} execution {} ({})",
            style("*").green().bold(),
            style(short_id(&wf.id)).cyan(),
            wf.state
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Resume / rerun
// ---------------------------------------------------------------------------

pub async fn handle_resume(state: &AppState, id: &str, env: &[String], json: bool) -> Result<()> {
    let id = parse_id(id)?;
    let env = parse_pairs(env)?;
    let runtime = state.runtime();
    let mut events = runtime.engine().events().subscribe();

    let result = async {
        let wf = runtime
            .engine()
            .resume_workflow(id, &env)
            .await
            .with_context(|| format!("Failed to resume execution {id}"))?;
        wait(&runtime, wf.id, &mut events).await
    }
    .await;
    runtime.shutdown().await;

    match result? {
        Some(wf) => print_outcome(&wf, json),
        None => Ok(()),
    }
}

pub async fn handle_rerun(
    state: &AppState,
    task_id: &str,
    reset: bool,
    env: &[String],
    json: bool,
) -> Result<()> {
    let task_id = parse_id(task_id)?;
    let env = parse_pairs(env)?;
    let runtime = state.runtime();
    let mut events = runtime.engine().events().subscribe();

    let result = async {
        let wf = runtime
            .engine()
            .rerun_workflow(task_id, reset, &env)
            .await
            .with_context(|| format!("Failed to rerun task {task_id}"))?;
        if !json {
            println!();
            println!(
                "  {} Rerunning task {} of '{}'",
                style("*").cyan().bold(),
                short_id(&task_id),
                style(&wf.workflow_name).cyan()
            );
        }
        wait(&runtime, wf.id, &mut events).await
    }
    .await;
    runtime.shutdown().await;

    match result? {
        Some(wf) => print_outcome(&wf, json),
        None => Ok(()),
    }
}

/// Wait for a terminal state; `None` when interrupted.
async fn wait(
    runtime: &LocalRuntime<SqliteExecutionStore>,
    id: Uuid,
    events: &mut broadcast::Receiver<EngineEvent>,
) -> Result<Option<WorkflowExecution>> {
    tokio::select! {
        result = runtime.wait_for(id, events) => Ok(Some(result?)),
        _ = tokio::signal::ctrl_c() => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

pub async fn handle_delete(state: &AppState, id: &str, force: bool, json: bool) -> Result<()> {
    let id = parse_id(id)?;
    let deleted = state
        .engine()
        .delete_workflow_execution(id, force)
        .await
        .with_context(|| format!("Failed to delete execution {id}"))?;

    if json {
        let out = serde_json::json!({ "id": id.to_string(), "deleted": deleted });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Deleted execution {} ({deleted} including nested)",
            style("*").green().bold(),
            style(short_id(&id)).cyan()
        );
        println!();
    }
    Ok(())
}
