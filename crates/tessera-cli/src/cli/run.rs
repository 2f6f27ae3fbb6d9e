//! `tessera run`: register a workflow file and run it to completion.

use std::path::Path;

use anyhow::{Context, Result, bail};
use console::style;
use serde_json::Value;
use tessera_core::workflow::engine::env_params;
use tessera_types::execution::WorkflowExecution;
use tessera_types::state::WorkflowState;

use super::parse_pairs;
use crate::state::AppState;

pub async fn handle_run(
    state: &AppState,
    file: &Path,
    workflow: Option<&str>,
    input: &[String],
    env: &[String],
    task: Option<&str>,
    json: bool,
) -> Result<()> {
    let loaded = state
        .catalog
        .load_file(file)
        .await
        .with_context(|| format!("Failed to load {}", file.display()))?;
    let name = match workflow {
        Some(name) => {
            if !loaded.iter().any(|spec| spec.name == name) {
                bail!("Workflow '{name}' is not defined in {}", file.display());
            }
            name.to_string()
        }
        None => match loaded.first() {
            Some(spec) => spec.name.clone(),
            None => bail!("{} defines no workflows", file.display()),
        },
    };

    let input = parse_pairs(input)?;
    let mut params = env_params(parse_pairs(env)?);
    if let Some(task) = task {
        params.insert("task_name".to_string(), Value::String(task.to_string()));
    }

    if !json {
        println!();
        println!("  {} Running workflow '{}'", style("*").cyan().bold(), style(&name).cyan());
    }

    let runtime = state.runtime();
    let outcome = tokio::select! {
        result = runtime.run_to_completion(&name, &input, params) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    runtime.shutdown().await;

    match outcome {
        Some(result) => {
            let wf = result.with_context(|| format!("Failed to run workflow '{name}'"))?;
            print_outcome(&wf, json)
        }
        None => {
            if !json {
                println!("  Interrupted. The execution stays in the database; see `tessera list`.");
            }
            Ok(())
        }
    }
}

/// Print a finished execution; an unsuccessful one is reported as an error.
pub fn print_outcome(wf: &WorkflowExecution, json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "id": wf.id.to_string(),
            "workflow": wf.workflow_name,
            "state": wf.state.as_str(),
            "state_info": wf.state_info,
            "output": wf.output,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        let mark = match wf.state {
            WorkflowState::Success => style("✓").green().bold(),
            _ => style("✗").red().bold(),
        };
        println!("  {mark} Execution {} finished: {}", wf.id, wf.state);
        if let Some(info) = &wf.state_info {
            println!("  {}", style(info).dim());
        }
        if let Some(output) = &wf.output {
            println!();
            println!("{}", serde_json::to_string_pretty(output)?);
        }
        println!();
    }

    if wf.state != WorkflowState::Success {
        bail!("workflow execution {} ended in state {}", wf.id, wf.state);
    }
    Ok(())
}
