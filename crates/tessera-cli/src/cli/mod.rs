//! CLI command definitions for the `tessera` binary.

pub mod execution;
pub mod run;

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{Cell, Color};
use serde_json::Value;
use tessera_types::spec::JsonMap;
use tessera_types::state::{TaskState, WorkflowState};

/// Run and inspect workflow executions.
#[derive(Parser)]
#[command(name = "tessera", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    /// Detailed output (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register the workflows in a YAML file and run one to completion.
    Run {
        /// Workflow YAML file.
        file: PathBuf,

        /// Workflow to run (defaults to the first one in the file).
        #[arg(long, short = 'w')]
        workflow: Option<String>,

        /// Input parameter as key=value; the value is parsed as JSON when possible.
        #[arg(long = "input", short = 'i', value_name = "KEY=VALUE")]
        input: Vec<String>,

        /// Environment variable exposed as `__env`, as key=value.
        #[arg(long = "env", short = 'e', value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Target task of a reverse workflow.
        #[arg(long)]
        task: Option<String>,
    },

    /// List workflow executions, newest first.
    #[command(alias = "ls")]
    List {
        /// Only executions in this state.
        #[arg(long)]
        state: Option<StateArg>,

        /// Only executions of this workflow.
        #[arg(long)]
        name: Option<String>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show a workflow execution and its tasks.
    Show {
        /// Workflow execution UUID.
        id: String,
    },

    /// Force a workflow execution into a terminal state.
    Stop {
        /// Workflow execution UUID.
        id: String,

        #[arg(long, value_enum, default_value = "cancelled")]
        state: StopState,

        /// Reason recorded as the state info.
        #[arg(long, short = 'm')]
        message: Option<String>,
    },

    /// Pause a running workflow execution.
    Pause {
        /// Workflow execution UUID.
        id: String,
    },

    /// Resume a paused workflow execution and wait for it to finish.
    Resume {
        /// Workflow execution UUID.
        id: String,

        /// Environment overrides as key=value.
        #[arg(long = "env", short = 'e', value_name = "KEY=VALUE")]
        env: Vec<String>,
    },

    /// Rerun a failed task and wait for its workflow to finish.
    Rerun {
        /// Task execution UUID.
        task_id: String,

        /// Repeat every with-items iteration instead of only the failed ones.
        #[arg(long)]
        reset: bool,

        /// Environment overrides as key=value.
        #[arg(long = "env", short = 'e', value_name = "KEY=VALUE")]
        env: Vec<String>,
    },

    /// Delete a workflow execution and everything below it.
    #[command(alias = "rm")]
    Delete {
        /// Workflow execution UUID.
        id: String,

        /// Delete even if the execution has not finished.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum StateArg {
    Idle,
    Running,
    Paused,
    Success,
    Error,
    Cancelled,
}

impl From<StateArg> for WorkflowState {
    fn from(arg: StateArg) -> Self {
        match arg {
            StateArg::Idle => Self::Idle,
            StateArg::Running => Self::Running,
            StateArg::Paused => Self::Paused,
            StateArg::Success => Self::Success,
            StateArg::Error => Self::Error,
            StateArg::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum StopState {
    Success,
    Error,
    Cancelled,
}

impl From<StopState> for WorkflowState {
    fn from(arg: StopState) -> Self {
        match arg {
            StopState::Success => Self::Success,
            StopState::Error => Self::Error,
            StopState::Cancelled => Self::Cancelled,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Parse `key=value` pairs. Values that parse as JSON keep their type;
/// anything else is a string.
pub fn parse_pairs(pairs: &[String]) -> Result<JsonMap> {
    let mut map = JsonMap::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("Expected KEY=VALUE, got '{pair}'");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Empty key in '{pair}'");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

pub fn parse_id(raw: &str) -> Result<uuid::Uuid> {
    raw.parse()
        .map_err(|_| anyhow::anyhow!("'{raw}' is not a valid execution ID"))
}

pub fn short_id(id: &uuid::Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

pub fn format_state(state: WorkflowState) -> Cell {
    let color = match state {
        WorkflowState::Idle => Color::Yellow,
        WorkflowState::Running => Color::Blue,
        WorkflowState::Paused => Color::Magenta,
        WorkflowState::Success => Color::Green,
        WorkflowState::Error => Color::Red,
        WorkflowState::Cancelled => Color::DarkYellow,
    };
    Cell::new(state.as_str()).fg(color)
}

pub fn format_task_state(state: TaskState) -> Cell {
    let color = match state {
        TaskState::Success => Color::Green,
        TaskState::Error => Color::Red,
        TaskState::Running | TaskState::RunningDelayed => Color::Blue,
        TaskState::Waiting | TaskState::Idle => Color::Yellow,
        TaskState::Cancelled | TaskState::Skipped => Color::DarkYellow,
    };
    Cell::new(state.as_str()).fg(color)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_pairs_keeps_json_types() {
        let pairs = vec![
            "name=Neo".to_string(),
            "count=3".to_string(),
            "tags=[\"a\",\"b\"]".to_string(),
            "quote=\"7\"".to_string(),
            "expr=a=b".to_string(),
        ];
        let map = parse_pairs(&pairs).unwrap();
        assert_eq!(map["name"], json!("Neo"));
        assert_eq!(map["count"], json!(3));
        assert_eq!(map["tags"], json!(["a", "b"]));
        assert_eq!(map["quote"], json!("7"));
        assert_eq!(map["expr"], json!("a=b"));
    }

    #[test]
    fn test_parse_pairs_rejects_malformed() {
        assert!(parse_pairs(&["novalue".to_string()]).is_err());
        assert!(parse_pairs(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses_run_arguments() {
        let cli = Cli::try_parse_from([
            "tessera", "--json", "run", "wf.yaml", "-i", "name=Neo", "--env", "from=cli", "--task", "t",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run {
                file, input, env, task, workflow,
            } => {
                assert_eq!(file, PathBuf::from("wf.yaml"));
                assert_eq!(input, vec!["name=Neo"]);
                assert_eq!(env, vec!["from=cli"]);
                assert_eq!(task.as_deref(), Some("t"));
                assert!(workflow.is_none());
            }
            _ => panic!("expected run"),
        }
    }
}
