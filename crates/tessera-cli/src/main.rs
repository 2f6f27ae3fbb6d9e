//! Tessera CLI entry point.
//!
//! Binary name: `tessera`
//!
//! Parses CLI arguments, sets up tracing, opens the execution database and
//! dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use tessera_observe::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = TracingOptions {
        json: cli.log_json,
        otel: cli.otel,
        ..Default::default()
    }
    .with_verbosity(cli.verbose);
    init_tracing(&options).map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init().await?;
    let json = cli.json;

    match cli.command {
        Commands::Run {
            file,
            workflow,
            input,
            env,
            task,
        } => {
            cli::run::handle_run(&state, &file, workflow.as_deref(), &input, &env, task.as_deref(), json).await?;
        }

        Commands::List { state: filter, name, limit } => {
            cli::execution::handle_list(&state, filter.map(Into::into), name, limit, json).await?;
        }

        Commands::Show { id } => {
            cli::execution::handle_show(&state, &id, json).await?;
        }

        Commands::Stop { id, state: target, message } => {
            cli::execution::handle_stop(&state, &id, target.into(), message, json).await?;
        }

        Commands::Pause { id } => {
            cli::execution::handle_pause(&state, &id, json).await?;
        }

        Commands::Resume { id, env } => {
            cli::execution::handle_resume(&state, &id, &env, json).await?;
        }

        Commands::Rerun { task_id, reset, env } => {
            cli::execution::handle_rerun(&state, &task_id, reset, &env, json).await?;
        }

        Commands::Delete { id, force } => {
            cli::execution::handle_delete(&state, &id, force, json).await?;
        }
    }

    state.db_pool.close().await;
    Ok(())
}
