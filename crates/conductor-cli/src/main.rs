//! `conductor` binary entry point.

mod cli;
mod state;

use clap::Parser;

use cli::instance::{Lifecycle, StartKeys};
use cli::{Cli, Commands};
use conductor_observe::tracing_setup::{filter_for_verbosity, init_tracing_with_filter, shutdown_tracing};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = filter_for_verbosity(cli.verbose, cli.quiet);
    // JSON log records only when machine output was requested and logs are verbose.
    let json_logs = cli.json && cli.verbose > 0;
    init_tracing_with_filter(filter, json_logs, cli.otel)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let state = AppState::init(cli.database.clone(), cli.config.clone()).await?;
    let result = run(&cli, &state).await;

    state.close().await;
    shutdown_tracing();
    result
}

async fn run(cli: &Cli, state: &AppState) -> anyhow::Result<()> {
    let json = cli.json;
    match &cli.command {
        Commands::Definition { command } => {
            cli::definition::handle_definition_command(command.clone(), state, json).await
        }
        Commands::Start {
            definition_id,
            input,
            business_key,
            mutex_key,
            version,
        } => {
            cli::instance::handle_start(
                state,
                definition_id,
                input.as_deref(),
                StartKeys {
                    business_key: business_key.clone(),
                    mutex_key: mutex_key.clone(),
                },
                version.as_deref(),
                json,
                cli.quiet,
            )
            .await
        }
        Commands::Status { instance_id } => cli::instance::handle_status(state, *instance_id, json).await,
        Commands::List { status, limit } => {
            cli::instance::handle_list(state, status.as_deref(), *limit, json).await
        }
        Commands::Nodes { instance_id } => cli::instance::handle_nodes(state, *instance_id, json).await,
        Commands::Cancel { instance_id } => {
            cli::instance::handle_lifecycle(state, Lifecycle::Cancel, *instance_id, json).await
        }
        Commands::Pause { instance_id } => {
            cli::instance::handle_lifecycle(state, Lifecycle::Pause, *instance_id, json).await
        }
        Commands::Resume { instance_id } => {
            cli::instance::handle_lifecycle(state, Lifecycle::Resume, *instance_id, json).await
        }
        Commands::Retry { instance_id } => {
            cli::instance::handle_lifecycle(state, Lifecycle::Retry, *instance_id, json).await
        }
        Commands::Recover { limit } => cli::instance::handle_recover(state, *limit, json).await,
        Commands::Serve => cli::serve::serve(state, json, cli.quiet).await,
    }
}
