//! Long-running engine host.

use anyhow::{Context, Result};
use console::style;
use tokio::sync::broadcast::error::RecvError;

use conductor_types::event::EngineEvent;

use crate::state::AppState;

/// Start the engine's background loops and block until Ctrl+C or SIGTERM,
/// then shut down gracefully.
pub async fn serve(state: &AppState, json: bool, quiet: bool) -> Result<()> {
    let engine = &state.engine;
    engine.start().await.context("Failed to start engine")?;

    let config = engine.config();
    if !json && !quiet {
        println!();
        println!(
            "  {} Conductor engine {} running",
            style("*").green().bold(),
            style(engine.engine_id()).cyan()
        );
        println!("  Database:  {}", state.database_url);
        println!(
            "  Slots:     {} workflows, {} nodes",
            config.max_concurrent_workflows, config.max_concurrent_nodes
        );
        println!("  {}", style("Press Ctrl+C to stop").dim());
        println!();
    }

    let mut events = engine.subscribe();
    let mut shutdown = std::pin::pin!(shutdown_signal());
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event log lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    if !json && !quiet {
        println!("\n  Shutting down...");
    }
    engine.shutdown().await;
    if !json && !quiet {
        println!("  Engine stopped.");
    }
    Ok(())
}

fn log_event(event: &EngineEvent) {
    let instance_id = event.instance_id();
    match event {
        EngineEvent::WorkflowStarted { definition_id, .. } => {
            tracing::info!(instance_id, %definition_id, "workflow started");
        }
        EngineEvent::WorkflowCompleted { .. } => tracing::info!(instance_id, "workflow completed"),
        EngineEvent::WorkflowFailed {
            category, message, ..
        } => {
            tracing::warn!(instance_id, %category, %message, "workflow failed");
        }
        EngineEvent::Escalated {
            category, message, ..
        } => {
            tracing::error!(instance_id, %category, %message, "workflow escalated");
        }
        other => tracing::debug!(instance_id, event = ?other, "engine event"),
    }
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
