//! Instance subcommands: start, inspect, and lifecycle control.

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

use conductor_core::repository::workflow::WorkflowRepository;
use conductor_core::workflow::StartOptions;
use conductor_types::event::EngineEvent;
use conductor_types::instance::{WorkflowInstance, WorkflowStatus};

use super::output::{
    format_duration_ms, format_time, node_status_color, print_instance, print_json, styled_status,
    truncate,
};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

/// Parse `--input`; it must be a JSON object.
pub fn parse_inputs(input: Option<&str>) -> Result<Value> {
    let Some(raw) = input else {
        return Ok(Value::Object(Default::default()));
    };
    let value: Value = serde_json::from_str(raw).context("--input is not valid JSON")?;
    if !value.is_object() {
        bail!("--input must be a JSON object, got {}", kind_of(&value));
    }
    Ok(value)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Admission keys given to `start`.
#[derive(Debug, Clone, Default)]
pub struct StartKeys {
    pub business_key: Option<String>,
    pub mutex_key: Option<String>,
}

pub async fn handle_start(
    state: &AppState,
    definition_id: &str,
    input: Option<&str>,
    keys: StartKeys,
    version: Option<&str>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let mut options = StartOptions::with_inputs(parse_inputs(input)?);
    options.business_key = keys.business_key;
    options.mutex_key = keys.mutex_key;

    let progress = (!json && !quiet).then(|| spawn_progress(state));
    let started = state
        .engine
        .start_by_id(definition_id, version, options)
        .await
        .with_context(|| format!("Failed to start '{definition_id}'"));
    let instance = match started {
        Ok(instance) => settle(state, instance).await?,
        Err(err) => {
            if let Some(handle) = progress {
                handle.abort();
            }
            return Err(err);
        }
    };
    if let Some(handle) = progress {
        handle.abort();
    }

    report(&instance, json)
}

/// Wait out automatic retries scheduled by this process, then reload.
async fn settle(state: &AppState, instance: WorkflowInstance) -> Result<WorkflowInstance> {
    if instance.status != WorkflowStatus::Failed || !instance.can_retry() {
        return Ok(instance);
    }
    state.engine.wait_for_retries(instance.id).await;
    load(state, instance.id).await
}

/// Print node progress lines as the engine publishes them.
fn spawn_progress(state: &AppState) -> tokio::task::JoinHandle<()> {
    let mut events = state.engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress output lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::NodeCompleted {
            node_id,
            duration_ms,
            ..
        } => println!(
            "  {} {} {}",
            style("+").green(),
            node_id,
            style(format_duration_ms(Some(*duration_ms))).dim()
        ),
        EngineEvent::NodeFailed {
            node_id, message, ..
        } => println!("  {} {} {}", style("x").red(), node_id, style(message).red()),
        EngineEvent::RetryScheduled {
            retry_count,
            delay_ms,
            ..
        } => println!(
            "  {} retry {} in {}",
            style("~").yellow(),
            retry_count,
            format_duration_ms(i64::try_from(*delay_ms).ok())
        ),
        EngineEvent::Escalated { message, .. } => {
            println!("  {} escalated: {}", style("!").red().bold(), message)
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Inspect
// ---------------------------------------------------------------------------

async fn load(state: &AppState, instance_id: i64) -> Result<WorkflowInstance> {
    state
        .engine
        .get_instance(instance_id)
        .await
        .context("Failed to load instance")?
        .with_context(|| format!("Workflow instance {instance_id} not found"))
}

fn report(instance: &WorkflowInstance, json: bool) -> Result<()> {
    if json {
        print_json(instance)
    } else {
        print_instance(instance);
        Ok(())
    }
}

pub async fn handle_status(state: &AppState, instance_id: i64, json: bool) -> Result<()> {
    let instance = load(state, instance_id).await?;
    report(&instance, json)
}

pub async fn handle_list(
    state: &AppState,
    status: Option<&str>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let status = status
        .map(|s| s.parse::<WorkflowStatus>().map_err(anyhow::Error::msg))
        .transpose()?;
    let instances = state
        .repo
        .list_instances(status, limit)
        .await
        .context("Failed to list instances")?;

    if json {
        return print_json(&instances);
    }
    if instances.is_empty() {
        println!();
        println!("  No workflow instances found.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Id").fg(Color::Cyan),
            Cell::new("Definition"),
            Cell::new("Status"),
            Cell::new("Business Key"),
            Cell::new("Retries"),
            Cell::new("Created"),
        ]);
    for i in &instances {
        table.add_row(vec![
            Cell::new(i.id),
            Cell::new(format!("{} v{}", i.definition_id, i.definition_version)),
            Cell::new(i.status.as_str()),
            Cell::new(i.business_key.as_deref().unwrap_or("-")),
            Cell::new(format!("{}/{}", i.retry_count, i.max_retries)),
            Cell::new(format_time(Some(i.created_at))),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn handle_nodes(state: &AppState, instance_id: i64, json: bool) -> Result<()> {
    // Surface "not found" rather than an empty table.
    load(state, instance_id).await?;
    let nodes = state
        .engine
        .list_nodes(instance_id)
        .await
        .context("Failed to list nodes")?;

    if json {
        return print_json(&nodes);
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Status"),
            Cell::new("Parent"),
            Cell::new("Attempt"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);
    for n in &nodes {
        table.add_row(vec![
            Cell::new(&n.node_id),
            Cell::new(n.node_type.as_str()),
            Cell::new(n.status.as_str()).fg(node_status_color(n.status)),
            Cell::new(n.parent_node_id.as_deref().unwrap_or("-")),
            Cell::new(n.retry_count + 1),
            Cell::new(format_duration_ms(n.duration_ms)),
            Cell::new(
                n.error_message
                    .as_deref()
                    .map(|e| truncate(e, 60))
                    .unwrap_or_default(),
            ),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle operation requested from the command line.
#[derive(Debug, Clone, Copy)]
pub enum Lifecycle {
    Cancel,
    Pause,
    Resume,
    Retry,
}

impl Lifecycle {
    fn verb(self) -> &'static str {
        match self {
            Lifecycle::Cancel => "cancel",
            Lifecycle::Pause => "pause",
            Lifecycle::Resume => "resume",
            Lifecycle::Retry => "retry",
        }
    }
}

pub async fn handle_lifecycle(
    state: &AppState,
    op: Lifecycle,
    instance_id: i64,
    json: bool,
) -> Result<()> {
    let engine = &state.engine;
    let result = match op {
        Lifecycle::Cancel => engine.cancel_workflow(instance_id).await,
        Lifecycle::Pause => engine.pause_workflow(instance_id).await,
        Lifecycle::Resume => engine.resume_workflow(instance_id).await,
        Lifecycle::Retry => engine.retry_workflow(instance_id).await,
    };
    let instance = result.with_context(|| format!("Failed to {} instance {instance_id}", op.verb()))?;
    let instance = match op {
        Lifecycle::Resume | Lifecycle::Retry => settle(state, instance).await?,
        Lifecycle::Cancel | Lifecycle::Pause => instance,
    };

    if json {
        return print_json(&instance);
    }
    println!(
        "  {} #{} is now {}",
        style("*").green().bold(),
        instance.id,
        styled_status(instance.status)
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Recover
// ---------------------------------------------------------------------------

pub async fn handle_recover(state: &AppState, limit: Option<u32>, json: bool) -> Result<()> {
    let engine = &state.engine;
    // Registration makes this process eligible for scheduler assignment.
    engine.start().await.context("Failed to start engine")?;
    let limit = limit.unwrap_or(engine.config().recovery_batch_limit);
    let claimed = engine
        .recover_interrupted(limit)
        .await
        .context("Recovery pass failed")?;

    let mut recovered = Vec::with_capacity(claimed.len());
    for id in claimed {
        engine.wait_for_recovery(id).await;
        let instance = load(state, id).await?;
        recovered.push(settle(state, instance).await?);
    }

    if json {
        return print_json(&recovered);
    }
    if recovered.is_empty() {
        println!("  No interrupted workflows to recover.");
        return Ok(());
    }
    for instance in &recovered {
        println!(
            "  {} #{} ({}) {}",
            style("*").green().bold(),
            instance.id,
            instance.definition_id,
            styled_status(instance.status)
        );
    }
    Ok(())
}
