//! Shared formatting helpers for styled CLI output.

use chrono::{DateTime, Utc};
use comfy_table::Color;
use console::{StyledObject, style};
use conductor_types::instance::{WorkflowInstance, WorkflowStatus};
use conductor_types::node::NodeStatus;

/// Print a value as pretty JSON on stdout.
pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn styled_status(status: WorkflowStatus) -> StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        WorkflowStatus::Completed => s.green(),
        WorkflowStatus::Failed => s.red(),
        WorkflowStatus::Running => s.cyan(),
        WorkflowStatus::Paused | WorkflowStatus::Pending => s.yellow(),
        WorkflowStatus::Cancelled => s.dim(),
    }
}

pub fn node_status_color(status: NodeStatus) -> Color {
    match status {
        NodeStatus::Completed => Color::Green,
        NodeStatus::Failed => Color::Red,
        NodeStatus::Running => Color::Cyan,
        NodeStatus::Pending => Color::Yellow,
        NodeStatus::Skipped | NodeStatus::Cancelled => Color::DarkGrey,
    }
}

pub fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn format_duration_ms(ms: Option<i64>) -> String {
    match ms {
        None => "-".to_string(),
        Some(ms) if ms < 1000 => format!("{ms}ms"),
        Some(ms) => format!("{:.1}s", ms as f64 / 1000.0),
    }
}

/// Truncate to `max` characters, appending an ellipsis when shortened.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

/// Styled multi-line summary of one instance.
pub fn print_instance(instance: &WorkflowInstance) {
    println!();
    println!(
        "  {} #{} ({} v{})",
        style("Workflow").bold(),
        style(instance.id).cyan(),
        instance.definition_id,
        instance.definition_version
    );
    println!("  Status:    {}", styled_status(instance.status));
    if let Some(key) = &instance.business_key {
        println!("  Business:  {key}");
    }
    if let Some(key) = &instance.mutex_key {
        println!("  Mutex:     {key}");
    }
    println!("  Retries:   {}/{}", instance.retry_count, instance.max_retries);
    if let Some(engine) = &instance.assigned_engine_id {
        println!("  Engine:    {engine}");
    }
    println!("  Started:   {}", format_time(instance.started_at));
    println!("  Completed: {}", format_time(instance.completed_at));
    if !instance.completed_nodes.is_empty() {
        println!("  Done:      {}", instance.completed_nodes.join(", "));
    }
    if !instance.failed_nodes.is_empty() {
        println!("  Failed:    {}", style(instance.failed_nodes.join(", ")).red());
    }
    if let Some(err) = &instance.error_details {
        println!(
            "  Error:     {} [{}{}]",
            style(&err.message).red(),
            err.category,
            if err.retryable { ", retryable" } else { "" }
        );
    }
    if let Some(output) = &instance.output_data {
        let rendered = serde_json::to_string(output).unwrap_or_default();
        println!("  Output:    {}", truncate(&rendered, 120));
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_switch_to_seconds() {
        assert_eq!(format_duration_ms(None), "-");
        assert_eq!(format_duration_ms(Some(250)), "250ms");
        assert_eq!(format_duration_ms(Some(1500)), "1.5s");
    }

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }
}
