//! Definition subcommands: register, show, and list.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use conductor_core::repository::workflow::WorkflowRepository;
use conductor_core::workflow::definition::{
    DefinitionError, load_definition_file, serialize_definition_yaml,
};

use super::output::print_json;
use crate::state::AppState;

/// Workflow definition subcommands.
#[derive(Subcommand, Clone)]
pub enum DefinitionCommand {
    /// Validate and store a definition from a YAML or JSON file.
    Register {
        /// Path to the definition file.
        file: PathBuf,
    },

    /// Print a stored definition.
    #[command(disable_version_flag = true)]
    Show {
        /// Definition id.
        id: String,

        /// Version to show (defaults to the most recently registered).
        #[arg(long)]
        version: Option<String>,
    },

    /// List the latest version of every stored definition.
    #[command(alias = "ls")]
    List,
}

pub async fn handle_definition_command(
    cmd: DefinitionCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        DefinitionCommand::Register { file } => handle_register(&file, state, json).await,
        DefinitionCommand::Show { id, version } => {
            handle_show(&id, version.as_deref(), state, json).await
        }
        DefinitionCommand::List => handle_list(state, json).await,
    }
}

async fn handle_register(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let def = load_definition_file(file).map_err(|e| match e {
        DefinitionError::Parse(msg) => anyhow::anyhow!("Failed to parse definition: {msg}"),
        DefinitionError::Invalid(err) => anyhow::anyhow!("Definition validation failed: {err}"),
        other => anyhow::anyhow!("Failed to load {}: {other}", file.display()),
    })?;

    state
        .engine
        .register_definition(&def)
        .await
        .context("Failed to save definition")?;

    if json {
        print_json(&serde_json::json!({
            "id": def.id,
            "name": def.name,
            "version": def.version,
            "nodes": def.nodes.len(),
        }))?;
    } else {
        println!();
        println!(
            "  {} Registered '{}' version {}",
            style("*").green().bold(),
            style(&def.id).cyan(),
            def.version
        );
        println!("  Name:  {}", def.name);
        println!("  Nodes: {}", def.nodes.len());
        println!();
    }
    Ok(())
}

async fn handle_show(id: &str, version: Option<&str>, state: &AppState, json: bool) -> Result<()> {
    let Some(def) = state
        .repo
        .get_definition(id, version)
        .await
        .context("Failed to load definition")?
    else {
        match version {
            Some(v) => bail!("Definition '{id}' version {v} not found"),
            None => bail!("Definition '{id}' not found"),
        }
    };

    if json {
        return print_json(&def);
    }

    println!();
    println!(
        "  {} ({} v{})",
        style(&def.name).bold(),
        style(&def.id).cyan(),
        def.version
    );
    if let Some(description) = &def.description {
        println!("  {}", style(description).dim());
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Depends On"),
        ]);
    for node in &def.nodes {
        table.add_row(vec![
            Cell::new(node.display_name()),
            Cell::new(node.node_type().as_str()),
            Cell::new(if node.depends_on.is_empty() {
                "-".to_string()
            } else {
                node.depends_on.join(", ")
            }),
        ]);
    }
    println!("{table}");
    println!();

    let yaml = serialize_definition_yaml(&def).context("Failed to render definition")?;
    println!("{}", style(yaml.trim_end()).dim());
    Ok(())
}

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let defs = state
        .repo
        .list_definitions()
        .await
        .context("Failed to list definitions")?;

    if json {
        return print_json(&defs);
    }

    if defs.is_empty() {
        println!();
        println!("  No definitions registered.");
        println!(
            "  Register one with: {}",
            style("conductor definition register <file>").yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Id").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Version"),
            Cell::new("Nodes"),
        ]);
    for def in &defs {
        table.add_row(vec![
            Cell::new(&def.id),
            Cell::new(&def.name),
            Cell::new(&def.version),
            Cell::new(def.nodes.len()),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}
