//! CLI command definitions and dispatch for the `conductor` binary.
//!
//! Uses clap derive macros for argument parsing. Definition management is a
//! nested subcommand (`conductor definition register`); instance operations
//! are top-level verbs (`conductor status 42`).

pub mod definition;
pub mod instance;
pub mod output;
pub mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use definition::DefinitionCommand;

/// Run and inspect durable workflows.
#[derive(Parser)]
#[command(name = "conductor", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Database URL (defaults to ~/.conductor/conductor.db).
    #[arg(long, global = true, env = "CONDUCTOR_DATABASE_URL")]
    pub database: Option<String>,

    /// Engine configuration file (defaults to ~/.conductor/conductor.toml).
    #[arg(long, global = true, env = "CONDUCTOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register and inspect workflow definitions.
    #[command(alias = "def")]
    Definition {
        #[command(subcommand)]
        command: DefinitionCommand,
    },

    /// Start a workflow from a registered definition and drive it to the end.
    #[command(disable_version_flag = true)]
    Start {
        /// Definition id.
        definition_id: String,

        /// Workflow inputs as a JSON object.
        #[arg(long)]
        input: Option<String>,

        /// Business key; refused while another active instance holds it.
        #[arg(long)]
        business_key: Option<String>,

        /// Mutex key; at most one active instance across all business keys.
        #[arg(long)]
        mutex_key: Option<String>,

        /// Definition version (defaults to the most recently registered).
        #[arg(long)]
        version: Option<String>,
    },

    /// Show one workflow instance.
    Status {
        /// Instance id.
        instance_id: i64,
    },

    /// List recent workflow instances.
    #[command(alias = "ls")]
    List {
        /// Only show instances in this status.
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of instances to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// List the node instances of a workflow instance.
    Nodes {
        /// Instance id.
        instance_id: i64,
    },

    /// Cancel a running, paused, or pending instance.
    Cancel {
        /// Instance id.
        instance_id: i64,
    },

    /// Pause a running instance at its next node boundary.
    Pause {
        /// Instance id.
        instance_id: i64,
    },

    /// Resume a paused or interrupted instance from its checkpoint.
    Resume {
        /// Instance id.
        instance_id: i64,
    },

    /// Re-drive a failed instance that has retries left.
    Retry {
        /// Instance id.
        instance_id: i64,
    },

    /// Resume interrupted instances assigned to this engine, then exit.
    Recover {
        /// Maximum number of instances to claim.
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Run a long-lived engine with heartbeat, sweep, and periodic recovery.
    Serve,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_start_with_options() {
        let cli = Cli::parse_from([
            "conductor",
            "--json",
            "start",
            "pipeline",
            "--input",
            r#"{"n": 3}"#,
            "--business-key",
            "batch-1",
            "--mutex-key",
            "dock-3",
        ]);
        assert!(cli.json);
        match cli.command {
            Commands::Start {
                definition_id,
                input,
                business_key,
                mutex_key,
                version,
            } => {
                assert_eq!(definition_id, "pipeline");
                assert_eq!(input.as_deref(), Some(r#"{"n": 3}"#));
                assert_eq!(business_key.as_deref(), Some("batch-1"));
                assert_eq!(mutex_key.as_deref(), Some("dock-3"));
                assert!(version.is_none());
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn verbosity_counts_and_globals_after_subcommand() {
        let cli = Cli::parse_from(["conductor", "status", "7", "-vv", "--database", "sqlite::memory:"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.database.as_deref(), Some("sqlite::memory:"));
        assert!(matches!(cli.command, Commands::Status { instance_id: 7 }));
    }

    #[test]
    fn definition_subcommands_parse() {
        let cli = Cli::parse_from(["conductor", "def", "show", "pipeline", "--version", "2"]);
        match cli.command {
            Commands::Definition {
                command: DefinitionCommand::Show { id, version },
            } => {
                assert_eq!(id, "pipeline");
                assert_eq!(version.as_deref(), Some("2"));
            }
            _ => panic!("expected definition show"),
        }
    }
}
