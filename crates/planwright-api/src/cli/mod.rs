//! CLI command definitions for the `pwr` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod execution;
pub mod plan;
pub mod signal;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{Cell, Color};
use console::style;
use planwright_types::execution::Status;

use plan::PlanCommand;

/// Run durable plans of steps.
#[derive(Parser)]
#[command(name = "pwr", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format.
    #[arg(long, value_enum, default_value_t = LogFormatArg::Text, global = true)]
    pub log_format: LogFormatArg,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "PLANWRIGHT_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register, list and validate plan definitions.
    Plan {
        #[command(subcommand)]
        command: PlanCommand,
    },

    /// Start a plan execution.
    Run {
        /// Plan id.
        plan_id: String,

        /// Plan inputs as a JSON object.
        #[arg(long)]
        input: Option<String>,

        /// Block until the plan execution reaches a terminal status.
        #[arg(long)]
        wait: bool,

        /// Give up waiting after this many seconds.
        #[arg(long, default_value = "600", requires = "wait")]
        timeout: u64,
    },

    /// Show a plan execution.
    Status {
        /// Plan execution UUID.
        id: String,
    },

    /// List the node executions of a plan execution.
    Nodes {
        /// Plan execution UUID.
        id: String,
    },

    /// Deliver a payload against a correlation id.
    Notify {
        correlation_id: String,

        /// Payload as JSON (defaults to null).
        #[arg(long)]
        payload: Option<String>,

        /// Deliver the payload as an error.
        #[arg(long)]
        error: bool,
    },

    /// Register an interrupt against a plan execution.
    Interrupt {
        /// Plan execution UUID.
        id: String,

        /// pause, resume, abort, retry, ignore, mark_failed or skip.
        kind: String,

        /// Target node execution UUID.
        #[arg(long)]
        node: Option<String>,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Start the REST API server.
    Serve {
        /// Port to listen on (overrides config.toml).
        #[arg(long, env = "PLANWRIGHT_PORT")]
        port: Option<u16>,

        /// Host to bind to (overrides config.toml).
        #[arg(long)]
        host: Option<String>,
    },
}

/// Parse an optional JSON argument, defaulting to `default`.
pub fn parse_json_arg(raw: Option<&str>, what: &str, default: serde_json::Value) -> anyhow::Result<serde_json::Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("--{what} is not valid JSON")),
        None => Ok(default),
    }
}

pub fn parse_uuid_arg(raw: &str, what: &str) -> anyhow::Result<uuid::Uuid> {
    raw.parse()
        .with_context(|| format!("Invalid {what}: '{raw}' is not a UUID"))
}

pub fn status_cell(status: Status) -> Cell {
    let color = match status {
        Status::Succeeded => Color::Green,
        Status::Failed | Status::Expired => Color::Red,
        Status::Aborted => Color::Magenta,
        Status::Running => Color::Cyan,
        Status::Suspended | Status::Paused => Color::Yellow,
        Status::Queued | Status::Skipped => Color::DarkGrey,
    };
    Cell::new(status.as_str()).fg(color)
}

pub fn styled_status(status: Status) -> String {
    let text = status.as_str();
    match status {
        Status::Succeeded => style(text).green().to_string(),
        Status::Failed | Status::Expired => style(text).red().to_string(),
        Status::Aborted => style(text).magenta().to_string(),
        Status::Running => style(text).cyan().to_string(),
        Status::Suspended | Status::Paused => style(text).yellow().to_string(),
        Status::Queued | Status::Skipped => style(text).dim().to_string(),
    }
}
