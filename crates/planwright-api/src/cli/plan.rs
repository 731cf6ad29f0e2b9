//! CLI plan subcommands: register, list, validate.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, ContentArrangement, Table, presets};
use console::style;

use planwright_core::engine::parse_plan_yaml;
use planwright_types::plan::Plan;

use crate::state::AppState;

#[derive(Subcommand)]
pub enum PlanCommand {
    /// Register (or replace) a plan from a YAML file.
    Register {
        /// Path to the plan YAML file.
        file: PathBuf,
    },

    /// List registered plans.
    List,

    /// Parse and validate a plan file without registering it.
    Validate {
        /// Path to the plan YAML file.
        file: PathBuf,
    },
}

/// `plan validate` needs no database, so it runs before state is built.
pub async fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let yaml = read_plan_file(file).await?;
    let plan = parse_plan_yaml(&yaml).map_err(|e| anyhow::anyhow!("Plan validation failed: {e}"))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "valid": true,
                "id": plan.id,
                "nodes": plan.nodes.len(),
            }))?
        );
    } else {
        println!(
            "  {} Plan '{}' is valid ({} nodes, root '{}')",
            style("✓").green().bold(),
            style(&plan.id).cyan(),
            plan.nodes.len(),
            plan.root,
        );
    }
    Ok(())
}

pub async fn handle_plan_command(cmd: PlanCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        PlanCommand::Register { file } => handle_register(&file, state, json).await,
        PlanCommand::List => handle_list(state, json).await,
        PlanCommand::Validate { file } => handle_validate(&file, json).await,
    }
}

async fn handle_register(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let yaml = read_plan_file(file).await?;
    let plan = state
        .plans
        .register_plan(&yaml)
        .await
        .with_context(|| format!("Failed to register plan from {}", file.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!(
            "  {} Registered plan '{}' ({} nodes)",
            style("✓").green().bold(),
            style(&plan.id).cyan(),
            plan.nodes.len()
        );
        println!(
            "  {}",
            style(format!("Start it with: pwr run {}", plan.id)).dim()
        );
    }
    Ok(())
}

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let plans = state.plans.list_plans().await.context("Failed to list plans")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plans)?);
        return Ok(());
    }
    if plans.is_empty() {
        println!("  No plans registered. Use `pwr plan register <file>` to add one.");
        return Ok(());
    }
    println!("{}", plans_table(&plans));
    Ok(())
}

fn plans_table(plans: &[Plan]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["ID", "Name", "Root", "Nodes", "Description"]);
    for plan in plans {
        table.add_row(vec![
            Cell::new(&plan.id),
            Cell::new(&plan.name),
            Cell::new(&plan.root),
            Cell::new(plan.nodes.len()),
            Cell::new(plan.description.as_deref().unwrap_or("-")),
        ]);
    }
    table
}

async fn read_plan_file(file: &Path) -> Result<String> {
    tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read plan file {}", file.display()))
}
