//! CLI plan execution commands: run, status, nodes.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, ContentArrangement, Table, presets};
use console::style;
use serde_json::json;

use planwright_types::execution::{NodeExecution, PlanExecution};

use crate::cli::{parse_json_arg, parse_uuid_arg, status_cell, styled_status};
use crate::state::AppState;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub async fn handle_run(
    plan_id: &str,
    input: Option<&str>,
    wait: bool,
    timeout: Duration,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let inputs = parse_json_arg(input, "input", json!({}))?;
    if !inputs.is_object() {
        bail!("--input must be a JSON object");
    }

    let mut metadata = BTreeMap::new();
    metadata.insert("trigger".to_string(), "cli".to_string());
    let execution = state
        .plans
        .start_plan(plan_id, inputs, metadata)
        .await
        .with_context(|| format!("Failed to start plan '{plan_id}'"))?;

    let execution = if wait {
        if !json {
            println!(
                "  {} Started {} {}",
                style("▶").cyan().bold(),
                style(&execution.id).cyan(),
                style("(waiting for completion)").dim()
            );
        }
        wait_for_terminal(state, execution, timeout).await?
    } else {
        execution
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else if wait {
        print_execution(&execution);
    } else {
        println!(
            "  {} Started plan '{}' as {}",
            style("▶").cyan().bold(),
            style(plan_id).cyan(),
            style(&execution.id).bold()
        );
        println!(
            "  {}",
            style(format!("Check progress with: pwr status {}", execution.id)).dim()
        );
    }
    Ok(())
}

async fn wait_for_terminal(state: &AppState, execution: PlanExecution, timeout: Duration) -> Result<PlanExecution> {
    let id = execution.id;
    let poll = async {
        loop {
            let current = state.plans.get_execution(&id).await?;
            if current.status.is_terminal() {
                return Ok::<_, anyhow::Error>(current);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };
    match tokio::time::timeout(timeout, poll).await {
        Ok(result) => result,
        Err(_) => bail!("Plan execution {id} did not finish within {}s", timeout.as_secs()),
    }
}

pub async fn handle_status(id: &str, state: &AppState, json: bool) -> Result<()> {
    let id = parse_uuid_arg(id, "plan execution id")?;
    let execution = state.plans.get_execution(&id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else {
        print_execution(&execution);
    }
    Ok(())
}

fn print_execution(execution: &PlanExecution) {
    println!();
    println!("  {} {}", style("Plan execution").bold(), style(&execution.id).cyan());
    println!("  {:<10} {}", style("Plan").dim(), execution.plan_id);
    println!("  {:<10} {}", style("Status").dim(), styled_status(execution.status));
    println!(
        "  {:<10} {}",
        style("Started").dim(),
        execution.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(ended_at) = execution.ended_at {
        let took = ended_at - execution.started_at;
        println!(
            "  {:<10} {} ({}ms)",
            style("Ended").dim(),
            ended_at.format("%Y-%m-%d %H:%M:%S"),
            took.num_milliseconds()
        );
    }
    if let Some(failure) = &execution.failure_info {
        println!("  {:<10} {}", style("Failure").dim(), style(&failure.message).red());
    }
    println!();
}

pub async fn handle_nodes(id: &str, state: &AppState, json: bool) -> Result<()> {
    let id = parse_uuid_arg(id, "plan execution id")?;
    state.plans.get_execution(&id).await?;
    let nodes = state.plans.list_nodes(&id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&nodes)?);
        return Ok(());
    }
    if nodes.is_empty() {
        println!("  No node executions yet.");
        return Ok(());
    }
    println!("{}", nodes_table(&nodes));
    Ok(())
}

fn nodes_table(nodes: &[NodeExecution]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Node Execution", "Node", "Type", "Attempt", "Status", "Mode", "Failure"]);
    for node in nodes {
        let mode = node.mode.map(|m| format!("{m:?}")).unwrap_or_else(|| "-".to_string());
        let failure = node
            .failure_info
            .as_ref()
            .map(|f| f.message.clone())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(node.id),
            Cell::new(node.context.fqn()),
            Cell::new(&node.step_type),
            Cell::new(node.attempt),
            status_cell(node.status),
            Cell::new(mode),
            Cell::new(failure),
        ]);
    }
    table
}
