//! CLI commands that signal running plans: notify and interrupt.

use anyhow::{Context, Result};
use console::style;
use serde_json::{Value, json};

use planwright_types::interrupt::{Interrupt, InterruptType};
use planwright_types::notify::NotifyPayload;

use crate::cli::{parse_json_arg, parse_uuid_arg};
use crate::state::AppState;

pub async fn handle_notify(
    correlation_id: &str,
    payload: Option<&str>,
    is_error: bool,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let data = parse_json_arg(payload, "payload", Value::Null)?;
    let payload = if is_error {
        NotifyPayload::error(data)
    } else {
        NotifyPayload::ok(data)
    };
    let delivered = state
        .strategy()
        .notify(correlation_id, payload)
        .await
        .with_context(|| format!("Failed to deliver payload for '{correlation_id}'"))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "correlation_id": correlation_id,
                "delivered": delivered,
            }))?
        );
    } else if delivered {
        println!(
            "  {} Delivered payload for {}",
            style("✓").green().bold(),
            style(correlation_id).cyan()
        );
    } else {
        println!(
            "  {} A payload for {} was already delivered; ignored",
            style("!").yellow().bold(),
            style(correlation_id).cyan()
        );
    }
    Ok(())
}

pub async fn handle_interrupt(
    id: &str,
    kind: &str,
    node: Option<&str>,
    reason: Option<String>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let plan_execution_id = parse_uuid_arg(id, "plan execution id")?;
    let interrupt_type: InterruptType = kind.parse().map_err(|e: String| anyhow::anyhow!(e))?;

    let mut interrupt = Interrupt::new(plan_execution_id, interrupt_type);
    if let Some(node) = node {
        interrupt = interrupt.for_node(parse_uuid_arg(node, "node execution id")?);
    }
    if let Some(reason) = reason {
        interrupt = interrupt.with_reason(reason);
    }

    let applied = state
        .strategy()
        .interrupt(interrupt)
        .await
        .with_context(|| format!("Failed to {kind} plan execution {plan_execution_id}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&applied)?);
    } else {
        println!(
            "  {} {} applied to {}",
            style("✓").green().bold(),
            style(applied.interrupt_type.as_str()).bold(),
            style(plan_execution_id).cyan()
        );
    }
    Ok(())
}
