//! Plan execution inspection and interrupt handlers.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

use planwright_types::execution::{NodeExecution, PlanExecution};
use planwright_types::interrupt::{Interrupt, InterruptType};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Body of `POST /executions/{id}/interrupts`.
#[derive(Debug, Deserialize)]
pub struct InterruptRequest {
    #[serde(rename = "type")]
    pub interrupt_type: InterruptType,
    #[serde(default)]
    pub node_execution_id: Option<Uuid>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// GET /api/v1/executions/{id}
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<PlanExecution>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let execution = state.plans.get_execution(&id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let nodes = format!("/api/v1/executions/{id}/nodes");
    Ok(Json(
        ApiResponse::success(execution, request_id, elapsed).with_link("nodes", &nodes),
    ))
}

/// GET /api/v1/executions/{id}/nodes - Every node execution, in creation order.
pub async fn list_nodes(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<NodeExecution>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state.plans.get_execution(&id).await?;
    let nodes = state.plans.list_nodes(&id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(nodes, request_id, elapsed)))
}

/// POST /api/v1/executions/{id}/interrupts - Register and apply an interrupt.
pub async fn create_interrupt(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<InterruptRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Interrupt>>), AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let mut interrupt = Interrupt::new(id, body.interrupt_type);
    if let Some(node) = body.node_execution_id {
        interrupt = interrupt.for_node(node);
    }
    if let Some(reason) = body.reason {
        interrupt = interrupt.with_reason(reason);
    }
    let applied = state.strategy().interrupt(interrupt).await?;
    tracing::info!(
        plan_execution_id = %id,
        interrupt_type = applied.interrupt_type.as_str(),
        "interrupt applied"
    );

    let elapsed = start.elapsed().as_millis() as u64;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(applied, request_id, elapsed))))
}
