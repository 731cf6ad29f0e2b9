//! Plan registration and plan execution start handlers.

use std::collections::BTreeMap;
use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

use planwright_types::execution::PlanExecution;
use planwright_types::plan::Plan;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Body of `POST /plans/{id}/executions`.
#[derive(Debug, Default, Deserialize)]
pub struct StartPlanRequest {
    #[serde(default)]
    pub inputs: serde_json::Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    #[serde(default = "default_execution_limit")]
    pub limit: u32,
}

fn default_execution_limit() -> u32 {
    20
}

/// POST /api/v1/plans - Register a plan from its YAML (or JSON) definition.
pub async fn register_plan(
    State(state): State<AppState>,
    body: String,
) -> Result<(StatusCode, Json<ApiResponse<Plan>>), AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let plan = state.plans.register_plan(&body).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let link = format!("/api/v1/plans/{}/executions", plan.id);
    let resp = ApiResponse::success(plan, request_id, elapsed).with_link("executions", &link);
    Ok((StatusCode::CREATED, Json(resp)))
}

/// GET /api/v1/plans - List registered plans.
pub async fn list_plans(State(state): State<AppState>) -> Result<Json<ApiResponse<Vec<Plan>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let plans = state.plans.list_plans().await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(plans, request_id, elapsed).with_link("self", "/api/v1/plans"),
    ))
}

/// POST /api/v1/plans/{id}/executions - Start a plan execution.
///
/// Returns as soon as the root node is enqueued.
pub async fn start_execution(
    State(state): State<AppState>,
    Path(plan_id): Path<String>,
    body: Option<Json<StartPlanRequest>>,
) -> Result<(StatusCode, Json<ApiResponse<PlanExecution>>), AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let body = body.map(|Json(body)| body).unwrap_or_default();
    let execution = state.plans.start_plan(&plan_id, body.inputs, body.metadata).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let link = format!("/api/v1/executions/{}", execution.id);
    let resp = ApiResponse::success(execution, request_id, elapsed).with_link("self", &link);
    Ok((StatusCode::ACCEPTED, Json(resp)))
}

/// GET /api/v1/plans/{id}/executions - Most recent executions of a plan.
pub async fn list_executions(
    State(state): State<AppState>,
    Path(plan_id): Path<String>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<ApiResponse<Vec<PlanExecution>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state.plans.get_plan(&plan_id).await?;
    let executions = state.plans.list_executions(&plan_id, query.limit).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(executions, request_id, elapsed)))
}
