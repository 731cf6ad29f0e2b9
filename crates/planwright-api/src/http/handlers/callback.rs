//! Callback transport: delivers external payloads to the wait/notify registry.

use std::time::Instant;

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use uuid::Uuid;

use planwright_types::notify::CallbackEnvelope;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CallbackReceipt {
    pub correlation_id: String,
    /// `false` when a payload was already recorded for this correlation id.
    pub delivered: bool,
}

/// POST /api/v1/callbacks - Accept `{correlation_id, payload, is_error}`.
pub async fn receive_callback(
    State(state): State<AppState>,
    Json(envelope): Json<CallbackEnvelope>,
) -> Result<Json<ApiResponse<CallbackReceipt>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    if envelope.correlation_id.trim().is_empty() {
        return Err(AppError::Validation("correlation_id must not be empty".into()));
    }
    let (correlation_id, payload) = envelope.into_payload();
    let delivered = state.strategy().notify(&correlation_id, payload).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(
        CallbackReceipt {
            correlation_id,
            delivered,
        },
        request_id,
        elapsed,
    )))
}
