//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use planwright_core::engine::EngineError;

use super::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Errors raised by the engine or its repositories.
    Engine(EngineError),
    /// Malformed request.
    Validation(String),
    /// Generic internal error.
    Internal(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Engine(EngineError::PlanNotFound(id)) => {
                (StatusCode::NOT_FOUND, "PLAN_NOT_FOUND", format!("Plan '{id}' not found"))
            }
            AppError::Engine(e @ (EngineError::PlanExecutionNotFound(_) | EngineError::NodeExecutionNotFound(_))) => {
                (StatusCode::NOT_FOUND, "EXECUTION_NOT_FOUND", e.to_string())
            }
            AppError::Engine(EngineError::TemplateNotFound { .. } | EngineError::Plan(_)) => {
                (StatusCode::BAD_REQUEST, "INVALID_PLAN", self.message())
            }
            AppError::Engine(EngineError::Interrupt(msg)) => {
                (StatusCode::CONFLICT, "INTERRUPT_REJECTED", msg.clone())
            }
            AppError::Engine(EngineError::PersistenceConflict(msg)) => {
                (StatusCode::CONFLICT, "CONFLICT", msg.clone())
            }
            AppError::Engine(e) => (StatusCode::INTERNAL_SERVER_ERROR, "ENGINE_ERROR", e.to_string()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone()),
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Engine(e) => e.to_string(),
            AppError::Validation(msg) | AppError::Internal(msg) => msg.clone(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, %message, "request failed");
        }

        (status, Json(ApiResponse::failure(code, message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planwright_core::engine::PlanError;
    use uuid::Uuid;

    #[test]
    fn engine_errors_map_to_status_codes() {
        let cases = [
            (AppError::from(EngineError::PlanNotFound("nightly".into())), StatusCode::NOT_FOUND),
            (AppError::from(EngineError::PlanExecutionNotFound(Uuid::nil())), StatusCode::NOT_FOUND),
            (AppError::from(EngineError::Plan(PlanError::EmptyId)), StatusCode::BAD_REQUEST),
            (AppError::from(EngineError::Interrupt("already SUCCEEDED".into())), StatusCode::CONFLICT),
            (AppError::from(EngineError::Serialization("bad".into())), StatusCode::INTERNAL_SERVER_ERROR),
            (AppError::Validation("missing field".into()), StatusCode::BAD_REQUEST),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn invalid_plan_carries_the_validation_message() {
        let err = AppError::from(EngineError::Plan(PlanError::MissingRoot("start".into())));
        let (_, code, message) = err.parts();
        assert_eq!(code, "INVALID_PLAN");
        assert_eq!(message, "root node 'start' is not defined");
    }
}
