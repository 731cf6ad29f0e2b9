//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Plans
        .route(
            "/plans",
            post(handlers::plan::register_plan).get(handlers::plan::list_plans),
        )
        .route(
            "/plans/{id}/executions",
            post(handlers::plan::start_execution).get(handlers::plan::list_executions),
        )
        // Executions
        .route("/executions/{id}", get(handlers::execution::get_execution))
        .route("/executions/{id}/nodes", get(handlers::execution::list_nodes))
        .route(
            "/executions/{id}/interrupts",
            post(handlers::execution::create_interrupt),
        )
        // Callback transport
        .route("/callbacks", post(handlers::callback::receive_callback));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Simple health check endpoint.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use planwright_core::engine::wait::input_correlation_id;
    use uuid::Uuid;

    use super::*;
    use crate::state::test_state;

    const GATED: &str = r#"
id: gated
name: Gated release
root: approve
nodes:
  - id: approve
    type: approval
    requires_input: true
"#;

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(Value::String(text)) => request.body(Body::from(text)).unwrap(),
            Some(json) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (state, _dir) = test_state().await;
        let router = build_router(state);
        let (status, body) = send(&router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn invalid_plan_is_rejected() {
        let (state, _dir) = test_state().await;
        let router = build_router(state);
        let yaml = "id: broken\nname: Broken\nroot: missing\nnodes:\n  - id: only\n    type: noop\n";
        let (status, body) = send(&router, "POST", "/api/v1/plans", Some(Value::String(yaml.into()))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errors"][0]["code"], "INVALID_PLAN");
    }

    #[tokio::test]
    async fn unknown_resources_are_not_found() {
        let (state, _dir) = test_state().await;
        let router = build_router(state);

        let (status, body) = send(&router, "POST", "/api/v1/plans/ghost/executions", Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errors"][0]["code"], "PLAN_NOT_FOUND");

        let uri = format!("/api/v1/executions/{}", Uuid::now_v7());
        let (status, body) = send(&router, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errors"][0]["code"], "EXECUTION_NOT_FOUND");
    }

    #[tokio::test]
    async fn callback_resumes_a_plan_waiting_for_input() {
        let (state, _dir) = test_state().await;
        let router = build_router(state.clone());

        let (status, body) = send(&router, "POST", "/api/v1/plans", Some(Value::String(GATED.into()))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["id"], "gated");

        let (status, body) = send(&router, "POST", "/api/v1/plans/gated/executions", Some(json!({"inputs": {}}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let execution_id = body["data"]["id"].as_str().unwrap().to_string();
        state.strategy().jobs().wait_idle().await;

        let (status, body) = send(&router, "GET", &format!("/api/v1/executions/{execution_id}/nodes"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["status"], "queued");
        let node_id: Uuid = body["data"][0]["id"].as_str().unwrap().parse().unwrap();

        let envelope = json!({
            "correlation_id": input_correlation_id(&node_id),
            "payload": {"approved": true, "by": "ana"},
        });
        let (status, body) = send(&router, "POST", "/api/v1/callbacks", Some(envelope.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["delivered"], true);

        let (_, body) = send(&router, "POST", "/api/v1/callbacks", Some(envelope)).await;
        assert_eq!(body["data"]["delivered"], false);
        state.strategy().jobs().wait_idle().await;

        let (status, body) = send(&router, "GET", &format!("/api/v1/executions/{execution_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "succeeded");
        state.shutdown().await;
    }

    #[tokio::test]
    async fn interrupts_on_finished_plans_conflict() {
        let (state, _dir) = test_state().await;
        let router = build_router(state.clone());
        let yaml = "id: quick\nname: Quick\nroot: hello\nnodes:\n  - id: hello\n    type: noop\n";
        send(&router, "POST", "/api/v1/plans", Some(Value::String(yaml.into()))).await;
        let (_, body) = send(&router, "POST", "/api/v1/plans/quick/executions", None).await;
        let execution_id = body["data"]["id"].as_str().unwrap().to_string();
        state.strategy().jobs().wait_idle().await;

        let uri = format!("/api/v1/executions/{execution_id}/interrupts");
        let (status, body) = send(&router, "POST", &uri, Some(json!({"type": "abort", "reason": "too late"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["errors"][0]["code"], "INTERRUPT_REJECTED");
    }

    #[tokio::test]
    async fn empty_correlation_id_is_invalid() {
        let (state, _dir) = test_state().await;
        let router = build_router(state);
        let (status, _) = send(&router, "POST", "/api/v1/callbacks", Some(json!({"correlation_id": " "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
