//! Step handlers: the per-step-type logic a node runs.
//!
//! `StepHandler` uses native async fn in traits, so it is not object-safe.
//! Following the blanket-impl pattern:
//! 1. `StepHandlerDyn` is the object-safe twin with boxed futures
//! 2. every `T: StepHandler` implements `StepHandlerDyn`
//! 3. `BoxStepHandler` wraps `Box<dyn StepHandlerDyn>` and delegates
//!
//! Handlers are registered by step-type tag in a `StepRegistry`.

pub mod builtin;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use planwright_types::execution::{
    FailureInfo, FailureType, NodeExecution, Status, StepResponse, StepResponseNotifyData,
};
use planwright_types::notify::NotifyPayload;
use planwright_types::plan::NodeTemplate;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("step type '{step_type}' does not support {mode} execution")]
    Unsupported { step_type: String, mode: &'static str },

    #[error("no step handler registered for '{0}'")]
    UnknownStepType(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid step response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Failed(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

/// Everything a handler sees of the node it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub record: NodeExecution,
    pub template: NodeTemplate,
    /// Resolved parameters; manual input is merged under `input`.
    pub parameters: Value,
}

impl StepContext {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

fn unsupported(step_type: &str, mode: &'static str) -> StepError {
    StepError::Unsupported {
        step_type: step_type.to_string(),
        mode,
    }
}

pub trait StepHandler: Send + Sync {
    fn step_type(&self) -> &str;

    /// Run the step inline and report its outcome.
    fn execute(&self, _step: &StepContext) -> impl Future<Output = Result<StepResponse, StepError>> + Send {
        let err = unsupported(self.step_type(), "inline");
        async move { Err(err) }
    }

    /// Payload handed to an external worker in async-task mode.
    fn build_task(&self, step: &StepContext) -> Result<Value, StepError> {
        let _ = step;
        Err(unsupported(self.step_type(), "async task"))
    }

    /// Turn the worker's callback into a step response.
    fn handle_task_response(&self, step: &StepContext, payload: &NotifyPayload) -> Result<StepResponse, StepError> {
        let _ = step;
        task_response_from_payload(payload)
    }

    /// Template node ids to spawn in children mode.
    fn obtain_children(&self, step: &StepContext) -> Result<Vec<String>, StepError> {
        Ok(step.template.child_ids())
    }

    fn handle_children_response(&self, step: &StepContext, responses: &[StepResponseNotifyData]) -> StepResponse {
        let _ = step;
        aggregate_children(responses)
    }
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

/// Build failure info from an error payload (`{message, failure_types}`, a
/// bare string, or anything else).
pub fn failure_from_value(data: &Value) -> FailureInfo {
    let message = match data {
        Value::String(s) => s.clone(),
        Value::Object(fields) => fields
            .get("message")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| data.to_string()),
        Value::Null => "task reported an error".to_string(),
        other => other.to_string(),
    };
    let failure_types: Vec<FailureType> = data
        .get("failure_types")
        .and_then(|types| serde_json::from_value(types.clone()).ok())
        .unwrap_or_default();

    let mut info = FailureInfo::new(message);
    if failure_types.is_empty() {
        info = info.with_type(FailureType::Application);
    }
    for failure_type in failure_types {
        info = info.with_type(failure_type);
    }
    info
}

/// Default callback interpretation.
///
/// Error payloads fail the node; a payload carrying a `status` field is read
/// as a full `StepResponse`; anything else is a success with the payload as
/// outputs.
pub fn task_response_from_payload(payload: &NotifyPayload) -> Result<StepResponse, StepError> {
    if payload.is_error {
        return Ok(StepResponse::failed(failure_from_value(&payload.data)));
    }
    if payload.data.get("status").is_some() {
        let response: StepResponse = serde_json::from_value(payload.data.clone())
            .map_err(|e| StepError::InvalidResponse(e.to_string()))?;
        if !response.status.is_terminal() {
            return Err(StepError::InvalidResponse(format!(
                "status '{}' is not terminal",
                response.status
            )));
        }
        return Ok(response);
    }
    let outputs = (!payload.data.is_null()).then(|| payload.data.clone());
    Ok(StepResponse::succeeded(outputs))
}

/// Default aggregation of child notifications into the parent's outcome.
///
/// Any failed/expired child that was not ignored fails the parent; otherwise
/// any aborted child aborts it; all-skipped children skip it; else it
/// succeeds with the children's outputs keyed by identifier.
pub fn aggregate_children(responses: &[StepResponseNotifyData]) -> StepResponse {
    let failed: Vec<&str> = responses
        .iter()
        .filter(|r| r.status.is_broken() && !r.failure_ignored)
        .map(|r| r.identifier.as_str())
        .collect();
    if !failed.is_empty() {
        let info = FailureInfo::new(format!(
            "{} child node(s) failed: {}",
            failed.len(),
            failed.join(", ")
        ))
        .with_type(FailureType::Application);
        return StepResponse::failed(info);
    }

    if responses.iter().any(|r| r.status == Status::Aborted) {
        return StepResponse::with_status(Status::Aborted);
    }
    if !responses.is_empty() && responses.iter().all(|r| r.status == Status::Skipped) {
        return StepResponse::with_status(Status::Skipped);
    }

    let outputs: serde_json::Map<String, Value> = responses
        .iter()
        .filter_map(|r| r.outputs.clone().map(|o| (r.identifier.clone(), o)))
        .collect();
    StepResponse::succeeded((!outputs.is_empty()).then_some(Value::Object(outputs)))
}

// ---------------------------------------------------------------------------
// Dynamic dispatch
// ---------------------------------------------------------------------------

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn step_type(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        step: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<StepResponse, StepError>> + Send + 'a>>;

    fn build_task(&self, step: &StepContext) -> Result<Value, StepError>;

    fn handle_task_response(&self, step: &StepContext, payload: &NotifyPayload) -> Result<StepResponse, StepError>;

    fn obtain_children(&self, step: &StepContext) -> Result<Vec<String>, StepError>;

    fn handle_children_response(&self, step: &StepContext, responses: &[StepResponseNotifyData]) -> StepResponse;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn step_type(&self) -> &str {
        StepHandler::step_type(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        step: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<StepResponse, StepError>> + Send + 'a>> {
        Box::pin(self.execute(step))
    }

    fn build_task(&self, step: &StepContext) -> Result<Value, StepError> {
        StepHandler::build_task(self, step)
    }

    fn handle_task_response(&self, step: &StepContext, payload: &NotifyPayload) -> Result<StepResponse, StepError> {
        StepHandler::handle_task_response(self, step, payload)
    }

    fn obtain_children(&self, step: &StepContext) -> Result<Vec<String>, StepError> {
        StepHandler::obtain_children(self, step)
    }

    fn handle_children_response(&self, step: &StepContext, responses: &[StepResponseNotifyData]) -> StepResponse {
        StepHandler::handle_children_response(self, step, responses)
    }
}

/// Type-erased step handler.
pub struct BoxStepHandler {
    inner: Box<dyn StepHandlerDyn + Send + Sync>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub fn step_type(&self) -> &str {
        self.inner.step_type()
    }

    pub async fn execute(&self, step: &StepContext) -> Result<StepResponse, StepError> {
        self.inner.execute_boxed(step).await
    }

    pub fn build_task(&self, step: &StepContext) -> Result<Value, StepError> {
        self.inner.build_task(step)
    }

    pub fn handle_task_response(&self, step: &StepContext, payload: &NotifyPayload) -> Result<StepResponse, StepError> {
        self.inner.handle_task_response(step, payload)
    }

    pub fn obtain_children(&self, step: &StepContext) -> Result<Vec<String>, StepError> {
        self.inner.obtain_children(step)
    }

    pub fn handle_children_response(&self, step: &StepContext, responses: &[StepResponseNotifyData]) -> StepResponse {
        self.inner.handle_children_response(step, responses)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Step handlers keyed by step-type tag.
pub struct StepRegistry {
    handlers: HashMap<String, BoxStepHandler>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with `section`, `noop`, `echo`, `fail`, `approval` and `shell`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(builtin::SectionStep);
        registry.register(builtin::NoopStep);
        registry.register(builtin::EchoStep);
        registry.register(builtin::FailStep);
        registry.register(builtin::ApprovalStep);
        registry.register(builtin::ShellStep);
        registry
    }

    /// Register a handler under its own step type, replacing any previous one.
    pub fn register<T: StepHandler + 'static>(&mut self, handler: T) {
        let step_type = StepHandler::step_type(&handler).to_string();
        self.handlers.insert(step_type, BoxStepHandler::new(handler));
    }

    pub fn get(&self, step_type: &str) -> Result<&BoxStepHandler, StepError> {
        self.handlers
            .get(step_type)
            .ok_or_else(|| StepError::UnknownStepType(step_type.to_string()))
    }

    pub fn step_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn child(identifier: &str, status: Status, ignored: bool, outputs: Option<Value>) -> StepResponseNotifyData {
        StepResponseNotifyData {
            node_execution_id: Uuid::now_v7(),
            node_id: identifier.into(),
            identifier: identifier.into(),
            status,
            outputs,
            failure_info: None,
            ended_at: Utc::now(),
            failure_ignored: ignored,
        }
    }

    #[test]
    fn aggregate_all_succeeded_collects_outputs() {
        let resp = aggregate_children(&[
            child("build", Status::Succeeded, false, Some(json!({"artifact": "a"}))),
            child("lint", Status::Skipped, false, None),
        ]);
        assert_eq!(resp.status, Status::Succeeded);
        assert_eq!(resp.outputs, Some(json!({"build": {"artifact": "a"}})));
    }

    #[test]
    fn aggregate_failure_wins_unless_ignored() {
        let resp = aggregate_children(&[
            child("build", Status::Succeeded, false, None),
            child("test", Status::Failed, false, None),
            child("lint", Status::Aborted, false, None),
        ]);
        assert_eq!(resp.status, Status::Failed);
        assert!(resp.failure_info.unwrap().message.contains("test"));

        let resp = aggregate_children(&[
            child("build", Status::Succeeded, false, None),
            child("test", Status::Failed, true, None),
        ]);
        assert_eq!(resp.status, Status::Succeeded);
    }

    #[test]
    fn aggregate_abort_and_skip() {
        let resp = aggregate_children(&[
            child("a", Status::Aborted, false, None),
            child("b", Status::Succeeded, false, None),
        ]);
        assert_eq!(resp.status, Status::Aborted);

        let resp = aggregate_children(&[child("a", Status::Skipped, false, None)]);
        assert_eq!(resp.status, Status::Skipped);

        assert_eq!(aggregate_children(&[]).status, Status::Succeeded);
    }

    #[test]
    fn task_payload_interpretation() {
        let ok = task_response_from_payload(&NotifyPayload::ok(json!({"rows": 3}))).unwrap();
        assert_eq!(ok.status, Status::Succeeded);
        assert_eq!(ok.outputs, Some(json!({"rows": 3})));

        let err = task_response_from_payload(&NotifyPayload::error(json!({
            "message": "deadline exceeded",
            "failure_types": ["timeout"]
        })))
        .unwrap();
        assert_eq!(err.status, Status::Expired);

        let explicit = task_response_from_payload(&NotifyPayload::ok(json!({"status": "skipped"}))).unwrap();
        assert_eq!(explicit.status, Status::Skipped);

        assert!(task_response_from_payload(&NotifyPayload::ok(json!({"status": "running"}))).is_err());
    }

    #[test]
    fn failure_from_bare_string() {
        let info = failure_from_value(&json!("disk full"));
        assert_eq!(info.message, "disk full");
        assert_eq!(info.failure_types, vec![FailureType::Application]);
    }

    #[test]
    fn registry_lookup() {
        let registry = StepRegistry::with_builtins();
        assert_eq!(
            registry.step_types(),
            vec!["approval", "echo", "fail", "noop", "section", "shell"]
        );
        assert!(matches!(
            registry.get("teleport"),
            Err(StepError::UnknownStepType(_))
        ));
        assert_eq!(registry.get("echo").unwrap().step_type(), "echo");
    }
}
