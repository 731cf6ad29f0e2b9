//! Built-in step handlers.

use planwright_types::execution::{FailureInfo, FailureType, StepResponse};
use planwright_types::notify::NotifyPayload;
use serde_json::{Value, json};

use super::{StepContext, StepError, StepHandler, failure_from_value};

/// A scope node whose only work is running its children.
pub struct SectionStep;

impl StepHandler for SectionStep {
    fn step_type(&self) -> &str {
        "section"
    }
}

pub struct NoopStep;

impl StepHandler for NoopStep {
    fn step_type(&self) -> &str {
        "noop"
    }

    async fn execute(&self, _step: &StepContext) -> Result<StepResponse, StepError> {
        Ok(StepResponse::succeeded(None))
    }
}

/// Outputs its resolved parameters, inline or through a task worker.
pub struct EchoStep;

impl StepHandler for EchoStep {
    fn step_type(&self) -> &str {
        "echo"
    }

    async fn execute(&self, step: &StepContext) -> Result<StepResponse, StepError> {
        let outputs = (!step.parameters.is_null()).then(|| step.parameters.clone());
        Ok(StepResponse::succeeded(outputs))
    }

    fn build_task(&self, step: &StepContext) -> Result<Value, StepError> {
        Ok(step.parameters.clone())
    }
}

/// Always fails.
///
/// Parameters: `message`, `failure_types`, and `raise` (report the failure
/// as a handler error rather than a failed response).
pub struct FailStep;

impl StepHandler for FailStep {
    fn step_type(&self) -> &str {
        "fail"
    }

    async fn execute(&self, step: &StepContext) -> Result<StepResponse, StepError> {
        let message = step.param_str("message").unwrap_or("step failed").to_string();
        if step.parameters.get("raise").and_then(Value::as_bool).unwrap_or(false) {
            return Err(StepError::Failed(message));
        }
        let info = failure_from_value(&json!({
            "message": message,
            "failure_types": step.parameters.get("failure_types").cloned().unwrap_or(Value::Null),
        }));
        Ok(StepResponse::failed(info))
    }
}

/// Consumes manual input of the form `{"approved": bool, "by": "..."}`.
pub struct ApprovalStep;

impl StepHandler for ApprovalStep {
    fn step_type(&self) -> &str {
        "approval"
    }

    async fn execute(&self, step: &StepContext) -> Result<StepResponse, StepError> {
        let input = step
            .record
            .execution_input
            .as_ref()
            .ok_or_else(|| StepError::InvalidParameters("approval requires manual input".into()))?;
        let approved = input.get("approved").and_then(Value::as_bool).unwrap_or(false);
        if approved {
            return Ok(StepResponse::succeeded(Some(input.clone())));
        }
        let by = input.get("by").and_then(Value::as_str).unwrap_or("operator");
        Ok(StepResponse::failed(
            FailureInfo::new(format!("rejected by {by}")).with_type(FailureType::Application),
        ))
    }
}

/// Runs a shell command on a task worker.
///
/// Parameters: `command` (required), `timeout_secs`, `working_dir`.
pub struct ShellStep;

impl StepHandler for ShellStep {
    fn step_type(&self) -> &str {
        "shell"
    }

    fn build_task(&self, step: &StepContext) -> Result<Value, StepError> {
        let command = step
            .param_str("command")
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| StepError::InvalidParameters("shell step requires 'command'".into()))?;

        let mut task = json!({ "command": command });
        if let Some(timeout) = step.parameters.get("timeout_secs").and_then(Value::as_u64) {
            task["timeout_secs"] = json!(timeout);
        }
        if let Some(dir) = step.param_str("working_dir") {
            task["working_dir"] = json!(dir);
        }
        Ok(task)
    }

    fn handle_task_response(&self, _step: &StepContext, payload: &NotifyPayload) -> Result<StepResponse, StepError> {
        if payload.is_error {
            return Ok(StepResponse::failed(failure_from_value(&payload.data)));
        }
        let exit_code = payload
            .data
            .get("exit_code")
            .and_then(Value::as_i64)
            .ok_or_else(|| StepError::InvalidResponse("shell result has no exit_code".into()))?;
        if exit_code != 0 {
            let stderr = payload.data.get("stderr").and_then(Value::as_str).unwrap_or("").trim();
            return Ok(StepResponse::failed(
                FailureInfo::new(format!("command exited with status {exit_code}: {stderr}"))
                    .with_type(FailureType::Application),
            ));
        }
        Ok(StepResponse::succeeded(Some(payload.data.clone())))
    }
}
