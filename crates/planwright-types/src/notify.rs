//! Wait/notify registry records.
//!
//! A wait is a durable pending continuation keyed by one or more opaque
//! correlation ids. Any process holding an id may deliver a payload for it;
//! once every id of a wait has a payload, the first claimant of the wait
//! receives all of them and runs the continuation named by its callback.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A payload delivered against a correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyPayload {
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub is_error: bool,
    pub delivered_at: DateTime<Utc>,
}

impl NotifyPayload {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            data,
            is_error: false,
            delivered_at: Utc::now(),
        }
    }

    pub fn error(data: serde_json::Value) -> Self {
        Self {
            data,
            is_error: true,
            delivered_at: Utc::now(),
        }
    }
}

/// Wire envelope accepted from the external callback transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackEnvelope {
    pub correlation_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub is_error: bool,
}

impl CallbackEnvelope {
    pub fn into_payload(self) -> (String, NotifyPayload) {
        let payload = NotifyPayload {
            data: self.payload,
            is_error: self.is_error,
            delivered_at: Utc::now(),
        };
        (self.correlation_id, payload)
    }
}

/// Which continuation runs once a wait is claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeKind {
    /// Resume the node with step responses (async task result or child notifications).
    StepResponse,
    /// Manual input arrived for a node waiting before facilitation.
    ExecutionInput,
    /// An operator resolved a manual intervention.
    Intervention,
}

impl ResumeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResumeKind::StepResponse => "step_response",
            ResumeKind::ExecutionInput => "execution_input",
            ResumeKind::Intervention => "intervention",
        }
    }
}

impl FromStr for ResumeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "step_response" => Ok(ResumeKind::StepResponse),
            "execution_input" => Ok(ResumeKind::ExecutionInput),
            "intervention" => Ok(ResumeKind::Intervention),
            other => Err(format!("invalid resume kind: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCallback {
    pub node_execution_id: Uuid,
    pub plan_execution_id: Uuid,
    pub kind: ResumeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    Pending,
    Claimed,
    Discarded,
}

impl WaitState {
    pub fn as_str(self) -> &'static str {
        match self {
            WaitState::Pending => "pending",
            WaitState::Claimed => "claimed",
            WaitState::Discarded => "discarded",
        }
    }
}

impl FromStr for WaitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WaitState::Pending),
            "claimed" => Ok(WaitState::Claimed),
            "discarded" => Ok(WaitState::Discarded),
            other => Err(format!("invalid wait state: '{other}'")),
        }
    }
}

/// A registered wait over a set of correlation ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitInstance {
    pub id: Uuid,
    pub correlation_ids: Vec<String>,
    pub callback: ResumeCallback,
    pub state: WaitState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl WaitInstance {
    pub fn new(correlation_ids: Vec<String>, callback: ResumeCallback) -> Self {
        Self {
            id: Uuid::now_v7(),
            correlation_ids,
            callback,
            state: WaitState::Pending,
            created_at: Utc::now(),
            claimed_at: None,
        }
    }
}

/// Result of a successful claim: the wait and every payload it waited on.
#[derive(Debug, Clone)]
pub struct ClaimedWait {
    pub wait: WaitInstance,
    pub responses: BTreeMap<String, NotifyPayload>,
}

/// Operator decision that resolves a manual intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionAction {
    Retry,
    Ignore,
    MarkFailed,
    Abort,
}

impl fmt::Display for InterventionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InterventionAction::Retry => "retry",
            InterventionAction::Ignore => "ignore",
            InterventionAction::MarkFailed => "mark_failed",
            InterventionAction::Abort => "abort",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_defaults() {
        let env: CallbackEnvelope =
            serde_json::from_value(json!({"correlation_id": "abc"})).unwrap();
        let (id, payload) = env.into_payload();
        assert_eq!(id, "abc");
        assert!(!payload.is_error);
        assert!(payload.data.is_null());
    }

    #[test]
    fn new_wait_is_pending() {
        let wait = WaitInstance::new(
            vec!["a".into(), "b".into()],
            ResumeCallback {
                node_execution_id: Uuid::now_v7(),
                plan_execution_id: Uuid::now_v7(),
                kind: ResumeKind::StepResponse,
            },
        );
        assert_eq!(wait.state, WaitState::Pending);
        assert!(wait.claimed_at.is_none());
    }

    #[test]
    fn resume_kind_round_trips_through_str() {
        for kind in [
            ResumeKind::StepResponse,
            ResumeKind::ExecutionInput,
            ResumeKind::Intervention,
        ] {
            assert_eq!(kind.as_str().parse::<ResumeKind>().unwrap(), kind);
        }
    }
}
