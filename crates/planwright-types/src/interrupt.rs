//! Interrupt records: externally raised control signals against a plan or node.
//!
//! Interrupts are consumed, not deleted. A processed interrupt stays visible
//! to the run/skip checkers until a later interrupt discards it (e.g. a
//! resume discards the pause it answers).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptType {
    Pause,
    Resume,
    Abort,
    /// Retry a node parked on manual intervention.
    Retry,
    /// Ignore the failure of a node parked on manual intervention.
    Ignore,
    /// End a node parked on manual intervention as failed.
    MarkFailed,
    Skip,
}

impl InterruptType {
    pub fn as_str(self) -> &'static str {
        match self {
            InterruptType::Pause => "pause",
            InterruptType::Resume => "resume",
            InterruptType::Abort => "abort",
            InterruptType::Retry => "retry",
            InterruptType::Ignore => "ignore",
            InterruptType::MarkFailed => "mark_failed",
            InterruptType::Skip => "skip",
        }
    }
}

impl fmt::Display for InterruptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterruptType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pause" => Ok(InterruptType::Pause),
            "resume" => Ok(InterruptType::Resume),
            "abort" => Ok(InterruptType::Abort),
            "retry" => Ok(InterruptType::Retry),
            "ignore" => Ok(InterruptType::Ignore),
            "mark_failed" | "mark-failed" => Ok(InterruptType::MarkFailed),
            "skip" => Ok(InterruptType::Skip),
            other => Err(format!("invalid interrupt type: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptState {
    Registered,
    Processed,
    Discarded,
}

impl InterruptState {
    pub fn as_str(self) -> &'static str {
        match self {
            InterruptState::Registered => "registered",
            InterruptState::Processed => "processed",
            InterruptState::Discarded => "discarded",
        }
    }
}

impl FromStr for InterruptState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(InterruptState::Registered),
            "processed" => Ok(InterruptState::Processed),
            "discarded" => Ok(InterruptState::Discarded),
            other => Err(format!("invalid interrupt state: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub id: Uuid,
    pub plan_execution_id: Uuid,
    /// `None` targets the whole plan execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_execution_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub interrupt_type: InterruptType,
    pub state: InterruptState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl Interrupt {
    pub fn new(plan_execution_id: Uuid, interrupt_type: InterruptType) -> Self {
        Self {
            id: Uuid::now_v7(),
            plan_execution_id,
            node_execution_id: None,
            interrupt_type,
            state: InterruptState::Registered,
            reason: None,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    pub fn for_node(mut self, node_execution_id: Uuid) -> Self {
        self.node_execution_id = Some(node_execution_id);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn is_active(&self) -> bool {
        self.state != InterruptState::Discarded
    }

    /// Plan-wide interrupts target every node; node interrupts only their node.
    pub fn targets(&self, node_execution_id: Uuid) -> bool {
        self.node_execution_id.is_none_or(|id| id == node_execution_id)
    }

    /// Like [`targets`](Self::targets), but a node interrupt also covers
    /// everything created beneath its node. `enclosing` holds the runtime ids
    /// of the node's enclosing levels.
    pub fn covers(&self, node_execution_id: Uuid, enclosing: &[Uuid]) -> bool {
        self.targets(node_execution_id)
            || self.node_execution_id.is_some_and(|id| enclosing.contains(&id))
    }
}
