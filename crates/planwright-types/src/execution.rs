//! Node execution domain types.
//!
//! A `NodeExecution` is one runtime attempt at executing a `NodeTemplate`.
//! Records are created `Queued` and only ever move forward through the
//! status machine via conditional (compare-and-set) updates. A retry never
//! reopens a terminal record; it creates a new record linked via
//! `previous_id`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::notify::NotifyPayload;

// ---------------------------------------------------------------------------
// Status machine
// ---------------------------------------------------------------------------

/// Lifecycle status of a node execution (and, in aggregate, of a plan execution).
///
/// ```text
/// QUEUED -> RUNNING -> {SUSPENDED, PAUSED} -> RUNNING -> {SUCCEEDED, FAILED, ABORTED, EXPIRED, SKIPPED}
/// QUEUED -> {SKIPPED, ABORTED, PAUSED}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Queued,
    Running,
    /// Waiting on one or more notify ids (children or an external callback).
    Suspended,
    Paused,
    Succeeded,
    Failed,
    Aborted,
    Expired,
    Skipped,
}

impl Status {
    /// Statuses that are never re-opened.
    pub const TERMINAL: &'static [Status] = &[
        Status::Succeeded,
        Status::Failed,
        Status::Aborted,
        Status::Expired,
        Status::Skipped,
    ];

    /// Statuses from which a record may still move.
    pub const NON_TERMINAL: &'static [Status] = &[
        Status::Queued,
        Status::Running,
        Status::Suspended,
        Status::Paused,
    ];

    /// Statuses in which a delivered callback may resume the record.
    pub const RESUMABLE: &'static [Status] = &[
        Status::Queued,
        Status::Running,
        Status::Suspended,
        Status::Paused,
    ];

    /// Statuses in which a record is parked and waiting (no work in flight).
    pub const WAITING: &'static [Status] = &[Status::Queued, Status::Suspended, Status::Paused];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    pub fn is_resumable(self) -> bool {
        Self::RESUMABLE.contains(&self)
    }

    /// Failed or expired: the outcomes failure advisers react to.
    pub fn is_broken(self) -> bool {
        matches!(self, Status::Failed | Status::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Running => "running",
            Status::Suspended => "suspended",
            Status::Paused => "paused",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Aborted => "aborted",
            Status::Expired => "expired",
            Status::Skipped => "skipped",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Status::Queued),
            "running" => Ok(Status::Running),
            "suspended" => Ok(Status::Suspended),
            "paused" => Ok(Status::Paused),
            "succeeded" => Ok(Status::Succeeded),
            "failed" => Ok(Status::Failed),
            "aborted" => Ok(Status::Aborted),
            "expired" => Ok(Status::Expired),
            "skipped" => Ok(Status::Skipped),
            other => Err(format!("invalid status: '{other}'")),
        }
    }
}

/// How a started node runs, as decided by the facilitation resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run now, on the calling task, returning a step response.
    Inline,
    /// Hand off to an external worker; resumption arrives via notify.
    AsyncTask,
    /// Spawn child node executions and wait for all of them.
    Children,
}

// ---------------------------------------------------------------------------
// Execution context ("levels")
// ---------------------------------------------------------------------------

/// One entry in the path from the plan root to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    /// Template node id.
    pub node_id: String,
    /// Runtime id of the node execution at this level.
    pub runtime_id: Uuid,
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub step_type: String,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
}

fn default_attempt() -> u32 {
    1
}

/// Path of ancestor scopes from the plan root to the current node.
///
/// Passed by value through every engine call. Descending into a child scope
/// clones and extends it; a context handed to a child is never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub plan_execution_id: Uuid,
    pub plan_id: String,
    #[serde(default)]
    pub levels: Vec<Level>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ExecutionContext {
    /// Context of a plan execution's outermost scope (no levels yet).
    pub fn new(plan_execution_id: Uuid, plan_id: impl Into<String>) -> Self {
        Self {
            plan_execution_id,
            plan_id: plan_id.into(),
            levels: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// A new context one level deeper.
    pub fn child(&self, level: Level) -> Self {
        let mut next = self.clone();
        next.levels.push(level);
        next
    }

    /// The scope that contains the current node (its leaf level removed).
    pub fn parent_scope(&self) -> Self {
        let mut scope = self.clone();
        scope.levels.pop();
        scope
    }

    pub fn leaf(&self) -> Option<&Level> {
        self.levels.last()
    }

    /// Runtime id of the node this context points at.
    pub fn runtime_id(&self) -> Option<Uuid> {
        self.leaf().map(|l| l.runtime_id)
    }

    /// Dot-joined identifiers from root to leaf, e.g. `pipeline.build.compile`.
    pub fn fqn(&self) -> String {
        self.levels
            .iter()
            .map(|l| l.identifier.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Nearest enclosing level tagged with `group`.
    pub fn level_for_group(&self, group: &str) -> Option<&Level> {
        self.levels
            .iter()
            .rev()
            .find(|l| l.group.as_deref() == Some(group))
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }
}

// ---------------------------------------------------------------------------
// Failure info and step responses
// ---------------------------------------------------------------------------

/// Classification attached to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Application,
    Timeout,
    Resolution,
    Dispatch,
    Connectivity,
    Unknown,
}

/// Structured failure description carried on records and notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_types: Vec<FailureType>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failure_types: Vec::new(),
        }
    }

    pub fn with_type(mut self, failure_type: FailureType) -> Self {
        if !self.failure_types.contains(&failure_type) {
            self.failure_types.push(failure_type);
        }
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.failure_types.contains(&FailureType::Timeout)
    }
}

/// The outcome a step handler reports for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
}

impl StepResponse {
    pub fn succeeded(outputs: Option<serde_json::Value>) -> Self {
        Self {
            status: Status::Succeeded,
            outputs,
            failure_info: None,
        }
    }

    /// A failed response; timeout-classified failures become `Expired`.
    pub fn failed(failure_info: FailureInfo) -> Self {
        let status = if failure_info.is_timeout() {
            Status::Expired
        } else {
            Status::Failed
        };
        Self {
            status,
            outputs: None,
            failure_info: Some(failure_info),
        }
    }

    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            outputs: None,
            failure_info: None,
        }
    }
}

/// What a finished node publishes to the notify id its parent waits on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponseNotifyData {
    pub node_execution_id: Uuid,
    pub node_id: String,
    pub identifier: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    pub ended_at: DateTime<Utc>,
    /// Set when an ignore-failure adviser let the branch continue.
    #[serde(default)]
    pub failure_ignored: bool,
}

// ---------------------------------------------------------------------------
// Adviser decisions
// ---------------------------------------------------------------------------

/// Control-flow decision produced by the adviser resolver for a concluded node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdviserResponse {
    /// Continue with a sibling node in the same scope.
    NextStep { next_node_id: Option<String> },
    /// Run the same template again as a new record.
    Retry { wait_secs: u64 },
    MarkParentFailed,
    EndBranch,
    /// Keep the failure on record but let the scope continue.
    IgnoreFailure { next_node_id: Option<String> },
    /// Park the node until an operator resolves it through an interrupt.
    ManualIntervention,
}

impl AdviserResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NextStep { .. } => "next_step",
            Self::Retry { .. } => "retry",
            Self::MarkParentFailed => "mark_parent_failed",
            Self::EndBranch => "end_branch",
            Self::IgnoreFailure { .. } => "ignore_failure",
            Self::ManualIntervention => "manual_intervention",
        }
    }
}

// ---------------------------------------------------------------------------
// NodeExecution (the mutable execution record)
// ---------------------------------------------------------------------------

/// One runtime attempt at a node template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Runtime id, unique per attempt.
    pub id: Uuid,
    /// Template node id within the plan.
    pub node_id: String,
    pub plan_execution_id: Uuid,
    pub identifier: String,
    pub name: String,
    pub step_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Identifier of the nearest enclosing `stage` level, for indexing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Full context with this node as the leaf level.
    pub context: ExecutionContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<Uuid>,
    /// Correlation id the parent waits on, if this node is awaited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_id: Option<String>,
    /// 1-based attempt counter across a retry chain.
    pub attempt: u32,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutionMode>,
    #[serde(
        default,
        with = "base64_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub resolved_parameters: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adviser_response: Option<AdviserResponse>,
    /// Responses claimed while the node was being parked by a pause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_responses: Option<BTreeMap<String, NotifyPayload>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl NodeExecution {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Resolved parameters decoded as JSON, if resolution has happened.
    pub fn parameters(&self) -> Option<serde_json::Value> {
        self.resolved_parameters
            .as_deref()
            .and_then(|bytes| serde_json::from_slice(bytes).ok())
    }

    /// Build the notification a parent receives when this node ends.
    pub fn notify_data(&self, failure_ignored: bool) -> StepResponseNotifyData {
        StepResponseNotifyData {
            node_execution_id: self.id,
            node_id: self.node_id.clone(),
            identifier: self.identifier.clone(),
            status: self.status,
            outputs: self.outputs.clone(),
            failure_info: self.failure_info.clone(),
            ended_at: self.ended_at.unwrap_or(self.updated_at),
            failure_ignored,
        }
    }
}

// ---------------------------------------------------------------------------
// Plan execution (aggregate over a plan's node executions)
// ---------------------------------------------------------------------------

/// One run of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    pub id: Uuid,
    pub plan_id: String,
    pub status: Status,
    #[serde(default)]
    pub inputs: serde_json::Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_node_execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Input expansion index
// ---------------------------------------------------------------------------

/// Which half of a node's data an expansion entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionKind {
    Parameters,
    Outputs,
}

/// Plan-wide index entry used by later expression lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpansionEntry {
    pub plan_execution_id: Uuid,
    pub node_execution_id: Uuid,
    pub identifier: String,
    pub fqn: String,
    pub kind: ExpansionKind,
    pub value: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|e| STANDARD.decode(e).map_err(serde::de::Error::custom))
            .transpose()
    }
}
