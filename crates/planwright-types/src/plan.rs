//! Plan definition types.
//!
//! A `Plan` is authored once (usually as YAML) and never mutated after it is
//! registered. Each `NodeTemplate` names its step type, raw parameter
//! template, facilitator and ordered adviser chain.

use serde::{Deserialize, Serialize};

use crate::execution::{FailureType, Status};

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Node id the plan starts from.
    pub root: String,
    pub nodes: Vec<NodeTemplate>,
}

impl Plan {
    pub fn node(&self, node_id: &str) -> Option<&NodeTemplate> {
        self.nodes.iter().find(|n| n.id == node_id)
    }
}

// ---------------------------------------------------------------------------
// Node template
// ---------------------------------------------------------------------------

/// One unit of work in the plan graph, as authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTemplate {
    pub id: String,
    /// Name used in expressions (`steps.<identifier>`); defaults to `id`.
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    /// Step-type tag selecting the step handler.
    #[serde(rename = "type")]
    pub step_type: String,
    /// Raw parameter template; string leaves may contain `{{ expr }}`.
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub facilitator: FacilitatorConfig,
    /// Evaluated in declaration order; the first applicable adviser wins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advisers: Vec<AdviserConfig>,
    /// Group/stage tag (e.g. `stage`, `step_group`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// JEXL condition; a truthy result skips the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_when: Option<String>,
    /// Wait for external input before facilitation.
    #[serde(default)]
    pub requires_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_prompt: Option<String>,
}

impl NodeTemplate {
    pub fn has_advisers(&self) -> bool {
        !self.advisers.is_empty()
    }

    /// Child node ids declared under `parameters.children`.
    pub fn child_ids(&self) -> Vec<String> {
        self.parameters
            .get("children")
            .and_then(|c| c.as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `next_node_id` targets named by the adviser chain.
    pub fn next_ids(&self) -> Vec<&str> {
        self.advisers
            .iter()
            .filter_map(|a| a.next_node_id.as_deref())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Facilitators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacilitatorType {
    #[default]
    Inline,
    AsyncTask,
    Children,
    /// The decision is computed out-of-band and delivered later.
    Custom,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacilitatorConfig {
    #[serde(rename = "type", default)]
    pub kind: FacilitatorType,
}

// ---------------------------------------------------------------------------
// Advisers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviserType {
    OnSuccess,
    OnFail,
    Retry,
    IgnoreFailure,
    ManualIntervention,
    MarkParentFailed,
    EndBranch,
}

impl AdviserType {
    /// Statuses the adviser applies to when its config has no `when` list.
    pub fn default_statuses(self) -> &'static [Status] {
        match self {
            AdviserType::OnSuccess => &[Status::Succeeded, Status::Skipped],
            AdviserType::EndBranch => Status::TERMINAL,
            AdviserType::OnFail
            | AdviserType::Retry
            | AdviserType::IgnoreFailure
            | AdviserType::ManualIntervention
            | AdviserType::MarkParentFailed => &[Status::Failed, Status::Expired],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviserConfig {
    #[serde(rename = "type")]
    pub kind: AdviserType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,
    /// Overrides the adviser's default applicable statuses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub when: Vec<Status>,
    /// Only apply when the failure carries one of these types.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_types: Vec<FailureType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl AdviserConfig {
    pub fn new(kind: AdviserType) -> Self {
        Self {
            kind,
            next_node_id: None,
            when: Vec::new(),
            failure_types: Vec::new(),
            retry: None,
        }
    }

    pub fn with_next(mut self, next_node_id: impl Into<String>) -> Self {
        self.next_node_id = Some(next_node_id.into());
        self
    }

    pub fn applicable_statuses(&self) -> &[Status] {
        if self.when.is_empty() {
            self.kind.default_statuses()
        } else {
            &self.when
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wait before each retry; the last entry repeats.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wait_secs: Vec<u64>,
    #[serde(default)]
    pub on_exhausted: RepairAction,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            wait_secs: Vec::new(),
            on_exhausted: RepairAction::default(),
        }
    }
}

impl RetryPolicy {
    /// Seconds to wait before starting the attempt after `attempt`.
    pub fn wait_after(&self, attempt: u32) -> u64 {
        let idx = attempt.saturating_sub(1) as usize;
        self.wait_secs
            .get(idx)
            .or_else(|| self.wait_secs.last())
            .copied()
            .unwrap_or(0)
    }
}

/// What a retry adviser falls back to once attempts are exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    #[default]
    EndBranch,
    MarkParentFailed,
    IgnoreFailure,
    ManualIntervention,
}
