//! Adviser resolver: maps a concluded node to its next control-flow action.
//!
//! Adviser configurations are evaluated in declaration order and the first
//! applicable one wins. When none applies the node simply ends.

use std::collections::HashMap;

use planwright_types::execution::{AdviserResponse, NodeExecution, Status};
use planwright_types::plan::{AdviserConfig, AdviserType, NodeTemplate, RepairAction};

#[derive(Debug, thiserror::Error)]
pub enum AdviserError {
    #[error("no adviser registered for '{0:?}'")]
    Unregistered(AdviserType),

    #[error("adviser '{kind:?}' misconfigured: {reason}")]
    Invalid { kind: AdviserType, reason: String },
}

/// The status change an adviser reacts to.
#[derive(Debug, Clone, Copy)]
pub struct AdviseEvent<'a> {
    pub record: &'a NodeExecution,
    pub from: Status,
    pub to: Status,
}

pub type AdviserFn = fn(&AdviserConfig, &AdviseEvent<'_>) -> Result<AdviserResponse, AdviserError>;

pub struct AdviserResolver {
    advisers: HashMap<AdviserType, AdviserFn>,
}

impl AdviserResolver {
    pub fn new() -> Self {
        Self {
            advisers: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut resolver = Self::new();
        resolver.register(AdviserType::OnSuccess, next_step);
        resolver.register(AdviserType::OnFail, next_step);
        resolver.register(AdviserType::Retry, retry);
        resolver.register(AdviserType::IgnoreFailure, ignore_failure);
        resolver.register(AdviserType::ManualIntervention, |_, _| {
            Ok(AdviserResponse::ManualIntervention)
        });
        resolver.register(AdviserType::MarkParentFailed, |_, _| {
            Ok(AdviserResponse::MarkParentFailed)
        });
        resolver.register(AdviserType::EndBranch, |_, _| Ok(AdviserResponse::EndBranch));
        resolver
    }

    pub fn register(&mut self, kind: AdviserType, adviser: AdviserFn) {
        self.advisers.insert(kind, adviser);
    }

    /// Evaluate the template's adviser chain. `None` means "no adviser applies".
    pub fn evaluate(
        &self,
        template: &NodeTemplate,
        event: &AdviseEvent<'_>,
    ) -> Result<Option<AdviserResponse>, AdviserError> {
        let Some(config) = template.advisers.iter().find(|c| applies(c, event)) else {
            return Ok(None);
        };
        let adviser = self
            .advisers
            .get(&config.kind)
            .ok_or(AdviserError::Unregistered(config.kind))?;
        adviser(config, event).map(Some)
    }
}

impl Default for AdviserResolver {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn applies(config: &AdviserConfig, event: &AdviseEvent<'_>) -> bool {
    if !config.applicable_statuses().contains(&event.to) {
        return false;
    }
    if config.failure_types.is_empty() {
        return true;
    }
    event.record.failure_info.as_ref().is_some_and(|info| {
        info.failure_types
            .iter()
            .any(|t| config.failure_types.contains(t))
    })
}

fn next_step(config: &AdviserConfig, _: &AdviseEvent<'_>) -> Result<AdviserResponse, AdviserError> {
    Ok(AdviserResponse::NextStep {
        next_node_id: config.next_node_id.clone(),
    })
}

fn ignore_failure(config: &AdviserConfig, _: &AdviseEvent<'_>) -> Result<AdviserResponse, AdviserError> {
    Ok(AdviserResponse::IgnoreFailure {
        next_node_id: config.next_node_id.clone(),
    })
}

fn retry(config: &AdviserConfig, event: &AdviseEvent<'_>) -> Result<AdviserResponse, AdviserError> {
    let policy = config.retry.clone().unwrap_or_default();
    if policy.max_attempts == 0 {
        return Err(AdviserError::Invalid {
            kind: AdviserType::Retry,
            reason: "max_attempts must be at least 1".to_string(),
        });
    }

    let attempt = event.record.attempt;
    if attempt < policy.max_attempts {
        return Ok(AdviserResponse::Retry {
            wait_secs: policy.wait_after(attempt),
        });
    }

    Ok(match policy.on_exhausted {
        RepairAction::EndBranch => AdviserResponse::EndBranch,
        RepairAction::MarkParentFailed => AdviserResponse::MarkParentFailed,
        RepairAction::IgnoreFailure => AdviserResponse::IgnoreFailure {
            next_node_id: config.next_node_id.clone(),
        },
        RepairAction::ManualIntervention => AdviserResponse::ManualIntervention,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::Utc;
    use planwright_types::execution::{ExecutionContext, FailureInfo, FailureType};
    use planwright_types::plan::{FacilitatorConfig, RetryPolicy};
    use uuid::Uuid;

    fn record(status: Status, attempt: u32, failure: Option<FailureInfo>) -> NodeExecution {
        let plan_execution_id = Uuid::now_v7();
        NodeExecution {
            id: Uuid::now_v7(),
            node_id: "build".into(),
            plan_execution_id,
            identifier: "build".into(),
            name: String::new(),
            step_type: "fail".into(),
            group: None,
            stage: None,
            context: ExecutionContext::new(plan_execution_id, "p"),
            parent_id: None,
            previous_id: None,
            notify_id: None,
            attempt,
            status,
            mode: None,
            resolved_parameters: None,
            execution_input: None,
            outputs: None,
            failure_info: failure,
            adviser_response: None,
            pending_responses: None,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            updated_at: Utc::now(),
        }
    }

    fn template(advisers: Vec<AdviserConfig>) -> NodeTemplate {
        NodeTemplate {
            id: "build".into(),
            identifier: "build".into(),
            name: String::new(),
            step_type: "fail".into(),
            parameters: serde_json::Value::Null,
            facilitator: FacilitatorConfig::default(),
            advisers,
            group: None,
            skip_when: None,
            requires_input: false,
            input_prompt: None,
        }
    }

    fn evaluate(t: &NodeTemplate, r: &NodeExecution) -> Option<AdviserResponse> {
        let event = AdviseEvent {
            record: r,
            from: Status::Running,
            to: r.status,
        };
        AdviserResolver::with_defaults().evaluate(t, &event).unwrap()
    }

    #[test]
    fn first_applicable_adviser_wins() {
        let t = template(vec![
            AdviserConfig::new(AdviserType::OnSuccess).with_next("deploy"),
            AdviserConfig::new(AdviserType::MarkParentFailed),
            AdviserConfig::new(AdviserType::EndBranch),
        ]);

        let ok = record(Status::Succeeded, 1, None);
        assert_eq!(
            evaluate(&t, &ok),
            Some(AdviserResponse::NextStep {
                next_node_id: Some("deploy".into())
            })
        );

        let failed = record(Status::Failed, 1, Some(FailureInfo::new("x")));
        assert_eq!(evaluate(&t, &failed), Some(AdviserResponse::MarkParentFailed));

        let aborted = record(Status::Aborted, 1, None);
        assert_eq!(evaluate(&t, &aborted), Some(AdviserResponse::EndBranch));
    }

    #[test]
    fn no_applicable_adviser_ends() {
        let t = template(vec![AdviserConfig::new(AdviserType::OnFail).with_next("cleanup")]);
        assert_eq!(evaluate(&t, &record(Status::Succeeded, 1, None)), None);
    }

    #[test]
    fn skipped_counts_as_success() {
        let t = template(vec![AdviserConfig::new(AdviserType::OnSuccess).with_next("next")]);
        assert!(matches!(
            evaluate(&t, &record(Status::Skipped, 1, None)),
            Some(AdviserResponse::NextStep { .. })
        ));
    }

    #[test]
    fn retry_until_exhausted_then_repair() {
        let mut config = AdviserConfig::new(AdviserType::Retry);
        config.retry = Some(RetryPolicy {
            max_attempts: 3,
            wait_secs: vec![2, 10],
            on_exhausted: RepairAction::MarkParentFailed,
        });
        let t = template(vec![config]);

        let first = record(Status::Failed, 1, None);
        assert_eq!(evaluate(&t, &first), Some(AdviserResponse::Retry { wait_secs: 2 }));
        let second = record(Status::Failed, 2, None);
        assert_eq!(evaluate(&t, &second), Some(AdviserResponse::Retry { wait_secs: 10 }));
        let third = record(Status::Failed, 3, None);
        assert_eq!(evaluate(&t, &third), Some(AdviserResponse::MarkParentFailed));
    }

    #[test]
    fn failure_type_filter() {
        let mut on_timeout = AdviserConfig::new(AdviserType::IgnoreFailure);
        on_timeout.failure_types = vec![FailureType::Timeout];
        let t = template(vec![on_timeout, AdviserConfig::new(AdviserType::MarkParentFailed)]);

        let timed_out = record(
            Status::Expired,
            1,
            Some(FailureInfo::new("slow").with_type(FailureType::Timeout)),
        );
        assert_eq!(
            evaluate(&t, &timed_out),
            Some(AdviserResponse::IgnoreFailure { next_node_id: None })
        );

        let crashed = record(
            Status::Failed,
            1,
            Some(FailureInfo::new("boom").with_type(FailureType::Application)),
        );
        assert_eq!(evaluate(&t, &crashed), Some(AdviserResponse::MarkParentFailed));
    }

    #[test]
    fn zero_attempt_policy_is_an_error() {
        let mut config = AdviserConfig::new(AdviserType::Retry);
        config.retry = Some(RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        });
        let t = template(vec![config]);
        let r = record(Status::Failed, 1, None);
        let event = AdviseEvent {
            record: &r,
            from: Status::Running,
            to: Status::Failed,
        };
        assert!(AdviserResolver::with_defaults().evaluate(&t, &event).is_err());
    }
}
