//! Facilitation resolver: decides how a node will run.
//!
//! A type-keyed registry of plain decision functions. Decisions are
//! side-effect free, so a resume that replays facilitation after a crash
//! reaches the same mode.

use std::collections::HashMap;

use planwright_types::execution::{ExecutionContext, ExecutionMode};
use planwright_types::plan::{FacilitatorType, NodeTemplate};

#[derive(Debug, thiserror::Error)]
pub enum FacilitationError {
    #[error("no facilitator registered for '{0:?}'")]
    Unregistered(FacilitatorType),

    #[error("invalid facilitation for node '{node_id}': {reason}")]
    Invalid { node_id: String, reason: String },
}

/// A synchronous facilitation outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacilitationDecision {
    pub mode: ExecutionMode,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Facilitation {
    Decided(FacilitationDecision),
    /// The decision is computed out-of-band and delivered through
    /// `ExecutionStrategy::process_facilitation_response`.
    Custom,
}

pub type FacilitatorFn = fn(&NodeTemplate, &ExecutionContext) -> Result<Facilitation, FacilitationError>;

pub struct FacilitationResolver {
    facilitators: HashMap<FacilitatorType, FacilitatorFn>,
}

impl FacilitationResolver {
    /// An empty resolver. Use [`FacilitationResolver::with_defaults`] for the built-ins.
    pub fn new() -> Self {
        Self {
            facilitators: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut resolver = Self::new();
        resolver.register(FacilitatorType::Inline, inline);
        resolver.register(FacilitatorType::AsyncTask, async_task);
        resolver.register(FacilitatorType::Children, children);
        resolver.register(FacilitatorType::Custom, custom);
        resolver
    }

    /// Register (or replace) the decision function for a facilitator type.
    pub fn register(&mut self, kind: FacilitatorType, facilitator: FacilitatorFn) {
        self.facilitators.insert(kind, facilitator);
    }

    pub fn decide(
        &self,
        template: &NodeTemplate,
        context: &ExecutionContext,
    ) -> Result<Facilitation, FacilitationError> {
        let kind = template.facilitator.kind;
        let facilitator = self
            .facilitators
            .get(&kind)
            .ok_or(FacilitationError::Unregistered(kind))?;
        facilitator(template, context)
    }
}

impl Default for FacilitationResolver {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn decided(mode: ExecutionMode, rationale: impl Into<String>) -> Facilitation {
    Facilitation::Decided(FacilitationDecision {
        mode,
        rationale: rationale.into(),
    })
}

fn inline(template: &NodeTemplate, _: &ExecutionContext) -> Result<Facilitation, FacilitationError> {
    Ok(decided(
        ExecutionMode::Inline,
        format!("'{}' runs inline", template.step_type),
    ))
}

fn async_task(template: &NodeTemplate, _: &ExecutionContext) -> Result<Facilitation, FacilitationError> {
    Ok(decided(
        ExecutionMode::AsyncTask,
        format!("'{}' is dispatched to a task worker", template.step_type),
    ))
}

fn children(template: &NodeTemplate, _: &ExecutionContext) -> Result<Facilitation, FacilitationError> {
    if template.parameters.get("children").is_some_and(|c| !c.is_array()) {
        return Err(FacilitationError::Invalid {
            node_id: template.id.clone(),
            reason: "parameters.children must be a list of node ids".to_string(),
        });
    }
    let count = template.child_ids().len();
    Ok(decided(ExecutionMode::Children, format!("{count} child node(s)")))
}

fn custom(_: &NodeTemplate, _: &ExecutionContext) -> Result<Facilitation, FacilitationError> {
    Ok(Facilitation::Custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use planwright_types::plan::FacilitatorConfig;
    use serde_json::json;
    use uuid::Uuid;

    fn template(kind: FacilitatorType, parameters: serde_json::Value) -> NodeTemplate {
        NodeTemplate {
            id: "n".into(),
            identifier: "n".into(),
            name: String::new(),
            step_type: "echo".into(),
            parameters,
            facilitator: FacilitatorConfig { kind },
            advisers: Vec::new(),
            group: None,
            skip_when: None,
            requires_input: false,
            input_prompt: None,
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Uuid::now_v7(), "p")
    }

    #[test]
    fn built_in_modes() {
        let resolver = FacilitationResolver::with_defaults();
        let cases = [
            (FacilitatorType::Inline, ExecutionMode::Inline),
            (FacilitatorType::AsyncTask, ExecutionMode::AsyncTask),
            (FacilitatorType::Children, ExecutionMode::Children),
        ];
        for (kind, mode) in cases {
            match resolver.decide(&template(kind, json!(null)), &ctx()).unwrap() {
                Facilitation::Decided(decision) => assert_eq!(decision.mode, mode),
                Facilitation::Custom => panic!("unexpected custom decision for {kind:?}"),
            }
        }
        assert_eq!(
            resolver
                .decide(&template(FacilitatorType::Custom, json!(null)), &ctx())
                .unwrap(),
            Facilitation::Custom
        );
    }

    #[test]
    fn decisions_are_repeatable() {
        let resolver = FacilitationResolver::with_defaults();
        let t = template(FacilitatorType::Children, json!({"children": ["a", "b"]}));
        let first = resolver.decide(&t, &ctx()).unwrap();
        let second = resolver.decide(&t, &ctx()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn malformed_children_are_rejected() {
        let resolver = FacilitationResolver::with_defaults();
        let t = template(FacilitatorType::Children, json!({"children": "a,b"}));
        assert!(matches!(
            resolver.decide(&t, &ctx()),
            Err(FacilitationError::Invalid { .. })
        ));
    }

    #[test]
    fn registration_replaces_defaults() {
        fn always_async(_: &NodeTemplate, _: &ExecutionContext) -> Result<Facilitation, FacilitationError> {
            Ok(decided(ExecutionMode::AsyncTask, "forced"))
        }

        let mut resolver = FacilitationResolver::new();
        assert!(matches!(
            resolver.decide(&template(FacilitatorType::Inline, json!(null)), &ctx()),
            Err(FacilitationError::Unregistered(FacilitatorType::Inline))
        ));

        resolver.register(FacilitatorType::Inline, always_async);
        let Facilitation::Decided(decision) = resolver
            .decide(&template(FacilitatorType::Inline, json!(null)), &ctx())
            .unwrap()
        else {
            panic!("expected a decision");
        };
        assert_eq!(decision.mode, ExecutionMode::AsyncTask);
    }
}
