//! Pre-facilitation and pre-resume checkers.
//!
//! A chain of responsibility: checkers run in order and the chain stops at
//! the first one that says "do not proceed". The default chain runs
//! `RunCheck` before `SkipCheck`, so an abort always beats a skip.

use std::sync::Arc;

use planwright_types::execution::Status;
use planwright_types::interrupt::{Interrupt, InterruptType};
use planwright_types::plan::NodeTemplate;
use uuid::Uuid;

use super::expression::{ExpressionResolver, ResolutionError, ResolutionScope};

/// Result of one checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionCheck {
    pub proceed: bool,
    pub reason: String,
    /// Status the blocked node should move to.
    pub status: Option<Status>,
}

impl ExecutionCheck {
    pub fn proceed() -> Self {
        Self {
            proceed: true,
            reason: String::new(),
            status: None,
        }
    }

    pub fn block(reason: impl Into<String>, status: Status) -> Self {
        Self {
            proceed: false,
            reason: reason.into(),
            status: Some(status),
        }
    }
}

/// Where in the lifecycle the chain is being consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPhase {
    Start,
    Resume,
}

pub struct CheckInput<'a> {
    pub plan_execution_id: Uuid,
    pub node_execution_id: Uuid,
    /// Runtime ids of the node's enclosing levels, outermost first.
    pub enclosing: &'a [Uuid],
    pub template: &'a NodeTemplate,
    /// Active interrupts of the plan execution, in registration order.
    pub interrupts: &'a [Interrupt],
    pub phase: CheckPhase,
    /// Present at start, where plan-level skip conditions are evaluated.
    pub scope: Option<&'a ResolutionScope>,
}

impl CheckInput<'_> {
    fn targeting(&self, kind: InterruptType) -> Option<&Interrupt> {
        self.interrupts
            .iter()
            .find(|i| i.interrupt_type == kind && i.is_active() && i.covers(self.node_execution_id, self.enclosing))
    }
}

pub trait ExecutionChecker: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, input: &CheckInput<'_>) -> Result<ExecutionCheck, ResolutionError>;
}

/// Abort and pause signals block proceeding.
pub struct RunCheck;

impl ExecutionChecker for RunCheck {
    fn name(&self) -> &'static str {
        "run"
    }

    fn check(&self, input: &CheckInput<'_>) -> Result<ExecutionCheck, ResolutionError> {
        if let Some(abort) = input.targeting(InterruptType::Abort) {
            return Ok(ExecutionCheck::block(
                abort.reason.clone().unwrap_or_else(|| "aborted".to_string()),
                Status::Aborted,
            ));
        }
        if let Some(pause) = input.targeting(InterruptType::Pause) {
            return Ok(ExecutionCheck::block(
                pause.reason.clone().unwrap_or_else(|| "paused".to_string()),
                Status::Paused,
            ));
        }
        Ok(ExecutionCheck::proceed())
    }
}

/// An explicit skip interrupt or a truthy `skip_when` marks the node skipped.
pub struct SkipCheck {
    resolver: Arc<dyn ExpressionResolver>,
}

impl SkipCheck {
    pub fn new(resolver: Arc<dyn ExpressionResolver>) -> Self {
        Self { resolver }
    }
}

impl ExecutionChecker for SkipCheck {
    fn name(&self) -> &'static str {
        "skip"
    }

    fn check(&self, input: &CheckInput<'_>) -> Result<ExecutionCheck, ResolutionError> {
        // Skip interrupts are always node-scoped.
        let explicit = input.interrupts.iter().find(|i| {
            i.interrupt_type == InterruptType::Skip
                && i.is_active()
                && i.node_execution_id == Some(input.node_execution_id)
        });
        if let Some(skip) = explicit {
            return Ok(ExecutionCheck::block(
                skip.reason.clone().unwrap_or_else(|| "skipped by interrupt".to_string()),
                Status::Skipped,
            ));
        }

        if input.phase == CheckPhase::Start {
            if let (Some(condition), Some(scope)) = (&input.template.skip_when, input.scope) {
                if self.resolver.evaluate_condition(condition, scope)? {
                    return Ok(ExecutionCheck::block(
                        format!("skip condition '{condition}' is true"),
                        Status::Skipped,
                    ));
                }
            }
        }
        Ok(ExecutionCheck::proceed())
    }
}

/// Ordered checker chain.
pub struct CheckChain {
    checkers: Vec<Box<dyn ExecutionChecker>>,
}

impl CheckChain {
    pub fn new(checkers: Vec<Box<dyn ExecutionChecker>>) -> Self {
        Self { checkers }
    }

    /// `RunCheck` then `SkipCheck`.
    pub fn standard(resolver: Arc<dyn ExpressionResolver>) -> Self {
        Self::new(vec![Box::new(RunCheck), Box::new(SkipCheck::new(resolver))])
    }

    /// Run every checker until one blocks.
    pub fn run(&self, input: &CheckInput<'_>) -> Result<ExecutionCheck, ResolutionError> {
        for checker in &self.checkers {
            let check = checker.check(input)?;
            if !check.proceed {
                tracing::debug!(
                    checker = checker.name(),
                    node_execution_id = %input.node_execution_id,
                    reason = %check.reason,
                    "execution check blocked node"
                );
                return Ok(check);
            }
        }
        Ok(ExecutionCheck::proceed())
    }
}
