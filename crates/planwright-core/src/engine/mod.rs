//! The plan/step execution engine.
//!
//! `ExecutionStrategy` drives node executions through the status machine,
//! consulting the expression resolver, facilitation and adviser registries,
//! pre-facilitation checkers and step handlers. Every cross-node continuation
//! is an `EngineJob` executed by the `EngineRunner`, so no lifecycle call
//! ever waits on another node's work.

pub mod adviser;
pub mod checks;
pub mod dispatch;
pub mod error;
pub mod expression;
pub mod facilitation;
pub mod interrupt;
pub mod jobs;
pub mod plan;
pub mod runner;
pub mod step;
pub mod strategy;
pub mod wait;

mod advise;

#[cfg(test)]
pub(crate) mod testing;

pub use adviser::{AdviseEvent, AdviserError, AdviserResolver};
pub use checks::{CheckChain, CheckInput, CheckPhase, ExecutionCheck, ExecutionChecker};
pub use dispatch::{BoxTaskDispatcher, ChannelTaskDispatcher, DispatchError, TaskDispatcher, TaskRequest};
pub use error::EngineError;
pub use expression::{ExpressionEvaluator, ExpressionResolver, JexlResolver, ResolutionError, ResolutionScope};
pub use facilitation::{Facilitation, FacilitationDecision, FacilitationError, FacilitationResolver};
pub use interrupt::InterruptService;
pub use jobs::{EngineJob, JobQueue};
pub use plan::{PlanError, PlanService, parse_plan_yaml, validate_plan};
pub use runner::EngineRunner;
pub use step::{BoxStepHandler, StepContext, StepError, StepHandler, StepRegistry};
pub use strategy::{ExecutionStrategy, NewExecution};
