//! Engine error taxonomy.
//!
//! Node-level errors never escape the node: `ExecutionStrategy::handle_error`
//! turns them into a synthetic failed step response using `failure_info()`.

use planwright_types::error::RepositoryError;
use planwright_types::execution::{FailureInfo, FailureType};
use uuid::Uuid;

use super::adviser::AdviserError;
use super::dispatch::DispatchError;
use super::expression::ResolutionError;
use super::facilitation::FacilitationError;
use super::plan::PlanError;
use super::step::StepError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("node template '{node_id}' not found in plan '{plan_id}'")]
    TemplateNotFound { plan_id: String, node_id: String },

    #[error("plan '{0}' not found")]
    PlanNotFound(String),

    #[error("plan execution {0} not found")]
    PlanExecutionNotFound(Uuid),

    #[error("node execution {0} not found")]
    NodeExecutionNotFound(Uuid),

    #[error("execution context has no levels")]
    EmptyContext,

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Facilitation(#[from] FacilitationError),

    #[error(transparent)]
    Step(#[from] StepError),

    /// A concurrent writer advanced the record first.
    #[error("persistence conflict: {0}")]
    PersistenceConflict(String),

    #[error("persistence error: {0}")]
    Persistence(RepositoryError),

    #[error(transparent)]
    ExternalDispatch(#[from] DispatchError),

    #[error(transparent)]
    AdviserEvaluation(#[from] AdviserError),

    #[error("async task failed: {}", .0.message)]
    AsyncTask(FailureInfo),

    #[error("interrupt rejected: {0}")]
    Interrupt(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<RepositoryError> for EngineError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Conflict(reason) => EngineError::PersistenceConflict(reason),
            other => EngineError::Persistence(other),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::PersistenceConflict(_))
    }

    /// Structured failure description recorded on the failed node.
    pub fn failure_info(&self) -> FailureInfo {
        if let EngineError::AsyncTask(info) = self {
            return info.clone();
        }
        let failure_type = match self {
            EngineError::Resolution(_) | EngineError::TemplateNotFound { .. } => {
                FailureType::Resolution
            }
            EngineError::ExternalDispatch(_) => FailureType::Dispatch,
            EngineError::Step(StepError::Timeout(_)) => FailureType::Timeout,
            EngineError::Step(_) | EngineError::Facilitation(_) => FailureType::Application,
            EngineError::Persistence(_) => FailureType::Connectivity,
            _ => FailureType::Unknown,
        };
        FailureInfo::new(self.to_string()).with_type(failure_type)
    }
}
