//! Execution record store trait definition.
//!
//! Covers four entity families:
//! - **Plans:** immutable plan definitions.
//! - **Plan executions:** one row per plan run, with an aggregate status.
//! - **Node executions:** the mutable execution records, changed only through
//!   conditional (status compare-and-set) updates.
//! - **Expansion index:** plan-wide record of resolved parameters and outputs
//!   used by later expression lookups.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use std::future::Future;

use planwright_types::error::RepositoryError;
use planwright_types::execution::{
    AdviserResponse, ExecutionMode, ExpansionEntry, NodeExecution, PlanExecution, Status,
};
use planwright_types::plan::Plan;
use uuid::Uuid;

/// Outcome of a successful conditional update.
#[derive(Debug, Clone)]
pub struct ConditionalUpdate {
    /// Status the record had before the mutator ran.
    pub previous_status: Status,
    /// The record as written.
    pub record: NodeExecution,
}

pub trait ExecutionRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Plans
    // -----------------------------------------------------------------------

    /// Upsert a plan definition by id.
    fn save_plan(&self, plan: &Plan) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_plan(
        &self,
        plan_id: &str,
    ) -> impl Future<Output = Result<Option<Plan>, RepositoryError>> + Send;

    fn list_plans(&self) -> impl Future<Output = Result<Vec<Plan>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Plan executions
    // -----------------------------------------------------------------------

    fn create_plan_execution(
        &self,
        execution: &PlanExecution,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_plan_execution(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<Option<PlanExecution>, RepositoryError>> + Send;

    /// Most recent first.
    fn list_plan_executions(
        &self,
        plan_id: &str,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<PlanExecution>, RepositoryError>> + Send;

    /// Apply `mutate` if the current status is in `from`.
    ///
    /// Returns `NotFound` for an unknown id and `Conflict` when the status
    /// check fails or a concurrent writer won.
    fn update_plan_execution<F>(
        &self,
        id: &Uuid,
        from: &[Status],
        mutate: F,
    ) -> impl Future<Output = Result<PlanExecution, RepositoryError>> + Send
    where
        F: FnOnce(&mut PlanExecution) + Send;

    // -----------------------------------------------------------------------
    // Node executions
    // -----------------------------------------------------------------------

    /// Insert a new record. A duplicate runtime id is a `Conflict`.
    fn save_node_execution(
        &self,
        record: &NodeExecution,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_node_execution(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<Option<NodeExecution>, RepositoryError>> + Send;

    /// Apply `mutate` if the current status is in `from`; stamps `updated_at`.
    ///
    /// Returns `NotFound` for an unknown id and `Conflict` when the status
    /// check fails or a concurrent writer won.
    fn update_node_execution<F>(
        &self,
        id: &Uuid,
        from: &[Status],
        mutate: F,
    ) -> impl Future<Output = Result<ConditionalUpdate, RepositoryError>> + Send
    where
        F: FnOnce(&mut NodeExecution) + Send;

    /// Bind the execution mode to a QUEUED record exactly once.
    ///
    /// Returns `false` if a mode was already bound or the record is no
    /// longer queued.
    fn bind_execution_mode(
        &self,
        id: &Uuid,
        mode: ExecutionMode,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Bind the adviser decision to a terminal record exactly once.
    ///
    /// Returns `false` if a decision was already bound or the record is not
    /// terminal.
    fn bind_adviser_response(
        &self,
        id: &Uuid,
        response: &AdviserResponse,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// All records of a plan execution, oldest first.
    fn list_node_executions(
        &self,
        plan_execution_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<NodeExecution>, RepositoryError>> + Send;

    fn list_children(
        &self,
        parent_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<NodeExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Expansion index
    // -----------------------------------------------------------------------

    /// Write resolved parameter bytes and their expansion entry atomically.
    ///
    /// Overwrites any previous bytes; resolution is idempotent for a given
    /// context so repeated writes carry identical content.
    fn save_resolved_parameters(
        &self,
        id: &Uuid,
        resolved: &[u8],
        entry: &ExpansionEntry,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn append_expansion(
        &self,
        entry: &ExpansionEntry,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Entries of a plan execution in recording order.
    fn list_expansions(
        &self,
        plan_execution_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<ExpansionEntry>, RepositoryError>> + Send;
}
