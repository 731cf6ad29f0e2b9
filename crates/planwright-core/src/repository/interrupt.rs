//! Interrupt repository trait definition.

use std::future::Future;

use planwright_types::error::RepositoryError;
use planwright_types::interrupt::{Interrupt, InterruptState};
use uuid::Uuid;

pub trait InterruptRepository: Send + Sync {
    fn save_interrupt(
        &self,
        interrupt: &Interrupt,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Every interrupt of a plan execution in registration order.
    fn list_interrupts(
        &self,
        plan_execution_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<Interrupt>, RepositoryError>> + Send;

    /// Move an interrupt to `state`; `processed` also stamps `processed_at`.
    fn update_interrupt_state(
        &self,
        id: &Uuid,
        state: InterruptState,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}
