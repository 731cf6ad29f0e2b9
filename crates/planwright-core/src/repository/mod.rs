//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (planwright-infra) implements. The core crate never depends on any
//! specific storage technology; `memory` provides in-process adapters used
//! by tests and single-process embedding.

pub mod execution;
pub mod interrupt;
pub mod memory;
pub mod wait_notify;

pub use execution::{ConditionalUpdate, ExecutionRepository};
pub use interrupt::InterruptRepository;
pub use wait_notify::WaitNotifyRepository;
