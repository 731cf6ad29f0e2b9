//! Shared domain types for Planwright.
//!
//! This crate contains the data model of the plan execution engine: plan
//! definitions, node executions and their status machine, interrupts,
//! wait/notify records, engine events, configuration, and the repository
//! error type shared by every storage port.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod interrupt;
pub mod notify;
pub mod plan;
