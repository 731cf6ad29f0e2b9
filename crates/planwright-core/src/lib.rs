//! Execution engine and repository trait definitions for Planwright.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements, plus in-memory adapters for them. The engine depends only
//! on `planwright-types` and these traits -- never on `planwright-infra` or any
//! database/IO crate.

pub mod engine;
pub mod event;
pub mod repository;
