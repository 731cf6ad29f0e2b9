//! Infrastructure layer for Planwright.
//!
//! Implements the storage ports defined in `planwright-core` on SQLite, loads
//! the engine configuration from the data directory, and provides the local
//! worker that executes async tasks on the host.

pub mod config;
pub mod sqlite;
pub mod worker;

use planwright_core::engine::ExecutionStrategy;

/// The engine wired to the SQLite adapters.
pub type SqliteStrategy = ExecutionStrategy<
    sqlite::SqliteExecutionRepository,
    sqlite::SqliteWaitNotifyRepository,
    sqlite::SqliteInterruptRepository,
>;
