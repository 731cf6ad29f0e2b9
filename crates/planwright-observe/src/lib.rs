//! Observability setup for Planwright: structured `tracing` output with an
//! optional OpenTelemetry bridge.

pub mod tracing_setup;
