//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` in the data directory. Every
//! section and field has a default, so an empty or partial file is valid.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub tasks: TaskSection,
    #[serde(default)]
    pub server: ServerSection,
}

/// Job queue and recovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSection {
    /// Upper bound on engine jobs running at once.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Capacity of the broadcast event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Interval of the ready-wait sweeper; 0 disables it.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_concurrent_jobs() -> usize {
    64
}

fn default_event_capacity() -> usize {
    1024
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            event_capacity: default_event_capacity(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Local task worker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSection {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Applied when a task payload carries no `timeout_secs`.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
}

fn default_max_concurrent_tasks() -> usize {
    8
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            default_timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7420
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}
