//! Application state shared by the CLI commands and the HTTP handlers.
//!
//! Opens the SQLite database in the data directory, wires the engine to the
//! SQLite adapters, and spawns the engine runner and the local task worker
//! in the background.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use planwright_core::engine::{BoxTaskDispatcher, ChannelTaskDispatcher, EngineRunner, ExecutionStrategy, PlanService};
use planwright_core::event::EventBus;
use planwright_infra::config::{load_engine_config, resolve_data_dir};
use planwright_infra::sqlite::pool::database_url;
use planwright_infra::sqlite::{
    DatabasePool, SqliteExecutionRepository, SqliteInterruptRepository, SqliteWaitNotifyRepository,
};
use planwright_infra::worker::LocalTaskWorker;
use planwright_infra::SqliteStrategy;
use planwright_types::config::EngineConfig;

/// How long shutdown waits for queued engine jobs before cancelling them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub type SqlitePlanService =
    PlanService<SqliteExecutionRepository, SqliteWaitNotifyRepository, SqliteInterruptRepository>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub plans: SqlitePlanService,
    pub config: Arc<EngineConfig>,
    pub data_dir: PathBuf,
    shutdown: CancellationToken,
    background: TaskTracker,
}

impl AppState {
    /// Resolve the data directory, load `config.toml`, open the database and
    /// start the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let db_url = format!("{}?mode=rwc", database_url(&data_dir));
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("Failed to open database at {}", data_dir.display()))?;

        tracing::debug!(data_dir = %data_dir.display(), "application state initialized");
        Ok(Self::start(db_pool, config, data_dir))
    }

    /// Wire the engine over an open pool and spawn its background loops.
    /// Must be called from within a tokio runtime.
    pub fn start(db_pool: DatabasePool, config: EngineConfig, data_dir: PathBuf) -> Self {
        let (dispatcher, tasks) = ChannelTaskDispatcher::channel();
        let (strategy, jobs): (SqliteStrategy, _) = ExecutionStrategy::new(
            Arc::new(SqliteExecutionRepository::new(db_pool.clone())),
            Arc::new(SqliteWaitNotifyRepository::new(db_pool.clone())),
            Arc::new(SqliteInterruptRepository::new(db_pool)),
            BoxTaskDispatcher::new(dispatcher),
            EventBus::new(config.engine.event_capacity),
        );

        let shutdown = CancellationToken::new();
        let background = TaskTracker::new();
        background.spawn(EngineRunner::from_config(strategy.clone(), &config.engine).run(jobs, shutdown.clone()));
        background.spawn(LocalTaskWorker::new(strategy.clone(), &config.tasks).run(tasks, shutdown.clone()));
        background.close();

        Self {
            plans: PlanService::new(strategy),
            config: Arc::new(config),
            data_dir,
            shutdown,
            background,
        }
    }

    pub fn strategy(&self) -> &SqliteStrategy {
        self.plans.strategy()
    }

    /// Let queued engine jobs finish, then stop the runner and the worker.
    ///
    /// Tasks already running on the worker still report before it exits.
    pub async fn shutdown(&self) {
        let jobs = self.strategy().jobs();
        if tokio::time::timeout(DRAIN_TIMEOUT, jobs.wait_idle()).await.is_err() {
            tracing::warn!(pending = jobs.pending(), "engine jobs still pending at shutdown");
        }
        self.shutdown.cancel();
        self.background.wait().await;
    }
}

#[cfg(test)]
pub(crate) async fn test_state() -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("{}?mode=rwc", database_url(dir.path()));
    let pool = DatabasePool::new(&url).await.unwrap();
    let state = AppState::start(pool, EngineConfig::default(), dir.path().to_path_buf());
    (state, dir)
}
