//! Engine job runner.
//!
//! Drains the job queue onto a bounded pool of tasks and periodically sweeps
//! for ready waits that no delivery claimed.

use std::sync::Arc;
use std::time::Duration;

use planwright_types::config::EngineSection;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::jobs::EngineJob;
use super::strategy::ExecutionStrategy;
use crate::repository::{ExecutionRepository, InterruptRepository, WaitNotifyRepository};

/// Ready waits claimed per sweep.
const SWEEP_BATCH: u32 = 100;

pub struct EngineRunner<R, W, I> {
    strategy: ExecutionStrategy<R, W, I>,
    max_concurrent_jobs: usize,
    sweep_interval: Option<Duration>,
}

impl<R, W, I> EngineRunner<R, W, I>
where
    R: ExecutionRepository + 'static,
    W: WaitNotifyRepository + 'static,
    I: InterruptRepository + 'static,
{
    pub fn new(strategy: ExecutionStrategy<R, W, I>, max_concurrent_jobs: usize, sweep_interval: Option<Duration>) -> Self {
        Self {
            strategy,
            max_concurrent_jobs: max_concurrent_jobs.max(1),
            sweep_interval,
        }
    }

    pub fn from_config(strategy: ExecutionStrategy<R, W, I>, config: &EngineSection) -> Self {
        let sweep = (config.sweep_interval_secs > 0).then(|| Duration::from_secs(config.sweep_interval_secs));
        Self::new(strategy, config.max_concurrent_jobs, sweep)
    }

    /// Run until `shutdown` fires or every queue sender is gone, then wait
    /// for in-flight jobs to finish.
    pub async fn run(self, mut jobs: mpsc::UnboundedReceiver<EngineJob>, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        let permits = Arc::new(Semaphore::new(self.max_concurrent_jobs));
        let sweeping = self.sweep_interval.is_some();
        let mut sweep = tokio::time::interval(self.sweep_interval.unwrap_or(Duration::from_secs(3600)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            max_concurrent_jobs = self.max_concurrent_jobs,
            sweep_interval_secs = self.sweep_interval.map(|d| d.as_secs()),
            "engine runner started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                job = jobs.recv() => {
                    let Some(job) = job else { break };
                    let Ok(permit) = Arc::clone(&permits).acquire_owned().await else { break };
                    let strategy = self.strategy.clone();
                    tracker.spawn(async move {
                        strategy.execute_job(job).await;
                        strategy.jobs().complete();
                        drop(permit);
                    });
                }
                _ = sweep.tick(), if sweeping => {
                    if let Err(err) = self.strategy.sweep_ready_waits(SWEEP_BATCH).await {
                        warn!(error = %err, "ready-wait sweep failed");
                    }
                }
            }
        }

        tracker.close();
        debug!(in_flight = tracker.len(), "engine runner draining");
        tracker.wait().await;
        info!("engine runner stopped");
    }
}
