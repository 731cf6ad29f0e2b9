//! Engine job queue.
//!
//! Every continuation that crosses a node boundary (adviser evaluation, child
//! and sibling starts, resumes after a claimed wait, delayed retries) is an
//! `EngineJob`. The queue tracks how many jobs are queued or running so
//! callers can wait for the engine to go idle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use planwright_types::execution::{ExecutionContext, Status};
use planwright_types::notify::NotifyPayload;
use tokio::sync::{Notify, mpsc};

#[derive(Debug, Clone)]
pub enum EngineJob {
    Start {
        context: ExecutionContext,
    },
    Resume {
        context: ExecutionContext,
        responses: BTreeMap<String, NotifyPayload>,
        is_error: bool,
    },
    Advise {
        context: ExecutionContext,
        from: Status,
        to: Status,
    },
    InputReceived {
        context: ExecutionContext,
        payload: NotifyPayload,
    },
    InterventionResolved {
        context: ExecutionContext,
        payload: NotifyPayload,
    },
}

impl EngineJob {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineJob::Start { .. } => "start",
            EngineJob::Resume { .. } => "resume",
            EngineJob::Advise { .. } => "advise",
            EngineJob::InputReceived { .. } => "input_received",
            EngineJob::InterventionResolved { .. } => "intervention_resolved",
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        match self {
            EngineJob::Start { context }
            | EngineJob::Resume { context, .. }
            | EngineJob::Advise { context, .. }
            | EngineJob::InputReceived { context, .. }
            | EngineJob::InterventionResolved { context, .. } => context,
        }
    }
}

#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::UnboundedSender<EngineJob>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl JobQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Self {
            sender,
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        };
        (queue, receiver)
    }

    pub fn enqueue(&self, job: EngineJob) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(job)) = self.sender.send(job) {
            tracing::warn!(job = job.kind(), "engine job queue closed, dropping job");
            self.complete();
        }
    }

    /// Enqueue `job` after `delay` without blocking the caller.
    pub fn schedule(&self, job: EngineJob, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(job);
            return;
        }
        // Count the job now so the queue is not idle while the timer runs.
        self.pending.fetch_add(1, Ordering::SeqCst);
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(job);
            queue.complete();
        });
    }

    /// Mark one job finished.
    pub fn complete(&self) {
        let previous = self.pending.fetch_sub(1, Ordering::SeqCst);
        if previous <= 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Resolve once no job is queued, running or scheduled.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}
