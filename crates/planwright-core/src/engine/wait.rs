//! Wait/notify continuations.
//!
//! `notify` records a payload and, for every wait that became ready, claims
//! it and enqueues the continuation its callback names. Claiming is atomic in
//! the repository, so when several deliveries race to complete the same wait
//! exactly one of them resumes the node.

use planwright_types::event::EngineEvent;
use planwright_types::execution::{ExecutionContext, NodeExecution, Status};
use planwright_types::notify::{NotifyPayload, ResumeCallback, ResumeKind, WaitInstance};
use planwright_types::plan::NodeTemplate;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::EngineError;
use super::jobs::EngineJob;
use super::step::failure_from_value;
use super::strategy::ExecutionStrategy;
use crate::repository::{ExecutionRepository, InterruptRepository, WaitNotifyRepository};

/// Correlation id a node waiting for manual input is resumed with.
pub fn input_correlation_id(node_execution_id: &Uuid) -> String {
    format!("input-{node_execution_id}")
}

/// Correlation id a node parked on manual intervention is resumed with.
pub fn intervention_correlation_id(node_execution_id: &Uuid) -> String {
    format!("intervention-{node_execution_id}")
}

impl<R, W, I> ExecutionStrategy<R, W, I>
where
    R: ExecutionRepository + 'static,
    W: WaitNotifyRepository + 'static,
    I: InterruptRepository + 'static,
{
    /// Deliver `payload` for `correlation_id`.
    ///
    /// Returns `false` when a payload was already recorded for the id; the
    /// first delivery wins and later ones are ignored.
    pub async fn notify(&self, correlation_id: &str, payload: NotifyPayload) -> Result<bool, EngineError> {
        if !self.waits.deliver(correlation_id, &payload).await? {
            debug!(%correlation_id, "duplicate notification ignored");
            return Ok(false);
        }
        for wait in self.waits.ready_waits(correlation_id).await? {
            self.claim_and_enqueue(&wait.id).await?;
        }
        Ok(true)
    }

    /// Claim a ready wait and enqueue its continuation. Returns `false`
    /// when another claimant got there first.
    pub(crate) async fn claim_and_enqueue(&self, wait_id: &Uuid) -> Result<bool, EngineError> {
        let Some(claimed) = self.waits.claim(wait_id).await? else {
            return Ok(false);
        };
        let ResumeCallback {
            node_execution_id,
            kind,
            ..
        } = claimed.wait.callback;
        let Some(record) = self.records.get_node_execution(&node_execution_id).await? else {
            warn!(%node_execution_id, wait_id = %wait_id, "claimed wait for an unknown node");
            return Ok(true);
        };
        let context = record.context;
        let job = match kind {
            ResumeKind::StepResponse => EngineJob::Resume {
                context,
                is_error: claimed.responses.values().any(|p| p.is_error),
                responses: claimed.responses,
            },
            ResumeKind::ExecutionInput => match claimed.responses.into_values().next() {
                Some(payload) => EngineJob::InputReceived { context, payload },
                None => return Ok(true),
            },
            ResumeKind::Intervention => match claimed.responses.into_values().next() {
                Some(payload) => EngineJob::InterventionResolved { context, payload },
                None => return Ok(true),
            },
        };
        debug!(%node_execution_id, job = job.kind(), "wait claimed");
        self.jobs.enqueue(job);
        Ok(true)
    }

    /// Claim waits whose payloads are complete but that nobody claimed,
    /// e.g. after a crash between delivery and claim.
    pub async fn sweep_ready_waits(&self, limit: u32) -> Result<usize, EngineError> {
        let mut resumed = 0;
        for wait in self.waits.list_ready_waits(limit).await? {
            if self.claim_and_enqueue(&wait.id).await? {
                resumed += 1;
            }
        }
        if resumed > 0 {
            info!(resumed, "sweeper resumed ready waits");
        }
        Ok(resumed)
    }

    /// Park a QUEUED node until manual input arrives.
    pub(crate) async fn request_input(&self, record: &NodeExecution, template: &NodeTemplate) -> Result<(), EngineError> {
        let correlation_id = input_correlation_id(&record.id);
        let wait = WaitInstance::new(
            vec![correlation_id.clone()],
            ResumeCallback {
                node_execution_id: record.id,
                plan_execution_id: record.plan_execution_id,
                kind: ResumeKind::ExecutionInput,
            },
        );
        self.waits.register_wait(&wait).await?;
        info!(node_execution_id = %record.id, %correlation_id, "node awaits manual input");
        self.events.publish(EngineEvent::InputRequested {
            plan_execution_id: record.plan_execution_id,
            node_execution_id: record.id,
            correlation_id,
            prompt: template.input_prompt.clone(),
        });
        Ok(())
    }

    /// Store manual input on the node and continue with facilitation.
    pub async fn receive_input(&self, context: &ExecutionContext, payload: NotifyPayload) {
        if let Err(err) = self.try_receive_input(context, payload).await {
            self.handle_error(context, err).await;
        }
    }

    async fn try_receive_input(&self, context: &ExecutionContext, payload: NotifyPayload) -> Result<(), EngineError> {
        let record = self.load(context).await?;
        if record.status != Status::Queued {
            warn!(node_execution_id = %record.id, status = %record.status, "input ignored, node is not queued");
            return Ok(());
        }
        if payload.is_error {
            return Err(EngineError::AsyncTask(failure_from_value(&payload.data)));
        }
        let input = payload.data;
        let stored = self
            .transition(&record.id, &[Status::Queued], Status::Queued, move |r| {
                r.execution_input = Some(input);
            })
            .await?;
        if stored.is_none() {
            return Ok(());
        }
        let template = self.template(&record).await?;
        self.facilitate(context, &template).await
    }
}
