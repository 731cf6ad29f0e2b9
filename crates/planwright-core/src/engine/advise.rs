//! Adviser evaluation and the control flow it decides.

use std::time::Duration;

use planwright_types::event::EngineEvent;
use planwright_types::execution::{
    AdviserResponse, ExecutionContext, FailureInfo, FailureType, NodeExecution, Status,
};
use planwright_types::notify::{InterventionAction, NotifyPayload, ResumeCallback, ResumeKind, WaitInstance};
use tracing::{debug, error, info, warn};

use super::adviser::AdviseEvent;
use super::error::EngineError;
use super::jobs::EngineJob;
use super::strategy::{ExecutionStrategy, NewExecution};
use super::wait::intervention_correlation_id;
use crate::repository::{ExecutionRepository, InterruptRepository, WaitNotifyRepository};

impl<R, W, I> ExecutionStrategy<R, W, I>
where
    R: ExecutionRepository + 'static,
    W: WaitNotifyRepository + 'static,
    I: InterruptRepository + 'static,
{
    /// Evaluate the adviser chain of a node that concluded `from` -> `to`.
    pub async fn advise(&self, context: &ExecutionContext, from: Status, to: Status) {
        if let Err(err) = self.try_advise(context, from, to).await {
            self.handle_error(context, err).await;
        }
    }

    async fn try_advise(&self, context: &ExecutionContext, from: Status, to: Status) -> Result<(), EngineError> {
        let record = self.load(context).await?;
        if !record.is_terminal() {
            warn!(node_execution_id = %record.id, status = %record.status, "advise ignored, node is not terminal");
            return Ok(());
        }
        if record.adviser_response.is_some() {
            warn!(node_execution_id = %record.id, "advise ignored, node was already advised");
            return Ok(());
        }
        let template = self.template(&record).await?;
        let decision = self.advisers.evaluate(&template, &AdviseEvent {
            record: &record,
            from,
            to,
        });
        match decision {
            Ok(Some(response)) => self.try_process_adviser_response(context, response).await,
            Ok(None) => {
                debug!(node_execution_id = %record.id, status = %to, "no adviser applies");
                self.try_end(context, false).await
            }
            Err(err) => {
                error!(node_execution_id = %record.id, error = %err, "adviser evaluation failed, ending node");
                self.try_end(context, false).await
            }
        }
    }

    /// Act on an adviser decision. Only the first response bound to a
    /// record takes effect.
    pub async fn process_adviser_response(&self, context: &ExecutionContext, response: AdviserResponse) {
        if let Err(err) = self.try_process_adviser_response(context, response).await {
            self.handle_error(context, err).await;
        }
    }

    async fn try_process_adviser_response(
        &self,
        context: &ExecutionContext,
        response: AdviserResponse,
    ) -> Result<(), EngineError> {
        let id = context.runtime_id().ok_or(EngineError::EmptyContext)?;
        if !self.records.bind_adviser_response(&id, &response).await? {
            warn!(node_execution_id = %id, response = response.kind(), "adviser response already bound");
            return Ok(());
        }
        let record = self.load(context).await?;
        info!(
            node_execution_id = %record.id,
            fqn = %context.fqn(),
            status = %record.status,
            response = response.kind(),
            "adviser decided"
        );

        match response {
            AdviserResponse::NextStep {
                next_node_id: Some(next),
            }
            | AdviserResponse::IgnoreFailure {
                next_node_id: Some(next),
            } => self.start_next(&record, &next).await,
            AdviserResponse::NextStep { next_node_id: None } | AdviserResponse::EndBranch => {
                self.try_end(context, false).await
            }
            AdviserResponse::IgnoreFailure { next_node_id: None } => self.try_end(context, true).await,
            AdviserResponse::Retry { wait_secs } => {
                self.start_attempt(&record, Duration::from_secs(wait_secs)).await
            }
            AdviserResponse::MarkParentFailed => self.mark_parent_failed(&record).await,
            AdviserResponse::ManualIntervention => self.request_intervention(&record).await,
        }
    }

    /// Create and start the sibling `node_id` in `record`'s place.
    async fn start_next(&self, record: &NodeExecution, node_id: &str) -> Result<(), EngineError> {
        let template = self.template_for(&record.context.plan_id, node_id).await?;
        let next = self
            .create_execution(&record.context.parent_scope(), &template, NewExecution::following(record))
            .await?;
        self.jobs.enqueue(EngineJob::Start { context: next.context });
        Ok(())
    }

    /// Create the next attempt of `record`'s template and start it after `delay`.
    async fn start_attempt(&self, record: &NodeExecution, delay: Duration) -> Result<(), EngineError> {
        let template = self.template(record).await?;
        let next = self
            .create_execution(&record.context.parent_scope(), &template, NewExecution::retry_of(record))
            .await?;
        info!(
            node_execution_id = %next.id,
            previous_id = %record.id,
            attempt = next.attempt,
            delay_secs = delay.as_secs(),
            "retrying node"
        );
        self.jobs.schedule(EngineJob::Start { context: next.context }, delay);
        Ok(())
    }

    /// Conclude the enclosing scope as failed, or the plan when `record` is
    /// at the root.
    async fn mark_parent_failed(&self, record: &NodeExecution) -> Result<(), EngineError> {
        let mut message = format!("child '{}' failed", record.identifier);
        if let Some(info) = &record.failure_info {
            message.push_str(": ");
            message.push_str(&info.message);
        }
        let info = FailureInfo::new(message).with_type(FailureType::Application);

        match record.parent_id {
            Some(parent_id) => {
                self.waits.discard_waits(&parent_id).await?;
                let parent = self.load_by_id(&parent_id).await?;
                self.try_conclude(&parent.context, Status::Failed, Status::NON_TERMINAL, &[], move |r| {
                    r.failure_info = Some(info);
                })
                .await
            }
            None => {
                self.conclude_plan(&record.plan_execution_id, Status::Failed, Some(info))
                    .await
            }
        }
    }

    async fn request_intervention(&self, record: &NodeExecution) -> Result<(), EngineError> {
        let correlation_id = intervention_correlation_id(&record.id);
        let wait = WaitInstance::new(
            vec![correlation_id.clone()],
            ResumeCallback {
                node_execution_id: record.id,
                plan_execution_id: record.plan_execution_id,
                kind: ResumeKind::Intervention,
            },
        );
        self.waits.register_wait(&wait).await?;
        info!(node_execution_id = %record.id, %correlation_id, "node awaits manual intervention");
        self.events.publish(EngineEvent::InterventionRequested {
            plan_execution_id: record.plan_execution_id,
            node_execution_id: record.id,
            correlation_id,
        });
        Ok(())
    }

    /// Carry out the operator's decision for a node parked on manual
    /// intervention. The payload carries `{"action": "..."}`.
    pub async fn resolve_intervention(&self, context: &ExecutionContext, payload: NotifyPayload) {
        if let Err(err) = self.try_resolve_intervention(context, payload).await {
            self.handle_error(context, err).await;
        }
    }

    async fn try_resolve_intervention(
        &self,
        context: &ExecutionContext,
        payload: NotifyPayload,
    ) -> Result<(), EngineError> {
        let record = self.load(context).await?;
        if record.adviser_response != Some(AdviserResponse::ManualIntervention) {
            warn!(node_execution_id = %record.id, "intervention ignored, node is not awaiting one");
            return Ok(());
        }
        let action: InterventionAction =
            serde_json::from_value(payload.data.get("action").cloned().unwrap_or_default())?;
        info!(node_execution_id = %record.id, %action, "intervention resolved");

        match action {
            InterventionAction::Retry => self.start_attempt(&record, Duration::ZERO).await,
            InterventionAction::Ignore => self.try_end(context, true).await,
            InterventionAction::MarkFailed => self.mark_parent_failed(&record).await,
            InterventionAction::Abort => {
                self.abort_node(&record, &[Status::Failed, Status::Expired]).await
            }
        }
    }
}
