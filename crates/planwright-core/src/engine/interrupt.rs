//! Operator interrupts: pause, resume, abort, skip and the manual
//! intervention resolutions.
//!
//! Interrupts are durable. Abort and pause stay active until discarded and
//! are consulted by the check chain at every start and resume; the effects
//! applied here only move nodes that are parked and would otherwise never
//! reach a checkpoint.

use std::sync::Arc;

use chrono::Utc;
use planwright_types::event::EngineEvent;
use planwright_types::execution::{AdviserResponse, NodeExecution, PlanExecution, Status};
use planwright_types::interrupt::{Interrupt, InterruptState, InterruptType};
use planwright_types::notify::{NotifyPayload, ResumeKind};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::EngineError;
use super::jobs::EngineJob;
use super::strategy::ExecutionStrategy;
use super::wait::intervention_correlation_id;
use crate::event::EventBus;
use crate::repository::{ExecutionRepository, InterruptRepository, WaitNotifyRepository};

/// Registry access for interrupts.
pub struct InterruptService<I> {
    repo: Arc<I>,
    events: EventBus,
}

impl<I> Clone for InterruptService<I> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            events: self.events.clone(),
        }
    }
}

impl<I: InterruptRepository> InterruptService<I> {
    pub fn new(repo: Arc<I>, events: EventBus) -> Self {
        Self { repo, events }
    }

    pub async fn register_signal(&self, interrupt: &Interrupt) -> Result<(), EngineError> {
        self.repo.save_interrupt(interrupt).await?;
        info!(
            interrupt_id = %interrupt.id,
            plan_execution_id = %interrupt.plan_execution_id,
            interrupt_type = %interrupt.interrupt_type,
            node_execution_id = ?interrupt.node_execution_id,
            "interrupt registered"
        );
        self.events.publish(EngineEvent::InterruptRegistered {
            interrupt_id: interrupt.id,
            plan_execution_id: interrupt.plan_execution_id,
            interrupt_type: interrupt.interrupt_type,
        });
        Ok(())
    }

    /// Active interrupts of a plan execution in registration order.
    pub async fn check_pending(&self, plan_execution_id: &Uuid) -> Result<Vec<Interrupt>, EngineError> {
        let mut interrupts = self.repo.list_interrupts(plan_execution_id).await?;
        interrupts.retain(Interrupt::is_active);
        Ok(interrupts)
    }

    pub async fn list(&self, plan_execution_id: &Uuid) -> Result<Vec<Interrupt>, EngineError> {
        Ok(self.repo.list_interrupts(plan_execution_id).await?)
    }

    pub async fn mark_processed(&self, id: &Uuid) -> Result<(), EngineError> {
        Ok(self.repo.update_interrupt_state(id, InterruptState::Processed).await?)
    }

    pub async fn discard(&self, id: &Uuid) -> Result<(), EngineError> {
        Ok(self.repo.update_interrupt_state(id, InterruptState::Discarded).await?)
    }
}

/// Whether `record` is the interrupt's target or lies beneath it.
fn in_scope(interrupt: &Interrupt, record: &NodeExecution) -> bool {
    let enclosing: Vec<Uuid> = record.context.levels.iter().map(|l| l.runtime_id).collect();
    interrupt.covers(record.id, &enclosing)
}

impl<R, W, I> ExecutionStrategy<R, W, I>
where
    R: ExecutionRepository + 'static,
    W: WaitNotifyRepository + 'static,
    I: InterruptRepository + 'static,
{
    /// Validate, register and apply an interrupt.
    pub async fn interrupt(&self, mut interrupt: Interrupt) -> Result<Interrupt, EngineError> {
        let execution = self
            .records
            .get_plan_execution(&interrupt.plan_execution_id)
            .await?
            .ok_or(EngineError::PlanExecutionNotFound(interrupt.plan_execution_id))?;
        self.validate_interrupt(&interrupt, &execution).await?;

        self.interrupts.register_signal(&interrupt).await?;
        self.apply_interrupt(&interrupt).await?;
        self.interrupts.mark_processed(&interrupt.id).await?;

        interrupt.state = InterruptState::Processed;
        interrupt.processed_at = Some(Utc::now());
        Ok(interrupt)
    }

    async fn validate_interrupt(&self, interrupt: &Interrupt, execution: &PlanExecution) -> Result<(), EngineError> {
        if execution.status.is_terminal() {
            return Err(EngineError::Interrupt(format!(
                "plan execution {} already {}",
                execution.id, execution.status
            )));
        }
        let kind = interrupt.interrupt_type;
        let node = match interrupt.node_execution_id {
            Some(id) => {
                let record = self.load_by_id(&id).await?;
                if record.plan_execution_id != execution.id {
                    return Err(EngineError::Interrupt(format!(
                        "node execution {id} does not belong to plan execution {}",
                        execution.id
                    )));
                }
                Some(record)
            }
            None => None,
        };

        match kind {
            InterruptType::Skip if node.is_none() => {
                Err(EngineError::Interrupt("skip requires a node execution".into()))
            }
            InterruptType::Retry | InterruptType::Ignore | InterruptType::MarkFailed => {
                let Some(record) = node else {
                    return Err(EngineError::Interrupt(format!("{kind} requires a node execution")));
                };
                let awaiting = self
                    .waits
                    .pending_waits(&record.id)
                    .await?
                    .iter()
                    .any(|w| w.callback.kind == ResumeKind::Intervention);
                if awaiting {
                    Ok(())
                } else {
                    Err(EngineError::Interrupt(format!(
                        "node execution {} is not awaiting manual intervention",
                        record.id
                    )))
                }
            }
            _ => Ok(()),
        }
    }

    async fn apply_interrupt(&self, interrupt: &Interrupt) -> Result<(), EngineError> {
        match interrupt.interrupt_type {
            InterruptType::Abort => self.apply_abort(interrupt).await,
            InterruptType::Pause => {
                if interrupt.node_execution_id.is_none() {
                    self.set_plan_status(&interrupt.plan_execution_id, &[Status::Queued, Status::Running], Status::Paused)
                        .await?;
                }
                Ok(())
            }
            InterruptType::Resume => self.apply_resume(interrupt).await,
            InterruptType::Retry | InterruptType::Ignore | InterruptType::MarkFailed => {
                let action = match interrupt.interrupt_type {
                    InterruptType::Retry => "retry",
                    InterruptType::Ignore => "ignore",
                    _ => "mark_failed",
                };
                if let Some(node) = interrupt.node_execution_id {
                    self.notify(&intervention_correlation_id(&node), NotifyPayload::ok(json!({ "action": action })))
                        .await?;
                }
                Ok(())
            }
            // Consulted by the skip check when the node next starts.
            InterruptType::Skip => Ok(()),
        }
    }

    async fn apply_abort(&self, interrupt: &Interrupt) -> Result<(), EngineError> {
        let nodes = self.records.list_node_executions(&interrupt.plan_execution_id).await?;
        let mut aborted = 0;
        for record in nodes.iter().filter(|r| in_scope(interrupt, r)) {
            if Status::WAITING.contains(&record.status) {
                self.abort_node(record, Status::WAITING).await?;
                aborted += 1;
            } else if record.adviser_response == Some(AdviserResponse::ManualIntervention)
                && record.status.is_broken()
            {
                self.notify(
                    &intervention_correlation_id(&record.id),
                    NotifyPayload::ok(json!({ "action": "abort" })),
                )
                .await?;
            }
        }
        debug!(interrupt_id = %interrupt.id, aborted, "abort applied to parked nodes");

        if interrupt.node_execution_id.is_none() {
            let remaining = self
                .records
                .list_node_executions(&interrupt.plan_execution_id)
                .await?
                .iter()
                .any(|r| !r.is_terminal());
            if !remaining {
                self.conclude_plan(&interrupt.plan_execution_id, Status::Aborted, None)
                    .await?;
            }
        }
        Ok(())
    }

    async fn apply_resume(&self, interrupt: &Interrupt) -> Result<(), EngineError> {
        let active = self.interrupts.check_pending(&interrupt.plan_execution_id).await?;
        for pause in active.iter().filter(|i| {
            i.interrupt_type == InterruptType::Pause
                && (interrupt.node_execution_id.is_none() || i.node_execution_id == interrupt.node_execution_id)
        }) {
            self.interrupts.discard(&pause.id).await?;
        }
        let still_paused = self
            .interrupts
            .check_pending(&interrupt.plan_execution_id)
            .await?
            .iter()
            .any(|i| i.interrupt_type == InterruptType::Pause && i.node_execution_id.is_none());
        if !still_paused {
            self.set_plan_status(&interrupt.plan_execution_id, &[Status::Paused], Status::Running)
                .await?;
        }

        let nodes = self.records.list_node_executions(&interrupt.plan_execution_id).await?;
        for record in nodes
            .into_iter()
            .filter(|r| r.status == Status::Paused && in_scope(interrupt, r))
        {
            match record.pending_responses {
                Some(responses) => {
                    let is_error = responses.values().any(|p| p.is_error);
                    self.jobs.enqueue(EngineJob::Resume {
                        context: record.context,
                        responses,
                        is_error,
                    });
                }
                None => {
                    let requeued = self
                        .transition(&record.id, &[Status::Paused], Status::Queued, |_| {})
                        .await?;
                    if requeued.is_some() {
                        self.jobs.enqueue(EngineJob::Start { context: record.context });
                    }
                }
            }
        }
        Ok(())
    }

    async fn set_plan_status(&self, id: &Uuid, from: &[Status], to: Status) -> Result<(), EngineError> {
        match self
            .records
            .update_plan_execution(id, from, move |e: &mut PlanExecution| e.status = to)
            .await
        {
            Ok(_) => {
                info!(plan_execution_id = %id, status = %to, "plan execution status changed");
                Ok(())
            }
            Err(err) if err.is_conflict() => {
                warn!(plan_execution_id = %id, status = %to, "plan execution status unchanged");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}
