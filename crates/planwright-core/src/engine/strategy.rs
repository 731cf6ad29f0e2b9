//! The node execution strategy.
//!
//! `ExecutionStrategy` owns the lifecycle of a single node execution:
//! create, start (resolve, check, facilitate), resume, conclude, advise and
//! end. Every persisted status change is a conditional update; losing one to
//! a concurrent writer is a no-op, never an error. Node-level errors are
//! routed through `handle_error` and become a failed conclusion, so every
//! started node reaches a terminal status and ends.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use planwright_types::error::RepositoryError;
use planwright_types::event::EngineEvent;
use planwright_types::execution::{
    ExecutionContext, ExecutionMode, ExpansionEntry, ExpansionKind, FailureInfo, Level,
    NodeExecution, StepResponse, StepResponseNotifyData, Status,
};
use planwright_types::notify::{NotifyPayload, ResumeCallback, ResumeKind, WaitInstance};
use planwright_types::plan::{NodeTemplate, Plan};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::adviser::AdviserResolver;
use super::checks::{CheckChain, CheckInput, CheckPhase, ExecutionCheck};
use super::dispatch::{BoxTaskDispatcher, TaskRequest};
use super::error::EngineError;
use super::expression::{ExpressionResolver, JexlResolver, ResolutionScope};
use super::facilitation::{Facilitation, FacilitationResolver};
use super::interrupt::InterruptService;
use super::jobs::{EngineJob, JobQueue};
use super::step::{BoxStepHandler, StepContext, StepError, StepRegistry, failure_from_value};
use crate::event::EventBus;
use crate::repository::{
    ConditionalUpdate, ExecutionRepository, InterruptRepository, WaitNotifyRepository,
};

/// Lineage of a node execution about to be created.
#[derive(Debug, Clone)]
pub struct NewExecution {
    /// Pre-assigned runtime id; a fresh v7 id when `None`.
    pub runtime_id: Option<Uuid>,
    pub notify_id: Option<String>,
    pub parent_id: Option<Uuid>,
    pub previous_id: Option<Uuid>,
    pub attempt: u32,
    pub metadata: BTreeMap<String, String>,
}

impl Default for NewExecution {
    fn default() -> Self {
        Self {
            runtime_id: None,
            notify_id: None,
            parent_id: None,
            previous_id: None,
            attempt: 1,
            metadata: BTreeMap::new(),
        }
    }
}

impl NewExecution {
    /// A child awaited by `parent_id` under `notify_id`.
    pub fn awaited_by(parent_id: Uuid, notify_id: impl Into<String>) -> Self {
        Self {
            notify_id: Some(notify_id.into()),
            parent_id: Some(parent_id),
            ..Self::default()
        }
    }

    /// A sibling that takes over `record`'s place in its scope.
    pub fn following(record: &NodeExecution) -> Self {
        Self {
            notify_id: record.notify_id.clone(),
            parent_id: record.parent_id,
            previous_id: Some(record.id),
            ..Self::default()
        }
    }

    /// The next attempt of `record`'s template.
    pub fn retry_of(record: &NodeExecution) -> Self {
        Self {
            attempt: record.attempt + 1,
            ..Self::following(record)
        }
    }
}

pub struct ExecutionStrategy<R, W, I> {
    pub(crate) records: Arc<R>,
    pub(crate) waits: Arc<W>,
    pub(crate) interrupts: InterruptService<I>,
    pub(crate) resolver: Arc<dyn ExpressionResolver>,
    pub(crate) facilitation: Arc<FacilitationResolver>,
    pub(crate) advisers: Arc<AdviserResolver>,
    pub(crate) checks: Arc<CheckChain>,
    pub(crate) steps: Arc<StepRegistry>,
    pub(crate) dispatcher: Arc<BoxTaskDispatcher>,
    pub(crate) jobs: JobQueue,
    pub(crate) events: EventBus,
    plans: Arc<DashMap<String, Arc<Plan>>>,
}

impl<R, W, I> Clone for ExecutionStrategy<R, W, I> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            waits: Arc::clone(&self.waits),
            interrupts: self.interrupts.clone(),
            resolver: Arc::clone(&self.resolver),
            facilitation: Arc::clone(&self.facilitation),
            advisers: Arc::clone(&self.advisers),
            checks: Arc::clone(&self.checks),
            steps: Arc::clone(&self.steps),
            dispatcher: Arc::clone(&self.dispatcher),
            jobs: self.jobs.clone(),
            events: self.events.clone(),
            plans: Arc::clone(&self.plans),
        }
    }
}

impl<R, W, I> ExecutionStrategy<R, W, I>
where
    R: ExecutionRepository + 'static,
    W: WaitNotifyRepository + 'static,
    I: InterruptRepository + 'static,
{
    /// Build a strategy with the default registries.
    ///
    /// The returned receiver must be handed to an `EngineRunner`; nothing
    /// progresses past the first node boundary until it runs.
    pub fn new(
        records: Arc<R>,
        waits: Arc<W>,
        interrupts: Arc<I>,
        dispatcher: BoxTaskDispatcher,
        events: EventBus,
    ) -> (Self, mpsc::UnboundedReceiver<EngineJob>) {
        let resolver: Arc<dyn ExpressionResolver> = Arc::new(JexlResolver::new());
        let (jobs, receiver) = JobQueue::new();
        let strategy = Self {
            records,
            waits,
            interrupts: InterruptService::new(interrupts, events.clone()),
            checks: Arc::new(CheckChain::standard(Arc::clone(&resolver))),
            resolver,
            facilitation: Arc::new(FacilitationResolver::with_defaults()),
            advisers: Arc::new(AdviserResolver::with_defaults()),
            steps: Arc::new(StepRegistry::with_builtins()),
            dispatcher: Arc::new(dispatcher),
            jobs,
            events,
            plans: Arc::new(DashMap::new()),
        };
        (strategy, receiver)
    }

    pub fn with_steps(mut self, steps: StepRegistry) -> Self {
        self.steps = Arc::new(steps);
        self
    }

    pub fn with_facilitation(mut self, facilitation: FacilitationResolver) -> Self {
        self.facilitation = Arc::new(facilitation);
        self
    }

    pub fn with_advisers(mut self, advisers: AdviserResolver) -> Self {
        self.advisers = Arc::new(advisers);
        self
    }

    /// Swap the expression resolver; the standard check chain is rebuilt
    /// around it.
    pub fn with_resolver(mut self, resolver: Arc<dyn ExpressionResolver>) -> Self {
        self.checks = Arc::new(CheckChain::standard(Arc::clone(&resolver)));
        self.resolver = resolver;
        self
    }

    pub fn with_checks(mut self, checks: CheckChain) -> Self {
        self.checks = Arc::new(checks);
        self
    }

    pub fn records(&self) -> &Arc<R> {
        &self.records
    }

    pub fn waits(&self) -> &Arc<W> {
        &self.waits
    }

    pub fn interrupt_service(&self) -> &InterruptService<I> {
        &self.interrupts
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn step_registry(&self) -> &StepRegistry {
        &self.steps
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub(crate) async fn load(&self, context: &ExecutionContext) -> Result<NodeExecution, EngineError> {
        let id = context.runtime_id().ok_or(EngineError::EmptyContext)?;
        self.load_by_id(&id).await
    }

    pub(crate) async fn load_by_id(&self, id: &Uuid) -> Result<NodeExecution, EngineError> {
        self.records
            .get_node_execution(id)
            .await?
            .ok_or(EngineError::NodeExecutionNotFound(*id))
    }

    /// Plans are immutable once registered, so they are cached by id.
    pub(crate) async fn plan(&self, plan_id: &str) -> Result<Arc<Plan>, EngineError> {
        let cached = self.plans.get(plan_id).map(|plan| Arc::clone(&plan));
        if let Some(plan) = cached {
            return Ok(plan);
        }
        let plan = self
            .records
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| EngineError::PlanNotFound(plan_id.to_string()))?;
        let plan = Arc::new(plan);
        self.plans.insert(plan_id.to_string(), Arc::clone(&plan));
        Ok(plan)
    }

    pub(crate) fn forget_plan(&self, plan_id: &str) {
        self.plans.remove(plan_id);
    }

    pub(crate) async fn template_for(&self, plan_id: &str, node_id: &str) -> Result<NodeTemplate, EngineError> {
        let plan = self.plan(plan_id).await?;
        plan.node(node_id)
            .cloned()
            .ok_or_else(|| EngineError::TemplateNotFound {
                plan_id: plan_id.to_string(),
                node_id: node_id.to_string(),
            })
    }

    pub(crate) async fn template(&self, record: &NodeExecution) -> Result<NodeTemplate, EngineError> {
        self.template_for(&record.context.plan_id, &record.node_id).await
    }

    async fn resolution_scope(&self, context: &ExecutionContext) -> Result<ResolutionScope, EngineError> {
        let execution = self
            .records
            .get_plan_execution(&context.plan_execution_id)
            .await?
            .ok_or(EngineError::PlanExecutionNotFound(context.plan_execution_id))?;
        let expansions = self.records.list_expansions(&context.plan_execution_id).await?;
        Ok(ResolutionScope::build(context, &execution.inputs, &expansions))
    }

    async fn run_checks(
        &self,
        record: &NodeExecution,
        template: &NodeTemplate,
        phase: CheckPhase,
        scope: Option<&ResolutionScope>,
    ) -> Result<ExecutionCheck, EngineError> {
        let interrupts = self.interrupts.check_pending(&record.plan_execution_id).await?;
        let enclosing: Vec<Uuid> = record.context.levels.iter().map(|l| l.runtime_id).collect();
        let input = CheckInput {
            plan_execution_id: record.plan_execution_id,
            node_execution_id: record.id,
            enclosing: &enclosing,
            template,
            interrupts: &interrupts,
            phase,
            scope,
        };
        Ok(self.checks.run(&input)?)
    }

    /// Conditional status update that publishes the transition.
    ///
    /// Returns `None` when another writer moved the record first.
    pub(crate) async fn transition<F>(
        &self,
        id: &Uuid,
        from: &[Status],
        to: Status,
        mutate: F,
    ) -> Result<Option<ConditionalUpdate>, EngineError>
    where
        F: FnOnce(&mut NodeExecution) + Send,
    {
        let result = self
            .records
            .update_node_execution(id, from, move |record: &mut NodeExecution| {
                record.status = to;
                mutate(record);
            })
            .await;
        match result {
            Ok(update) => {
                if update.previous_status != to {
                    debug!(
                        node_execution_id = %id,
                        identifier = %update.record.identifier,
                        from = %update.previous_status,
                        to = %to,
                        "node status changed"
                    );
                    self.events.publish(EngineEvent::NodeStatusChanged {
                        plan_execution_id: update.record.plan_execution_id,
                        node_execution_id: *id,
                        identifier: update.record.identifier.clone(),
                        from: update.previous_status,
                        to,
                    });
                }
                Ok(Some(update))
            }
            Err(RepositoryError::Conflict(reason)) => {
                warn!(node_execution_id = %id, to = %to, %reason, "status update lost to a concurrent writer");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    /// Persist a QUEUED record for `template` one level below `scope`.
    pub async fn create_execution(
        &self,
        scope: &ExecutionContext,
        template: &NodeTemplate,
        new: NewExecution,
    ) -> Result<NodeExecution, EngineError> {
        let id = new.runtime_id.unwrap_or_else(Uuid::now_v7);
        let identifier = if template.identifier.is_empty() {
            template.id.clone()
        } else {
            template.identifier.clone()
        };
        let context = scope.child(Level {
            node_id: template.id.clone(),
            runtime_id: id,
            identifier: identifier.clone(),
            group: template.group.clone(),
            step_type: template.step_type.clone(),
            attempt: new.attempt,
        });
        let stage = context.level_for_group("stage").map(|l| l.identifier.clone());
        let now = Utc::now();
        let record = NodeExecution {
            id,
            node_id: template.id.clone(),
            plan_execution_id: scope.plan_execution_id,
            identifier,
            name: if template.name.is_empty() {
                template.id.clone()
            } else {
                template.name.clone()
            },
            step_type: template.step_type.clone(),
            group: template.group.clone(),
            stage,
            context,
            parent_id: new.parent_id,
            previous_id: new.previous_id,
            notify_id: new.notify_id,
            attempt: new.attempt,
            status: Status::Queued,
            mode: None,
            resolved_parameters: None,
            execution_input: None,
            outputs: None,
            failure_info: None,
            adviser_response: None,
            pending_responses: None,
            metadata: new.metadata,
            created_at: now,
            started_at: None,
            ended_at: None,
            updated_at: now,
        };
        self.records.save_node_execution(&record).await?;
        debug!(
            node_execution_id = %record.id,
            fqn = %record.context.fqn(),
            attempt = record.attempt,
            "node execution created"
        );
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Start and facilitation
    // -----------------------------------------------------------------------

    pub async fn start_execution(&self, context: &ExecutionContext) {
        if let Err(err) = self.try_start(context).await {
            self.handle_error(context, err).await;
        }
    }

    async fn try_start(&self, context: &ExecutionContext) -> Result<(), EngineError> {
        let record = self.load(context).await?;
        if record.status != Status::Queued {
            warn!(node_execution_id = %record.id, status = %record.status, "start ignored, node is not queued");
            return Ok(());
        }
        let template = self.template(&record).await?;

        let scope = self.resolution_scope(context).await?;
        let resolved = self.resolver.resolve(&template.parameters, &scope)?;
        let entry = ExpansionEntry {
            plan_execution_id: record.plan_execution_id,
            node_execution_id: record.id,
            identifier: record.identifier.clone(),
            fqn: context.fqn(),
            kind: ExpansionKind::Parameters,
            value: serde_json::from_slice(&resolved)?,
            recorded_at: Utc::now(),
        };
        self.records
            .save_resolved_parameters(&record.id, &resolved, &entry)
            .await?;

        let check = self
            .run_checks(&record, &template, CheckPhase::Start, Some(&scope))
            .await?;
        if !check.proceed {
            return self.apply_block(&record, check, None).await;
        }

        if template.requires_input && record.execution_input.is_none() {
            return self.request_input(&record, &template).await;
        }
        self.facilitate(context, &template).await
    }

    pub(crate) async fn facilitate(
        &self,
        context: &ExecutionContext,
        template: &NodeTemplate,
    ) -> Result<(), EngineError> {
        match self.facilitation.decide(template, context)? {
            Facilitation::Custom => {
                let id = context.runtime_id().ok_or(EngineError::EmptyContext)?;
                info!(node_execution_id = %id, node_id = %template.id, "facilitation requested out of band");
                self.events.publish(EngineEvent::FacilitationRequested {
                    plan_execution_id: context.plan_execution_id,
                    node_execution_id: id,
                    node_id: template.id.clone(),
                });
                Ok(())
            }
            Facilitation::Decided(decision) => {
                debug!(mode = ?decision.mode, rationale = %decision.rationale, "facilitation decided");
                self.try_process_facilitation(context, decision.mode).await
            }
        }
    }

    /// Run a node in the mode an external facilitator decided.
    pub async fn process_facilitation_response(&self, context: &ExecutionContext, mode: ExecutionMode) {
        if let Err(err) = self.try_process_facilitation(context, mode).await {
            self.handle_error(context, err).await;
        }
    }

    async fn try_process_facilitation(
        &self,
        context: &ExecutionContext,
        mode: ExecutionMode,
    ) -> Result<(), EngineError> {
        let record = self.load(context).await?;
        if record.status != Status::Queued {
            warn!(node_execution_id = %record.id, status = %record.status, "facilitation ignored, node is not queued");
            return Ok(());
        }
        let template = self.template(&record).await?;
        let check = self.run_checks(&record, &template, CheckPhase::Resume, None).await?;
        if !check.proceed {
            return self.apply_block(&record, check, None).await;
        }
        let handler = self.steps.get(&record.step_type)?;
        if !self.records.bind_execution_mode(&record.id, mode).await? {
            warn!(node_execution_id = %record.id, ?mode, "facilitation ignored, node already facilitated");
            return Ok(());
        }

        match mode {
            ExecutionMode::Inline => {
                let started = self
                    .transition(&record.id, &[Status::Queued], Status::Running, |r| r.started_at = Some(Utc::now()))
                    .await?;
                let Some(update) = started else {
                    return Ok(());
                };
                self.mark_plan_running(&record.plan_execution_id).await;
                let step = step_context(&update.record, &template);
                let response = handler.execute(&step).await?;
                self.try_process_step_response(context, response).await
            }
            ExecutionMode::AsyncTask => self.dispatch_task(context, &record, &template, handler).await,
            ExecutionMode::Children => self.start_children(context, &record, &template, handler).await,
        }
    }

    async fn dispatch_task(
        &self,
        context: &ExecutionContext,
        record: &NodeExecution,
        template: &NodeTemplate,
        handler: &BoxStepHandler,
    ) -> Result<(), EngineError> {
        let payload = handler.build_task(&step_context(record, template))?;
        let correlation_id = format!("task-{}", Uuid::now_v7());

        let tagged = correlation_id.clone();
        let claimed = self
            .transition(&record.id, &[Status::Queued], Status::Queued, move |r| {
                r.metadata.insert("task_correlation_id".to_string(), tagged);
            })
            .await?;
        if claimed.is_none() {
            return Ok(());
        }

        let wait = WaitInstance::new(
            vec![correlation_id.clone()],
            ResumeCallback {
                node_execution_id: record.id,
                plan_execution_id: record.plan_execution_id,
                kind: ResumeKind::StepResponse,
            },
        );
        self.waits.register_wait(&wait).await?;

        self.dispatcher
            .dispatch(TaskRequest {
                correlation_id: correlation_id.clone(),
                node_execution_id: record.id,
                plan_execution_id: record.plan_execution_id,
                step_type: record.step_type.clone(),
                payload,
            })
            .await?;
        info!(
            node_execution_id = %record.id,
            fqn = %context.fqn(),
            %correlation_id,
            "task dispatched"
        );
        self.events.publish(EngineEvent::TaskDispatched {
            plan_execution_id: record.plan_execution_id,
            node_execution_id: record.id,
            correlation_id,
            step_type: record.step_type.clone(),
        });
        Ok(())
    }

    async fn start_children(
        &self,
        context: &ExecutionContext,
        record: &NodeExecution,
        template: &NodeTemplate,
        handler: &BoxStepHandler,
    ) -> Result<(), EngineError> {
        let started = self
            .transition(&record.id, &[Status::Queued], Status::Running, |r| r.started_at = Some(Utc::now()))
            .await?;
        let Some(update) = started else {
            return Ok(());
        };
        self.mark_plan_running(&record.plan_execution_id).await;

        let child_ids = handler.obtain_children(&step_context(&update.record, template))?;
        if child_ids.is_empty() {
            return self
                .try_process_step_response(context, StepResponse::succeeded(None))
                .await;
        }

        let plan = self.plan(&context.plan_id).await?;
        let mut children = Vec::with_capacity(child_ids.len());
        for child_id in &child_ids {
            let child_template = plan.node(child_id).ok_or_else(|| EngineError::TemplateNotFound {
                plan_id: context.plan_id.clone(),
                node_id: child_id.clone(),
            })?;
            let notify_id = format!("child-{}", Uuid::now_v7());
            let child = self
                .create_execution(context, child_template, NewExecution::awaited_by(record.id, notify_id))
                .await?;
            children.push(child);
        }

        let wait = WaitInstance::new(
            children.iter().filter_map(|c| c.notify_id.clone()).collect(),
            ResumeCallback {
                node_execution_id: record.id,
                plan_execution_id: record.plan_execution_id,
                kind: ResumeKind::StepResponse,
            },
        );
        self.waits.register_wait(&wait).await?;

        let suspended = self
            .transition(&record.id, &[Status::Running], Status::Suspended, |_| {})
            .await?;
        if suspended.is_none() {
            return Ok(());
        }
        debug!(node_execution_id = %record.id, children = children.len(), "children started");
        for child in children {
            self.jobs.enqueue(EngineJob::Start { context: child.context });
        }
        Ok(())
    }

    /// Act on a checker that refused to let the node proceed.
    async fn apply_block(
        &self,
        record: &NodeExecution,
        check: ExecutionCheck,
        stash: Option<BTreeMap<String, NotifyPayload>>,
    ) -> Result<(), EngineError> {
        match check.status {
            Some(Status::Aborted) => {
                info!(node_execution_id = %record.id, reason = %check.reason, "node aborted");
                self.abort_node(record, Status::NON_TERMINAL).await
            }
            Some(Status::Skipped) => {
                info!(node_execution_id = %record.id, reason = %check.reason, "node skipped");
                self.try_conclude(&record.context, Status::Skipped, Status::NON_TERMINAL, &[], |_| {})
                    .await
            }
            Some(Status::Paused) => {
                self.transition(&record.id, Status::NON_TERMINAL, Status::Paused, move |r| {
                    if stash.is_some() {
                        r.pending_responses = stash;
                    }
                })
                .await?;
                info!(node_execution_id = %record.id, reason = %check.reason, "node parked by pause");
                Ok(())
            }
            other => {
                debug!(node_execution_id = %record.id, status = ?other, reason = %check.reason, "node blocked");
                Ok(())
            }
        }
    }

    /// Move a node straight to ABORTED and end it.
    pub(crate) async fn abort_node(&self, record: &NodeExecution, from: &[Status]) -> Result<(), EngineError> {
        let aborted = self
            .transition(&record.id, from, Status::Aborted, |r| {
                r.ended_at = Some(Utc::now());
                r.pending_responses = None;
            })
            .await?;
        if aborted.is_none() {
            return Ok(());
        }
        self.waits.discard_waits(&record.id).await?;
        self.try_end(&record.context, false).await
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    /// Continue a node whose wait was claimed with `responses`.
    pub async fn resume_execution(
        &self,
        context: &ExecutionContext,
        responses: BTreeMap<String, NotifyPayload>,
        is_error: bool,
    ) {
        if let Err(err) = self.try_resume(context, responses, is_error).await {
            self.handle_error(context, err).await;
        }
    }

    async fn try_resume(
        &self,
        context: &ExecutionContext,
        responses: BTreeMap<String, NotifyPayload>,
        is_error: bool,
    ) -> Result<(), EngineError> {
        let record = self.load(context).await?;
        if !record.status.is_resumable() {
            warn!(node_execution_id = %record.id, status = %record.status, "resume ignored, node is not resumable");
            return Ok(());
        }
        let template = self.template(&record).await?;
        let check = self.run_checks(&record, &template, CheckPhase::Resume, None).await?;
        if !check.proceed {
            return self.apply_block(&record, check, Some(responses)).await;
        }

        let record = if record.status == Status::Running {
            record
        } else {
            let resumed = self
                .transition(&record.id, Status::WAITING, Status::Running, |r| {
                    r.pending_responses = None;
                    if r.started_at.is_none() {
                        r.started_at = Some(Utc::now());
                    }
                })
                .await?;
            let Some(update) = resumed else {
                return Ok(());
            };
            self.mark_plan_running(&record.plan_execution_id).await;
            update.record
        };

        if is_error {
            let info = responses
                .values()
                .find(|p| p.is_error)
                .map(|p| failure_from_value(&p.data))
                .unwrap_or_else(|| FailureInfo::new("async task reported an error"));
            return Err(EngineError::AsyncTask(info));
        }

        let handler = self.steps.get(&record.step_type)?;
        let step = step_context(&record, &template);
        let response = match record.mode {
            Some(ExecutionMode::Children) => {
                let mut notifications = Vec::with_capacity(responses.len());
                for payload in responses.values() {
                    notifications.push(serde_json::from_value::<StepResponseNotifyData>(payload.data.clone())?);
                }
                handler.handle_children_response(&step, &notifications)
            }
            _ => {
                let payload = responses
                    .values()
                    .next()
                    .ok_or_else(|| StepError::InvalidResponse("resumed without a response".into()))?;
                handler.handle_task_response(&step, payload)?
            }
        };
        self.try_process_step_response(context, response).await
    }

    // -----------------------------------------------------------------------
    // Conclude and end
    // -----------------------------------------------------------------------

    /// Record a handler's response as the node's conclusion.
    pub async fn process_step_response(&self, context: &ExecutionContext, response: StepResponse) {
        if let Err(err) = self.try_process_step_response(context, response).await {
            self.handle_error(context, err).await;
        }
    }

    pub(crate) async fn try_process_step_response(
        &self,
        context: &ExecutionContext,
        response: StepResponse,
    ) -> Result<(), EngineError> {
        let StepResponse {
            status,
            outputs,
            failure_info,
        } = response;
        self.try_conclude(context, status, Status::RESUMABLE, &[], move |r| {
            r.outputs = outputs;
            r.failure_info = failure_info;
        })
        .await
    }

    /// Move the node to a terminal `to` status from `from`, or from a
    /// terminal status listed in `overridable`.
    pub async fn conclude_execution(
        &self,
        context: &ExecutionContext,
        to: Status,
        from: &[Status],
        overridable: &[Status],
    ) {
        if let Err(err) = self.try_conclude(context, to, from, overridable, |_| {}).await {
            self.handle_error(context, err).await;
        }
    }

    pub(crate) async fn try_conclude<F>(
        &self,
        context: &ExecutionContext,
        to: Status,
        from: &[Status],
        overridable: &[Status],
        mutate: F,
    ) -> Result<(), EngineError>
    where
        F: FnOnce(&mut NodeExecution) + Send,
    {
        if !to.is_terminal() {
            return Err(StepError::InvalidResponse(format!("cannot conclude with non-terminal status '{to}'")).into());
        }
        let id = context.runtime_id().ok_or(EngineError::EmptyContext)?;
        let mut allowed = from.to_vec();
        allowed.extend_from_slice(overridable);

        let concluded = self
            .transition(&id, &allowed, to, move |r| {
                r.ended_at = Some(Utc::now());
                r.pending_responses = None;
                mutate(r);
            })
            .await?;
        let Some(update) = concluded else {
            return Ok(());
        };
        let record = update.record;

        if let Some(outputs) = &record.outputs {
            self.records
                .append_expansion(&ExpansionEntry {
                    plan_execution_id: record.plan_execution_id,
                    node_execution_id: record.id,
                    identifier: record.identifier.clone(),
                    fqn: record.context.fqn(),
                    kind: ExpansionKind::Outputs,
                    value: outputs.clone(),
                    recorded_at: Utc::now(),
                })
                .await?;
        }

        let template = self.template(&record).await?;
        if template.has_advisers() {
            self.jobs.enqueue(EngineJob::Advise {
                context: record.context.clone(),
                from: update.previous_status,
                to,
            });
            return Ok(());
        }
        self.try_end(&record.context, false).await
    }

    /// Report a terminal node to whoever awaits it.
    pub async fn end_execution(&self, context: &ExecutionContext) {
        if let Err(err) = self.try_end(context, false).await {
            error!(fqn = %context.fqn(), error = %err, "failed to end node execution");
        }
    }

    /// Notify the awaiting parent, or conclude the plan when the node has
    /// no one waiting on it.
    pub(crate) async fn try_end(&self, context: &ExecutionContext, failure_ignored: bool) -> Result<(), EngineError> {
        let record = self.load(context).await?;
        match &record.notify_id {
            Some(notify_id) => {
                let data = serde_json::to_value(record.notify_data(failure_ignored))?;
                debug!(node_execution_id = %record.id, status = %record.status, %notify_id, "node ended, notifying parent");
                self.notify(notify_id, NotifyPayload::ok(data)).await?;
                Ok(())
            }
            None => {
                let status = plan_status_for(record.status, failure_ignored);
                let failure_info = if status.is_broken() {
                    record.failure_info.clone()
                } else {
                    None
                };
                self.conclude_plan(&record.plan_execution_id, status, failure_info).await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Errors
    // -----------------------------------------------------------------------

    /// Turn a node-level error into a failed conclusion.
    ///
    /// Failures while doing so are logged; they never propagate.
    pub async fn handle_error(&self, context: &ExecutionContext, err: EngineError) {
        if err.is_conflict() {
            debug!(fqn = %context.fqn(), error = %err, "lost a concurrent update, dropping");
            return;
        }
        warn!(fqn = %context.fqn(), error = %err, "node execution failed");
        if let Err(inner) = self.try_handle_error(context, err.failure_info()).await {
            error!(fqn = %context.fqn(), error = %inner, "failed to record node failure");
        }
    }

    async fn try_handle_error(&self, context: &ExecutionContext, info: FailureInfo) -> Result<(), EngineError> {
        let record = self.load(context).await?;
        if record.is_terminal() {
            return self.try_end(context, false).await;
        }
        self.waits.discard_waits(&record.id).await?;
        let failed = StepResponse::failed(info);
        let StepResponse {
            status,
            failure_info,
            ..
        } = failed;
        self.try_conclude(context, status, Status::NON_TERMINAL, &[], move |r| {
            r.failure_info = failure_info;
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    pub async fn execute_job(&self, job: EngineJob) {
        debug!(job = job.kind(), fqn = %job.context().fqn(), "executing engine job");
        match job {
            EngineJob::Start { context } => self.start_execution(&context).await,
            EngineJob::Resume {
                context,
                responses,
                is_error,
            } => self.resume_execution(&context, responses, is_error).await,
            EngineJob::Advise { context, from, to } => self.advise(&context, from, to).await,
            EngineJob::InputReceived { context, payload } => self.receive_input(&context, payload).await,
            EngineJob::InterventionResolved { context, payload } => {
                self.resolve_intervention(&context, payload).await
            }
        }
    }
}

/// Step handlers see the resolved parameters with manual input under `input`.
fn step_context(record: &NodeExecution, template: &NodeTemplate) -> StepContext {
    let mut parameters = record.parameters().unwrap_or(Value::Null);
    if let Some(input) = &record.execution_input {
        match &mut parameters {
            Value::Object(fields) => {
                fields.insert("input".to_string(), input.clone());
            }
            Value::Null => {
                parameters = serde_json::json!({ "input": input });
            }
            _ => {}
        }
    }
    StepContext {
        record: record.clone(),
        template: template.clone(),
        parameters,
    }
}

/// Plan status reported when the root scope's last node ends.
fn plan_status_for(status: Status, failure_ignored: bool) -> Status {
    match status {
        Status::Succeeded | Status::Skipped => Status::Succeeded,
        Status::Failed | Status::Expired if failure_ignored => Status::Succeeded,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_execution_lineage() {
        let plan_execution_id = Uuid::now_v7();
        let mut record = crate::engine::testing::record(plan_execution_id, "build");
        record.notify_id = Some("child-1".into());
        record.parent_id = Some(Uuid::now_v7());
        record.attempt = 2;

        let next = NewExecution::following(&record);
        assert_eq!(next.notify_id.as_deref(), Some("child-1"));
        assert_eq!(next.parent_id, record.parent_id);
        assert_eq!(next.previous_id, Some(record.id));
        assert_eq!(next.attempt, 1);

        let retry = NewExecution::retry_of(&record);
        assert_eq!(retry.attempt, 3);
        assert_eq!(retry.previous_id, Some(record.id));
    }

    #[test]
    fn plan_status_mapping() {
        assert_eq!(plan_status_for(Status::Skipped, false), Status::Succeeded);
        assert_eq!(plan_status_for(Status::Failed, true), Status::Succeeded);
        assert_eq!(plan_status_for(Status::Expired, false), Status::Expired);
        assert_eq!(plan_status_for(Status::Aborted, true), Status::Aborted);
    }

    #[test]
    fn manual_input_is_merged_into_parameters() {
        let plan_execution_id = Uuid::now_v7();
        let mut record = crate::engine::testing::record(plan_execution_id, "gate");
        record.resolved_parameters = Some(br#"{"env":"prod"}"#.to_vec());
        record.execution_input = Some(serde_json::json!({"approved": true}));
        let template = crate::engine::testing::template("gate", "approval");

        let step = step_context(&record, &template);
        assert_eq!(step.parameters["env"], "prod");
        assert_eq!(step.parameters["input"]["approved"], true);
    }

    mod lifecycle {
        use planwright_types::event::EngineEvent;
        use planwright_types::execution::{ExecutionMode, FailureType, Status};
        use planwright_types::interrupt::{Interrupt, InterruptType};
        use planwright_types::notify::NotifyPayload;
        use planwright_types::plan::{AdviserConfig, AdviserType, FacilitatorType};
        use serde_json::json;

        use super::*;
        use crate::engine::plan::PlanService;
        use crate::engine::testing::{Harness, PlanBuilder};

        #[tokio::test]
        async fn children_outputs_are_aggregated() {
            let h = Harness::new();
            let plan = PlanBuilder::new("fanout")
                .node("root", "section", json!({"children": ["a", "b"]}))
                .children("root")
                .node("a", "echo", json!({"v": "{{ inputs.name }}"}))
                .node("b", "noop", json!(null))
                .build();
            let execution = h.run(plan, json!({"name": "x"})).await;

            assert_eq!(execution.status, Status::Succeeded);
            let nodes = h.nodes(&execution.id).await;
            let root = nodes.iter().find(|n| n.node_id == "root").unwrap();
            assert_eq!(root.mode, Some(ExecutionMode::Children));
            assert_eq!(root.outputs.as_ref().unwrap()["a"], json!({"v": "x"}));
            let a = nodes.iter().find(|n| n.node_id == "a").unwrap();
            assert_eq!(a.parent_id, Some(root.id));
            assert_eq!(a.context.fqn(), "root.a");
        }

        #[tokio::test]
        async fn async_task_resumes_on_callback() {
            let h = Harness::new();
            let plan = PlanBuilder::new("remote")
                .node("call", "shell", json!({"command": "echo ok"}))
                .async_task("call")
                .build();
            let execution = h.run(plan, json!({})).await;
            assert_eq!(execution.status, Status::Queued);

            let task = h.take_task().unwrap();
            assert_eq!(task.payload, json!({"command": "echo ok"}));
            h.strategy
                .notify(&task.correlation_id, NotifyPayload::ok(json!({"exit_code": 0, "stdout": "ok\n"})))
                .await
                .unwrap();
            h.idle().await;

            assert_eq!(h.execution(&execution.id).await.status, Status::Succeeded);
            let node = &h.nodes(&execution.id).await[0];
            assert_eq!(node.mode, Some(ExecutionMode::AsyncTask));
            assert_eq!(node.outputs.as_ref().unwrap()["stdout"], "ok\n");
        }

        #[tokio::test]
        async fn async_error_fails_from_running() {
            let h = Harness::new();
            let mut events = h.strategy.events().subscribe();
            let plan = PlanBuilder::new("remote")
                .node("call", "shell", json!({"command": "false"}))
                .async_task("call")
                .build();
            let execution = h.run(plan, json!({})).await;
            let task = h.take_task().unwrap();
            h.strategy
                .notify(&task.correlation_id, NotifyPayload::error(json!({"message": "worker crashed"})))
                .await
                .unwrap();
            h.idle().await;

            let node = &h.nodes(&execution.id).await[0];
            assert_eq!(node.status, Status::Failed);
            assert_eq!(node.failure_info.as_ref().unwrap().message, "worker crashed");
            assert_eq!(h.execution(&execution.id).await.status, Status::Failed);

            let mut transitions = Vec::new();
            while let Ok(event) = events.try_recv() {
                if let EngineEvent::NodeStatusChanged { from, to, .. } = event {
                    transitions.push((from, to));
                }
            }
            assert_eq!(
                transitions,
                vec![(Status::Queued, Status::Running), (Status::Running, Status::Failed)]
            );
        }

        #[tokio::test]
        async fn handler_and_resolution_errors_fail_the_node() {
            let h = Harness::new();
            let raised = h
                .run(PlanBuilder::new("raise").node("n", "fail", json!({"raise": true})).build(), json!({}))
                .await;
            assert_eq!(raised.status, Status::Failed);
            let info = raised.failure_info.unwrap();
            assert_eq!(info.failure_types, vec![FailureType::Application]);

            let unresolved = h
                .run(PlanBuilder::new("bad").node("n", "echo", json!({"x": "{{ inputs.x"})).build(), json!({}))
                .await;
            assert_eq!(unresolved.status, Status::Failed);
            let node = &h.nodes(&unresolved.id).await[0];
            assert!(node.failure_info.as_ref().unwrap().failure_types.contains(&FailureType::Resolution));
        }

        #[tokio::test]
        async fn timeout_failures_expire() {
            let h = Harness::new();
            let plan = PlanBuilder::new("slow")
                .node("n", "fail", json!({"message": "too slow", "failure_types": ["timeout"]}))
                .build();
            let execution = h.run(plan, json!({})).await;
            assert_eq!(execution.status, Status::Expired);
        }

        #[tokio::test]
        async fn skip_condition_skips_the_node() {
            let h = Harness::new();
            let plan = PlanBuilder::new("conditional")
                .node("n", "fail", json!({}))
                .skip_when("n", "inputs.env == 'dev'")
                .build();
            let execution = h.run(plan, json!({"env": "dev"})).await;
            assert_eq!(execution.status, Status::Succeeded);
            assert_eq!(h.nodes(&execution.id).await[0].status, Status::Skipped);
        }

        #[tokio::test]
        async fn custom_facilitation_waits_for_a_decision() {
            let h = Harness::new();
            let plan = PlanBuilder::new("custom")
                .node("n", "echo", json!({"k": 1}))
                .facilitator("n", FacilitatorType::Custom)
                .build();
            let execution = h.run(plan, json!({})).await;
            let node = h.nodes(&execution.id).await.remove(0);
            assert_eq!(node.status, Status::Queued);

            h.strategy
                .process_facilitation_response(&node.context, ExecutionMode::Inline)
                .await;
            h.idle().await;
            assert_eq!(h.execution(&execution.id).await.status, Status::Succeeded);
        }

        #[tokio::test]
        async fn repeated_async_facilitation_dispatches_once() {
            let h = Harness::new();
            let plan = PlanBuilder::new("custom")
                .node("call", "shell", json!({"command": "echo ok"}))
                .facilitator("call", FacilitatorType::Custom)
                .build();
            let execution = h.run(plan, json!({})).await;
            let node = h.nodes(&execution.id).await.remove(0);

            h.strategy
                .process_facilitation_response(&node.context, ExecutionMode::AsyncTask)
                .await;
            h.strategy
                .process_facilitation_response(&node.context, ExecutionMode::AsyncTask)
                .await;
            h.strategy
                .process_facilitation_response(&node.context, ExecutionMode::Inline)
                .await;
            h.idle().await;

            assert!(h.take_task().is_some());
            assert!(h.take_task().is_none());
            let node = h.nodes(&execution.id).await.remove(0);
            assert_eq!(node.status, Status::Queued);
            assert_eq!(node.mode, Some(ExecutionMode::AsyncTask));
            assert_eq!(h.strategy.waits().pending_waits(&node.id).await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn abort_on_a_scope_stops_later_work_beneath_it() {
            let (strategy, mut jobs) = Harness::strategy();
            let service = PlanService::new(strategy.clone());
            let plan = PlanBuilder::new("scoped")
                .node("root", "section", json!({"children": ["a"]}))
                .children("root")
                .node("a", "echo", json!({"k": 1}))
                .adviser("a", AdviserConfig::new(AdviserType::OnSuccess).with_next("b"))
                .node("b", "echo", json!({"k": 2}))
                .build();
            service.save_plan(plan).await.unwrap();
            let (execution, root) = service
                .create_plan_execution("scoped", json!({}), BTreeMap::new())
                .await
                .unwrap();

            strategy.start_execution(&root.context).await;
            let start_a = jobs.try_recv().unwrap();
            strategy.execute_job(start_a).await;

            strategy
                .interrupt(Interrupt::new(execution.id, InterruptType::Abort).for_node(root.id))
                .await
                .unwrap();
            while let Ok(job) = jobs.try_recv() {
                strategy.execute_job(job).await;
            }

            let nodes = strategy.records().list_node_executions(&execution.id).await.unwrap();
            let status = |id: &str| nodes.iter().find(|n| n.node_id == id).map(|n| n.status);
            assert_eq!(status("a"), Some(Status::Succeeded));
            assert_eq!(status("b"), Some(Status::Aborted));
            assert_eq!(status("root"), Some(Status::Aborted));
        }

        #[tokio::test]
        async fn late_resume_after_conclusion_is_ignored() {
            let h = Harness::new();
            let plan = PlanBuilder::new("once").node("n", "echo", json!({"k": 1})).build();
            let execution = h.run(plan, json!({})).await;
            let before = h.nodes(&execution.id).await.remove(0);

            h.strategy
                .resume_execution(&before.context, BTreeMap::new(), true)
                .await;
            h.idle().await;

            let after = h.nodes(&execution.id).await.remove(0);
            assert_eq!(after.status, Status::Succeeded);
            assert_eq!(after.updated_at, before.updated_at);
        }

        #[tokio::test]
        async fn duplicate_runtime_ids_conflict() {
            let h = Harness::new();
            let plan = PlanBuilder::new("p").node("n", "noop", json!(null)).build();
            let execution = h.create(plan, json!({})).await;
            let scope = ExecutionContext::new(execution.id, "p");
            let template = crate::engine::testing::template("n", "noop");
            let new = NewExecution {
                runtime_id: execution.root_node_execution_id,
                ..NewExecution::default()
            };
            let err = h.strategy.create_execution(&scope, &template, new).await.unwrap_err();
            assert!(err.is_conflict());
        }

        #[tokio::test]
        async fn pause_stashes_a_callback_until_resume() {
            let h = Harness::new();
            let plan = PlanBuilder::new("remote")
                .node("call", "echo", json!({"x": 1}))
                .async_task("call")
                .build();
            let execution = h.run(plan, json!({})).await;
            let task = h.take_task().unwrap();

            h.strategy
                .interrupt(Interrupt::new(execution.id, InterruptType::Pause))
                .await
                .unwrap();
            h.strategy
                .notify(&task.correlation_id, NotifyPayload::ok(json!({"x": 2})))
                .await
                .unwrap();
            h.idle().await;

            let parked = h.nodes(&execution.id).await.remove(0);
            assert_eq!(parked.status, Status::Paused);
            assert!(parked.pending_responses.is_some());

            h.strategy
                .interrupt(Interrupt::new(execution.id, InterruptType::Resume))
                .await
                .unwrap();
            h.idle().await;

            let done = h.nodes(&execution.id).await.remove(0);
            assert_eq!(done.status, Status::Succeeded);
            assert_eq!(done.outputs, Some(json!({"x": 2})));
            assert_eq!(h.execution(&execution.id).await.status, Status::Succeeded);
        }
    }
}
