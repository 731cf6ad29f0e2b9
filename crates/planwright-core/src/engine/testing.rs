//! Test harness: the engine over in-memory repositories with a running
//! job runner.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use planwright_types::execution::{ExecutionContext, Level, NodeExecution, PlanExecution, Status};
use planwright_types::plan::{AdviserConfig, FacilitatorConfig, FacilitatorType, NodeTemplate, Plan};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::dispatch::{BoxTaskDispatcher, ChannelTaskDispatcher, TaskRequest};
use super::jobs::EngineJob;
use super::plan::PlanService;
use super::runner::EngineRunner;
use super::strategy::ExecutionStrategy;
use crate::event::EventBus;
use crate::repository::ExecutionRepository;
use crate::repository::memory::{
    MemoryExecutionRepository, MemoryInterruptRepository, MemoryWaitNotifyRepository,
};

pub(crate) type MemoryStrategy =
    ExecutionStrategy<MemoryExecutionRepository, MemoryWaitNotifyRepository, MemoryInterruptRepository>;

pub(crate) struct Harness {
    pub strategy: MemoryStrategy,
    tasks: Mutex<mpsc::UnboundedReceiver<TaskRequest>>,
    shutdown: CancellationToken,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_sweep(interval: Duration) -> Self {
        Self::build(Some(interval))
    }

    /// A bare strategy and its job receiver, with no runner attached.
    pub fn strategy() -> (MemoryStrategy, mpsc::UnboundedReceiver<EngineJob>) {
        let (dispatcher, _tasks) = ChannelTaskDispatcher::channel();
        MemoryStrategy::new(
            Arc::new(MemoryExecutionRepository::new()),
            Arc::new(MemoryWaitNotifyRepository::new()),
            Arc::new(MemoryInterruptRepository::new()),
            BoxTaskDispatcher::new(dispatcher),
            EventBus::new(256),
        )
    }

    fn build(sweep: Option<Duration>) -> Self {
        let (dispatcher, tasks) = ChannelTaskDispatcher::channel();
        let (strategy, jobs) = MemoryStrategy::new(
            Arc::new(MemoryExecutionRepository::new()),
            Arc::new(MemoryWaitNotifyRepository::new()),
            Arc::new(MemoryInterruptRepository::new()),
            BoxTaskDispatcher::new(dispatcher),
            EventBus::new(256),
        );
        let shutdown = CancellationToken::new();
        tokio::spawn(EngineRunner::new(strategy.clone(), 8, sweep).run(jobs, shutdown.clone()));
        Self {
            strategy,
            tasks: Mutex::new(tasks),
            shutdown,
        }
    }

    pub fn service(&self) -> PlanService<MemoryExecutionRepository, MemoryWaitNotifyRepository, MemoryInterruptRepository> {
        PlanService::new(self.strategy.clone())
    }

    /// Store `plan` and create an execution without starting it.
    pub async fn create(&self, plan: Plan, inputs: Value) -> PlanExecution {
        let service = self.service();
        let plan = service.save_plan(plan).await.unwrap();
        let (execution, _) = service
            .create_plan_execution(&plan.id, inputs, BTreeMap::new())
            .await
            .unwrap();
        execution
    }

    /// Enqueue the start of a created execution's root node.
    pub async fn kick(&self, plan_execution_id: &Uuid) {
        let execution = self.execution(plan_execution_id).await;
        let root = execution.root_node_execution_id.unwrap();
        let record = self.strategy.records().get_node_execution(&root).await.unwrap().unwrap();
        self.strategy.jobs().enqueue(EngineJob::Start {
            context: record.context,
        });
    }

    pub async fn start(&self, plan: Plan, inputs: Value) -> PlanExecution {
        let service = self.service();
        let plan = service.save_plan(plan).await.unwrap();
        service.start_plan(&plan.id, inputs, BTreeMap::new()).await.unwrap()
    }

    /// Start `plan`, wait until the engine goes idle and return the
    /// execution as stored.
    pub async fn run(&self, plan: Plan, inputs: Value) -> PlanExecution {
        let execution = self.start(plan, inputs).await;
        self.idle().await;
        self.execution(&execution.id).await
    }

    pub async fn idle(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.strategy.jobs().wait_idle())
            .await
            .expect("engine did not go idle");
    }

    pub async fn execution(&self, id: &Uuid) -> PlanExecution {
        self.strategy.records().get_plan_execution(id).await.unwrap().unwrap()
    }

    pub async fn nodes(&self, plan_execution_id: &Uuid) -> Vec<NodeExecution> {
        self.strategy
            .records()
            .list_node_executions(plan_execution_id)
            .await
            .unwrap()
    }

    /// Next task handed to the dispatcher, if any.
    pub fn take_task(&self) -> Option<TaskRequest> {
        self.tasks.lock().unwrap().try_recv().ok()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub(crate) struct PlanBuilder {
    plan: Plan,
}

impl PlanBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            plan: Plan {
                id: id.to_string(),
                name: id.to_string(),
                description: None,
                root: String::new(),
                nodes: Vec::new(),
            },
        }
    }

    /// Add a node; the first node added is the root.
    pub fn node(mut self, id: &str, step_type: &str, parameters: Value) -> Self {
        if self.plan.root.is_empty() {
            self.plan.root = id.to_string();
        }
        let mut node = template(id, step_type);
        node.parameters = parameters;
        self.plan.nodes.push(node);
        self
    }

    fn get(&mut self, id: &str) -> &mut NodeTemplate {
        self.plan.nodes.iter_mut().find(|n| n.id == id).unwrap()
    }

    pub fn adviser(mut self, id: &str, config: AdviserConfig) -> Self {
        self.get(id).advisers.push(config);
        self
    }

    pub fn facilitator(mut self, id: &str, kind: FacilitatorType) -> Self {
        self.get(id).facilitator = FacilitatorConfig { kind };
        self
    }

    pub fn children(self, id: &str) -> Self {
        self.facilitator(id, FacilitatorType::Children)
    }

    pub fn async_task(self, id: &str) -> Self {
        self.facilitator(id, FacilitatorType::AsyncTask)
    }

    pub fn requires_input(mut self, id: &str) -> Self {
        self.get(id).requires_input = true;
        self
    }

    pub fn skip_when(mut self, id: &str, condition: &str) -> Self {
        self.get(id).skip_when = Some(condition.to_string());
        self
    }

    pub fn build(self) -> Plan {
        self.plan
    }
}

pub(crate) fn template(id: &str, step_type: &str) -> NodeTemplate {
    NodeTemplate {
        id: id.to_string(),
        identifier: id.to_string(),
        name: String::new(),
        step_type: step_type.to_string(),
        parameters: Value::Null,
        facilitator: FacilitatorConfig::default(),
        advisers: Vec::new(),
        group: None,
        skip_when: None,
        requires_input: false,
        input_prompt: None,
    }
}

/// A QUEUED root-level record for `node_id`.
pub(crate) fn record(plan_execution_id: Uuid, node_id: &str) -> NodeExecution {
    let id = Uuid::now_v7();
    let context = ExecutionContext::new(plan_execution_id, "plan").child(Level {
        node_id: node_id.to_string(),
        runtime_id: id,
        identifier: node_id.to_string(),
        group: None,
        step_type: "echo".to_string(),
        attempt: 1,
    });
    NodeExecution {
        id,
        node_id: node_id.to_string(),
        plan_execution_id,
        identifier: node_id.to_string(),
        name: node_id.to_string(),
        step_type: "echo".to_string(),
        group: None,
        stage: None,
        context,
        parent_id: None,
        previous_id: None,
        notify_id: None,
        attempt: 1,
        status: Status::Queued,
        mode: None,
        resolved_parameters: None,
        execution_input: None,
        outputs: None,
        failure_info: None,
        adviser_response: None,
        pending_responses: None,
        metadata: BTreeMap::new(),
        created_at: Utc::now(),
        started_at: None,
        ended_at: None,
        updated_at: Utc::now(),
    }
}
