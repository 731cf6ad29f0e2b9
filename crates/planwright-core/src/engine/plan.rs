//! Plan definitions and plan executions.
//!
//! Plans are parsed from YAML and validated as a graph before they are
//! stored: every `children` and `next_node_id` reference must name a node of
//! the plan, and following those edges must never lead back to a node.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use planwright_types::error::RepositoryError;
use planwright_types::event::EngineEvent;
use planwright_types::execution::{ExecutionContext, FailureInfo, NodeExecution, PlanExecution, Status};
use planwright_types::plan::Plan;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::EngineError;
use super::jobs::EngineJob;
use super::strategy::{ExecutionStrategy, NewExecution};
use crate::repository::{ExecutionRepository, InterruptRepository, WaitNotifyRepository};

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("failed to parse plan: {0}")]
    Parse(String),

    #[error("plan id must not be empty")]
    EmptyId,

    #[error("plan '{0}' has no nodes")]
    NoNodes(String),

    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("root node '{0}' is not defined")]
    MissingRoot(String),

    #[error("node '{node}' references unknown node '{target}'")]
    UnknownReference { node: String, target: String },

    #[error("cycle detected involving node '{0}'")]
    CycleDetected(String),
}

/// Parse a YAML plan, default each node's identifier to its id, and
/// validate the result.
pub fn parse_plan_yaml(yaml: &str) -> Result<Plan, PlanError> {
    let mut plan: Plan = serde_yaml_ng::from_str(yaml).map_err(|e| PlanError::Parse(e.to_string()))?;
    normalize(&mut plan);
    validate_plan(&plan)?;
    Ok(plan)
}

fn normalize(plan: &mut Plan) {
    if plan.name.is_empty() {
        plan.name = plan.id.clone();
    }
    for node in &mut plan.nodes {
        if node.identifier.is_empty() {
            node.identifier = node.id.clone();
        }
    }
}

/// Check ids, references and acyclicity of the child and next-step edges.
pub fn validate_plan(plan: &Plan) -> Result<(), PlanError> {
    if plan.id.trim().is_empty() {
        return Err(PlanError::EmptyId);
    }
    if plan.nodes.is_empty() {
        return Err(PlanError::NoNodes(plan.id.clone()));
    }

    let mut graph = DiGraph::<&str, ()>::new();
    let mut indices = HashMap::new();
    for node in &plan.nodes {
        if indices.contains_key(node.id.as_str()) {
            return Err(PlanError::DuplicateNode(node.id.clone()));
        }
        indices.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
    }
    if !indices.contains_key(plan.root.as_str()) {
        return Err(PlanError::MissingRoot(plan.root.clone()));
    }

    for node in &plan.nodes {
        let from = indices[node.id.as_str()];
        let children = node.child_ids();
        let targets = children.iter().map(String::as_str).chain(node.next_ids());
        for target in targets {
            let to = indices.get(target).ok_or_else(|| PlanError::UnknownReference {
                node: node.id.clone(),
                target: target.to_string(),
            })?;
            graph.add_edge(from, *to, ());
        }
    }

    toposort(&graph, None).map_err(|cycle| PlanError::CycleDetected(graph[cycle.node_id()].to_string()))?;
    Ok(())
}

impl<R, W, I> ExecutionStrategy<R, W, I>
where
    R: ExecutionRepository + 'static,
    W: WaitNotifyRepository + 'static,
    I: InterruptRepository + 'static,
{
    /// Move a plan execution to a terminal status. Concluding an already
    /// concluded execution is a no-op.
    pub async fn conclude_plan(
        &self,
        plan_execution_id: &Uuid,
        status: Status,
        failure_info: Option<FailureInfo>,
    ) -> Result<(), EngineError> {
        let result = self
            .records
            .update_plan_execution(plan_execution_id, Status::NON_TERMINAL, move |e: &mut PlanExecution| {
                e.status = status;
                e.failure_info = failure_info;
                e.ended_at = Some(Utc::now());
            })
            .await;
        match result {
            Ok(execution) => {
                info!(plan_execution_id = %execution.id, plan_id = %execution.plan_id, status = %status, "plan execution concluded");
                self.events.publish(EngineEvent::PlanConcluded {
                    plan_execution_id: execution.id,
                    status,
                });
                Ok(())
            }
            Err(RepositoryError::Conflict(reason)) => {
                debug!(%plan_execution_id, %reason, "plan execution already concluded");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// First node to start moves the plan execution out of QUEUED.
    pub(crate) async fn mark_plan_running(&self, plan_execution_id: &Uuid) {
        let result = self
            .records
            .update_plan_execution(plan_execution_id, &[Status::Queued], |e: &mut PlanExecution| {
                e.status = Status::Running;
            })
            .await;
        match result {
            Ok(_) => debug!(%plan_execution_id, "plan execution running"),
            Err(RepositoryError::Conflict(_)) => {}
            Err(err) => warn!(%plan_execution_id, error = %err, "failed to mark plan execution running"),
        }
    }
}

/// Entry point for registering plans and starting plan executions.
pub struct PlanService<R, W, I> {
    strategy: ExecutionStrategy<R, W, I>,
}

impl<R, W, I> Clone for PlanService<R, W, I> {
    fn clone(&self) -> Self {
        Self {
            strategy: self.strategy.clone(),
        }
    }
}

impl<R, W, I> PlanService<R, W, I>
where
    R: ExecutionRepository + 'static,
    W: WaitNotifyRepository + 'static,
    I: InterruptRepository + 'static,
{
    pub fn new(strategy: ExecutionStrategy<R, W, I>) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> &ExecutionStrategy<R, W, I> {
        &self.strategy
    }

    pub async fn register_plan(&self, yaml: &str) -> Result<Plan, EngineError> {
        let plan = parse_plan_yaml(yaml)?;
        self.save_plan(plan).await
    }

    pub async fn save_plan(&self, mut plan: Plan) -> Result<Plan, EngineError> {
        normalize(&mut plan);
        validate_plan(&plan)?;
        self.strategy.records.save_plan(&plan).await?;
        self.strategy.forget_plan(&plan.id);
        info!(plan_id = %plan.id, nodes = plan.nodes.len(), "plan registered");
        Ok(plan)
    }

    pub async fn get_plan(&self, plan_id: &str) -> Result<Plan, EngineError> {
        self.strategy
            .records
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| EngineError::PlanNotFound(plan_id.to_string()))
    }

    pub async fn list_plans(&self) -> Result<Vec<Plan>, EngineError> {
        Ok(self.strategy.records.list_plans().await?)
    }

    /// Create a plan execution and its root node, without starting it.
    pub async fn create_plan_execution(
        &self,
        plan_id: &str,
        inputs: Value,
        metadata: BTreeMap<String, String>,
    ) -> Result<(PlanExecution, NodeExecution), EngineError> {
        let plan = self.strategy.plan(plan_id).await?;
        let root = plan.node(&plan.root).ok_or_else(|| EngineError::TemplateNotFound {
            plan_id: plan.id.clone(),
            node_id: plan.root.clone(),
        })?;

        let id = Uuid::now_v7();
        let root_id = Uuid::now_v7();
        let execution = PlanExecution {
            id,
            plan_id: plan.id.clone(),
            status: Status::Queued,
            inputs,
            metadata: metadata.clone(),
            root_node_execution_id: Some(root_id),
            failure_info: None,
            started_at: Utc::now(),
            ended_at: None,
        };
        self.strategy.records.create_plan_execution(&execution).await?;

        let scope = ExecutionContext::new(id, plan.id.clone()).with_metadata(metadata);
        let record = self
            .strategy
            .create_execution(
                &scope,
                root,
                NewExecution {
                    runtime_id: Some(root_id),
                    ..NewExecution::default()
                },
            )
            .await?;
        Ok((execution, record))
    }

    /// Create a plan execution and enqueue its root node.
    pub async fn start_plan(
        &self,
        plan_id: &str,
        inputs: Value,
        metadata: BTreeMap<String, String>,
    ) -> Result<PlanExecution, EngineError> {
        let (execution, root) = self.create_plan_execution(plan_id, inputs, metadata).await?;
        info!(plan_execution_id = %execution.id, %plan_id, "plan execution started");
        self.strategy.events.publish(EngineEvent::PlanStarted {
            plan_execution_id: execution.id,
            plan_id: plan_id.to_string(),
        });
        self.strategy.jobs.enqueue(EngineJob::Start { context: root.context });
        Ok(execution)
    }

    pub async fn conclude_plan(
        &self,
        plan_execution_id: &Uuid,
        status: Status,
        failure_info: Option<FailureInfo>,
    ) -> Result<(), EngineError> {
        self.strategy.conclude_plan(plan_execution_id, status, failure_info).await
    }

    pub async fn get_execution(&self, id: &Uuid) -> Result<PlanExecution, EngineError> {
        self.strategy
            .records
            .get_plan_execution(id)
            .await?
            .ok_or(EngineError::PlanExecutionNotFound(*id))
    }

    pub async fn list_executions(&self, plan_id: &str, limit: u32) -> Result<Vec<PlanExecution>, EngineError> {
        Ok(self.strategy.records.list_plan_executions(plan_id, limit).await?)
    }

    pub async fn list_nodes(&self, plan_execution_id: &Uuid) -> Result<Vec<NodeExecution>, EngineError> {
        Ok(self.strategy.records.list_node_executions(plan_execution_id).await?)
    }
}
