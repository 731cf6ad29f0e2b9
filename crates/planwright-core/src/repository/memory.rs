//! In-memory repository adapters.
//!
//! DashMap-backed implementations of every storage port. Per-record
//! conditional updates hold the map entry's write guard for the whole
//! read-check-write, which gives the same compare-and-set semantics the
//! SQLite adapters get from their `version` column.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use planwright_types::error::RepositoryError;
use planwright_types::execution::{
    AdviserResponse, ExecutionMode, ExpansionEntry, NodeExecution, PlanExecution, Status,
};
use planwright_types::interrupt::{Interrupt, InterruptState};
use planwright_types::notify::{ClaimedWait, NotifyPayload, WaitInstance, WaitState};
use planwright_types::plan::Plan;
use uuid::Uuid;

use super::execution::{ConditionalUpdate, ExecutionRepository};
use super::interrupt::InterruptRepository;
use super::wait_notify::WaitNotifyRepository;

fn status_conflict(id: &Uuid, status: Status) -> RepositoryError {
    RepositoryError::Conflict(format!("record {id} is {status}"))
}

// ---------------------------------------------------------------------------
// Execution records
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryExecutionRepository {
    plans: DashMap<String, Plan>,
    plan_executions: DashMap<Uuid, PlanExecution>,
    nodes: DashMap<Uuid, NodeExecution>,
    expansions: Mutex<Vec<ExpansionEntry>>,
}

impl MemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn expansions(&self) -> MutexGuard<'_, Vec<ExpansionEntry>> {
        self.expansions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ExecutionRepository for MemoryExecutionRepository {
    async fn save_plan(&self, plan: &Plan) -> Result<(), RepositoryError> {
        self.plans.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>, RepositoryError> {
        Ok(self.plans.get(plan_id).map(|p| p.clone()))
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, RepositoryError> {
        let mut plans: Vec<Plan> = self.plans.iter().map(|p| p.clone()).collect();
        plans.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(plans)
    }

    async fn create_plan_execution(&self, execution: &PlanExecution) -> Result<(), RepositoryError> {
        match self.plan_executions.entry(execution.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "plan execution {} already exists",
                execution.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(execution.clone());
                Ok(())
            }
        }
    }

    async fn get_plan_execution(&self, id: &Uuid) -> Result<Option<PlanExecution>, RepositoryError> {
        Ok(self.plan_executions.get(id).map(|e| e.clone()))
    }

    async fn list_plan_executions(
        &self,
        plan_id: &str,
        limit: u32,
    ) -> Result<Vec<PlanExecution>, RepositoryError> {
        let mut runs: Vec<PlanExecution> = self
            .plan_executions
            .iter()
            .filter(|e| e.plan_id == plan_id)
            .map(|e| e.clone())
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn update_plan_execution<F>(
        &self,
        id: &Uuid,
        from: &[Status],
        mutate: F,
    ) -> Result<PlanExecution, RepositoryError>
    where
        F: FnOnce(&mut PlanExecution) + Send,
    {
        let mut entry = self
            .plan_executions
            .get_mut(id)
            .ok_or(RepositoryError::NotFound)?;
        if !from.contains(&entry.status) {
            return Err(status_conflict(id, entry.status));
        }
        mutate(&mut entry);
        Ok((*entry).clone())
    }

    async fn save_node_execution(&self, record: &NodeExecution) -> Result<(), RepositoryError> {
        match self.nodes.entry(record.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "node execution {} already exists",
                record.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get_node_execution(&self, id: &Uuid) -> Result<Option<NodeExecution>, RepositoryError> {
        Ok(self.nodes.get(id).map(|n| n.clone()))
    }

    async fn update_node_execution<F>(
        &self,
        id: &Uuid,
        from: &[Status],
        mutate: F,
    ) -> Result<ConditionalUpdate, RepositoryError>
    where
        F: FnOnce(&mut NodeExecution) + Send,
    {
        let mut entry = self.nodes.get_mut(id).ok_or(RepositoryError::NotFound)?;
        let previous_status = entry.status;
        if !from.contains(&previous_status) {
            return Err(status_conflict(id, previous_status));
        }
        mutate(&mut entry);
        entry.updated_at = Utc::now();
        Ok(ConditionalUpdate {
            previous_status,
            record: (*entry).clone(),
        })
    }

    async fn bind_execution_mode(&self, id: &Uuid, mode: ExecutionMode) -> Result<bool, RepositoryError> {
        let mut entry = self.nodes.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if entry.status != Status::Queued || entry.mode.is_some() {
            return Ok(false);
        }
        entry.mode = Some(mode);
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn bind_adviser_response(
        &self,
        id: &Uuid,
        response: &AdviserResponse,
    ) -> Result<bool, RepositoryError> {
        let mut entry = self.nodes.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if !entry.status.is_terminal() || entry.adviser_response.is_some() {
            return Ok(false);
        }
        entry.adviser_response = Some(response.clone());
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_node_executions(
        &self,
        plan_execution_id: &Uuid,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        let mut records: Vec<NodeExecution> = self
            .nodes
            .iter()
            .filter(|n| n.plan_execution_id == *plan_execution_id)
            .map(|n| n.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn list_children(&self, parent_id: &Uuid) -> Result<Vec<NodeExecution>, RepositoryError> {
        let mut records: Vec<NodeExecution> = self
            .nodes
            .iter()
            .filter(|n| n.parent_id == Some(*parent_id))
            .map(|n| n.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn save_resolved_parameters(
        &self,
        id: &Uuid,
        resolved: &[u8],
        entry: &ExpansionEntry,
    ) -> Result<(), RepositoryError> {
        let mut record = self.nodes.get_mut(id).ok_or(RepositoryError::NotFound)?;
        record.resolved_parameters = Some(resolved.to_vec());
        record.updated_at = Utc::now();

        let mut index = self.expansions();
        match index
            .iter_mut()
            .find(|e| e.node_execution_id == entry.node_execution_id && e.kind == entry.kind)
        {
            Some(existing) => *existing = entry.clone(),
            None => index.push(entry.clone()),
        }
        Ok(())
    }

    async fn append_expansion(&self, entry: &ExpansionEntry) -> Result<(), RepositoryError> {
        self.expansions().push(entry.clone());
        Ok(())
    }

    async fn list_expansions(
        &self,
        plan_execution_id: &Uuid,
    ) -> Result<Vec<ExpansionEntry>, RepositoryError> {
        Ok(self
            .expansions()
            .iter()
            .filter(|e| e.plan_execution_id == *plan_execution_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Wait/notify registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Registry {
    waits: HashMap<Uuid, WaitInstance>,
    by_correlation: HashMap<String, Vec<Uuid>>,
    payloads: HashMap<String, NotifyPayload>,
}

impl Registry {
    fn is_ready(&self, wait: &WaitInstance) -> bool {
        wait.state == WaitState::Pending
            && wait
                .correlation_ids
                .iter()
                .all(|id| self.payloads.contains_key(id))
    }
}

/// Registry state behind one mutex so claim sees a consistent snapshot.
#[derive(Default)]
pub struct MemoryWaitNotifyRepository {
    inner: Mutex<Registry>,
}

impl MemoryWaitNotifyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WaitNotifyRepository for MemoryWaitNotifyRepository {
    async fn register_wait(&self, wait: &WaitInstance) -> Result<(), RepositoryError> {
        let mut reg = self.registry();
        if reg.waits.contains_key(&wait.id) {
            return Err(RepositoryError::Conflict(format!("wait {} already exists", wait.id)));
        }
        for cid in &wait.correlation_ids {
            reg.by_correlation.entry(cid.clone()).or_default().push(wait.id);
        }
        reg.waits.insert(wait.id, wait.clone());
        Ok(())
    }

    async fn deliver(&self, correlation_id: &str, payload: &NotifyPayload) -> Result<bool, RepositoryError> {
        let mut reg = self.registry();
        if reg.payloads.contains_key(correlation_id) {
            return Ok(false);
        }
        reg.payloads.insert(correlation_id.to_string(), payload.clone());
        Ok(true)
    }

    async fn ready_waits(&self, correlation_id: &str) -> Result<Vec<WaitInstance>, RepositoryError> {
        let reg = self.registry();
        let ids = reg.by_correlation.get(correlation_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| reg.waits.get(id))
            .filter(|w| reg.is_ready(w))
            .cloned()
            .collect())
    }

    async fn claim(&self, wait_id: &Uuid) -> Result<Option<ClaimedWait>, RepositoryError> {
        let mut reg = self.registry();
        let ready = reg.waits.get(wait_id).is_some_and(|w| reg.is_ready(w));
        if !ready {
            return Ok(None);
        }
        let Some(wait) = reg.waits.get_mut(wait_id) else {
            return Ok(None);
        };
        wait.state = WaitState::Claimed;
        wait.claimed_at = Some(Utc::now());
        let wait = wait.clone();
        let responses: BTreeMap<String, NotifyPayload> = wait
            .correlation_ids
            .iter()
            .filter_map(|cid| reg.payloads.get(cid).map(|p| (cid.clone(), p.clone())))
            .collect();
        Ok(Some(ClaimedWait { wait, responses }))
    }

    async fn list_ready_waits(&self, limit: u32) -> Result<Vec<WaitInstance>, RepositoryError> {
        let reg = self.registry();
        let mut ready: Vec<WaitInstance> = reg
            .waits
            .values()
            .filter(|w| reg.is_ready(w))
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        ready.truncate(limit as usize);
        Ok(ready)
    }

    async fn discard_waits(&self, node_execution_id: &Uuid) -> Result<u64, RepositoryError> {
        let mut reg = self.registry();
        let mut discarded = 0;
        for wait in reg.waits.values_mut() {
            if wait.callback.node_execution_id == *node_execution_id
                && wait.state == WaitState::Pending
            {
                wait.state = WaitState::Discarded;
                discarded += 1;
            }
        }
        Ok(discarded)
    }

    async fn pending_waits(&self, node_execution_id: &Uuid) -> Result<Vec<WaitInstance>, RepositoryError> {
        let reg = self.registry();
        Ok(reg
            .waits
            .values()
            .filter(|w| {
                w.callback.node_execution_id == *node_execution_id && w.state == WaitState::Pending
            })
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Interrupts
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryInterruptRepository {
    interrupts: DashMap<Uuid, Interrupt>,
}

impl MemoryInterruptRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InterruptRepository for MemoryInterruptRepository {
    async fn save_interrupt(&self, interrupt: &Interrupt) -> Result<(), RepositoryError> {
        self.interrupts.insert(interrupt.id, interrupt.clone());
        Ok(())
    }

    async fn list_interrupts(&self, plan_execution_id: &Uuid) -> Result<Vec<Interrupt>, RepositoryError> {
        let mut list: Vec<Interrupt> = self
            .interrupts
            .iter()
            .filter(|i| i.plan_execution_id == *plan_execution_id)
            .map(|i| i.clone())
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn update_interrupt_state(&self, id: &Uuid, state: InterruptState) -> Result<(), RepositoryError> {
        let mut entry = self.interrupts.get_mut(id).ok_or(RepositoryError::NotFound)?;
        entry.state = state;
        if state == InterruptState::Processed {
            entry.processed_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planwright_types::execution::{ExecutionContext, ExpansionKind, Level};
    use planwright_types::interrupt::InterruptType;
    use planwright_types::notify::{ResumeCallback, ResumeKind};
    use serde_json::json;

    fn record(plan_execution_id: Uuid) -> NodeExecution {
        let id = Uuid::now_v7();
        let context = ExecutionContext::new(plan_execution_id, "release").child(Level {
            node_id: "build".into(),
            runtime_id: id,
            identifier: "build".into(),
            group: None,
            step_type: "echo".into(),
            attempt: 1,
        });
        NodeExecution {
            id,
            node_id: "build".into(),
            plan_execution_id,
            identifier: "build".into(),
            name: "Build".into(),
            step_type: "echo".into(),
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

    fn callback(node: Uuid) -> ResumeCallback {
        ResumeCallback {
            node_execution_id: node,
            plan_execution_id: Uuid::now_v7(),
            kind: ResumeKind::StepResponse,
        }
    }

    #[tokio::test]
    async fn duplicate_runtime_id_is_conflict() {
        let repo = MemoryExecutionRepository::new();
        let rec = record(Uuid::now_v7());
        repo.save_node_execution(&rec).await.unwrap();
        let err = repo.save_node_execution(&rec).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn conditional_update_checks_status() {
        let repo = MemoryExecutionRepository::new();
        let rec = record(Uuid::now_v7());
        repo.save_node_execution(&rec).await.unwrap();

        let update = repo
            .update_node_execution(&rec.id, &[Status::Queued], |r| r.status = Status::Running)
            .await
            .unwrap();
        assert_eq!(update.previous_status, Status::Queued);
        assert_eq!(update.record.status, Status::Running);

        let err = repo
            .update_node_execution(&rec.id, &[Status::Queued], |r| r.status = Status::Aborted)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let missing = repo
            .update_node_execution(&Uuid::now_v7(), &[Status::Queued], |_| {})
            .await
            .unwrap_err();
        assert!(matches!(missing, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn adviser_response_binds_once_on_terminal_records() {
        let repo = MemoryExecutionRepository::new();
        let mut rec = record(Uuid::now_v7());
        repo.save_node_execution(&rec).await.unwrap();

        assert!(!repo.bind_adviser_response(&rec.id, &AdviserResponse::EndBranch).await.unwrap());

        rec.status = Status::Failed;
        repo.update_node_execution(&rec.id, &[Status::Queued], |r| r.status = Status::Failed)
            .await
            .unwrap();
        assert!(repo.bind_adviser_response(&rec.id, &AdviserResponse::EndBranch).await.unwrap());
        assert!(!repo
            .bind_adviser_response(&rec.id, &AdviserResponse::MarkParentFailed)
            .await
            .unwrap());

        let stored = repo.get_node_execution(&rec.id).await.unwrap().unwrap();
        assert_eq!(stored.adviser_response, Some(AdviserResponse::EndBranch));
    }

    #[tokio::test]
    async fn execution_mode_binds_once_on_queued_records() {
        let repo = MemoryExecutionRepository::new();
        let rec = record(Uuid::now_v7());
        repo.save_node_execution(&rec).await.unwrap();

        assert!(repo.bind_execution_mode(&rec.id, ExecutionMode::AsyncTask).await.unwrap());
        assert!(!repo.bind_execution_mode(&rec.id, ExecutionMode::Inline).await.unwrap());

        let stored = repo.get_node_execution(&rec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Queued);
        assert_eq!(stored.mode, Some(ExecutionMode::AsyncTask));
    }

    #[tokio::test]
    async fn resolved_parameters_are_indexed() {
        let repo = MemoryExecutionRepository::new();
        let rec = record(Uuid::now_v7());
        repo.save_node_execution(&rec).await.unwrap();

        let entry = ExpansionEntry {
            plan_execution_id: rec.plan_execution_id,
            node_execution_id: rec.id,
            identifier: "build".into(),
            fqn: "build".into(),
            kind: ExpansionKind::Parameters,
            value: json!({"target": "x86"}),
            recorded_at: Utc::now(),
        };
        repo.save_resolved_parameters(&rec.id, br#"{"target":"x86"}"#, &entry)
            .await
            .unwrap();

        let stored = repo.get_node_execution(&rec.id).await.unwrap().unwrap();
        assert_eq!(stored.parameters(), Some(json!({"target": "x86"})));
        let index = repo.list_expansions(&rec.plan_execution_id).await.unwrap();
        assert_eq!(index.len(), 1);
        assert!(repo.list_expansions(&Uuid::now_v7()).await.unwrap().is_empty());

        // Resolving again on re-start replaces the entry.
        let again = ExpansionEntry {
            value: json!({"target": "arm64"}),
            ..entry
        };
        repo.save_resolved_parameters(&rec.id, br#"{"target":"arm64"}"#, &again)
            .await
            .unwrap();
        let index = repo.list_expansions(&rec.plan_execution_id).await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].value, json!({"target": "arm64"}));
    }

    #[tokio::test]
    async fn wait_is_ready_only_when_all_ids_delivered() {
        let repo = MemoryWaitNotifyRepository::new();
        let node = Uuid::now_v7();
        let wait = WaitInstance::new(vec!["a".into(), "b".into()], callback(node));
        repo.register_wait(&wait).await.unwrap();

        assert!(repo.deliver("a", &NotifyPayload::ok(json!(1))).await.unwrap());
        assert!(repo.ready_waits("a").await.unwrap().is_empty());
        assert!(repo.claim(&wait.id).await.unwrap().is_none());

        assert!(repo.deliver("b", &NotifyPayload::ok(json!(2))).await.unwrap());
        let ready = repo.ready_waits("b").await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(repo.list_ready_waits(10).await.unwrap().len(), 1);

        let claimed = repo.claim(&wait.id).await.unwrap().unwrap();
        assert_eq!(claimed.responses.len(), 2);
        assert_eq!(claimed.responses["a"].data, json!(1));

        assert!(repo.claim(&wait.id).await.unwrap().is_none());
        assert!(repo.list_ready_waits(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_delivery_wins() {
        let repo = MemoryWaitNotifyRepository::new();
        let wait = WaitInstance::new(vec!["x".into()], callback(Uuid::now_v7()));
        repo.register_wait(&wait).await.unwrap();

        assert!(repo.deliver("x", &NotifyPayload::ok(json!("first"))).await.unwrap());
        assert!(!repo.deliver("x", &NotifyPayload::error(json!("second"))).await.unwrap());

        let claimed = repo.claim(&wait.id).await.unwrap().unwrap();
        assert_eq!(claimed.responses["x"].data, json!("first"));
        assert!(!claimed.responses["x"].is_error);
    }

    #[tokio::test]
    async fn discarded_waits_never_become_ready() {
        let repo = MemoryWaitNotifyRepository::new();
        let node = Uuid::now_v7();
        let wait = WaitInstance::new(vec!["y".into()], callback(node));
        repo.register_wait(&wait).await.unwrap();
        assert_eq!(repo.pending_waits(&node).await.unwrap().len(), 1);

        assert_eq!(repo.discard_waits(&node).await.unwrap(), 1);
        repo.deliver("y", &NotifyPayload::ok(json!(null))).await.unwrap();
        assert!(repo.ready_waits("y").await.unwrap().is_empty());
        assert!(repo.claim(&wait.id).await.unwrap().is_none());
        assert!(repo.pending_waits(&node).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn interrupts_listed_in_order_and_processed() {
        let repo = MemoryInterruptRepository::new();
        let plan = Uuid::now_v7();
        let pause = Interrupt::new(plan, InterruptType::Pause);
        let resume = Interrupt::new(plan, InterruptType::Resume);
        repo.save_interrupt(&pause).await.unwrap();
        repo.save_interrupt(&resume).await.unwrap();
        repo.save_interrupt(&Interrupt::new(Uuid::now_v7(), InterruptType::Abort))
            .await
            .unwrap();

        repo.update_interrupt_state(&pause.id, InterruptState::Processed)
            .await
            .unwrap();

        let list = repo.list_interrupts(&plan).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, pause.id);
        assert_eq!(list[0].state, InterruptState::Processed);
        assert!(list[0].processed_at.is_some());
    }
}
