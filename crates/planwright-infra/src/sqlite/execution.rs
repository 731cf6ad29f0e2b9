//! SQLite execution record repository.
//!
//! Plans, plan executions and node executions are stored as JSON documents
//! alongside the columns needed to index and guard them. Every status change
//! is a compare-and-set on the `version` column: read the document, check the
//! status allow-list, apply the mutator, then write with
//! `WHERE id = ? AND version = ?`. Zero affected rows means another writer got
//! there first and the call reports `Conflict`.

use chrono::Utc;
use planwright_core::repository::{ConditionalUpdate, ExecutionRepository};
use planwright_types::error::RepositoryError;
use planwright_types::execution::{
    AdviserResponse, ExecutionMode, ExpansionEntry, ExpansionKind, NodeExecution, PlanExecution, Status,
};
use planwright_types::plan::Plan;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, from_json, insert_err, parse_datetime, parse_uuid, query_err, to_json};

/// How many times a bind re-reads after losing a version race.
const BIND_ATTEMPTS: usize = 3;

pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn fetch_node(&self, id: &Uuid) -> Result<Option<Versioned<NodeExecution>>, RepositoryError> {
        let row = sqlx::query("SELECT record, version FROM node_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.map(|r| Versioned::from_row(&r, "node execution")).transpose()
    }

    async fn fetch_plan_execution(&self, id: &Uuid) -> Result<Option<Versioned<PlanExecution>>, RepositoryError> {
        let row = sqlx::query("SELECT record, version FROM plan_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.map(|r| Versioned::from_row(&r, "plan execution")).transpose()
    }

    /// Write `record` if the stored version is still `version`.
    async fn write_node(&self, record: &NodeExecution, version: i64) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE node_executions
               SET status = ?, notify_id = ?, stage = ?, record = ?, updated_at = ?, version = version + 1
               WHERE id = ? AND version = ?"#,
        )
        .bind(record.status.as_str())
        .bind(&record.notify_id)
        .bind(&record.stage)
        .bind(to_json(record)?)
        .bind(format_datetime(&record.updated_at))
        .bind(record.id.to_string())
        .bind(version)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_expansion<'e, E>(executor: E, entry: &ExpansionEntry) -> Result<(), RepositoryError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            r#"INSERT INTO expansions
               (plan_execution_id, node_execution_id, identifier, fqn, kind, value, recorded_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.plan_execution_id.to_string())
        .bind(entry.node_execution_id.to_string())
        .bind(&entry.identifier)
        .bind(&entry.fqn)
        .bind(kind_str(entry.kind))
        .bind(to_json(&entry.value)?)
        .bind(format_datetime(&entry.recorded_at))
        .execute(executor)
        .await
        .map_err(query_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

/// A stored document together with its compare-and-set version.
struct Versioned<T> {
    value: T,
    version: i64,
}

impl<T: serde::de::DeserializeOwned> Versioned<T> {
    fn from_row(row: &SqliteRow, what: &str) -> Result<Self, RepositoryError> {
        let record: String = row.try_get("record").map_err(query_err)?;
        let version: i64 = row.try_get("version").map_err(query_err)?;
        Ok(Self {
            value: from_json(&record, what)?,
            version,
        })
    }
}

fn decode_records<T: serde::de::DeserializeOwned>(rows: &[SqliteRow], what: &str) -> Result<Vec<T>, RepositoryError> {
    rows.iter()
        .map(|row| {
            let record: String = row.try_get("record").map_err(query_err)?;
            from_json(&record, what)
        })
        .collect()
}

struct ExpansionRow {
    plan_execution_id: String,
    node_execution_id: String,
    identifier: String,
    fqn: String,
    kind: String,
    value: String,
    recorded_at: String,
}

impl ExpansionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            plan_execution_id: row.try_get("plan_execution_id")?,
            node_execution_id: row.try_get("node_execution_id")?,
            identifier: row.try_get("identifier")?,
            fqn: row.try_get("fqn")?,
            kind: row.try_get("kind")?,
            value: row.try_get("value")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn into_entry(self) -> Result<ExpansionEntry, RepositoryError> {
        let kind = match self.kind.as_str() {
            "parameters" => ExpansionKind::Parameters,
            "outputs" => ExpansionKind::Outputs,
            other => return Err(RepositoryError::Query(format!("invalid expansion kind: {other}"))),
        };
        Ok(ExpansionEntry {
            plan_execution_id: parse_uuid(&self.plan_execution_id)?,
            node_execution_id: parse_uuid(&self.node_execution_id)?,
            identifier: self.identifier,
            fqn: self.fqn,
            kind,
            value: from_json(&self.value, "expansion value")?,
            recorded_at: parse_datetime(&self.recorded_at)?,
        })
    }
}

fn kind_str(kind: ExpansionKind) -> &'static str {
    match kind {
        ExpansionKind::Parameters => "parameters",
        ExpansionKind::Outputs => "outputs",
    }
}

fn stale(what: &str, id: &Uuid) -> RepositoryError {
    RepositoryError::Conflict(format!("{what} {id} was modified concurrently"))
}

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

impl ExecutionRepository for SqliteExecutionRepository {
    async fn save_plan(&self, plan: &Plan) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        sqlx::query(
            r#"INSERT INTO plans (id, name, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&plan.id)
        .bind(&plan.name)
        .bind(to_json(plan)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM plans WHERE id = ?")
            .bind(plan_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        match row {
            Some(row) => {
                let definition: String = row.try_get("definition").map_err(query_err)?;
                Ok(Some(from_json(&definition, "plan definition")?))
            }
            None => Ok(None),
        }
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM plans ORDER BY id ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        let mut plans = Vec::with_capacity(rows.len());
        for row in &rows {
            let definition: String = row.try_get("definition").map_err(query_err)?;
            plans.push(from_json(&definition, "plan definition")?);
        }
        Ok(plans)
    }

    async fn create_plan_execution(&self, execution: &PlanExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO plan_executions (id, plan_id, status, record, version, started_at, ended_at)
               VALUES (?, ?, ?, ?, 0, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(&execution.plan_id)
        .bind(execution.status.as_str())
        .bind(to_json(execution)?)
        .bind(format_datetime(&execution.started_at))
        .bind(execution.ended_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| insert_err(e, || format!("plan execution {} already exists", execution.id)))?;
        Ok(())
    }

    async fn get_plan_execution(&self, id: &Uuid) -> Result<Option<PlanExecution>, RepositoryError> {
        Ok(self.fetch_plan_execution(id).await?.map(|v| v.value))
    }

    async fn list_plan_executions(&self, plan_id: &str, limit: u32) -> Result<Vec<PlanExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT record FROM plan_executions WHERE plan_id = ? ORDER BY started_at DESC, id DESC LIMIT ?",
        )
        .bind(plan_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        decode_records(&rows, "plan execution")
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
        let Versioned { value: mut execution, version } =
            self.fetch_plan_execution(id).await?.ok_or(RepositoryError::NotFound)?;
        if !from.contains(&execution.status) {
            return Err(RepositoryError::Conflict(format!(
                "plan execution {id} is {}",
                execution.status
            )));
        }
        mutate(&mut execution);

        let result = sqlx::query(
            r#"UPDATE plan_executions
               SET status = ?, record = ?, ended_at = ?, version = version + 1
               WHERE id = ? AND version = ?"#,
        )
        .bind(execution.status.as_str())
        .bind(to_json(&execution)?)
        .bind(execution.ended_at.as_ref().map(format_datetime))
        .bind(id.to_string())
        .bind(version)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(stale("plan execution", id));
        }
        Ok(execution)
    }

    async fn save_node_execution(&self, record: &NodeExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO node_executions
               (id, plan_execution_id, parent_id, node_id, identifier, stage, status, notify_id,
                record, version, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)"#,
        )
        .bind(record.id.to_string())
        .bind(record.plan_execution_id.to_string())
        .bind(record.parent_id.map(|p| p.to_string()))
        .bind(&record.node_id)
        .bind(&record.identifier)
        .bind(&record.stage)
        .bind(record.status.as_str())
        .bind(&record.notify_id)
        .bind(to_json(record)?)
        .bind(format_datetime(&record.created_at))
        .bind(format_datetime(&record.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| insert_err(e, || format!("node execution {} already exists", record.id)))?;
        Ok(())
    }

    async fn get_node_execution(&self, id: &Uuid) -> Result<Option<NodeExecution>, RepositoryError> {
        Ok(self.fetch_node(id).await?.map(|v| v.value))
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
        let Versioned { value: mut record, version } =
            self.fetch_node(id).await?.ok_or(RepositoryError::NotFound)?;
        let previous_status = record.status;
        if !from.contains(&previous_status) {
            return Err(RepositoryError::Conflict(format!("record {id} is {previous_status}")));
        }
        mutate(&mut record);
        record.updated_at = Utc::now();

        if !self.write_node(&record, version).await? {
            return Err(stale("node execution", id));
        }
        Ok(ConditionalUpdate {
            previous_status,
            record,
        })
    }

    async fn bind_execution_mode(&self, id: &Uuid, mode: ExecutionMode) -> Result<bool, RepositoryError> {
        for _ in 0..BIND_ATTEMPTS {
            let Versioned { value: mut record, version } =
                self.fetch_node(id).await?.ok_or(RepositoryError::NotFound)?;
            if record.status != Status::Queued || record.mode.is_some() {
                return Ok(false);
            }
            record.mode = Some(mode);
            record.updated_at = Utc::now();
            if self.write_node(&record, version).await? {
                return Ok(true);
            }
            tracing::debug!(node_execution_id = %id, "mode binding raced a concurrent write, re-reading");
        }
        Err(stale("node execution", id))
    }

    async fn bind_adviser_response(&self, id: &Uuid, response: &AdviserResponse) -> Result<bool, RepositoryError> {
        for _ in 0..BIND_ATTEMPTS {
            let Versioned { value: mut record, version } =
                self.fetch_node(id).await?.ok_or(RepositoryError::NotFound)?;
            if !record.status.is_terminal() || record.adviser_response.is_some() {
                return Ok(false);
            }
            record.adviser_response = Some(response.clone());
            record.updated_at = Utc::now();
            if self.write_node(&record, version).await? {
                return Ok(true);
            }
            tracing::debug!(node_execution_id = %id, "adviser binding raced a concurrent write, re-reading");
        }
        Err(stale("node execution", id))
    }

    async fn list_node_executions(&self, plan_execution_id: &Uuid) -> Result<Vec<NodeExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT record FROM node_executions WHERE plan_execution_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(plan_execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        decode_records(&rows, "node execution")
    }

    async fn list_children(&self, parent_id: &Uuid) -> Result<Vec<NodeExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT record FROM node_executions WHERE parent_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(parent_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        decode_records(&rows, "node execution")
    }

    async fn save_resolved_parameters(
        &self,
        id: &Uuid,
        resolved: &[u8],
        entry: &ExpansionEntry,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let row = sqlx::query("SELECT record, version FROM node_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?
            .ok_or(RepositoryError::NotFound)?;
        let Versioned { value: mut record, version } =
            Versioned::<NodeExecution>::from_row(&row, "node execution")?;
        record.resolved_parameters = Some(resolved.to_vec());
        record.updated_at = Utc::now();

        let result = sqlx::query(
            "UPDATE node_executions SET record = ?, updated_at = ?, version = version + 1 WHERE id = ? AND version = ?",
        )
        .bind(to_json(&record)?)
        .bind(format_datetime(&record.updated_at))
        .bind(id.to_string())
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;
        if result.rows_affected() == 0 {
            return Err(stale("node execution", id));
        }

        // A re-start replaces the node's earlier resolution in place.
        let replaced = sqlx::query(
            r#"UPDATE expansions SET identifier = ?, fqn = ?, value = ?, recorded_at = ?
               WHERE node_execution_id = ? AND kind = ?"#,
        )
        .bind(&entry.identifier)
        .bind(&entry.fqn)
        .bind(to_json(&entry.value)?)
        .bind(format_datetime(&entry.recorded_at))
        .bind(entry.node_execution_id.to_string())
        .bind(kind_str(entry.kind))
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;
        if replaced.rows_affected() == 0 {
            Self::insert_expansion(&mut *tx, entry).await?;
        }
        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn append_expansion(&self, entry: &ExpansionEntry) -> Result<(), RepositoryError> {
        Self::insert_expansion(&self.pool.writer, entry).await
    }

    async fn list_expansions(&self, plan_execution_id: &Uuid) -> Result<Vec<ExpansionEntry>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM expansions WHERE plan_execution_id = ? ORDER BY seq ASC")
            .bind(plan_execution_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        rows.iter()
            .map(|row| ExpansionRow::from_row(row).map_err(query_err)?.into_entry())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::sqlite::test_pool;
    use planwright_types::execution::{ExecutionContext, Level};
    use planwright_types::plan::{FacilitatorConfig, NodeTemplate};
    use serde_json::json;

    fn plan() -> Plan {
        Plan {
            id: "release".into(),
            name: "Release".into(),
            description: None,
            root: "build".into(),
            nodes: vec![NodeTemplate {
                id: "build".into(),
                identifier: "build".into(),
                name: "Build".into(),
                step_type: "echo".into(),
                parameters: json!({"target": "x86_64"}),
                facilitator: FacilitatorConfig::default(),
                advisers: Vec::new(),
                group: None,
                skip_when: None,
                requires_input: false,
                input_prompt: None,
            }],
        }
    }

    fn execution() -> PlanExecution {
        PlanExecution {
            id: Uuid::now_v7(),
            plan_id: "release".into(),
            status: Status::Queued,
            inputs: json!({"version": "1.2.0"}),
            metadata: BTreeMap::new(),
            root_node_execution_id: None,
            failure_info: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    fn record(plan_execution_id: Uuid, parent_id: Option<Uuid>) -> NodeExecution {
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
            parent_id,
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

    async fn seeded() -> (SqliteExecutionRepository, PlanExecution) {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        repo.save_plan(&plan()).await.unwrap();
        let run = execution();
        repo.create_plan_execution(&run).await.unwrap();
        (repo, run)
    }

    #[tokio::test]
    async fn test_save_plan_upserts() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let mut p = plan();
        repo.save_plan(&p).await.unwrap();
        p.name = "Release v2".into();
        repo.save_plan(&p).await.unwrap();

        let stored = repo.get_plan("release").await.unwrap().unwrap();
        assert_eq!(stored.name, "Release v2");
        assert_eq!(repo.list_plans().await.unwrap().len(), 1);
        assert!(repo.get_plan("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_plan_execution_cas() {
        let (repo, run) = seeded().await;

        let running = repo
            .update_plan_execution(&run.id, &[Status::Queued], |e| e.status = Status::Running)
            .await
            .unwrap();
        assert_eq!(running.status, Status::Running);

        let err = repo
            .update_plan_execution(&run.id, &[Status::Queued], |e| e.status = Status::Aborted)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let missing = repo
            .update_plan_execution(&Uuid::now_v7(), &[Status::Queued], |_| {})
            .await
            .unwrap_err();
        assert!(matches!(missing, RepositoryError::NotFound));

        let listed = repo.list_plan_executions("release", 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, Status::Running);
        assert_eq!(listed[0].inputs, json!({"version": "1.2.0"}));
    }

    #[tokio::test]
    async fn test_duplicate_node_is_conflict() {
        let (repo, run) = seeded().await;
        let rec = record(run.id, None);
        repo.save_node_execution(&rec).await.unwrap();
        let err = repo.save_node_execution(&rec).await.unwrap_err();
        assert!(err.is_conflict(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_node_update_reports_previous_status() {
        let (repo, run) = seeded().await;
        let rec = record(run.id, None);
        repo.save_node_execution(&rec).await.unwrap();

        let update = repo
            .update_node_execution(&rec.id, Status::NON_TERMINAL, |r| {
                r.status = Status::Running;
                r.metadata.insert("worker".into(), "w-1".into());
            })
            .await
            .unwrap();
        assert_eq!(update.previous_status, Status::Queued);
        assert_eq!(update.record.status, Status::Running);

        let stored = repo.get_node_execution(&rec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Running);
        assert_eq!(stored.metadata["worker"], "w-1");

        let err = repo
            .update_node_execution(&rec.id, &[Status::Queued], |r| r.status = Status::Skipped)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_concurrent_transitions_have_one_winner() {
        let (repo, run) = seeded().await;
        let rec = record(run.id, None);
        repo.save_node_execution(&rec).await.unwrap();

        let repo = std::sync::Arc::new(repo);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            let id = rec.id;
            handles.push(tokio::spawn(async move {
                repo.update_node_execution(&id, &[Status::Queued], |r| r.status = Status::Running)
                    .await
                    .is_ok()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_adviser_response_binds_once() {
        let (repo, run) = seeded().await;
        let rec = record(run.id, None);
        repo.save_node_execution(&rec).await.unwrap();

        assert!(!repo
            .bind_adviser_response(&rec.id, &AdviserResponse::EndBranch)
            .await
            .unwrap());

        repo.update_node_execution(&rec.id, &[Status::Queued], |r| r.status = Status::Failed)
            .await
            .unwrap();
        assert!(repo
            .bind_adviser_response(&rec.id, &AdviserResponse::Retry { wait_secs: 2 })
            .await
            .unwrap());
        assert!(!repo
            .bind_adviser_response(&rec.id, &AdviserResponse::EndBranch)
            .await
            .unwrap());

        let stored = repo.get_node_execution(&rec.id).await.unwrap().unwrap();
        assert_eq!(stored.adviser_response, Some(AdviserResponse::Retry { wait_secs: 2 }));
    }

    #[tokio::test]
    async fn test_execution_mode_binds_once() {
        let (repo, run) = seeded().await;
        let rec = record(run.id, None);
        repo.save_node_execution(&rec).await.unwrap();

        let repo = std::sync::Arc::new(repo);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let repo = repo.clone();
            let id = rec.id;
            handles.push(tokio::spawn(async move {
                repo.bind_execution_mode(&id, ExecutionMode::AsyncTask).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let stored = repo.get_node_execution(&rec.id).await.unwrap().unwrap();
        assert_eq!(stored.mode, Some(ExecutionMode::AsyncTask));
        assert_eq!(stored.status, Status::Queued);
    }

    #[tokio::test]
    async fn test_children_and_expansions() {
        let (repo, run) = seeded().await;
        let parent = record(run.id, None);
        repo.save_node_execution(&parent).await.unwrap();
        let first = record(run.id, Some(parent.id));
        let second = record(run.id, Some(parent.id));
        repo.save_node_execution(&first).await.unwrap();
        repo.save_node_execution(&second).await.unwrap();

        let children = repo.list_children(&parent.id).await.unwrap();
        assert_eq!(children.iter().map(|c| c.id).collect::<Vec<_>>(), vec![first.id, second.id]);
        assert_eq!(repo.list_node_executions(&run.id).await.unwrap().len(), 3);

        let params = ExpansionEntry {
            plan_execution_id: run.id,
            node_execution_id: first.id,
            identifier: "build".into(),
            fqn: "build".into(),
            kind: ExpansionKind::Parameters,
            value: json!({"target": "x86_64"}),
            recorded_at: Utc::now(),
        };
        repo.save_resolved_parameters(&first.id, br#"{"target":"x86_64"}"#, &params)
            .await
            .unwrap();
        repo.append_expansion(&ExpansionEntry {
            kind: ExpansionKind::Outputs,
            value: json!({"artifact": "build.tar"}),
            ..params.clone()
        })
        .await
        .unwrap();

        let stored = repo.get_node_execution(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.parameters(), Some(json!({"target": "x86_64"})));

        let entries = repo.list_expansions(&run.id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, ExpansionKind::Parameters);
        assert_eq!(entries[1].value, json!({"artifact": "build.tar"}));

        repo.save_resolved_parameters(
            &first.id,
            br#"{"target":"aarch64"}"#,
            &ExpansionEntry {
                value: json!({"target": "aarch64"}),
                ..params.clone()
            },
        )
        .await
        .unwrap();
        let entries = repo.list_expansions(&run.id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, ExpansionKind::Parameters);
        assert_eq!(entries[0].value, json!({"target": "aarch64"}));
    }
}
