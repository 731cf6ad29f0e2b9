//! SQLite wait/notify registry.
//!
//! `waits` holds one row per pending continuation, `wait_correlations` the
//! ids each wait is keyed by, and `notify_responses` the first payload
//! delivered per id. A wait is ready when none of its correlation ids lacks a
//! response; `claim` flips it from pending to claimed in a single guarded
//! UPDATE so only one caller ever wins.

use std::collections::BTreeMap;

use chrono::Utc;
use planwright_core::repository::WaitNotifyRepository;
use planwright_types::error::RepositoryError;
use planwright_types::notify::{ClaimedWait, NotifyPayload, ResumeCallback, ResumeKind, WaitInstance, WaitState};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, from_json, insert_err, parse_datetime, parse_uuid, query_err, to_json};

/// Predicate over alias `w`: every correlation id of the wait has a response.
const READY: &str = "NOT EXISTS (
    SELECT 1 FROM wait_correlations c
    LEFT JOIN notify_responses n ON n.correlation_id = c.correlation_id
    WHERE c.wait_id = w.id AND n.correlation_id IS NULL
)";

pub struct SqliteWaitNotifyRepository {
    pool: DatabasePool,
}

impl SqliteWaitNotifyRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn correlation_ids(&self, wait_id: &str) -> Result<Vec<String>, RepositoryError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT correlation_id FROM wait_correlations WHERE wait_id = ? ORDER BY position ASC")
                .bind(wait_id)
                .fetch_all(&self.pool.reader)
                .await
                .map_err(query_err)?;
        Ok(rows.into_iter().map(|(cid,)| cid).collect())
    }

    async fn hydrate(&self, rows: &[SqliteRow]) -> Result<Vec<WaitInstance>, RepositoryError> {
        let mut waits = Vec::with_capacity(rows.len());
        for row in rows {
            let row = WaitRow::from_row(row).map_err(query_err)?;
            let correlation_ids = self.correlation_ids(&row.id).await?;
            waits.push(row.into_wait(correlation_ids)?);
        }
        Ok(waits)
    }

    async fn fetch_wait(&self, wait_id: &Uuid) -> Result<Option<WaitInstance>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM waits WHERE id = ?")
            .bind(wait_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        Ok(self.hydrate(&rows).await?.into_iter().next())
    }

    async fn responses_for(&self, wait_id: &Uuid) -> Result<BTreeMap<String, NotifyPayload>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT n.correlation_id, n.data, n.is_error, n.delivered_at
               FROM wait_correlations c
               JOIN notify_responses n ON n.correlation_id = c.correlation_id
               WHERE c.wait_id = ?"#,
        )
        .bind(wait_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut responses = BTreeMap::new();
        for row in &rows {
            let correlation_id: String = row.try_get("correlation_id").map_err(query_err)?;
            let data: String = row.try_get("data").map_err(query_err)?;
            let is_error: bool = row.try_get("is_error").map_err(query_err)?;
            let delivered_at: String = row.try_get("delivered_at").map_err(query_err)?;
            responses.insert(
                correlation_id,
                NotifyPayload {
                    data: from_json(&data, "notify payload")?,
                    is_error,
                    delivered_at: parse_datetime(&delivered_at)?,
                },
            );
        }
        Ok(responses)
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WaitRow {
    id: String,
    node_execution_id: String,
    plan_execution_id: String,
    kind: String,
    state: String,
    created_at: String,
    claimed_at: Option<String>,
}

impl WaitRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            node_execution_id: row.try_get("node_execution_id")?,
            plan_execution_id: row.try_get("plan_execution_id")?,
            kind: row.try_get("kind")?,
            state: row.try_get("state")?,
            created_at: row.try_get("created_at")?,
            claimed_at: row.try_get("claimed_at")?,
        })
    }

    fn into_wait(self, correlation_ids: Vec<String>) -> Result<WaitInstance, RepositoryError> {
        let kind: ResumeKind = self.kind.parse().map_err(RepositoryError::Query)?;
        let state: WaitState = self.state.parse().map_err(RepositoryError::Query)?;
        Ok(WaitInstance {
            id: parse_uuid(&self.id)?,
            correlation_ids,
            callback: ResumeCallback {
                node_execution_id: parse_uuid(&self.node_execution_id)?,
                plan_execution_id: parse_uuid(&self.plan_execution_id)?,
                kind,
            },
            state,
            created_at: parse_datetime(&self.created_at)?,
            claimed_at: self.claimed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// WaitNotifyRepository impl
// ---------------------------------------------------------------------------

impl WaitNotifyRepository for SqliteWaitNotifyRepository {
    async fn register_wait(&self, wait: &WaitInstance) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        sqlx::query(
            r#"INSERT INTO waits (id, node_execution_id, plan_execution_id, kind, state, created_at, claimed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(wait.id.to_string())
        .bind(wait.callback.node_execution_id.to_string())
        .bind(wait.callback.plan_execution_id.to_string())
        .bind(wait.callback.kind.as_str())
        .bind(wait.state.as_str())
        .bind(format_datetime(&wait.created_at))
        .bind(wait.claimed_at.as_ref().map(format_datetime))
        .execute(&mut *tx)
        .await
        .map_err(|e| insert_err(e, || format!("wait {} already exists", wait.id)))?;

        for (position, correlation_id) in wait.correlation_ids.iter().enumerate() {
            sqlx::query("INSERT INTO wait_correlations (wait_id, correlation_id, position) VALUES (?, ?, ?)")
                .bind(wait.id.to_string())
                .bind(correlation_id)
                .bind(position as i64)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn deliver(&self, correlation_id: &str, payload: &NotifyPayload) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO notify_responses (correlation_id, data, is_error, delivered_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(correlation_id) DO NOTHING"#,
        )
        .bind(correlation_id)
        .bind(to_json(&payload.data)?)
        .bind(payload.is_error)
        .bind(format_datetime(&payload.delivered_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn ready_waits(&self, correlation_id: &str) -> Result<Vec<WaitInstance>, RepositoryError> {
        let sql = format!(
            r#"SELECT w.* FROM waits w
               JOIN wait_correlations k ON k.wait_id = w.id
               WHERE k.correlation_id = ? AND w.state = 'pending' AND {READY}
               ORDER BY w.created_at ASC, w.id ASC"#
        );
        let rows = sqlx::query(&sql)
            .bind(correlation_id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        self.hydrate(&rows).await
    }

    async fn claim(&self, wait_id: &Uuid) -> Result<Option<ClaimedWait>, RepositoryError> {
        let sql = format!("UPDATE waits AS w SET state = 'claimed', claimed_at = ? WHERE w.id = ? AND w.state = 'pending' AND {READY}");
        let result = sqlx::query(&sql)
            .bind(format_datetime(&Utc::now()))
            .bind(wait_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let Some(wait) = self.fetch_wait(wait_id).await? else {
            return Ok(None);
        };
        let responses = self.responses_for(wait_id).await?;
        Ok(Some(ClaimedWait { wait, responses }))
    }

    async fn list_ready_waits(&self, limit: u32) -> Result<Vec<WaitInstance>, RepositoryError> {
        let sql = format!(
            "SELECT w.* FROM waits w WHERE w.state = 'pending' AND {READY} ORDER BY w.created_at ASC, w.id ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        self.hydrate(&rows).await
    }

    async fn discard_waits(&self, node_execution_id: &Uuid) -> Result<u64, RepositoryError> {
        let result = sqlx::query("UPDATE waits SET state = 'discarded' WHERE node_execution_id = ? AND state = 'pending'")
            .bind(node_execution_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected())
    }

    async fn pending_waits(&self, node_execution_id: &Uuid) -> Result<Vec<WaitInstance>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM waits WHERE node_execution_id = ? AND state = 'pending' ORDER BY created_at ASC, id ASC",
        )
        .bind(node_execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        self.hydrate(&rows).await
    }
}
