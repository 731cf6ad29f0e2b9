//! SQLite interrupt repository.

use chrono::Utc;
use planwright_core::repository::InterruptRepository;
use planwright_types::error::RepositoryError;
use planwright_types::interrupt::{Interrupt, InterruptState, InterruptType};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid, query_err};

pub struct SqliteInterruptRepository {
    pool: DatabasePool,
}

impl SqliteInterruptRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct InterruptRow {
    id: String,
    plan_execution_id: String,
    node_execution_id: Option<String>,
    interrupt_type: String,
    state: String,
    reason: Option<String>,
    created_at: String,
    processed_at: Option<String>,
}

impl InterruptRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            plan_execution_id: row.try_get("plan_execution_id")?,
            node_execution_id: row.try_get("node_execution_id")?,
            interrupt_type: row.try_get("type")?,
            state: row.try_get("state")?,
            reason: row.try_get("reason")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }

    fn into_interrupt(self) -> Result<Interrupt, RepositoryError> {
        let interrupt_type: InterruptType = self.interrupt_type.parse().map_err(RepositoryError::Query)?;
        let state: InterruptState = self.state.parse().map_err(RepositoryError::Query)?;
        Ok(Interrupt {
            id: parse_uuid(&self.id)?,
            plan_execution_id: parse_uuid(&self.plan_execution_id)?,
            node_execution_id: self.node_execution_id.as_deref().map(parse_uuid).transpose()?,
            interrupt_type,
            state,
            reason: self.reason,
            created_at: parse_datetime(&self.created_at)?,
            processed_at: self.processed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

impl InterruptRepository for SqliteInterruptRepository {
    async fn save_interrupt(&self, interrupt: &Interrupt) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO interrupts
               (id, plan_execution_id, node_execution_id, type, state, reason, created_at, processed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 state = excluded.state,
                 reason = excluded.reason,
                 processed_at = excluded.processed_at"#,
        )
        .bind(interrupt.id.to_string())
        .bind(interrupt.plan_execution_id.to_string())
        .bind(interrupt.node_execution_id.map(|id| id.to_string()))
        .bind(interrupt.interrupt_type.as_str())
        .bind(interrupt.state.as_str())
        .bind(&interrupt.reason)
        .bind(format_datetime(&interrupt.created_at))
        .bind(interrupt.processed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn list_interrupts(&self, plan_execution_id: &Uuid) -> Result<Vec<Interrupt>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM interrupts WHERE plan_execution_id = ? ORDER BY created_at ASC, id ASC")
            .bind(plan_execution_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        rows.iter()
            .map(|row| InterruptRow::from_row(row).map_err(query_err)?.into_interrupt())
            .collect()
    }

    async fn update_interrupt_state(&self, id: &Uuid, state: InterruptState) -> Result<(), RepositoryError> {
        let processed_at = (state == InterruptState::Processed).then(|| format_datetime(&Utc::now()));
        let result = sqlx::query(
            "UPDATE interrupts SET state = ?, processed_at = COALESCE(?, processed_at) WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(processed_at)
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}
