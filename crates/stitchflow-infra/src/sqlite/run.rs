//! SQLite run repository implementation.
//!
//! Implements `RunRepository` from `stitchflow-core` using sqlx with split
//! read/write pools. Run state is stored as a JSON blob next to scalar
//! columns; status transitions are guarded in SQL so terminal rows are
//! frozen -- the monotonicity the reconciler's idempotency relies on.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use stitchflow_core::repository::RunRepository;
use stitchflow_types::error::RepositoryError;
use stitchflow_types::pipeline::NodeKind;
use stitchflow_types::run::{RunStatus, StepRecord, StepStatus, TaskRecord};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunRepository`.
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    definition_id: String,
    user_id: String,
    status: String,
    state: String,
    total_async_steps: i64,
    dispatch_complete: i64,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition_id: row.try_get("definition_id")?,
            user_id: row.try_get("user_id")?,
            status: row.try_get("status")?,
            state: row.try_get("state")?,
            total_async_steps: row.try_get("total_async_steps")?,
            dispatch_complete: row.try_get("dispatch_complete")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_task(self) -> Result<TaskRecord, RepositoryError> {
        let status: RunStatus = parse_enum(&self.status, "run status")?;
        let state: Value = serde_json::from_str(&self.state)
            .map_err(|e| RepositoryError::Query(format!("invalid state JSON: {e}")))?;
        Ok(TaskRecord {
            id: parse_uuid(&self.id)?,
            definition_id: parse_uuid(&self.definition_id)?,
            user_id: self.user_id,
            status,
            state,
            total_async_steps: self.total_async_steps as u32,
            dispatch_complete: self.dispatch_complete != 0,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StepRow {
    run_id: String,
    step_index: i64,
    node_id: String,
    kind: String,
    provider_ref: Option<String>,
    provider_task_ref: Option<String>,
    status: String,
    output: Option<String>,
    error_message: Option<String>,
    completed_at: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step_index: row.try_get("step_index")?,
            node_id: row.try_get("node_id")?,
            kind: row.try_get("kind")?,
            provider_ref: row.try_get("provider_ref")?,
            provider_task_ref: row.try_get("provider_task_ref")?,
            status: row.try_get("status")?,
            output: row.try_get("output")?,
            error_message: row.try_get("error_message")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_step(self) -> Result<StepRecord, RepositoryError> {
        let status: StepStatus = parse_enum(&self.status, "step status")?;
        let kind: NodeKind = parse_enum(&self.kind, "node kind")?;
        let output = self
            .output
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid step output: {e}")))
            })
            .transpose()?;
        let completed_at = self
            .completed_at
            .as_deref()
            .map(parse_datetime)
            .transpose()?;
        Ok(StepRecord {
            run_id: parse_uuid(&self.run_id)?,
            step_index: self.step_index as u32,
            node_id: self.node_id,
            kind,
            provider_ref: self.provider_ref,
            provider_task_ref: self.provider_task_ref,
            status,
            output,
            error_message: self.error_message,
            completed_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parse a snake_case enum column through its serde representation.
fn parse_enum<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

/// Serialize a status enum to its snake_case column value.
fn enum_str<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => Ok(s),
        _ => Err(RepositoryError::Query("unserializable enum".to_string())),
    }
}

const RUN_COLUMNS: &str = "id, definition_id, user_id, status, state, total_async_steps, \
                           dispatch_complete, error, created_at, updated_at";
const STEP_COLUMNS: &str = "run_id, step_index, node_id, kind, provider_ref, provider_task_ref, \
                            status, output, error_message, completed_at";

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn create_run(&self, run: &TaskRecord) -> Result<(), RepositoryError> {
        let state_json = serde_json::to_string(&run.state)
            .map_err(|e| RepositoryError::Query(format!("serialize state: {e}")))?;

        sqlx::query(
            "INSERT INTO runs (id, definition_id, user_id, status, state, total_async_steps, \
             dispatch_complete, error, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run.id.to_string())
        .bind(run.definition_id.to_string())
        .bind(&run.user_id)
        .bind(enum_str(&run.status)?)
        .bind(state_json)
        .bind(run.total_async_steps as i64)
        .bind(run.dispatch_complete as i64)
        .bind(&run.error)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<TaskRecord>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?"))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|r| {
            RunRow::from_row(&r)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_task()
        })
        .transpose()
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
        state: Option<&Value>,
    ) -> Result<(), RepositoryError> {
        let state_json = state
            .map(|s| {
                serde_json::to_string(s)
                    .map_err(|e| RepositoryError::Query(format!("serialize state: {e}")))
            })
            .transpose()?;

        // Terminal rows are frozen at the SQL level.
        sqlx::query(
            "UPDATE runs SET status = ?, error = COALESCE(?, error), \
             state = COALESCE(?, state), updated_at = ? \
             WHERE id = ? AND status NOT IN ('succeeded', 'failed', 'cancelled')",
        )
        .bind(enum_str(&status)?)
        .bind(error)
        .bind(state_json)
        .bind(format_datetime(&Utc::now()))
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn mark_dispatch_complete(&self, run_id: &Uuid) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE runs SET dispatch_complete = 1, updated_at = ? WHERE id = ?")
            .bind(format_datetime(&Utc::now()))
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }

    async fn create_step(&self, step: &StepRecord) -> Result<(), RepositoryError> {
        let output_json = step
            .output
            .as_ref()
            .map(|o| {
                serde_json::to_string(o)
                    .map_err(|e| RepositoryError::Query(format!("serialize output: {e}")))
            })
            .transpose()?;

        sqlx::query(
            "INSERT INTO steps (run_id, step_index, node_id, kind, provider_ref, \
             provider_task_ref, status, output, error_message, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(step.run_id.to_string())
        .bind(step.step_index as i64)
        .bind(&step.node_id)
        .bind(enum_str(&step.kind)?)
        .bind(&step.provider_ref)
        .bind(&step.provider_task_ref)
        .bind(enum_str(&step.status)?)
        .bind(output_json)
        .bind(&step.error_message)
        .bind(step.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_step(
        &self,
        run_id: &Uuid,
        step_index: u32,
    ) -> Result<Option<StepRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ? AND step_index = ?"
        ))
        .bind(run_id.to_string())
        .bind(step_index as i64)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|r| {
            StepRow::from_row(&r)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_step()
        })
        .transpose()
    }

    async fn update_step_status(
        &self,
        run_id: &Uuid,
        step_index: u32,
        status: StepStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let output_json = output
            .map(|o| {
                serde_json::to_string(o)
                    .map_err(|e| RepositoryError::Query(format!("serialize output: {e}")))
            })
            .transpose()?;
        let completed_at = status.is_terminal().then(|| format_datetime(&Utc::now()));

        // Terminal rows are frozen: duplicate callbacks become no-ops.
        sqlx::query(
            "UPDATE steps SET status = ?, output = COALESCE(?, output), \
             error_message = COALESCE(?, error_message), \
             completed_at = COALESCE(completed_at, ?) \
             WHERE run_id = ? AND step_index = ? \
             AND status NOT IN ('completed', 'failed', 'skipped')",
        )
        .bind(enum_str(&status)?)
        .bind(output_json)
        .bind(error)
        .bind(completed_at)
        .bind(run_id.to_string())
        .bind(step_index as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn list_steps(&self, run_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ? ORDER BY step_index ASC"
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|r| {
                StepRow::from_row(r)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_step()
            })
            .collect()
    }

    async fn count_steps_by_status(
        &self,
        run_id: &Uuid,
        status: StepStatus,
    ) -> Result<u64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM steps WHERE run_id = ? AND status = ?")
            .bind(run_id.to_string())
            .bind(enum_str(&status)?)
            .fetch_one(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let count: i64 = row
            .try_get("count")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(count as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
