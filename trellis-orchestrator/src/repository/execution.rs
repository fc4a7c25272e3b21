//! Step execution repository
//!
//! The idempotency key is a UNIQUE column; `get_or_create` races through
//! ON CONFLICT DO NOTHING and re-selects, so every caller with the same
//! key sees the same row.

use sqlx::PgPool;
use trellis_core::domain::execution::StepExecution;
use trellis_core::keys::ExecutionKey;
use uuid::Uuid;

/// The single creation path for step executions
///
/// The first call with a key creates a PENDING row; every later call
/// returns that identical row.
pub async fn get_or_create(
    pool: &PgPool,
    step_run_id: Uuid,
    key: &ExecutionKey,
) -> Result<StepExecution, sqlx::Error> {
    let candidate = StepExecution::new(step_run_id, key.clone());

    sqlx::query(
        r#"
        INSERT INTO step_executions
            (id, step_run_id, execution_key, access_token, status, state)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (execution_key) DO NOTHING
        "#,
    )
    .bind(candidate.id)
    .bind(candidate.step_run_id)
    .bind(key.to_string())
    .bind(&candidate.access_token)
    .bind(candidate.status().to_string())
    .bind(serde_json::to_value(&candidate.state).unwrap_or_default())
    .execute(pool)
    .await?;

    // Whoever won the insert, the row under this key is authoritative
    let row = find_by_key(pool, key).await?;
    row.ok_or(sqlx::Error::RowNotFound)
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<StepExecution>, sqlx::Error> {
    let row = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, step_run_id, execution_key, runner_id, container_id, exit_code,
               access_token, state, started_at, completed_at
        FROM step_executions
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

pub async fn find_by_key(
    pool: &PgPool,
    key: &ExecutionKey,
) -> Result<Option<StepExecution>, sqlx::Error> {
    let row = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, step_run_id, execution_key, runner_id, container_id, exit_code,
               access_token, state, started_at, completed_at
        FROM step_executions
        WHERE execution_key = $1
        "#,
    )
    .bind(key.to_string())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

pub async fn find_by_token(
    pool: &PgPool,
    token: &str,
) -> Result<Option<StepExecution>, sqlx::Error> {
    let row = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, step_run_id, execution_key, runner_id, container_id, exit_code,
               access_token, state, started_at, completed_at
        FROM step_executions
        WHERE access_token = $1
        "#,
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Executions that were mid-flight (RUNNING or PREPARING)
pub async fn find_in_flight(pool: &PgPool) -> Result<Vec<StepExecution>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, step_run_id, execution_key, runner_id, container_id, exit_code,
               access_token, state, started_at, completed_at
        FROM step_executions
        WHERE status IN ('running', 'preparing')
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Write back every mutable field after a state change
pub async fn update(pool: &PgPool, execution: &StepExecution) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE step_executions
        SET runner_id = $1, container_id = $2, exit_code = $3, status = $4,
            state = $5, started_at = $6, completed_at = $7
        WHERE id = $8
        "#,
    )
    .bind(&execution.runner_id)
    .bind(&execution.container_id)
    .bind(execution.exit_code)
    .bind(execution.status().to_string())
    .bind(serde_json::to_value(&execution.state).unwrap_or_default())
    .bind(execution.started_at)
    .bind(execution.completed_at)
    .bind(execution.id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Recovery reset: back to pending with the runner cleared
///
/// Guarded on the non-terminal statuses so a second reset (or a race
/// with completion) is a no-op. Returns whether a row changed.
pub async fn reset_to_pending(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE step_executions
        SET runner_id = NULL, container_id = NULL, status = 'pending',
            state = jsonb_set(state, '{current}', '"pending"')
        WHERE id = $1 AND status IN ('pending', 'preparing', 'running')
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    step_run_id: Uuid,
    execution_key: String,
    runner_id: Option<String>,
    container_id: Option<String>,
    exit_code: Option<i32>,
    access_token: String,
    state: serde_json::Value,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<ExecutionRow> for StepExecution {
    fn from(row: ExecutionRow) -> Self {
        let key = ExecutionKey::parse(&row.execution_key).unwrap_or(ExecutionKey {
            run_id: row.execution_key.clone(),
            step_index: 0,
            attempt: 1,
        });

        let mut execution = StepExecution::new(row.step_run_id, key);
        execution.id = row.id;
        execution.runner_id = row.runner_id;
        execution.container_id = row.container_id;
        execution.exit_code = row.exit_code;
        execution.access_token = row.access_token;
        execution.started_at = row.started_at;
        execution.completed_at = row.completed_at;
        if let Ok(state) = serde_json::from_value(row.state) {
            execution.state = state;
        }
        execution
    }
}
