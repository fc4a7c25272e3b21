//! Pipeline run repository
//!
//! Handles all database operations for pipeline runs and their step
//! runs. The full state machine (state + history) is stored as JSONB
//! alongside a plain status column for indexed queries.

use sqlx::PgPool;
use trellis_core::domain::run::{PipelineRun, TriggerType};
use trellis_core::domain::step::{StepKind, StepPolicy, StepRun, StepRunStatus};
use uuid::Uuid;

/// Persist a new run together with its step runs, in one transaction
pub async fn create(pool: &PgPool, run: &PipelineRun, steps: &[StepRun]) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO pipeline_runs
            (id, pipeline_id, trigger_type, trigger_ref, steps_total, steps_completed,
             status, state, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(run.id)
    .bind(run.pipeline_id)
    .bind(run.trigger_type.to_string())
    .bind(&run.trigger_ref)
    .bind(run.steps_total as i32)
    .bind(serde_json::to_value(&run.steps_completed).unwrap_or_default())
    .bind(run.status().to_string())
    .bind(serde_json::to_value(&run.state).unwrap_or_default())
    .bind(run.created_at)
    .execute(&mut *tx)
    .await?;

    for step in steps {
        sqlx::query(
            r#"
            INSERT INTO step_runs
                (id, pipeline_run_id, step_index, name, kind, on_success, on_failure,
                 timeout_seconds, logs, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(step.id)
        .bind(step.pipeline_run_id)
        .bind(step.index as i32)
        .bind(&step.name)
        .bind(step.kind.to_string())
        .bind(step.on_success.to_string())
        .bind(step.on_failure.to_string())
        .bind(step.timeout_seconds.map(|t| t as i64))
        .bind(serde_json::to_value(&step.logs).unwrap_or_default())
        .bind(step.status.to_string())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<PipelineRun>, sqlx::Error> {
    let row = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT id, pipeline_id, trigger_type, trigger_ref, steps_total, steps_completed,
               current_step_index, current_step_name, failed_step_index, error,
               state, created_at, started_at, completed_at
        FROM pipeline_runs
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Write back every mutable field after a state change
pub async fn update(pool: &PgPool, run: &PipelineRun) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE pipeline_runs
        SET steps_completed = $1, current_step_index = $2, current_step_name = $3,
            failed_step_index = $4, error = $5, status = $6, state = $7,
            started_at = $8, completed_at = $9
        WHERE id = $10
        "#,
    )
    .bind(serde_json::to_value(&run.steps_completed).unwrap_or_default())
    .bind(run.current_step_index.map(|i| i as i32))
    .bind(&run.current_step_name)
    .bind(run.failed_step_index.map(|i| i as i32))
    .bind(&run.error)
    .bind(run.status().to_string())
    .bind(serde_json::to_value(&run.state).unwrap_or_default())
    .bind(run.started_at)
    .bind(run.completed_at)
    .bind(run.id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list_steps(pool: &PgPool, run_id: Uuid) -> Result<Vec<StepRun>, sqlx::Error> {
    let rows = sqlx::query_as::<_, StepRow>(
        r#"
        SELECT id, pipeline_run_id, step_index, name, kind, on_success, on_failure,
               timeout_seconds, logs, status
        FROM step_runs
        WHERE pipeline_run_id = $1
        ORDER BY step_index ASC
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

pub async fn find_step(
    pool: &PgPool,
    run_id: Uuid,
    step_index: usize,
) -> Result<Option<StepRun>, sqlx::Error> {
    let row = sqlx::query_as::<_, StepRow>(
        r#"
        SELECT id, pipeline_run_id, step_index, name, kind, on_success, on_failure,
               timeout_seconds, logs, status
        FROM step_runs
        WHERE pipeline_run_id = $1 AND step_index = $2
        "#,
    )
    .bind(run_id)
    .bind(step_index as i32)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

pub async fn update_step_status(
    pool: &PgPool,
    step_run_id: Uuid,
    status: StepRunStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE step_runs SET status = $1 WHERE id = $2")
        .bind(status.to_string())
        .bind(step_run_id)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn append_step_logs(
    pool: &PgPool,
    step_run_id: Uuid,
    lines: &[String],
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE step_runs SET logs = logs || $1 WHERE id = $2")
        .bind(serde_json::to_value(lines).unwrap_or_default())
        .bind(step_run_id)
        .execute(pool)
        .await?;

    Ok(())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn string_to_trigger(s: &str) -> TriggerType {
    match s {
        "push" => TriggerType::Push,
        "card" => TriggerType::Card,
        _ => TriggerType::Manual,
    }
}

fn string_to_kind(s: &str) -> StepKind {
    match s {
        "container" => StepKind::Container,
        "agent" => StepKind::Agent,
        _ => StepKind::Script,
    }
}

fn string_to_step_status(s: &str) -> StepRunStatus {
    match s {
        "running" => StepRunStatus::Running,
        "completed" => StepRunStatus::Completed,
        "failed" => StepRunStatus::Failed,
        _ => StepRunStatus::Pending,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    pipeline_id: Uuid,
    trigger_type: String,
    trigger_ref: Option<String>,
    steps_total: i32,
    steps_completed: serde_json::Value,
    current_step_index: Option<i32>,
    current_step_name: Option<String>,
    failed_step_index: Option<i32>,
    error: Option<String>,
    state: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<RunRow> for PipelineRun {
    fn from(row: RunRow) -> Self {
        let mut run = PipelineRun::new(
            row.pipeline_id,
            string_to_trigger(&row.trigger_type),
            row.trigger_ref,
            row.steps_total as usize,
        );
        run.id = row.id;
        run.steps_completed = serde_json::from_value(row.steps_completed).unwrap_or_default();
        run.current_step_index = row.current_step_index.map(|i| i as usize);
        run.current_step_name = row.current_step_name;
        run.failed_step_index = row.failed_step_index.map(|i| i as usize);
        run.error = row.error;
        run.created_at = row.created_at;
        run.started_at = row.started_at;
        run.completed_at = row.completed_at;
        if let Ok(state) = serde_json::from_value(row.state) {
            run.state = state;
        }
        run
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: Uuid,
    pipeline_run_id: Uuid,
    step_index: i32,
    name: String,
    kind: String,
    on_success: String,
    on_failure: String,
    timeout_seconds: Option<i64>,
    logs: serde_json::Value,
    status: String,
}

impl From<StepRow> for StepRun {
    fn from(row: StepRow) -> Self {
        let mut step = StepRun::new(
            row.pipeline_run_id,
            row.step_index as usize,
            row.name,
            string_to_kind(&row.kind),
        );
        step.id = row.id;
        step.on_success = StepPolicy::parse(&row.on_success).unwrap_or(StepPolicy::Next);
        step.on_failure = StepPolicy::parse(&row.on_failure).unwrap_or(StepPolicy::Stop);
        step.timeout_seconds = row.timeout_seconds.map(|t| t as u64);
        step.logs = serde_json::from_value(row.logs).unwrap_or_default();
        step.status = string_to_step_status(&row.status);
        step
    }
}
