//! Runner repository
//!
//! Durable mirror of the in-memory runner registry, used by crash
//! recovery to reconstruct who held what after a backend restart.

use sqlx::PgPool;
use trellis_core::domain::runner::{Runner, RunnerStatus};
use uuid::Uuid;

/// Create or refresh a runner row; re-registration keeps registered_at
pub async fn upsert(pool: &PgPool, runner: &Runner) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO runners
            (id, name, runner_type, labels, status, current_execution_id,
             registered_at, last_heartbeat_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (id) DO UPDATE SET
            name = EXCLUDED.name,
            runner_type = EXCLUDED.runner_type,
            labels = EXCLUDED.labels,
            status = EXCLUDED.status,
            last_heartbeat_at = EXCLUDED.last_heartbeat_at
        "#,
    )
    .bind(&runner.id)
    .bind(&runner.name)
    .bind(&runner.runner_type)
    .bind(serde_json::to_value(&runner.labels).unwrap_or_default())
    .bind(runner.status.to_string())
    .bind(runner.current_execution_id)
    .bind(runner.registered_at)
    .bind(runner.last_heartbeat_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn update_heartbeat(pool: &PgPool, runner_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE runners SET last_heartbeat_at = $1 WHERE id = $2",
    )
    .bind(chrono::Utc::now())
    .bind(runner_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn update_status(
    pool: &PgPool,
    runner_id: &str,
    status: RunnerStatus,
    current_execution_id: Option<Uuid>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE runners SET status = $1, current_execution_id = $2 WHERE id = $3",
    )
    .bind(status.to_string())
    .bind(current_execution_id)
    .bind(runner_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<Runner>, sqlx::Error> {
    let row = sqlx::query_as::<_, RunnerRow>(
        r#"
        SELECT id, name, runner_type, labels, status, current_execution_id,
               registered_at, last_heartbeat_at
        FROM runners
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

pub async fn list_all(pool: &PgPool) -> Result<Vec<Runner>, sqlx::Error> {
    let rows = sqlx::query_as::<_, RunnerRow>(
        r#"
        SELECT id, name, runner_type, labels, status, current_execution_id,
               registered_at, last_heartbeat_at
        FROM runners
        ORDER BY registered_at DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunnerRow {
    id: String,
    name: String,
    runner_type: String,
    labels: serde_json::Value,
    status: String,
    current_execution_id: Option<Uuid>,
    registered_at: chrono::DateTime<chrono::Utc>,
    last_heartbeat_at: chrono::DateTime<chrono::Utc>,
}

impl From<RunnerRow> for Runner {
    fn from(row: RunnerRow) -> Self {
        let labels: Vec<String> = serde_json::from_value(row.labels).unwrap_or_default();
        let mut runner = Runner::new(row.id, row.name, row.runner_type, labels);
        runner.status = match row.status.as_str() {
            "idle" => RunnerStatus::Idle,
            "busy" => RunnerStatus::Busy,
            "dead" => RunnerStatus::Dead,
            _ => RunnerStatus::Offline,
        };
        runner.current_execution_id = row.current_execution_id;
        runner.registered_at = row.registered_at;
        runner.last_heartbeat_at = row.last_heartbeat_at;
        runner
    }
}
