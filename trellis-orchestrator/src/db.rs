use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_runs (
            id UUID PRIMARY KEY,
            pipeline_id UUID NOT NULL,
            trigger_type VARCHAR(50) NOT NULL,
            trigger_ref TEXT,
            steps_total INTEGER NOT NULL,
            steps_completed JSONB NOT NULL DEFAULT '[]',
            current_step_index INTEGER,
            current_step_name TEXT,
            failed_step_index INTEGER,
            error TEXT,
            status VARCHAR(50) NOT NULL,
            state JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS step_runs (
            id UUID PRIMARY KEY,
            pipeline_run_id UUID NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
            step_index INTEGER NOT NULL,
            name VARCHAR(255) NOT NULL,
            kind VARCHAR(50) NOT NULL,
            on_success VARCHAR(255) NOT NULL,
            on_failure VARCHAR(255) NOT NULL,
            timeout_seconds BIGINT,
            logs JSONB NOT NULL DEFAULT '[]',
            status VARCHAR(50) NOT NULL,
            UNIQUE (pipeline_run_id, step_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS step_executions (
            id UUID PRIMARY KEY,
            step_run_id UUID NOT NULL REFERENCES step_runs(id) ON DELETE CASCADE,
            execution_key VARCHAR(255) NOT NULL UNIQUE,
            runner_id VARCHAR(255),
            container_id VARCHAR(255),
            exit_code INTEGER,
            access_token VARCHAR(64) NOT NULL,
            status VARCHAR(50) NOT NULL,
            state JSONB NOT NULL,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runners (
            id VARCHAR(255) PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            runner_type VARCHAR(50) NOT NULL,
            labels JSONB NOT NULL DEFAULT '[]',
            status VARCHAR(50) NOT NULL,
            current_execution_id UUID,
            registered_at TIMESTAMPTZ NOT NULL,
            last_heartbeat_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trigger_records (
            key VARCHAR(512) PRIMARY KEY,
            triggered_at TIMESTAMPTZ NOT NULL,
            pipeline_run_id UUID NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pipeline_runs_status ON pipeline_runs(status)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_step_runs_pipeline_run ON step_runs(pipeline_run_id, step_index)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_step_executions_status ON step_executions(status)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_step_executions_step_run ON step_executions(step_run_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_step_executions_token ON step_executions(access_token)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runners_heartbeat ON runners(last_heartbeat_at)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
