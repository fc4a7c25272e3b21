//! Trigger record repository
//!
//! Durable side of the dedup ledger; the in-memory deduplicator is
//! rehydrated from here at startup.

use sqlx::PgPool;

use crate::service::dedup::TriggerRecord;

pub async fn upsert(pool: &PgPool, record: &TriggerRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO trigger_records (key, triggered_at, pipeline_run_id)
        VALUES ($1, $2, $3)
        ON CONFLICT (key) DO UPDATE SET
            triggered_at = EXCLUDED.triggered_at,
            pipeline_run_id = EXCLUDED.pipeline_run_id
        "#,
    )
    .bind(&record.key)
    .bind(record.triggered_at)
    .bind(record.pipeline_run_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn load_all(pool: &PgPool) -> Result<Vec<TriggerRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<_, TriggerRow>(
        "SELECT key, triggered_at, pipeline_run_id FROM trigger_records",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

pub async fn delete_older_than(
    pool: &PgPool,
    cutoff: chrono::DateTime<chrono::Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM trigger_records WHERE triggered_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

#[derive(sqlx::FromRow)]
struct TriggerRow {
    key: String,
    triggered_at: chrono::DateTime<chrono::Utc>,
    pipeline_run_id: uuid::Uuid,
}

impl From<TriggerRow> for TriggerRecord {
    fn from(row: TriggerRow) -> Self {
        TriggerRecord {
            key: row.key,
            triggered_at: row.triggered_at,
            pipeline_run_id: row.pipeline_run_id,
        }
    }
}
