//! Runner API Handlers
//!
//! REST surface for remote runners: registration, heartbeat, long-poll
//! job pickup and completion. Runners that keep a persistent connection
//! use the websocket channel instead (see `api::ws`).

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use trellis_core::domain::job::QueuedJob;
use trellis_core::domain::runner::Runner;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::context::AppContext;
use crate::repository::runner_repository;
use crate::service::{execution_service, recovery_service, run_service};

/// How long a poll request is held open waiting for work
const POLL_WAIT: Duration = Duration::from_secs(25);

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterRunnerBody {
    pub runner_id: String,
    pub name: String,
    pub runner_type: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteStepBody {
    pub execution_id: Uuid,
    pub exit_code: i32,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterRunnerResponse {
    pub runner: Runner,
    pub resume: String,
}

// =============================================================================
// Runner Registration & Lifecycle
// =============================================================================

/// POST /api/runners/register
/// Register a runner; re-registration with a known id reuses the record
pub async fn register_runner(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<RegisterRunnerBody>,
) -> ApiResult<Json<RegisterRunnerResponse>> {
    if body.runner_id.trim().is_empty() || body.name.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "runner_id and name are required".to_string(),
        ));
    }

    tracing::info!("Registering runner: {}", body.runner_id);

    let runner = ctx
        .registry
        .register(&body.runner_id, &body.name, &body.runner_type, body.labels);
    runner_repository::upsert(&ctx.pool, &runner).await?;

    let verdict = recovery_service::on_runner_reconnect(&ctx.pool, &ctx.registry, &runner.id)
        .await
        .map_err(|e| ApiError::InternalError(format!("Reconnect check failed: {:?}", e)))?;

    let resume = match verdict {
        recovery_service::ReconnectVerdict::Continue => "continue",
        recovery_service::ReconnectVerdict::Abort => "abort",
        recovery_service::ReconnectVerdict::Idle => "idle",
    };

    Ok(Json(RegisterRunnerResponse {
        runner,
        resume: resume.to_string(),
    }))
}

/// POST /api/runners/{id}/heartbeat
/// Update heartbeat for a runner to keep it marked as online
pub async fn runner_heartbeat(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    tracing::debug!("Heartbeat from runner: {}", id);

    if !ctx.registry.heartbeat(&id) {
        return Err(ApiError::NotFound(format!("Runner {} not found", id)));
    }
    runner_repository::update_heartbeat(&ctx.pool, &id).await?;

    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Job Pickup & Completion
// =============================================================================

/// POST /api/runners/{id}/poll
/// Long-poll for a matching job; 204 when nothing arrives in time
pub async fn poll_job(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Option<QueuedJob>>)> {
    let runner = ctx
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Runner {} not found", id)))?;

    // Only take jobs this runner can actually execute; the rest keep
    // their FIFO position for other pollers
    let Some(job) = ctx
        .queue
        .wait_for_matching(POLL_WAIT, |j| j.matches_runner(&runner.id, &runner.labels))
        .await
    else {
        return Ok((StatusCode::NO_CONTENT, Json(None)));
    };

    execution_service::assign_to_runner(&ctx.pool, &ctx.registry, job.execution_id, &id)
        .await
        .map_err(|e| ApiError::InternalError(format!("Assignment failed: {:?}", e)))?;

    tracing::info!("Job {} handed to runner {}", job.execution_key, id);
    Ok((StatusCode::OK, Json(Some(job))))
}

/// POST /api/runners/{id}/complete
/// Report a step's final result
pub async fn complete_step(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(body): Json<CompleteStepBody>,
) -> ApiResult<StatusCode> {
    run_service::handle_remote_completion(&ctx, body.execution_id, body.exit_code, body.error, &id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Runner Query Endpoints
// =============================================================================

/// GET /api/runners
/// List all registered runners
pub async fn list_runners(State(ctx): State<Arc<AppContext>>) -> ApiResult<Json<Vec<Runner>>> {
    Ok(Json(ctx.registry.list()))
}

/// GET /api/runners/{id}
/// Get details for a specific runner
pub async fn get_runner(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Runner>> {
    ctx.registry
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Runner {} not found", id)))
}
