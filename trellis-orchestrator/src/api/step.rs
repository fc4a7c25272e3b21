//! Step Control API Handlers
//!
//! Endpoints called by the control script running inside a step
//! container. Every call carries a bearer token scoped to exactly one
//! execution key: a token that exists but belongs to a different key is
//! forbidden, anything else is unauthorized.

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use trellis_core::domain::execution::StepExecution;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::context::AppContext;
use crate::repository::{execution_repository, run_repository};

#[derive(Debug, Serialize)]
pub struct StepStatusResponse {
    pub execution_key: String,
    pub status: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct AppendLogsBody {
    pub lines: Vec<String>,
}

/// Resolve the caller's token to an execution and pin it to the path key
async fn authenticate(
    ctx: &AppContext,
    headers: &HeaderMap,
    path_key: &str,
) -> Result<StepExecution, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_string()))?;

    let execution = execution_repository::find_by_token(&ctx.pool, token)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Unknown token".to_string()))?;

    if execution.key.to_string() != path_key {
        return Err(ApiError::Forbidden(format!(
            "Token is not valid for execution {}",
            path_key
        )));
    }

    Ok(execution)
}

/// GET /api/steps/{key}/status
/// Current status of the caller's own execution
pub async fn step_status(
    State(ctx): State<Arc<AppContext>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<StepStatusResponse>> {
    let execution = authenticate(&ctx, &headers, &key).await?;

    Ok(Json(StepStatusResponse {
        execution_key: execution.key.to_string(),
        status: execution.status().to_string(),
        exit_code: execution.exit_code,
    }))
}

/// POST /api/steps/{key}/logs
/// Append log lines to the caller's step run
pub async fn append_step_logs(
    State(ctx): State<Arc<AppContext>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AppendLogsBody>,
) -> ApiResult<StatusCode> {
    let execution = authenticate(&ctx, &headers, &key).await?;

    if body.lines.is_empty() {
        return Err(ApiError::BadRequest("No log lines supplied".to_string()));
    }

    run_repository::append_step_logs(&ctx.pool, execution.step_run_id, &body.lines).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/steps/{key}/heartbeat
/// Keep the run's workspace from being swept as orphaned
pub async fn step_heartbeat(
    State(ctx): State<Arc<AppContext>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let execution = authenticate(&ctx, &headers, &key).await?;

    if let Ok(run_id) = Uuid::parse_str(&execution.key.run_id) {
        ctx.workspaces.touch(run_id);
    }

    Ok(StatusCode::NO_CONTENT)
}
