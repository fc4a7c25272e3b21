//! Pipeline Run API Handlers
//!
//! HTTP endpoints for triggering, inspecting and cancelling runs.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use trellis_core::domain::run::{PipelineRun, TriggerType};
use trellis_core::domain::step::{StepKind, StepPolicy, StepRun};
use trellis_core::routing::StepRequirements;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::context::AppContext;
use crate::repository::run_repository;
use crate::service::run_service;
use crate::service::run_service::{StepSpec, TriggerOutcome, TriggerRequest};

// =============================================================================
// Request / Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct TriggerRunBody {
    pub pipeline_id: Uuid,
    pub trigger_type: TriggerType,
    pub repo_id: String,
    pub git_ref: String,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub force: bool,
    pub steps: Vec<StepBody>,
}

#[derive(Debug, Deserialize)]
pub struct StepBody {
    pub name: String,
    pub kind: StepKind,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default = "default_on_success")]
    pub on_success: String,
    #[serde(default = "default_on_failure")]
    pub on_failure: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub requirements: StepRequirements,
}

fn default_on_success() -> String {
    "next".to_string()
}

fn default_on_failure() -> String {
    "stop".to_string()
}

#[derive(Debug, Serialize)]
pub struct TriggerRunResponse {
    pub run_id: Uuid,
    pub status: &'static str,
}

impl StepBody {
    fn into_spec(self) -> Result<StepSpec, ApiError> {
        let on_success = parse_policy(&self.on_success)?;
        let on_failure = parse_policy(&self.on_failure)?;
        Ok(StepSpec {
            name: self.name,
            kind: self.kind,
            image: self.image,
            on_success,
            on_failure,
            timeout_seconds: self.timeout_seconds,
            requirements: self.requirements,
        })
    }
}

fn parse_policy(s: &str) -> Result<StepPolicy, ApiError> {
    StepPolicy::parse(s)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid step policy: {:?}", s)))
}

// =============================================================================
// Run Endpoints
// =============================================================================

/// POST /api/runs/trigger
/// Admit a trigger and start a pipeline run
pub async fn trigger_run(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<TriggerRunBody>,
) -> ApiResult<(StatusCode, Json<TriggerRunResponse>)> {
    if body.steps.is_empty() {
        return Err(ApiError::BadRequest("Pipeline has no steps".to_string()));
    }

    let steps: Vec<StepSpec> = body
        .steps
        .into_iter()
        .map(StepBody::into_spec)
        .collect::<Result<_, _>>()?;

    let request = TriggerRequest {
        pipeline_id: body.pipeline_id,
        trigger_type: body.trigger_type,
        repo_id: body.repo_id,
        git_ref: body.git_ref,
        commit_sha: body.commit_sha,
        force: body.force,
        steps,
    };

    match run_service::trigger_run(&ctx, request).await? {
        TriggerOutcome::Started { run_id } => Ok((
            StatusCode::CREATED,
            Json(TriggerRunResponse {
                run_id,
                status: "started",
            }),
        )),
        TriggerOutcome::Duplicate { original_run_id } => Ok((
            StatusCode::OK,
            Json(TriggerRunResponse {
                run_id: original_run_id,
                status: "duplicate",
            }),
        )),
    }
}

/// GET /api/runs/{id}
/// Get a run including its state machine history
pub async fn get_run(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PipelineRun>> {
    let run = run_service::get_run(&ctx, id).await?;
    Ok(Json(run))
}

/// GET /api/runs/{id}/steps
/// List a run's steps with their logs and coarse status
pub async fn list_run_steps(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<StepRun>>> {
    // NotFound over an empty list for an id nobody has seen
    run_service::get_run(&ctx, id).await?;
    let steps = run_repository::list_steps(&ctx.pool, id).await?;
    Ok(Json(steps))
}

/// POST /api/runs/{id}/cancel
/// Cooperatively cancel a run and its in-flight executions
pub async fn cancel_run(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Cancellation requested for run {}", id);
    run_service::cancel_run(&ctx, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
