//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod run;
pub mod runner;
pub mod step;
pub mod ws;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::context::AppContext;

/// Create the main API router with all endpoints
pub fn create_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Run endpoints
        .route("/api/runs/trigger", post(run::trigger_run))
        .route("/api/runs/{id}", get(run::get_run))
        .route("/api/runs/{id}/steps", get(run::list_run_steps))
        .route("/api/runs/{id}/cancel", post(run::cancel_run))
        // Step control endpoints (in-container control scripts)
        .route("/api/steps/{key}/status", get(step::step_status))
        .route("/api/steps/{key}/logs", post(step::append_step_logs))
        .route("/api/steps/{key}/heartbeat", post(step::step_heartbeat))
        // Runner endpoints
        .route("/api/runners/register", post(runner::register_runner))
        .route("/api/runners/ws", get(ws::runner_ws))
        .route("/api/runners", get(runner::list_runners))
        .route("/api/runners/{id}", get(runner::get_runner))
        .route("/api/runners/{id}/heartbeat", post(runner::runner_heartbeat))
        .route("/api/runners/{id}/poll", post(runner::poll_job))
        .route("/api/runners/{id}/complete", post(runner::complete_step))
        // Add state and middleware
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
