//! Health Check API Handler
//!
//! Liveness plus a few control-plane gauges.

use axum::{Json, extract::State};
use serde_json::json;
use std::sync::Arc;

use crate::context::AppContext;

/// GET /health
/// Health check endpoint
pub async fn health_check(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "queued_jobs": ctx.queue.queued_len(),
        "in_flight_jobs": ctx.queue.pending_len(),
        "runners": ctx.registry.list().len(),
        "active_workspaces": ctx.workspaces.active_count(),
    }))
}
