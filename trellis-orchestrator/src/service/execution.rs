//! Step execution service
//!
//! Attempt lifecycle around the idempotent creation path, runner
//! assignment, and the per-step background tasks (log flushing,
//! activity heartbeat) that are owned by the execution and always
//! stopped when it ends.

use sqlx::PgPool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use trellis_core::domain::execution::{ExecutionStatus, StepExecution};
use trellis_core::error::StateError;
use trellis_core::keys::ExecutionKey;
use uuid::Uuid;

use crate::repository::{execution_repository, run_repository, runner_repository};
use crate::service::registry::RunnerRegistry;
use crate::service::workspace::WorkspaceManager;

/// Service error type
#[derive(Debug)]
pub enum ExecutionError {
    NotFound(Uuid),
    InvalidState(StateError),
    DatabaseError(sqlx::Error),
}

impl From<sqlx::Error> for ExecutionError {
    fn from(err: sqlx::Error) -> Self {
        ExecutionError::DatabaseError(err)
    }
}

impl From<StateError> for ExecutionError {
    fn from(err: StateError) -> Self {
        ExecutionError::InvalidState(err)
    }
}

/// The single creation path for execution attempts
///
/// Every call with the same key returns the identical row, which makes
/// retried or duplicated dispatch attempts safe.
pub async fn get_or_create_execution(
    pool: &PgPool,
    step_run_id: Uuid,
    key: &ExecutionKey,
) -> Result<StepExecution, ExecutionError> {
    let execution = execution_repository::get_or_create(pool, step_run_id, key).await?;
    Ok(execution)
}

/// Hand a pending execution to a runner (PENDING → PREPARING)
pub async fn assign_to_runner(
    pool: &PgPool,
    registry: &RunnerRegistry,
    execution_id: Uuid,
    runner_id: &str,
) -> Result<StepExecution, ExecutionError> {
    let mut execution = execution_repository::find_by_id(pool, execution_id)
        .await?
        .ok_or(ExecutionError::NotFound(execution_id))?;

    execution.transition(
        ExecutionStatus::Preparing,
        Some(&format!("assigned to runner {}", runner_id)),
    )?;
    execution.runner_id = Some(runner_id.to_string());
    execution_repository::update(pool, &execution).await?;

    registry.mark_busy(runner_id, execution.id);
    if let Some(runner) = registry.get(runner_id) {
        runner_repository::update_status(pool, runner_id, runner.status, Some(execution.id)).await?;
    }

    debug!("Execution {} assigned to runner {}", execution.key, runner_id);
    Ok(execution)
}

/// The runner ACKed the assignment (PREPARING → RUNNING)
pub async fn mark_running(pool: &PgPool, execution_id: Uuid) -> Result<(), ExecutionError> {
    let mut execution = execution_repository::find_by_id(pool, execution_id)
        .await?
        .ok_or(ExecutionError::NotFound(execution_id))?;

    execution.transition(ExecutionStatus::Running, Some("runner acknowledged"))?;
    execution_repository::update(pool, &execution).await?;
    Ok(())
}

/// Settle an execution from its exit code
pub async fn settle(
    pool: &PgPool,
    execution_id: Uuid,
    exit_code: i32,
    error: Option<&str>,
) -> Result<StepExecution, ExecutionError> {
    let mut execution = execution_repository::find_by_id(pool, execution_id)
        .await?
        .ok_or(ExecutionError::NotFound(execution_id))?;

    // Already settled elsewhere (e.g. cancelled while the container ran)
    if execution.state.is_terminal() {
        return Ok(execution);
    }

    execution.transition(ExecutionStatus::Completing, error)?;
    execution.record_exit(exit_code)?;
    execution_repository::update(pool, &execution).await?;
    Ok(execution)
}

/// Cancel one attempt without touching its siblings
pub async fn cancel(
    pool: &PgPool,
    execution_id: Uuid,
    reason: &str,
) -> Result<(), ExecutionError> {
    let mut execution = execution_repository::find_by_id(pool, execution_id)
        .await?
        .ok_or(ExecutionError::NotFound(execution_id))?;

    if execution.state.is_terminal() {
        return Ok(());
    }
    execution.transition(ExecutionStatus::Cancelled, Some(reason))?;
    execution_repository::update(pool, &execution).await?;
    Ok(())
}

// =============================================================================
// Per-step background tasks
// =============================================================================

/// Shared buffer the execution path appends log lines into
pub type LogBuffer = Arc<Mutex<Vec<String>>>;

/// Background activities owned by one active step execution
///
/// Started on entry to RUNNING, stopped on every exit path. `stop`
/// aborts both tasks and awaits them so no dangling timers remain.
pub struct StepTasks {
    handles: Vec<JoinHandle<()>>,
}

impl StepTasks {
    pub fn spawn(
        pool: PgPool,
        workspaces: Arc<WorkspaceManager>,
        run_id: Uuid,
        step_run_id: Uuid,
        buffer: LogBuffer,
        flush_interval: Duration,
    ) -> Self {
        let flusher = {
            let pool = pool.clone();
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(flush_interval);
                loop {
                    ticker.tick().await;
                    flush_logs(&pool, step_run_id, &buffer).await;
                }
            })
        };

        // Keeps the workspace's last-activity time fresh so the orphan
        // sweep never reaps a workspace with a live step
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                ticker.tick().await;
                workspaces.touch(run_id);
            }
        });

        Self {
            handles: vec![flusher, heartbeat],
        }
    }

    /// Abort and await both tasks, then flush whatever logs remain
    pub async fn stop(self, pool: &PgPool, step_run_id: Uuid, buffer: &LogBuffer) {
        for handle in self.handles {
            handle.abort();
            let _ = handle.await;
        }
        flush_logs(pool, step_run_id, buffer).await;
    }
}

async fn flush_logs(pool: &PgPool, step_run_id: Uuid, buffer: &LogBuffer) {
    let lines: Vec<String> = {
        let mut buffer = buffer.lock().unwrap();
        buffer.drain(..).collect()
    };
    if lines.is_empty() {
        return;
    }
    if let Err(e) = run_repository::append_step_logs(pool, step_run_id, &lines).await {
        warn!("Failed to flush {} log line(s): {:?}", lines.len(), e);
    }
}
