//! Job/step recovery
//!
//! Repairs state after a runner or the backend process dies. All entry
//! points are idempotent; the database row is the single source of
//! truth, so whichever of a death-detection and a reconnection commits
//! first determines the runner's subsequent view.

use sqlx::PgPool;
use tracing::{info, warn};
use trellis_core::domain::runner::RunnerStatus;
use uuid::Uuid;

use crate::repository::{execution_repository, runner_repository};
use crate::service::queue::JobQueue;
use crate::service::registry::RunnerRegistry;

#[derive(Debug)]
pub enum RecoveryError {
    DatabaseError(sqlx::Error),
}

impl From<sqlx::Error> for RecoveryError {
    fn from(err: sqlx::Error) -> Self {
        RecoveryError::DatabaseError(err)
    }
}

/// What a reconnecting runner should do with the step it remembers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectVerdict {
    /// The step is still assigned to this runner; keep going
    Continue,
    /// The step was reassigned while the runner was away; abandon it
    Abort,
    /// The runner held nothing
    Idle,
}

/// A runner stopped heartbeating or dropped its connection
///
/// Returns the execution that was reclaimed, if any. Calling this twice
/// on an already-requeued step is a no-op: the registry hands out the
/// held execution only once, and the row reset is guarded on
/// non-terminal status.
pub async fn on_runner_death(
    pool: &PgPool,
    registry: &RunnerRegistry,
    queue: &JobQueue,
    runner_id: &str,
) -> Result<Option<Uuid>, RecoveryError> {
    let held = registry.mark_dead(runner_id);
    runner_repository::update_status(pool, runner_id, RunnerStatus::Dead, None).await?;

    let Some(execution_id) = held else {
        return Ok(None);
    };

    if execution_repository::reset_to_pending(pool, execution_id).await? {
        warn!(
            "Runner {} died holding execution {}; reset to pending",
            runner_id, execution_id
        );
        queue.requeue(execution_id);
        Ok(Some(execution_id))
    } else {
        // Already terminal or already reclaimed by someone else
        Ok(None)
    }
}

/// A runner reconnected and wants to know whether to resume
pub async fn on_runner_reconnect(
    pool: &PgPool,
    registry: &RunnerRegistry,
    runner_id: &str,
) -> Result<ReconnectVerdict, RecoveryError> {
    let remembered = match registry.get(runner_id).and_then(|r| r.current_execution_id) {
        Some(id) => Some(id),
        // Registry may be empty after a backend restart; fall back to
        // the durable runner row
        None => runner_repository::find_by_id(pool, runner_id)
            .await?
            .and_then(|r| r.current_execution_id),
    };

    let assignee = match remembered {
        Some(execution_id) => execution_repository::find_by_id(pool, execution_id)
            .await?
            .and_then(|e| e.runner_id),
        None => None,
    };

    let verdict = reconnect_verdict(remembered, assignee.as_deref(), runner_id);

    if verdict == ReconnectVerdict::Abort {
        registry.clear_assignment(runner_id);
        runner_repository::update_status(pool, runner_id, RunnerStatus::Idle, None).await?;
    }

    Ok(verdict)
}

fn reconnect_verdict(
    remembered: Option<Uuid>,
    current_assignee: Option<&str>,
    runner_id: &str,
) -> ReconnectVerdict {
    match remembered {
        None => ReconnectVerdict::Idle,
        Some(_) if current_assignee == Some(runner_id) => ReconnectVerdict::Continue,
        Some(_) => ReconnectVerdict::Abort,
    }
}

/// Startup scan: reclaim executions whose runner is not alive
///
/// RUNNING/PREPARING rows with a dead or unknown runner are reset to
/// pending with the runner cleared. Already-pending rows are left
/// untouched; terminal rows are never looked at.
pub async fn recover_orphaned_steps(
    pool: &PgPool,
    registry: &RunnerRegistry,
) -> Result<Vec<Uuid>, RecoveryError> {
    let in_flight = execution_repository::find_in_flight(pool).await?;
    let mut recovered = Vec::new();

    for execution in in_flight {
        let alive = execution
            .runner_id
            .as_deref()
            .map(|id| registry.is_alive(id))
            .unwrap_or(false);
        if alive {
            continue;
        }

        if execution_repository::reset_to_pending(pool, execution.id).await? {
            info!(
                "Recovered orphaned execution {} (key {})",
                execution.id, execution.key
            );
            recovered.push(execution.id);
        }
    }

    if !recovered.is_empty() {
        info!("Recovery reset {} orphaned execution(s)", recovered.len());
    }
    Ok(recovered)
}

/// Periodic sweep: declare silent runners dead and reclaim their work
pub async fn sweep_stale_runners(
    pool: &PgPool,
    registry: &RunnerRegistry,
    queue: &JobQueue,
) -> Result<usize, RecoveryError> {
    let stale = registry.stale_runner_ids();
    let count = stale.len();

    for runner_id in stale {
        warn!("Runner {} missed its heartbeat deadline", runner_id);
        on_runner_death(pool, registry, queue, &runner_id).await?;
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_idle_when_nothing_held() {
        assert_eq!(reconnect_verdict(None, None, "rig-1"), ReconnectVerdict::Idle);
    }

    #[test]
    fn test_verdict_continue_when_still_assigned() {
        let exec = Uuid::new_v4();
        assert_eq!(
            reconnect_verdict(Some(exec), Some("rig-1"), "rig-1"),
            ReconnectVerdict::Continue
        );
    }

    #[test]
    fn test_verdict_abort_when_reassigned_or_cleared() {
        let exec = Uuid::new_v4();
        assert_eq!(
            reconnect_verdict(Some(exec), Some("rig-2"), "rig-1"),
            ReconnectVerdict::Abort
        );
        assert_eq!(
            reconnect_verdict(Some(exec), None, "rig-1"),
            ReconnectVerdict::Abort
        );
    }
}
