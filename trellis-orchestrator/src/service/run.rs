//! Run coordinator
//!
//! Ties the control plane together: trigger admission, run and step-run
//! creation, per-step routing and dispatch, completion/failure roll-up,
//! cancellation, and workspace cleanup once a run settles.
//!
//! Steps execute in definition order; the callback for step N decides
//! whether N+1 is dispatched, so completions for one run are applied in
//! the order they arrive.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};
use trellis_core::domain::execution::StepExecution;
use trellis_core::domain::job::{QueuedJob, StepConfig};
use trellis_core::domain::run::{PipelineRun, RunStatus, TriggerType};
use trellis_core::domain::step::{StepKind, StepPolicy, StepRun, StepRunStatus};
use trellis_core::error::StateError;
use trellis_core::keys::{ExecutionKey, trigger_key};
use trellis_core::routing::{ExecutorType, StepRequirements};
use uuid::Uuid;

use crate::context::AppContext;
use crate::repository::{execution_repository, run_repository, trigger_repository};
use crate::service::dedup::{TriggerRecord, TriggerVerdict};
use crate::service::execution::{self, StepTasks};
use crate::service::locks::{LockError, LockKind};
use crate::service::router::{self, RouterError};

/// Service error type
#[derive(Debug)]
pub enum RunError {
    NotFound(Uuid),
    StepNotFound { run_id: Uuid, step_index: usize },
    InvalidState(StateError),
    Routing(RouterError),
    LockTimeout(LockError),
    DatabaseError(sqlx::Error),
}

impl From<sqlx::Error> for RunError {
    fn from(err: sqlx::Error) -> Self {
        RunError::DatabaseError(err)
    }
}

impl From<StateError> for RunError {
    fn from(err: StateError) -> Self {
        RunError::InvalidState(err)
    }
}

impl From<RouterError> for RunError {
    fn from(err: RouterError) -> Self {
        RunError::Routing(err)
    }
}

impl From<LockError> for RunError {
    fn from(err: LockError) -> Self {
        RunError::LockTimeout(err)
    }
}

impl From<crate::service::execution::ExecutionError> for RunError {
    fn from(err: crate::service::execution::ExecutionError) -> Self {
        match err {
            execution::ExecutionError::NotFound(id) => RunError::NotFound(id),
            execution::ExecutionError::InvalidState(e) => RunError::InvalidState(e),
            execution::ExecutionError::DatabaseError(e) => RunError::DatabaseError(e),
        }
    }
}

/// Step definition supplied with a trigger
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub name: String,
    pub kind: StepKind,
    pub image: Option<String>,
    pub on_success: StepPolicy,
    pub on_failure: StepPolicy,
    pub timeout_seconds: Option<u64>,
    pub requirements: StepRequirements,
}

/// An incoming trigger
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub pipeline_id: Uuid,
    pub trigger_type: TriggerType,
    pub repo_id: String,
    pub git_ref: String,
    pub commit_sha: Option<String>,
    pub force: bool,
    pub steps: Vec<StepSpec>,
}

/// Outcome of trigger admission; a duplicate is not an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started { run_id: Uuid },
    Duplicate { original_run_id: Uuid },
}

/// Admit (or reject) a trigger and create the run
pub async fn trigger_run(
    ctx: &Arc<AppContext>,
    req: TriggerRequest,
) -> Result<TriggerOutcome, RunError> {
    let key = trigger_key(
        &req.trigger_type.to_string(),
        &req.repo_id,
        &req.git_ref,
        req.commit_sha.as_deref(),
    );

    let run = PipelineRun::new(
        req.pipeline_id,
        req.trigger_type,
        Some(req.git_ref.clone()),
        req.steps.len(),
    );

    match ctx.dedup.check_and_record(&key, run.id, req.force) {
        TriggerVerdict::Duplicate {
            original_run_id, ..
        } => {
            info!("Trigger {} deduplicated against run {}", key, original_run_id);
            return Ok(TriggerOutcome::Duplicate { original_run_id });
        }
        TriggerVerdict::Admitted => {}
    }

    let steps: Vec<StepRun> = req
        .steps
        .iter()
        .enumerate()
        .map(|(index, spec)| {
            let mut step = StepRun::new(run.id, index, spec.name.clone(), spec.kind);
            step.on_success = spec.on_success.clone();
            step.on_failure = spec.on_failure.clone();
            step.timeout_seconds = spec.timeout_seconds;
            step
        })
        .collect();

    if let Err(e) = run_repository::create(&ctx.pool, &run, &steps).await {
        // The admission guards a run that never existed; give the key back
        ctx.dedup.retract(&key, run.id);
        return Err(e.into());
    }
    if let Err(e) = trigger_repository::upsert(
        &ctx.pool,
        &TriggerRecord {
            key: key.clone(),
            triggered_at: chrono::Utc::now(),
            pipeline_run_id: run.id,
        },
    )
    .await
    {
        // The in-memory ledger still dedups; only restart-survival is lost
        warn!("Failed to persist trigger record {}: {}", key, e);
    }

    info!("Run {} created from trigger {}", run.id, key);

    let run_id = run.id;
    ctx.remember_specs(run_id, req.steps.clone());

    let ctx = Arc::clone(ctx);
    let specs = req.steps;
    tokio::spawn(async move {
        if let Err(e) = start_run(&ctx, run_id, &specs).await {
            error!("Run {} failed to start: {:?}", run_id, e);
        }
    });

    Ok(TriggerOutcome::Started { run_id })
}

/// PENDING → PREPARING (workspace creation under an exclusive lock)
/// → RUNNING, then dispatch the first step
async fn start_run(
    ctx: &Arc<AppContext>,
    run_id: Uuid,
    specs: &[StepSpec],
) -> Result<(), RunError> {
    let mut run = load_run(ctx, run_id).await?;

    run.transition(RunStatus::Preparing, Some("trigger admitted"))?;
    run_repository::update(&ctx.pool, &run).await?;

    {
        let workspace = ctx.workspaces.create_for_run(run_id)?;
        let _guard = ctx
            .locks
            .lock_scoped(
                workspace.id,
                LockKind::Exclusive,
                "workspace create",
                Duration::from_secs(30),
            )
            .await?;
        // Volume provisioning would happen here under the exclusive
        // grant; released on scope exit either way
    }

    run.transition(RunStatus::Running, None)?;
    run_repository::update(&ctx.pool, &run).await?;

    dispatch_step(ctx, run_id, 0, specs, None).await
}

/// Route one step and hand it to the right executor
pub async fn dispatch_step(
    ctx: &Arc<AppContext>,
    run_id: Uuid,
    step_index: usize,
    specs: &[StepSpec],
    previous_runner_id: Option<String>,
) -> Result<(), RunError> {
    let step = run_repository::find_step(&ctx.pool, run_id, step_index)
        .await?
        .ok_or(RunError::StepNotFound { run_id, step_index })?;
    let spec = specs
        .get(step_index)
        .ok_or(RunError::StepNotFound { run_id, step_index })?;

    let decision = router::route(
        &ctx.router,
        step.kind,
        spec.image.as_deref(),
        &spec.requirements,
        previous_runner_id.as_deref(),
    )?;

    let attempt = next_attempt(ctx, run_id, step_index).await?;
    let key = ExecutionKey::new(run_id, step_index, attempt);
    let execution = execution::get_or_create_execution(&ctx.pool, step.id, &key).await?;

    let mut run = load_run(ctx, run_id).await?;
    run.set_current_step(step_index, &step.name);
    run_repository::update(&ctx.pool, &run).await?;
    run_repository::update_step_status(&ctx.pool, step.id, StepRunStatus::Running).await?;

    let config = StepConfig {
        kind: step.kind,
        image: decision.image.clone(),
        command: spec.image.is_none().then(|| format!("trellis-step {}", step.name)),
        env: Default::default(),
        timeout_seconds: step.timeout_seconds,
        workspace_affinity: decision.workspace_affinity.clone(),
    };

    match decision.executor {
        ExecutorType::Local => {
            info!("Step {}:{} dispatched locally ({})", run_id, step_index, decision.reason);
            let ctx = Arc::clone(ctx);
            let specs = specs.to_vec();
            let step = step.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    run_local_step(&ctx, run_id, &step, &specs, execution, config).await
                {
                    error!("Local step {}:{} failed: {:?}", run_id, step.index, e);
                }
            });
        }
        ExecutorType::Remote => {
            info!("Step {}:{} queued for remote runner ({})", run_id, step_index, decision.reason);
            let mut job = QueuedJob::new(execution.id, key.to_string(), config);
            job.required_runner_id = decision.required_runner_id.clone();
            job.required_labels = decision.required_labels.clone();
            ctx.queue.enqueue(job);
        }
    }

    Ok(())
}

/// Execute a step in a local container under a shared workspace lock
async fn run_local_step(
    ctx: &Arc<AppContext>,
    run_id: Uuid,
    step: &StepRun,
    specs: &[StepSpec],
    mut execution: StepExecution,
    config: StepConfig,
) -> Result<(), RunError> {
    use trellis_core::domain::execution::ExecutionStatus;

    let workspace = ctx
        .workspaces
        .get(run_id)
        .ok_or_else(|| RunError::InvalidState(StateError::Precondition(format!(
            "no workspace for run {}",
            run_id
        ))))?;

    let lock_timeout = Duration::from_secs(step.timeout_seconds.unwrap_or(3600));
    let _guard = ctx
        .locks
        .lock_scoped(workspace.id, LockKind::Shared, &step.name, lock_timeout)
        .await?;

    // Released on drop, so no error between here and the explicit drop
    // below can strand the use count
    let hold = ctx.workspaces.acquire_scoped(run_id, &step.name)?;

    let key_string = execution.key.to_string();
    execution.container_id = Some(ctx.executor.container_name(&key_string));
    execution.transition(ExecutionStatus::Preparing, Some("local container"))?;
    execution.transition(ExecutionStatus::Running, None)?;
    execution_repository::update(&ctx.pool, &execution).await?;

    let buffer = Arc::new(Mutex::new(Vec::new()));
    let tasks = StepTasks::spawn(
        ctx.pool.clone(),
        Arc::clone(&ctx.workspaces),
        run_id,
        step.id,
        Arc::clone(&buffer),
        Duration::from_secs(5),
    );

    let outcome = ctx.executor.execute_step(&key_string, &config, &buffer).await;

    // Background tasks stop on every path before the result is examined
    tasks.stop(&ctx.pool, step.id, &buffer).await;
    drop(hold);

    let (exit_code, error) = match outcome {
        Ok(result) => (result.exit_code, result.error_message),
        Err(e) => (-1, Some(format!("container runtime failure: {:#}", e))),
    };

    let settled = execution::settle(&ctx.pool, execution.id, exit_code, error.as_deref()).await?;

    match settled.status() {
        ExecutionStatus::Completed => {
            handle_step_completed(ctx, run_id, step.index, specs, None).await
        }
        // Cancelled while the container ran; the run-level state was
        // already set by the cancellation path
        ExecutionStatus::Cancelled => Ok(()),
        _ => {
            let message = error.unwrap_or_else(|| format!("exit code {}", exit_code));
            handle_step_failed(ctx, run_id, step.index, &message, specs).await
        }
    }
}

/// A step settled successfully; roll up and dispatch the next one
pub async fn handle_step_completed(
    ctx: &Arc<AppContext>,
    run_id: Uuid,
    step_index: usize,
    specs: &[StepSpec],
    completed_on_runner: Option<String>,
) -> Result<(), RunError> {
    let _guard = ctx.run_guard(run_id).await;

    let mut run = load_run(ctx, run_id).await?;
    if run.state.is_terminal() {
        return Ok(());
    }

    if let Some(step) = run_repository::find_step(&ctx.pool, run_id, step_index).await? {
        run_repository::update_step_status(&ctx.pool, step.id, StepRunStatus::Completed).await?;
    }

    run.on_step_completed(step_index)?;
    run_repository::update(&ctx.pool, &run).await?;

    if run.status() == RunStatus::Completing {
        finalize_run(ctx, run).await
    } else {
        dispatch_next(ctx, run_id, step_index, specs, completed_on_runner).await
    }
}

/// A step failed; apply its on_failure policy
pub async fn handle_step_failed(
    ctx: &Arc<AppContext>,
    run_id: Uuid,
    step_index: usize,
    error: &str,
    specs: &[StepSpec],
) -> Result<(), RunError> {
    let _guard = ctx.run_guard(run_id).await;

    let mut run = load_run(ctx, run_id).await?;
    if run.state.is_terminal() {
        return Ok(());
    }

    let step = run_repository::find_step(&ctx.pool, run_id, step_index)
        .await?
        .ok_or(RunError::StepNotFound { run_id, step_index })?;
    run_repository::update_step_status(&ctx.pool, step.id, StepRunStatus::Failed).await?;

    let policy = step.on_failure.clone();
    run.on_step_failed(step_index, error, &policy)?;
    run_repository::update(&ctx.pool, &run).await?;

    match run.status() {
        RunStatus::Failed => {
            warn!("Run {} failed at step {}: {}", run_id, step_index, error);
            cancel_remaining_executions(ctx, run_id, "run failed").await?;
            settle_workspace(ctx, run_id);
            ctx.forget_run(run_id);
            Ok(())
        }
        RunStatus::Completing => finalize_run(ctx, run).await,
        _ => {
            // Policy "next" degraded the failure to a logged event
            info!(
                "Step {}:{} failed non-fatally, continuing: {}",
                run_id, step_index, error
            );
            dispatch_next(ctx, run_id, step_index, specs, None).await
        }
    }
}

/// A remote runner reported a step's final result
///
/// Settles the execution, retires the queued job, frees the runner, and
/// rolls the result up into the run. Next-step routing favors the runner
/// that just finished, so a multi-step run sticks to the workspace it
/// has already populated.
pub async fn handle_remote_completion(
    ctx: &Arc<AppContext>,
    execution_id: Uuid,
    exit_code: i32,
    error: Option<String>,
    runner_id: &str,
) -> Result<(), RunError> {
    // A completion implies the step ran even if the ACK was lost in
    // transit; a failed transition here just means it was already running
    let _ = execution::mark_running(&ctx.pool, execution_id).await;

    let settled = execution::settle(&ctx.pool, execution_id, exit_code, error.as_deref()).await?;

    ctx.queue.complete(execution_id);
    ctx.registry.mark_idle(runner_id);
    if let Err(e) = crate::repository::runner_repository::update_status(
        &ctx.pool,
        runner_id,
        trellis_core::domain::runner::RunnerStatus::Idle,
        None,
    )
    .await
    {
        warn!("Failed to persist idle status for runner {}: {}", runner_id, e);
    }

    let run_id = Uuid::parse_str(&settled.key.run_id).map_err(|_| {
        RunError::InvalidState(StateError::Precondition(format!(
            "execution key {} does not name a run",
            settled.key
        )))
    })?;
    let step_index = settled.key.step_index;
    let specs = match ctx.specs_for(run_id) {
        Some(specs) => specs,
        None => {
            // Backend restarted since the run began; roll up without
            // dispatching further steps
            warn!("No step specs held for run {}; roll-up only", run_id);
            Vec::new()
        }
    };

    use trellis_core::domain::execution::ExecutionStatus;
    match settled.status() {
        ExecutionStatus::Completed => {
            handle_step_completed(ctx, run_id, step_index, &specs, Some(runner_id.to_string()))
                .await
        }
        ExecutionStatus::Cancelled => Ok(()),
        _ => {
            let message = error.unwrap_or_else(|| format!("exit code {}", exit_code));
            handle_step_failed(ctx, run_id, step_index, &message, &specs).await
        }
    }
}

/// Request cancellation of a run and all its non-terminal attempts
pub async fn cancel_run(ctx: &Arc<AppContext>, run_id: Uuid) -> Result<(), RunError> {
    let _guard = ctx.run_guard(run_id).await;

    let mut run = load_run(ctx, run_id).await?;
    if run.state.is_terminal() {
        return Ok(());
    }

    run.transition(RunStatus::Cancelled, Some("cancellation requested"))?;
    run_repository::update(&ctx.pool, &run).await?;

    cancel_remaining_executions(ctx, run_id, "run cancelled").await?;
    settle_workspace(ctx, run_id);
    ctx.forget_run(run_id);

    info!("Run {} cancelled", run_id);
    Ok(())
}

pub async fn get_run(ctx: &Arc<AppContext>, run_id: Uuid) -> Result<PipelineRun, RunError> {
    load_run(ctx, run_id).await
}

// =============================================================================
// Internals
// =============================================================================

async fn load_run(ctx: &Arc<AppContext>, run_id: Uuid) -> Result<PipelineRun, RunError> {
    run_repository::find_by_id(&ctx.pool, run_id)
        .await?
        .ok_or(RunError::NotFound(run_id))
}

/// Attempt numbers restart from the latest persisted attempt + 1
async fn next_attempt(
    ctx: &Arc<AppContext>,
    run_id: Uuid,
    step_index: usize,
) -> Result<u32, RunError> {
    for attempt in 1..u32::MAX {
        let key = ExecutionKey::new(run_id, step_index, attempt);
        match execution_repository::find_by_key(&ctx.pool, &key).await? {
            Some(existing) if existing.state.is_terminal() => continue,
            // Reuse the open attempt (idempotent re-dispatch) or claim
            // the first unused number
            _ => return Ok(attempt),
        }
    }
    Ok(1)
}

fn dispatch_next<'a>(
    ctx: &'a Arc<AppContext>,
    run_id: Uuid,
    completed_index: usize,
    specs: &'a [StepSpec],
    previous_runner_id: Option<String>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), RunError>> + Send + 'a>> {
    Box::pin(async move {
        let next_index = completed_index + 1;
        if next_index >= specs.len() {
            return Ok(());
        }
        if run_repository::find_step(&ctx.pool, run_id, next_index).await?.is_none() {
            return Ok(());
        }
        dispatch_step(ctx, run_id, next_index, specs, previous_runner_id).await
    })
}

/// COMPLETING → COMPLETED, then clean the workspace
async fn finalize_run(ctx: &Arc<AppContext>, mut run: PipelineRun) -> Result<(), RunError> {
    let run_id = run.id;
    run.transition(RunStatus::Completed, None)?;
    run_repository::update(&ctx.pool, &run).await?;

    settle_workspace(ctx, run_id);
    ctx.forget_run(run_id);

    info!(
        "Run {} completed ({}/{} steps)",
        run_id,
        run.steps_completed.len(),
        run.steps_total
    );
    Ok(())
}

async fn cancel_remaining_executions(
    ctx: &Arc<AppContext>,
    run_id: Uuid,
    reason: &str,
) -> Result<(), RunError> {
    let steps = run_repository::list_steps(&ctx.pool, run_id).await?;
    let in_flight = execution_repository::find_in_flight(&ctx.pool).await?;

    for (execution_id, container) in cancellation_targets(&in_flight, &steps) {
        ctx.queue.cancel(execution_id);
        if let Err(e) = execution::cancel(&ctx.pool, execution_id, reason).await {
            warn!("Failed to cancel execution {}: {:?}", execution_id, e);
            continue;
        }
        // A locally running container is killed, not just marked
        if let Some(name) = container {
            if let Err(e) = ctx.executor.terminate(&name).await {
                warn!("Failed to terminate container {}: {:#}", name, e);
            }
        }
    }
    Ok(())
}

/// In-flight executions belonging to the run, with the container to kill
/// for those running locally
fn cancellation_targets(
    in_flight: &[StepExecution],
    steps: &[StepRun],
) -> Vec<(Uuid, Option<String>)> {
    in_flight
        .iter()
        .filter(|e| steps.iter().any(|s| s.id == e.step_run_id))
        .map(|e| (e.id, e.container_id.clone()))
        .collect()
}

/// Clean the workspace once the run has settled, forcing locks clear
fn settle_workspace(ctx: &Arc<AppContext>, run_id: Uuid) {
    if let Some(workspace) = ctx.workspaces.get(run_id) {
        ctx.locks.force_release(workspace.id);
    }
    if let Err(e) = ctx.workspaces.clean(run_id) {
        warn!("Workspace cleanup for run {} deferred: {}", run_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_flight_execution(step_run_id: Uuid, container: Option<&str>) -> StepExecution {
        let key = ExecutionKey::new(Uuid::new_v4(), 0, 1);
        let mut exec = StepExecution::new(step_run_id, key);
        exec.container_id = container.map(String::from);
        exec
    }

    #[test]
    fn test_cancellation_targets_pick_up_local_containers() {
        let run_id = Uuid::new_v4();
        let local = StepRun::new(run_id, 0, "build", StepKind::Script);
        let remote = StepRun::new(run_id, 1, "deploy", StepKind::Script);
        let steps = vec![local.clone(), remote.clone()];

        let local_exec = in_flight_execution(local.id, Some("trellis-abc-0-1"));
        let remote_exec = in_flight_execution(remote.id, None);
        let foreign_exec = in_flight_execution(Uuid::new_v4(), Some("trellis-other"));
        let in_flight = vec![local_exec.clone(), remote_exec.clone(), foreign_exec];

        let targets = cancellation_targets(&in_flight, &steps);

        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&(local_exec.id, Some("trellis-abc-0-1".to_string()))));
        assert!(targets.contains(&(remote_exec.id, None)));
    }

    #[test]
    fn test_cancellation_targets_empty_when_run_has_no_in_flight_work() {
        let run_id = Uuid::new_v4();
        let steps = vec![StepRun::new(run_id, 0, "build", StepKind::Script)];
        let other = in_flight_execution(Uuid::new_v4(), None);
        assert!(cancellation_targets(&[other], &steps).is_empty());
    }
}
