//! Runner WebSocket Channel
//!
//! Persistent connection for runners that would rather push than poll.
//! The connection must open with a register message within
//! REGISTRATION_TIMEOUT. Assigned steps must be ACKed within ACK_TIMEOUT
//! or they go back on the queue. A dropped connection while a step is
//! held triggers runner-death recovery.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use trellis_core::domain::runner::RunnerStatus;
use trellis_core::protocol::{ACK_TIMEOUT, BackendMessage, REGISTRATION_TIMEOUT, RunnerMessage};
use uuid::Uuid;

use crate::context::AppContext;
use crate::repository::{execution_repository, run_repository, runner_repository};
use crate::service::recovery::ReconnectVerdict;
use crate::service::{execution_service, recovery_service, run_service};

/// GET /api/runners/ws
pub async fn runner_ws(State(ctx): State<Arc<AppContext>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn handle_socket(mut socket: WebSocket, ctx: Arc<AppContext>) {
    let runner_id = match await_registration(&mut socket, &ctx).await {
        Some(id) => id,
        None => return,
    };

    channel_loop(&mut socket, &ctx, &runner_id).await;

    // Disconnect: work in flight moves to recovery, an empty-handed
    // runner is just marked offline
    let held = ctx
        .registry
        .get(&runner_id)
        .and_then(|r| r.current_execution_id);
    if held.is_some() {
        if let Err(e) =
            recovery_service::on_runner_death(&ctx.pool, &ctx.registry, &ctx.queue, &runner_id)
                .await
        {
            warn!("Recovery after runner {} disconnect failed: {:?}", runner_id, e);
        }
    } else {
        ctx.registry.mark_offline(&runner_id);
        if let Err(e) =
            runner_repository::update_status(&ctx.pool, &runner_id, RunnerStatus::Offline, None)
                .await
        {
            warn!("Failed to persist offline status for runner {}: {}", runner_id, e);
        }
    }
    info!("Runner {} disconnected", runner_id);
}

/// First frame must be a valid register within the deadline
async fn await_registration(socket: &mut WebSocket, ctx: &Arc<AppContext>) -> Option<String> {
    let frame = match tokio::time::timeout(REGISTRATION_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => return None,
        Err(_) => {
            warn!("Connection dropped: no registration within deadline");
            let _ = send(socket, &BackendMessage::Error {
                message: "registration timeout".to_string(),
            })
            .await;
            return None;
        }
    };

    let message = match RunnerMessage::parse(&frame) {
        Ok(m) => m,
        Err(e) => {
            let _ = send(socket, &BackendMessage::Error { message: e.to_string() }).await;
            return None;
        }
    };

    let RunnerMessage::Register {
        runner_id,
        name,
        runner_type,
        labels,
    } = message
    else {
        let _ = send(socket, &BackendMessage::Error {
            message: "expected register".to_string(),
        })
        .await;
        return None;
    };

    let runner = ctx.registry.register(&runner_id, &name, &runner_type, labels);
    if let Err(e) = runner_repository::upsert(&ctx.pool, &runner).await {
        warn!("Failed to persist runner {}: {}", runner_id, e);
    }

    send(socket, &BackendMessage::Registered {
        runner_id: runner_id.clone(),
    })
    .await
    .ok()?;

    match recovery_service::on_runner_reconnect(&ctx.pool, &ctx.registry, &runner_id).await {
        Ok(ReconnectVerdict::Abort) => {
            // Step was reassigned while the runner was away
            let _ = send(socket, &BackendMessage::Error {
                message: "abandon current step: reassigned".to_string(),
            })
            .await;
        }
        Ok(_) => {}
        Err(e) => warn!("Reconnect check for runner {} failed: {:?}", runner_id, e),
    }

    Some(runner_id)
}

async fn channel_loop(socket: &mut WebSocket, ctx: &Arc<AppContext>, runner_id: &str) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut pending_ack: Option<(Uuid, Instant)> = None;

    loop {
        tokio::select! {
            frame = socket.recv() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("Socket error from runner {}: {}", runner_id, e);
                        break;
                    }
                };
                match RunnerMessage::parse(&text) {
                    Ok(message) => {
                        handle_message(socket, ctx, runner_id, message, &mut pending_ack).await;
                    }
                    Err(e) => {
                        warn!("Rejected frame from runner {}: {}", runner_id, e);
                        let _ = send(socket, &BackendMessage::Error {
                            message: e.to_string(),
                        })
                        .await;
                    }
                }
            }
            _ = tick.tick() => {
                if let Some((execution_id, deadline)) = pending_ack {
                    if Instant::now() >= deadline {
                        warn!(
                            "Runner {} missed ACK for execution {}; requeueing",
                            runner_id, execution_id
                        );
                        ctx.queue.requeue(execution_id);
                        ctx.registry.clear_assignment(runner_id);
                        ctx.registry.mark_idle(runner_id);
                        pending_ack = None;
                    }
                } else {
                    offer_job(socket, ctx, runner_id, &mut pending_ack).await;
                }
            }
        }
    }

    if let Some((execution_id, _)) = pending_ack {
        ctx.queue.requeue(execution_id);
    }
}

/// Hand the next matching queued job to an idle runner
async fn offer_job(
    socket: &mut WebSocket,
    ctx: &Arc<AppContext>,
    runner_id: &str,
    pending_ack: &mut Option<(Uuid, Instant)>,
) {
    let Some(runner) = ctx.registry.get(runner_id) else {
        return;
    };
    if runner.status != RunnerStatus::Idle {
        return;
    }
    // Scan past jobs this runner cannot take so the head keeps its place
    let Some(job) = ctx
        .queue
        .dequeue_matching(|j| j.matches_runner(runner_id, &runner.labels))
    else {
        return;
    };

    if let Err(e) =
        execution_service::assign_to_runner(&ctx.pool, &ctx.registry, job.execution_id, runner_id)
            .await
    {
        warn!("Assignment of {} to runner {} failed: {:?}", job.execution_id, runner_id, e);
        ctx.queue.requeue(job.execution_id);
        return;
    }

    info!("Job {} pushed to runner {}", job.execution_key, runner_id);
    let dispatched = send(socket, &BackendMessage::ExecuteStep {
        step_id: job.execution_id,
        execution_key: job.execution_key.clone(),
        config: job.config.clone(),
    })
    .await
    .is_ok();

    if dispatched {
        *pending_ack = Some((job.execution_id, Instant::now() + ACK_TIMEOUT));
    } else {
        ctx.queue.requeue(job.execution_id);
        ctx.registry.clear_assignment(runner_id);
        ctx.registry.mark_idle(runner_id);
    }
}

async fn handle_message(
    socket: &mut WebSocket,
    ctx: &Arc<AppContext>,
    runner_id: &str,
    message: RunnerMessage,
    pending_ack: &mut Option<(Uuid, Instant)>,
) {
    match message {
        RunnerMessage::Register { .. } => {
            let _ = send(socket, &BackendMessage::Error {
                message: "already registered".to_string(),
            })
            .await;
        }
        RunnerMessage::Heartbeat => {
            ctx.registry.heartbeat(runner_id);
            if let Err(e) = runner_repository::update_heartbeat(&ctx.pool, runner_id).await {
                warn!("Failed to persist heartbeat for runner {}: {}", runner_id, e);
            }
            let _ = send(socket, &BackendMessage::Pong).await;
        }
        RunnerMessage::Ack { step_id } => {
            if pending_ack.map(|(id, _)| id) == Some(step_id) {
                *pending_ack = None;
            }
            if let Err(e) = execution_service::mark_running(&ctx.pool, step_id).await {
                warn!("ACK for execution {} not applied: {:?}", step_id, e);
            }
        }
        RunnerMessage::Log { step_id, lines } => {
            ctx.registry.push_logs(runner_id, lines.clone());
            match execution_repository::find_by_id(&ctx.pool, step_id).await {
                Ok(Some(execution)) => {
                    if let Err(e) =
                        run_repository::append_step_logs(&ctx.pool, execution.step_run_id, &lines)
                            .await
                    {
                        warn!("Failed to persist logs for execution {}: {}", step_id, e);
                    }
                }
                Ok(None) => warn!("Logs for unknown execution {} dropped", step_id),
                Err(e) => warn!("Log lookup for execution {} failed: {}", step_id, e),
            }
        }
        RunnerMessage::StepComplete {
            step_id,
            exit_code,
            error,
        } => {
            // A completion also settles any outstanding ACK deadline
            if pending_ack.map(|(id, _)| id) == Some(step_id) {
                *pending_ack = None;
            }
            if let Err(e) =
                run_service::handle_remote_completion(ctx, step_id, exit_code, error, runner_id)
                    .await
            {
                warn!("Completion of execution {} not applied: {:?}", step_id, e);
            }
        }
    }
}

async fn send(socket: &mut WebSocket, message: &BackendMessage) -> Result<(), axum::Error> {
    socket.send(Message::Text(message.to_json().into())).await
}
