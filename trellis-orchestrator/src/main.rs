use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod config;
pub mod context;
pub mod db;
pub mod repository;
pub mod service;

use context::AppContext;
use repository::trigger_repository;
use service::recovery_service;

/// How often silent runners are checked for
const RUNNER_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
/// How often expired trigger records are purged
const TRIGGER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Workspaces idle longer than this with no active execution are swept
const WORKSPACE_ORPHAN_AFTER: Duration = Duration::from_secs(3600);
const WORKSPACE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trellis_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Trellis Orchestrator...");

    let config = config::Config::from_env();

    tracing::info!("Connecting to database...");

    // Create database connection pool
    let pool = db::create_pool(&config.database_url)
        .await
        .expect("Failed to create database pool");

    tracing::info!("Database connection pool created");

    // Run migrations
    db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");

    let addr = config.bind_addr.clone();
    let ctx = AppContext::new(pool, config);

    // Rehydrate the dedup ledger so a restart does not re-admit
    // recently-seen triggers
    match trigger_repository::load_all(&ctx.pool).await {
        Ok(records) => {
            tracing::info!("Loaded {} trigger record(s)", records.len());
            ctx.dedup.hydrate(records);
        }
        Err(e) => tracing::warn!("Could not load trigger records: {}", e),
    }

    // Reclaim executions stranded by a previous crash
    match recovery_service::recover_orphaned_steps(&ctx.pool, &ctx.registry).await {
        Ok(recovered) if !recovered.is_empty() => {
            tracing::warn!("Startup recovery reset {} execution(s)", recovered.len());
        }
        Ok(_) => {}
        Err(e) => tracing::error!("Startup recovery failed: {:?}", e),
    }

    spawn_background_sweeps(&ctx);

    // Build router with all API endpoints
    let app = api::create_router(Arc::clone(&ctx));

    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}

/// Periodic maintenance: stale runners, expired triggers, orphaned
/// workspaces
fn spawn_background_sweeps(ctx: &Arc<AppContext>) {
    {
        let ctx = Arc::clone(ctx);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RUNNER_SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                if let Err(e) =
                    recovery_service::sweep_stale_runners(&ctx.pool, &ctx.registry, &ctx.queue)
                        .await
                {
                    tracing::error!("Runner sweep failed: {:?}", e);
                }
            }
        });
    }

    {
        let ctx = Arc::clone(ctx);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(TRIGGER_SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                ctx.dedup.cleanup();

                let window = chrono::Duration::from_std(ctx.config.trigger_dedup_window)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
                let cutoff = chrono::Utc::now() - window;
                if let Err(e) = trigger_repository::delete_older_than(&ctx.pool, cutoff).await {
                    tracing::warn!("Trigger record purge failed: {}", e);
                }
            }
        });
    }

    {
        let ctx = Arc::clone(ctx);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(WORKSPACE_SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                let swept = ctx
                    .workspaces
                    .sweep_orphans(chrono::Duration::from_std(WORKSPACE_ORPHAN_AFTER).unwrap());
                if swept > 0 {
                    tracing::info!("Swept {} orphaned workspace(s)", swept);
                }
            }
        });
    }
}
