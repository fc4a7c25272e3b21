//! Process-wide context
//!
//! One AppContext is built at startup and injected everywhere; the job
//! queue, runner registry, lock manager, dedup ledger and local executor
//! handle are process-wide singletons living here, not ambient globals.

use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::config::Config;
use crate::service::dedup::TriggerDeduplicator;
use crate::service::run::StepSpec;
use crate::service::executor::{ContainerDriver, PodmanDriver};
use crate::service::locks::WorkspaceLockManager;
use crate::service::queue::JobQueue;
use crate::service::registry::RunnerRegistry;
use crate::service::router::RouterConfig;
use crate::service::workspace::WorkspaceManager;

pub struct AppContext {
    pub pool: PgPool,
    pub config: Config,
    pub router: RouterConfig,
    pub queue: JobQueue,
    pub registry: RunnerRegistry,
    pub locks: Arc<WorkspaceLockManager>,
    pub workspaces: Arc<WorkspaceManager>,
    pub dedup: TriggerDeduplicator,
    /// One process-wide local executor handle; routing decisions never
    /// instantiate their own
    pub executor: Arc<dyn ContainerDriver>,
    run_guards: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    /// Step definitions for in-flight runs; remote completions need them
    /// to route the next step
    run_specs: Mutex<HashMap<Uuid, Vec<StepSpec>>>,
}

impl AppContext {
    pub fn new(pool: PgPool, config: Config) -> Arc<Self> {
        let router = RouterConfig::from_config(&config);
        let dedup = TriggerDeduplicator::new(config.trigger_dedup_window);

        Arc::new(Self {
            pool,
            router,
            dedup,
            queue: JobQueue::new(),
            registry: RunnerRegistry::new(),
            locks: Arc::new(WorkspaceLockManager::new()),
            workspaces: Arc::new(WorkspaceManager::new()),
            executor: Arc::new(PodmanDriver::new("/var/lib/trellis/workspaces")),
            config,
            run_guards: Mutex::new(HashMap::new()),
            run_specs: Mutex::new(HashMap::new()),
        })
    }

    /// Per-run serialization of step completion/failure callbacks
    ///
    /// Callbacks for one run are applied in arrival order; different
    /// runs proceed independently.
    pub async fn run_guard(&self, run_id: Uuid) -> tokio::sync::OwnedMutexGuard<()> {
        let guard = {
            let mut guards = self.run_guards.lock().unwrap();
            Arc::clone(guards.entry(run_id).or_default())
        };
        guard.lock_owned().await
    }

    pub fn remember_specs(&self, run_id: Uuid, specs: Vec<StepSpec>) {
        self.run_specs.lock().unwrap().insert(run_id, specs);
    }

    pub fn specs_for(&self, run_id: Uuid) -> Option<Vec<StepSpec>> {
        self.run_specs.lock().unwrap().get(&run_id).cloned()
    }

    /// Drop the guard and spec entries once a run settles
    pub fn forget_run(&self, run_id: Uuid) {
        self.run_guards.lock().unwrap().remove(&run_id);
        self.run_specs.lock().unwrap().remove(&run_id);
    }
}
