//! Runner registry
//!
//! In-memory registry of remote workers. Re-registration with an
//! existing client-supplied id reuses the record so assignment history
//! stays stable across reconnects. Process-wide singleton, internally
//! synchronized; durable runner rows are mirrored by the repository
//! layer for crash recovery.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};
use trellis_core::domain::runner::{Runner, RunnerStatus};
use trellis_core::protocol::HEARTBEAT_DEAD_AFTER;
use uuid::Uuid;

pub struct RunnerRegistry {
    runners: Mutex<HashMap<String, Runner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self {
            runners: Mutex::new(HashMap::new()),
        }
    }

    /// Register a runner, reusing any existing record with the same id
    pub fn register(
        &self,
        id: &str,
        name: &str,
        runner_type: &str,
        labels: Vec<String>,
    ) -> Runner {
        let mut runners = self.runners.lock().unwrap();

        let runner = runners
            .entry(id.to_string())
            .and_modify(|existing| {
                // Reconnect: refresh identity fields, keep history
                existing.name = name.to_string();
                existing.runner_type = runner_type.to_string();
                existing.labels = labels.clone();
                existing.status = RunnerStatus::Idle;
                existing.heartbeat();
                info!("Runner {} re-registered", id);
            })
            .or_insert_with(|| {
                info!("Runner {} registered", id);
                Runner::new(id, name, runner_type, labels.clone())
            });

        runner.clone()
    }

    pub fn heartbeat(&self, id: &str) -> bool {
        let mut runners = self.runners.lock().unwrap();
        match runners.get_mut(id) {
            Some(runner) => {
                runner.heartbeat();
                if runner.status == RunnerStatus::Dead || runner.status == RunnerStatus::Offline {
                    runner.status = RunnerStatus::Idle;
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Runner> {
        self.runners.lock().unwrap().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Runner> {
        self.runners.lock().unwrap().values().cloned().collect()
    }

    /// Whether a runner is known and not dead/offline
    pub fn is_alive(&self, id: &str) -> bool {
        self.runners
            .lock()
            .unwrap()
            .get(id)
            .map(|r| matches!(r.status, RunnerStatus::Idle | RunnerStatus::Busy))
            .unwrap_or(false)
    }

    /// Record a step assignment
    pub fn mark_busy(&self, id: &str, execution_id: Uuid) -> bool {
        let mut runners = self.runners.lock().unwrap();
        match runners.get_mut(id) {
            Some(runner) => {
                runner.status = RunnerStatus::Busy;
                runner.current_execution_id = Some(execution_id);
                debug!("Runner {} assigned execution {}", id, execution_id);
                true
            }
            None => false,
        }
    }

    /// Clear the assignment and go back to idle
    pub fn mark_idle(&self, id: &str) -> bool {
        let mut runners = self.runners.lock().unwrap();
        match runners.get_mut(id) {
            Some(runner) => {
                runner.status = RunnerStatus::Idle;
                runner.current_execution_id = None;
                true
            }
            None => false,
        }
    }

    /// Mark dead, returning any execution the runner was holding
    pub fn mark_dead(&self, id: &str) -> Option<Uuid> {
        let mut runners = self.runners.lock().unwrap();
        let runner = runners.get_mut(id)?;
        runner.status = RunnerStatus::Dead;
        runner.current_execution_id.take()
    }

    pub fn mark_offline(&self, id: &str) {
        if let Some(runner) = self.runners.lock().unwrap().get_mut(id) {
            runner.status = RunnerStatus::Offline;
        }
    }

    /// Drop a stale execution reference without changing status
    pub fn clear_assignment(&self, id: &str) {
        if let Some(runner) = self.runners.lock().unwrap().get_mut(id) {
            runner.current_execution_id = None;
        }
    }

    pub fn push_logs(&self, id: &str, lines: Vec<String>) {
        if let Some(runner) = self.runners.lock().unwrap().get_mut(id) {
            runner.push_logs(lines);
        }
    }

    /// Ids of live runners whose last heartbeat is older than the
    /// protocol's dead-after threshold
    pub fn stale_runner_ids(&self) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(HEARTBEAT_DEAD_AFTER).unwrap_or(chrono::Duration::seconds(30));
        self.runners
            .lock()
            .unwrap()
            .values()
            .filter(|r| {
                matches!(r.status, RunnerStatus::Idle | RunnerStatus::Busy)
                    && r.last_heartbeat_at < cutoff
            })
            .map(|r| r.id.clone())
            .collect()
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reregistration_reuses_record() {
        let registry = RunnerRegistry::new();
        let first = registry.register("rig-1", "bench rig", "hardware", vec!["gpio".into()]);
        registry.mark_busy("rig-1", Uuid::new_v4());

        let again = registry.register("rig-1", "bench rig (renamed)", "hardware", vec![]);
        assert_eq!(again.id, first.id);
        assert_eq!(again.name, "bench rig (renamed)");
        assert_eq!(again.registered_at, first.registered_at);
        // Assignment history survives the reconnect
        assert!(again.current_execution_id.is_some());
    }

    #[test]
    fn test_mark_dead_returns_held_execution() {
        let registry = RunnerRegistry::new();
        registry.register("rig-1", "rig", "hardware", vec![]);
        let execution = Uuid::new_v4();
        registry.mark_busy("rig-1", execution);

        assert_eq!(registry.mark_dead("rig-1"), Some(execution));
        assert!(!registry.is_alive("rig-1"));
        // Second death is empty-handed
        assert_eq!(registry.mark_dead("rig-1"), None);
    }

    #[test]
    fn test_heartbeat_revives_dead_runner() {
        let registry = RunnerRegistry::new();
        registry.register("rig-1", "rig", "hardware", vec![]);
        registry.mark_dead("rig-1");
        assert!(registry.heartbeat("rig-1"));
        assert!(registry.is_alive("rig-1"));
    }

    #[test]
    fn test_heartbeat_unknown_runner() {
        let registry = RunnerRegistry::new();
        assert!(!registry.heartbeat("ghost"));
    }

    #[test]
    fn test_stale_detection() {
        let registry = RunnerRegistry::new();
        registry.register("rig-1", "rig", "hardware", vec![]);
        assert!(registry.stale_runner_ids().is_empty());

        {
            let mut runners = registry.runners.lock().unwrap();
            runners.get_mut("rig-1").unwrap().last_heartbeat_at =
                Utc::now() - chrono::Duration::seconds(60);
        }
        assert_eq!(registry.stale_runner_ids(), vec!["rig-1".to_string()]);
    }
}
