//! Workspace manager
//!
//! Tracks the workspace volume of each active pipeline run, from
//! creation when the run enters PREPARING through cleanup after the run
//! settles. Lifecycle rules live on the domain entity; this service owns
//! the map and the orphan sweep.

use chrono::Duration;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use trellis_core::domain::workspace::Workspace;
use trellis_core::error::StateError;
use uuid::Uuid;

pub struct WorkspaceManager {
    by_run: Mutex<HashMap<Uuid, Workspace>>,
}

impl WorkspaceManager {
    pub fn new() -> Self {
        Self {
            by_run: Mutex::new(HashMap::new()),
        }
    }

    /// Create the workspace for a run and mark it ready
    pub fn create_for_run(&self, run_id: Uuid) -> Result<Workspace, StateError> {
        let mut workspaces = self.by_run.lock().unwrap();
        let mut workspace = Workspace::new(run_id, format!("trellis-ws-{}", run_id));
        workspace.mark_ready()?;
        info!("Workspace {} created for run {}", workspace.id, run_id);
        workspaces.insert(run_id, workspace.clone());
        Ok(workspace)
    }

    pub fn get(&self, run_id: Uuid) -> Option<Workspace> {
        self.by_run.lock().unwrap().get(&run_id).cloned()
    }

    /// Attach one active execution to the run's workspace
    pub fn acquire(&self, run_id: Uuid, reason: &str) -> Result<(), StateError> {
        let mut workspaces = self.by_run.lock().unwrap();
        let workspace = workspaces
            .get_mut(&run_id)
            .ok_or_else(|| StateError::Precondition(format!("no workspace for run {}", run_id)))?;
        workspace.acquire(reason)
    }

    /// Scoped acquisition: the returned hold releases on drop, on every
    /// exit path, so a failed step can never strand the use count
    pub fn acquire_scoped(
        self: &Arc<Self>,
        run_id: Uuid,
        reason: &str,
    ) -> Result<WorkspaceHold, StateError> {
        self.acquire(run_id, reason)?;
        Ok(WorkspaceHold {
            manager: Arc::clone(self),
            run_id: Some(run_id),
        })
    }

    pub fn release(&self, run_id: Uuid) -> Result<(), StateError> {
        let mut workspaces = self.by_run.lock().unwrap();
        let workspace = workspaces
            .get_mut(&run_id)
            .ok_or_else(|| StateError::Precondition(format!("no workspace for run {}", run_id)))?;
        workspace.release()
    }

    /// Run cleanup for a settled run, removing the workspace on success
    pub fn clean(&self, run_id: Uuid) -> Result<(), StateError> {
        let mut workspaces = self.by_run.lock().unwrap();
        let Some(workspace) = workspaces.get_mut(&run_id) else {
            return Ok(());
        };

        workspace.begin_cleaning()?;
        workspace.mark_cleaned()?;
        info!("Workspace cleaned for run {}", run_id);
        workspaces.remove(&run_id);
        Ok(())
    }

    /// Refresh the last-activity time for a run's workspace
    pub fn touch(&self, run_id: Uuid) {
        if let Some(ws) = self.by_run.lock().unwrap().get_mut(&run_id) {
            ws.last_activity_at = chrono::Utc::now();
        }
    }

    /// Sweep workspaces abandoned past the threshold into cleanup
    pub fn sweep_orphans(&self, threshold: Duration) -> usize {
        let mut workspaces = self.by_run.lock().unwrap();
        let orphaned: Vec<Uuid> = workspaces
            .iter()
            .filter(|(_, ws)| ws.is_orphaned(threshold))
            .map(|(run_id, _)| *run_id)
            .collect();

        for run_id in &orphaned {
            if let Some(workspace) = workspaces.get_mut(run_id) {
                warn!("Workspace for run {} is orphaned, cleaning", run_id);
                if workspace.begin_cleaning().and_then(|_| workspace.mark_cleaned()).is_ok() {
                    workspaces.remove(run_id);
                }
            }
        }
        orphaned.len()
    }

    pub fn active_count(&self) -> usize {
        self.by_run.lock().unwrap().len()
    }
}

impl Default for WorkspaceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one attached execution
pub struct WorkspaceHold {
    manager: Arc<WorkspaceManager>,
    run_id: Option<Uuid>,
}

impl Drop for WorkspaceHold {
    fn drop(&mut self) {
        if let Some(run_id) = self.run_id.take() {
            if let Err(e) = self.manager.release(run_id) {
                warn!("Workspace release for run {} failed: {}", run_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_acquire_release_clean() {
        let manager = WorkspaceManager::new();
        let run_id = Uuid::new_v4();
        manager.create_for_run(run_id).unwrap();

        manager.acquire(run_id, "step 0").unwrap();
        // Cleanup is blocked while an execution is attached
        assert!(manager.clean(run_id).is_err());

        manager.release(run_id).unwrap();
        manager.clean(run_id).unwrap();
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_hold_releases_on_early_exit() {
        let manager = Arc::new(WorkspaceManager::new());
        let run_id = Uuid::new_v4();
        manager.create_for_run(run_id).unwrap();

        // An error between acquisition and the normal release path must
        // not strand the use count
        let failing = |manager: &Arc<WorkspaceManager>| -> Result<(), StateError> {
            let _hold = manager.acquire_scoped(run_id, "step 0")?;
            Err(StateError::Precondition("database unavailable".to_string()))
        };
        assert!(failing(&manager).is_err());

        // The hold dropped with the early exit, so cleanup is unblocked
        manager.clean(run_id).unwrap();
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_clean_unknown_run_is_noop() {
        let manager = WorkspaceManager::new();
        assert!(manager.clean(Uuid::new_v4()).is_ok());
    }

    #[test]
    fn test_sweep_skips_in_use_workspaces() {
        let manager = WorkspaceManager::new();
        let idle = Uuid::new_v4();
        let busy = Uuid::new_v4();
        manager.create_for_run(idle).unwrap();
        manager.create_for_run(busy).unwrap();
        manager.acquire(busy, "step 0").unwrap();

        {
            let mut workspaces = manager.by_run.lock().unwrap();
            for ws in workspaces.values_mut() {
                ws.last_activity_at = chrono::Utc::now() - Duration::hours(2);
            }
        }

        assert_eq!(manager.sweep_orphans(Duration::hours(1)), 1);
        assert!(manager.get(idle).is_none());
        assert!(manager.get(busy).is_some());
    }
}
