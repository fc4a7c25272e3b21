//! Workspace lifecycle
//!
//! The workspace is the mounted working-directory volume shared by all
//! step executions of one pipeline run. `acquire`/`release` keep a
//! reference count of concurrently active executions; cleanup is gated
//! on the count reaching zero.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::StateError;
use crate::statemachine::{StateMachine, StateSpec};

/// Workspace status
///
/// IN_USE lists itself as a successor: concurrent acquires and releases
/// while the count stays above zero are legal repeated-state transitions
/// with distinct history entries, not graph cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Creating,
    Ready,
    InUse,
    Cleaning,
    Cleaned,
    Failed,
}

impl StateSpec for WorkspaceStatus {
    fn successors(self) -> &'static [Self] {
        use WorkspaceStatus::*;
        match self {
            Creating => &[Ready, Failed],
            Ready => &[InUse, Cleaning],
            InUse => &[Ready, InUse],
            Cleaning => &[Cleaned, Failed],
            Failed => &[Cleaning],
            Cleaned => &[],
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, WorkspaceStatus::Cleaned)
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceStatus::Creating => write!(f, "creating"),
            WorkspaceStatus::Ready => write!(f, "ready"),
            WorkspaceStatus::InUse => write!(f, "in_use"),
            WorkspaceStatus::Cleaning => write!(f, "cleaning"),
            WorkspaceStatus::Cleaned => write!(f, "cleaned"),
            WorkspaceStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Shared working-directory volume for one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub pipeline_run_id: Uuid,
    pub volume: String,
    pub use_count: u32,
    pub last_activity_at: DateTime<Utc>,
    pub state: StateMachine<WorkspaceStatus>,
}

impl Workspace {
    pub fn new(pipeline_run_id: Uuid, volume: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_run_id,
            volume: volume.into(),
            use_count: 0,
            last_activity_at: Utc::now(),
            state: StateMachine::new(WorkspaceStatus::Creating),
        }
    }

    pub fn status(&self) -> WorkspaceStatus {
        self.state.current()
    }

    pub fn mark_ready(&mut self) -> Result<(), StateError> {
        self.state.transition(WorkspaceStatus::Ready, None)?;
        self.touch();
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: &str) -> Result<(), StateError> {
        self.state.transition(WorkspaceStatus::Failed, Some(reason))?;
        self.touch();
        Ok(())
    }

    /// Attach one more active execution
    ///
    /// READY moves to IN_USE on the 0→1 edge; further acquires are IN_USE
    /// self-transitions.
    pub fn acquire(&mut self, reason: &str) -> Result<(), StateError> {
        self.state.transition(WorkspaceStatus::InUse, Some(reason))?;
        self.use_count += 1;
        self.touch();
        Ok(())
    }

    /// Detach one active execution; the last release returns to READY
    pub fn release(&mut self) -> Result<(), StateError> {
        if self.use_count == 0 {
            return Err(StateError::Precondition(format!(
                "workspace {} released with use_count 0",
                self.id
            )));
        }

        let target = if self.use_count == 1 {
            WorkspaceStatus::Ready
        } else {
            WorkspaceStatus::InUse
        };
        self.state.transition(target, Some("execution released"))?;
        self.use_count -= 1;
        self.touch();
        Ok(())
    }

    /// Start cleanup
    ///
    /// Requires use_count == 0; violating that is a precondition error,
    /// distinct from an invalid-adjacency failure.
    pub fn begin_cleaning(&mut self) -> Result<(), StateError> {
        if self.use_count > 0 {
            return Err(StateError::Precondition(format!(
                "workspace {} has {} active execution(s)",
                self.id, self.use_count
            )));
        }
        self.state.transition(WorkspaceStatus::Cleaning, None)?;
        self.touch();
        Ok(())
    }

    pub fn mark_cleaned(&mut self) -> Result<(), StateError> {
        self.state.transition(WorkspaceStatus::Cleaned, None)?;
        self.touch();
        Ok(())
    }

    /// Whether this workspace has been abandoned
    ///
    /// Only READY/CREATING/FAILED workspaces age out; IN_USE and CLEANED
    /// are never orphaned.
    pub fn is_orphaned(&self, threshold: Duration) -> bool {
        match self.status() {
            WorkspaceStatus::Ready | WorkspaceStatus::Creating | WorkspaceStatus::Failed => {
                Utc::now() - self.last_activity_at > threshold
            }
            _ => false,
        }
    }

    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_workspace() -> Workspace {
        let mut ws = Workspace::new(Uuid::new_v4(), "vol-1");
        ws.mark_ready().unwrap();
        ws
    }

    #[test]
    fn test_acquire_release_pairs_return_to_ready() {
        let mut ws = ready_workspace();

        ws.acquire("step 0").unwrap();
        ws.acquire("step 1").unwrap();
        assert_eq!(ws.status(), WorkspaceStatus::InUse);
        assert_eq!(ws.use_count, 2);

        ws.release().unwrap();
        assert_eq!(ws.status(), WorkspaceStatus::InUse);
        ws.release().unwrap();
        assert_eq!(ws.status(), WorkspaceStatus::Ready);
        assert_eq!(ws.use_count, 0);

        ws.begin_cleaning().unwrap();
        ws.mark_cleaned().unwrap();
        assert!(ws.state.is_terminal());
    }

    #[test]
    fn test_cleaning_blocked_while_in_use() {
        let mut ws = ready_workspace();
        ws.acquire("step 0").unwrap();

        // IN_USE has no edge to CLEANING at all
        let err = ws.begin_cleaning().unwrap_err();
        assert!(matches!(err, StateError::Precondition(_)));
        assert_eq!(ws.status(), WorkspaceStatus::InUse);
    }

    #[test]
    fn test_release_without_acquire_is_precondition_error() {
        let mut ws = ready_workspace();
        assert!(matches!(ws.release(), Err(StateError::Precondition(_))));
    }

    #[test]
    fn test_failed_workspace_can_retry_cleanup() {
        let mut ws = Workspace::new(Uuid::new_v4(), "vol-1");
        ws.mark_failed("volume mount error").unwrap();
        ws.begin_cleaning().unwrap();
        ws.mark_cleaned().unwrap();
    }

    #[test]
    fn test_orphan_detection_respects_state() {
        let mut ws = ready_workspace();
        ws.last_activity_at = Utc::now() - Duration::hours(2);
        assert!(ws.is_orphaned(Duration::hours(1)));
        assert!(!ws.is_orphaned(Duration::hours(3)));

        ws.acquire("step 0").unwrap();
        ws.last_activity_at = Utc::now() - Duration::hours(2);
        assert!(!ws.is_orphaned(Duration::hours(1)), "in-use is never orphaned");
    }

    #[test]
    fn test_history_records_self_loops_distinctly() {
        let mut ws = ready_workspace();
        ws.acquire("step 0").unwrap();
        ws.acquire("step 1").unwrap();
        let in_use_entries = ws
            .state
            .history()
            .iter()
            .filter(|t| t.to == WorkspaceStatus::InUse)
            .count();
        assert_eq!(in_use_entries, 2);
    }
}
