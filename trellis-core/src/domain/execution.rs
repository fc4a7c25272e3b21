//! Step execution attempts
//!
//! A StepExecution is one idempotent attempt to run a StepRun. Retries
//! create a new attempt with an incremented key rather than mutating the
//! old one; at most one non-terminal attempt exists per StepRun.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::StateError;
use crate::keys::ExecutionKey;
use crate::statemachine::{StateMachine, StateSpec};

/// Exit code conventions for timed-out steps
pub const EXIT_CODE_KILLED: i32 = -1;
pub const EXIT_CODE_TIMEOUT: i32 = 124;

/// Step execution status
///
/// Finer-grained than the owning StepRun's status; CANCELLED is
/// reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Preparing,
    Running,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

impl StateSpec for ExecutionStatus {
    fn successors(self) -> &'static [Self] {
        use ExecutionStatus::*;
        match self {
            Pending => &[Preparing, Failed, Cancelled],
            Preparing => &[Running, Failed, Cancelled],
            Running => &[Completing, Failed, Cancelled],
            Completing => &[Completed, Failed, Cancelled],
            Completed | Failed | Cancelled => &[],
        }
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Preparing => write!(f, "preparing"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completing => write!(f, "completing"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One attempt to execute a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub step_run_id: Uuid,
    pub key: ExecutionKey,
    pub runner_id: Option<String>,
    pub container_id: Option<String>,
    pub exit_code: Option<i32>,
    /// Bearer token scoped to exactly this execution's key, presented by
    /// the in-container control script
    pub access_token: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub state: StateMachine<ExecutionStatus>,
}

impl StepExecution {
    pub fn new(step_run_id: Uuid, key: ExecutionKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_run_id,
            key,
            runner_id: None,
            container_id: None,
            exit_code: None,
            access_token: Uuid::new_v4().simple().to_string(),
            started_at: None,
            completed_at: None,
            state: StateMachine::new(ExecutionStatus::Pending),
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.state.current()
    }

    pub fn transition(
        &mut self,
        target: ExecutionStatus,
        reason: Option<&str>,
    ) -> Result<(), StateError> {
        self.state.transition(target, reason)?;

        if target == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if target.is_terminal() {
            self.completed_at = Some(Utc::now());
        }

        Ok(())
    }

    /// Settle a COMPLETING execution from its exit code
    ///
    /// Zero lands in COMPLETED; anything else (including the -1/124
    /// timeout conventions) lands in FAILED.
    pub fn record_exit(&mut self, exit_code: i32) -> Result<(), StateError> {
        self.exit_code = Some(exit_code);

        match exit_code {
            0 => self.transition(ExecutionStatus::Completed, Some("exit code 0")),
            EXIT_CODE_KILLED | EXIT_CODE_TIMEOUT => {
                self.transition(ExecutionStatus::Failed, Some("step timed out"))
            }
            code => {
                let reason = format!("exit code {}", code);
                self.transition(ExecutionStatus::Failed, Some(&reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution_at(status: ExecutionStatus) -> StepExecution {
        let key = ExecutionKey::new(Uuid::new_v4(), 0, 1);
        let mut exec = StepExecution::new(Uuid::new_v4(), key);
        let path = [
            ExecutionStatus::Preparing,
            ExecutionStatus::Running,
            ExecutionStatus::Completing,
        ];
        for target in path {
            if exec.status() == status {
                break;
            }
            exec.transition(target, None).unwrap();
        }
        exec
    }

    #[test]
    fn test_zero_exit_completes() {
        let mut exec = execution_at(ExecutionStatus::Completing);
        exec.record_exit(0).unwrap();
        assert_eq!(exec.status(), ExecutionStatus::Completed);
        assert_eq!(exec.exit_code, Some(0));
        assert!(exec.completed_at.is_some());
    }

    #[test]
    fn test_nonzero_exit_fails() {
        let mut exec = execution_at(ExecutionStatus::Completing);
        exec.record_exit(2).unwrap();
        assert_eq!(exec.status(), ExecutionStatus::Failed);
    }

    #[test]
    fn test_timeout_exit_codes_fail() {
        for code in [EXIT_CODE_KILLED, EXIT_CODE_TIMEOUT] {
            let mut exec = execution_at(ExecutionStatus::Completing);
            exec.record_exit(code).unwrap();
            assert_eq!(exec.status(), ExecutionStatus::Failed);
            let last = exec.state.history().last().unwrap();
            assert_eq!(last.reason.as_deref(), Some("step timed out"));
        }
    }

    #[test]
    fn test_cancel_reachable_from_every_non_terminal_state() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Preparing,
            ExecutionStatus::Running,
            ExecutionStatus::Completing,
        ] {
            let mut exec = execution_at(status);
            exec.transition(ExecutionStatus::Cancelled, None).unwrap();
            assert_eq!(exec.status(), ExecutionStatus::Cancelled);
        }
    }

    #[test]
    fn test_terminal_attempt_cannot_be_reused() {
        let mut exec = execution_at(ExecutionStatus::Completing);
        exec.record_exit(0).unwrap();
        assert!(exec.transition(ExecutionStatus::Running, None).is_err());
        assert!(exec.transition(ExecutionStatus::Completed, None).is_err());
    }
}
