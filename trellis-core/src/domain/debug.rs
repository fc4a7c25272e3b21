//! Interactive debug sessions
//!
//! A debug session attaches to a breakpointed re-run of a step. The
//! CONNECTED↔WAITING_AT_BP pair allows disconnect/reconnect cycles;
//! each cycle appends distinct history entries.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::StateError;
use crate::statemachine::{StateMachine, StateSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugSessionStatus {
    Pending,
    WaitingAtBreakpoint,
    Connected,
    Timeout,
    Ended,
}

impl StateSpec for DebugSessionStatus {
    fn successors(self) -> &'static [Self] {
        use DebugSessionStatus::*;
        match self {
            Pending => &[WaitingAtBreakpoint, Ended],
            WaitingAtBreakpoint => &[Connected, Timeout, Ended],
            Connected => &[Ended, Timeout, WaitingAtBreakpoint],
            Timeout | Ended => &[],
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, DebugSessionStatus::Timeout | DebugSessionStatus::Ended)
    }
}

impl fmt::Display for DebugSessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebugSessionStatus::Pending => write!(f, "pending"),
            DebugSessionStatus::WaitingAtBreakpoint => write!(f, "waiting_at_bp"),
            DebugSessionStatus::Connected => write!(f, "connected"),
            DebugSessionStatus::Timeout => write!(f, "timeout"),
            DebugSessionStatus::Ended => write!(f, "ended"),
        }
    }
}

/// Interactive session attached to a breakpointed step re-run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugSession {
    pub id: Uuid,
    pub pipeline_run_id: Uuid,
    pub step_index: usize,
    pub step_name: String,
    pub commit_sha: Option<String>,
    pub image: Option<String>,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub state: StateMachine<DebugSessionStatus>,
}

impl DebugSession {
    pub fn new(
        pipeline_run_id: Uuid,
        step_index: usize,
        step_name: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_run_id,
            step_index,
            step_name: step_name.into(),
            commit_sha: None,
            image: None,
            access_token: Uuid::new_v4().simple().to_string(),
            expires_at: Utc::now() + ttl,
            state: StateMachine::new(DebugSessionStatus::Pending),
        }
    }

    pub fn status(&self) -> DebugSessionStatus {
        self.state.current()
    }

    pub fn transition(
        &mut self,
        target: DebugSessionStatus,
        reason: Option<&str>,
    ) -> Result<(), StateError> {
        self.state.transition(target, reason)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> DebugSession {
        DebugSession::new(Uuid::new_v4(), 1, "integration-tests", Duration::minutes(30))
    }

    #[test]
    fn test_disconnect_reconnect_cycle() {
        let mut s = session();
        s.transition(DebugSessionStatus::WaitingAtBreakpoint, None).unwrap();
        s.transition(DebugSessionStatus::Connected, None).unwrap();
        s.transition(DebugSessionStatus::WaitingAtBreakpoint, Some("client dropped"))
            .unwrap();
        s.transition(DebugSessionStatus::Connected, None).unwrap();
        s.transition(DebugSessionStatus::Ended, None).unwrap();
        assert_eq!(s.state.history().len(), 5);
    }

    #[test]
    fn test_timeout_from_waiting_and_connected() {
        let mut s = session();
        s.transition(DebugSessionStatus::WaitingAtBreakpoint, None).unwrap();
        s.transition(DebugSessionStatus::Timeout, None).unwrap();
        assert!(s.state.is_terminal());

        let mut s = session();
        s.transition(DebugSessionStatus::WaitingAtBreakpoint, None).unwrap();
        s.transition(DebugSessionStatus::Connected, None).unwrap();
        s.transition(DebugSessionStatus::Timeout, None).unwrap();
        assert!(s.state.is_terminal());
    }

    #[test]
    fn test_pending_cannot_connect_directly() {
        let mut s = session();
        assert!(s.transition(DebugSessionStatus::Connected, None).is_err());
    }
}
