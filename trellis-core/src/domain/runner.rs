//! Runner domain model
//!
//! Represents a remote worker process that executes steps requiring
//! hardware or affinity the local host lacks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

/// How many recent log lines a runner record keeps in memory
pub const RUNNER_LOG_BUFFER: usize = 512;

/// Status of a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    /// Online and ready to accept steps
    Idle,
    /// Currently executing a step
    Busy,
    /// Missed the heartbeat deadline; recovery has reclaimed its work
    Dead,
    /// Deliberately disconnected
    Offline,
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerStatus::Idle => write!(f, "idle"),
            RunnerStatus::Busy => write!(f, "busy"),
            RunnerStatus::Dead => write!(f, "dead"),
            RunnerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// A registered remote worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    /// Client-supplied identifier, stable across reconnects
    pub id: String,
    pub name: String,
    pub runner_type: String,
    pub labels: Vec<String>,
    pub status: RunnerStatus,
    /// Step execution currently assigned to this runner, if any
    pub current_execution_id: Option<Uuid>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    recent_logs: VecDeque<String>,
}

impl Runner {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        runner_type: impl Into<String>,
        labels: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            runner_type: runner_type.into(),
            labels,
            status: RunnerStatus::Idle,
            current_execution_id: None,
            registered_at: now,
            last_heartbeat_at: now,
            recent_logs: VecDeque::new(),
        }
    }

    pub fn heartbeat(&mut self) {
        self.last_heartbeat_at = Utc::now();
    }

    /// Append log lines, evicting the oldest past the buffer cap
    pub fn push_logs<I: IntoIterator<Item = String>>(&mut self, lines: I) {
        for line in lines {
            if self.recent_logs.len() == RUNNER_LOG_BUFFER {
                self.recent_logs.pop_front();
            }
            self.recent_logs.push_back(line);
        }
    }

    pub fn recent_logs(&self) -> impl Iterator<Item = &str> {
        self.recent_logs.iter().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_buffer_is_bounded() {
        let mut runner = Runner::new("r-1", "bench rig", "hardware", vec![]);
        runner.push_logs((0..RUNNER_LOG_BUFFER + 10).map(|i| format!("line {}", i)));
        assert_eq!(runner.recent_logs().count(), RUNNER_LOG_BUFFER);
        assert_eq!(runner.recent_logs().next(), Some("line 10"));
    }
}
