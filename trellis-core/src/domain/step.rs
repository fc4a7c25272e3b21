//! Step definitions
//!
//! A StepRun is one step's definition-and-progress record within a
//! pipeline run. Execution attempts are tracked separately as
//! StepExecutions; the StepRun only carries coarse progress.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What kind of workload a step is
///
/// Closed set consumed by both the execution router and the config
/// builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Script,
    Container,
    Agent,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Script => write!(f, "script"),
            StepKind::Container => write!(f, "container"),
            StepKind::Agent => write!(f, "agent"),
        }
    }
}

/// What to do after a step completes or fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepPolicy {
    /// Continue to the next step
    Next,
    /// Stop the run
    Stop,
    /// Merge the run's working branch into the named ref
    Merge(String),
    /// Trigger another pipeline by id
    Trigger(String),
}

impl StepPolicy {
    /// Parse the `on_success`/`on_failure` string form
    /// ("next", "stop", "merge:<ref>", "trigger:<id>")
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "next" => Some(StepPolicy::Next),
            "stop" => Some(StepPolicy::Stop),
            _ => {
                if let Some(git_ref) = s.strip_prefix("merge:") {
                    (!git_ref.is_empty()).then(|| StepPolicy::Merge(git_ref.to_string()))
                } else if let Some(id) = s.strip_prefix("trigger:") {
                    (!id.is_empty()).then(|| StepPolicy::Trigger(id.to_string()))
                } else {
                    None
                }
            }
        }
    }
}

impl fmt::Display for StepPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepPolicy::Next => write!(f, "next"),
            StepPolicy::Stop => write!(f, "stop"),
            StepPolicy::Merge(git_ref) => write!(f, "merge:{}", git_ref),
            StepPolicy::Trigger(id) => write!(f, "trigger:{}", id),
        }
    }
}

/// Coarse progress of a step within its run
///
/// Finer-grained attempt state lives on the StepExecution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for StepRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepRunStatus::Pending => write!(f, "pending"),
            StepRunStatus::Running => write!(f, "running"),
            StepRunStatus::Completed => write!(f, "completed"),
            StepRunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One step's definition-and-progress record within a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: Uuid,
    pub pipeline_run_id: Uuid,
    pub index: usize,
    pub name: String,
    pub kind: StepKind,
    pub on_success: StepPolicy,
    pub on_failure: StepPolicy,
    pub timeout_seconds: Option<u64>,
    pub logs: Vec<String>,
    pub status: StepRunStatus,
}

impl StepRun {
    pub fn new(pipeline_run_id: Uuid, index: usize, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_run_id,
            index,
            name: name.into(),
            kind,
            on_success: StepPolicy::Next,
            on_failure: StepPolicy::Stop,
            timeout_seconds: None,
            logs: Vec::new(),
            status: StepRunStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parse_round_trip() {
        for s in ["next", "stop", "merge:main", "trigger:pipeline-9"] {
            let policy = StepPolicy::parse(s).unwrap();
            assert_eq!(policy.to_string(), s);
        }
    }

    #[test]
    fn test_policy_parse_rejects_garbage() {
        assert!(StepPolicy::parse("retry").is_none());
        assert!(StepPolicy::parse("merge:").is_none());
        assert!(StepPolicy::parse("trigger:").is_none());
        assert!(StepPolicy::parse("").is_none());
    }
}
