//! Queued work units and step configuration
//!
//! A QueuedJob is the unit of work awaiting a remote runner. The
//! StepConfig it carries is the same payload the wire protocol's
//! execute_step message delivers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::step::StepKind;

/// Everything a worker needs to run one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub kind: StepKind,
    pub image: String,
    pub command: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub timeout_seconds: Option<u64>,
    /// "local" or the id of the runner holding the workspace
    pub workspace_affinity: String,
}

/// A unit of work awaiting a runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub execution_id: Uuid,
    pub execution_key: String,
    pub config: StepConfig,
    /// Pinned runner, if routing demanded one
    pub required_runner_id: Option<String>,
    pub required_labels: Vec<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn new(execution_id: Uuid, execution_key: String, config: StepConfig) -> Self {
        Self {
            execution_id,
            execution_key,
            config,
            required_runner_id: None,
            required_labels: Vec::new(),
            enqueued_at: Utc::now(),
        }
    }

    /// Whether the given runner may pick this job up
    pub fn matches_runner(&self, runner_id: &str, labels: &[String]) -> bool {
        if let Some(required) = &self.required_runner_id {
            return required == runner_id;
        }
        self.required_labels
            .iter()
            .all(|need| labels.iter().any(|have| have == need))
    }
}

/// Final outcome reported by an executor (container driver or runner)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub exit_code: i32,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> QueuedJob {
        let config = StepConfig {
            kind: StepKind::Container,
            image: "alpine:3".to_string(),
            command: None,
            env: HashMap::new(),
            timeout_seconds: Some(600),
            workspace_affinity: "local".to_string(),
        };
        QueuedJob::new(Uuid::new_v4(), "run:0:1".to_string(), config)
    }

    #[test]
    fn test_pinned_runner_wins_over_labels() {
        let mut j = job();
        j.required_runner_id = Some("rig-7".to_string());
        j.required_labels = vec!["cuda".to_string()];
        assert!(j.matches_runner("rig-7", &[]));
        assert!(!j.matches_runner("rig-8", &["cuda".to_string()]));
    }

    #[test]
    fn test_label_matching_requires_all() {
        let mut j = job();
        j.required_labels = vec!["arm64".to_string(), "camera".to_string()];
        let both = vec!["arm64".to_string(), "camera".to_string(), "gpio".to_string()];
        let one = vec!["arm64".to_string()];
        assert!(j.matches_runner("any", &both));
        assert!(!j.matches_runner("any", &one));
    }
}
