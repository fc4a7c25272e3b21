//! Routing decision types
//!
//! The router itself lives in the orchestrator; these are the typed
//! inputs and the ephemeral (never persisted) decision it produces.

use serde::{Deserialize, Serialize};

use crate::domain::step::StepKind;

/// Where a step executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorType {
    Local,
    Remote,
}

/// Hardware/affinity requirements declared on a step
///
/// A closed struct rather than an open map, so router matching stays
/// exhaustive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRequirements {
    /// CPU architecture, e.g. "arm64"
    pub arch: Option<String>,
    /// Hardware capabilities the host must have, e.g. "gpio", "cuda"
    #[serde(default)]
    pub has: Vec<String>,
    /// Pin to one specific runner
    pub runner_id: Option<String>,
}

impl StepRequirements {
    pub fn is_empty(&self) -> bool {
        self.arch.is_none() && self.has.is_empty() && self.runner_id.is_none()
    }
}

/// Where and how one step will run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub executor: ExecutorType,
    pub step_kind: StepKind,
    /// Step-specified image, or the per-kind default
    pub image: String,
    /// arch + capability labels a remote runner must carry
    pub required_labels: Vec<String>,
    pub required_runner_id: Option<String>,
    /// "local" or the runner id holding the workspace
    pub workspace_affinity: String,
    pub reason: String,
}
