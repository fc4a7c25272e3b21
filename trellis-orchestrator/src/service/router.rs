//! Execution router
//!
//! Pure routing: given a step's kind, image, and hardware/affinity
//! requirements, decide whether it runs in a local container or on a
//! remote runner. Local is the default; the decision is ephemeral and
//! never persisted.

use std::fmt;
use tracing::debug;
use trellis_core::domain::step::StepKind;
use trellis_core::routing::{ExecutorType, RoutingDecision, StepRequirements};

use crate::config::Config;

/// Static routing rules, derived from the orchestrator config once at
/// startup
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub local_arch: String,
    pub allow_remote: bool,
    pub local_agent_runtime: bool,
    pub default_script_image: String,
    pub default_agent_image: String,
}

impl RouterConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            local_arch: config.local_arch.clone(),
            allow_remote: config.allow_remote,
            local_agent_runtime: config.local_agent_runtime,
            default_script_image: config.default_script_image.clone(),
            default_agent_image: config.default_agent_image.clone(),
        }
    }
}

#[derive(Debug)]
pub enum RouterError {
    /// A requirement demands remote execution but remote fallback is
    /// disabled by configuration
    RemoteDisabled(String),
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::RemoteDisabled(reason) => {
                write!(f, "remote execution disabled but required: {}", reason)
            }
        }
    }
}

impl std::error::Error for RouterError {}

/// Decide where one step executes
pub fn route(
    config: &RouterConfig,
    kind: StepKind,
    step_image: Option<&str>,
    requirements: &StepRequirements,
    previous_runner_id: Option<&str>,
) -> Result<RoutingDecision, RouterError> {
    let image = resolve_image(config, kind, step_image);

    let mut required_labels = Vec::new();
    if let Some(arch) = &requirements.arch {
        required_labels.push(arch.clone());
    }
    required_labels.extend(requirements.has.iter().cloned());

    // Execution affinity wins regardless of other requirements: a
    // multi-step continuation stays on the runner holding its workspace.
    let remote_reason = if let Some(prev) = previous_runner_id {
        Some((
            Some(prev.to_string()),
            format!("continuing on runner {} which holds the workspace", prev),
        ))
    } else if let Some(runner_id) = &requirements.runner_id {
        Some((
            Some(runner_id.clone()),
            format!("step pinned to runner {}", runner_id),
        ))
    } else if !requirements.has.is_empty() {
        Some((
            None,
            format!("requires hardware capabilities [{}]", requirements.has.join(", ")),
        ))
    } else if requirements
        .arch
        .as_deref()
        .is_some_and(|arch| arch != config.local_arch)
    {
        Some((
            None,
            format!(
                "requires arch {} but local host is {}",
                requirements.arch.as_deref().unwrap_or_default(),
                config.local_arch
            ),
        ))
    } else if kind == StepKind::Agent && !config.local_agent_runtime {
        Some((None, "agent step with no local agent runtime".to_string()))
    } else {
        None
    };

    let decision = match remote_reason {
        Some((runner_id, reason)) => {
            if !config.allow_remote {
                return Err(RouterError::RemoteDisabled(reason));
            }
            RoutingDecision {
                executor: ExecutorType::Remote,
                step_kind: kind,
                image,
                required_labels,
                workspace_affinity: runner_id.clone().unwrap_or_else(|| "local".to_string()),
                required_runner_id: runner_id,
                reason,
            }
        }
        None => RoutingDecision {
            executor: ExecutorType::Local,
            step_kind: kind,
            image,
            required_labels,
            required_runner_id: None,
            workspace_affinity: "local".to_string(),
            reason: "no remote requirement, executing in local container".to_string(),
        },
    };

    debug!("Routed {} step: {:?} ({})", kind, decision.executor, decision.reason);
    Ok(decision)
}

fn resolve_image(config: &RouterConfig, kind: StepKind, step_image: Option<&str>) -> String {
    if let Some(image) = step_image {
        return image.to_string();
    }
    match kind {
        StepKind::Agent => config.default_agent_image.clone(),
        StepKind::Script | StepKind::Container => config.default_script_image.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RouterConfig {
        RouterConfig {
            local_arch: "x86_64".to_string(),
            allow_remote: true,
            local_agent_runtime: false,
            default_script_image: "trellis/step-base:latest".to_string(),
            default_agent_image: "trellis/agent-base:latest".to_string(),
        }
    }

    #[test]
    fn test_default_is_local() {
        let decision = route(
            &config(),
            StepKind::Script,
            None,
            &StepRequirements::default(),
            None,
        )
        .unwrap();
        assert_eq!(decision.executor, ExecutorType::Local);
        assert_eq!(decision.workspace_affinity, "local");
        assert_eq!(decision.image, "trellis/step-base:latest");
    }

    #[test]
    fn test_pinned_runner_routes_remote() {
        let requirements = StepRequirements {
            runner_id: Some("rig-7".to_string()),
            ..Default::default()
        };
        let decision =
            route(&config(), StepKind::Script, None, &requirements, None).unwrap();
        assert_eq!(decision.executor, ExecutorType::Remote);
        assert_eq!(decision.required_runner_id.as_deref(), Some("rig-7"));
        assert_eq!(decision.workspace_affinity, "rig-7");
    }

    #[test]
    fn test_capabilities_route_remote_with_labels() {
        let requirements = StepRequirements {
            has: vec!["gpio".to_string(), "camera".to_string()],
            ..Default::default()
        };
        let decision =
            route(&config(), StepKind::Container, Some("alpine:3"), &requirements, None).unwrap();
        assert_eq!(decision.executor, ExecutorType::Remote);
        assert_eq!(decision.required_labels, vec!["gpio", "camera"]);
        assert_eq!(decision.image, "alpine:3");
        assert!(decision.reason.contains("gpio"));
    }

    #[test]
    fn test_arch_mismatch_routes_remote() {
        let requirements = StepRequirements {
            arch: Some("arm64".to_string()),
            ..Default::default()
        };
        let decision = route(&config(), StepKind::Script, None, &requirements, None).unwrap();
        assert_eq!(decision.executor, ExecutorType::Remote);
        assert!(decision.required_labels.contains(&"arm64".to_string()));
    }

    #[test]
    fn test_matching_arch_stays_local() {
        let requirements = StepRequirements {
            arch: Some("x86_64".to_string()),
            ..Default::default()
        };
        let decision = route(&config(), StepKind::Script, None, &requirements, None).unwrap();
        assert_eq!(decision.executor, ExecutorType::Local);
    }

    #[test]
    fn test_agent_without_local_runtime_routes_remote() {
        let decision = route(
            &config(),
            StepKind::Agent,
            None,
            &StepRequirements::default(),
            None,
        )
        .unwrap();
        assert_eq!(decision.executor, ExecutorType::Remote);
        assert_eq!(decision.image, "trellis/agent-base:latest");

        let mut with_runtime = config();
        with_runtime.local_agent_runtime = true;
        let decision = route(
            &with_runtime,
            StepKind::Agent,
            None,
            &StepRequirements::default(),
            None,
        )
        .unwrap();
        assert_eq!(decision.executor, ExecutorType::Local);
    }

    #[test]
    fn test_previous_runner_affinity_wins() {
        // No other requirement would route this remotely
        let decision = route(
            &config(),
            StepKind::Script,
            None,
            &StepRequirements::default(),
            Some("rig-3"),
        )
        .unwrap();
        assert_eq!(decision.executor, ExecutorType::Remote);
        assert_eq!(decision.required_runner_id.as_deref(), Some("rig-3"));

        // And it overrides a pin to a different runner
        let requirements = StepRequirements {
            runner_id: Some("rig-9".to_string()),
            ..Default::default()
        };
        let decision =
            route(&config(), StepKind::Script, None, &requirements, Some("rig-3")).unwrap();
        assert_eq!(decision.required_runner_id.as_deref(), Some("rig-3"));
    }

    #[test]
    fn test_remote_disabled_is_a_config_error() {
        let mut cfg = config();
        cfg.allow_remote = false;

        let requirements = StepRequirements {
            has: vec!["cuda".to_string()],
            ..Default::default()
        };
        let err = route(&cfg, StepKind::Script, None, &requirements, None).unwrap_err();
        assert!(matches!(err, RouterError::RemoteDisabled(_)));

        // Purely local steps are unaffected
        assert!(route(&cfg, StepKind::Script, None, &StepRequirements::default(), None).is_ok());
    }
}
