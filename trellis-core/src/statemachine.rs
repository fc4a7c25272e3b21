//! Generic state-machine engine
//!
//! All four lifecycle machines (pipeline run, step execution, workspace,
//! debug session) share this engine: a fixed adjacency table per state
//! type, an append-only transition history, and a non-raising probe that
//! always agrees with the raising form.
//!
//! Transitions are synchronous and single-writer per entity. Concurrency
//! control belongs to the owning service, not to the machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StateError;

/// A state type with a closed adjacency table
///
/// Self-transitions are legal only where explicitly listed in
/// `successors` (e.g. a workspace staying in use while a second step
/// attaches). Terminal states must have no successors.
pub trait StateSpec: Copy + Eq + fmt::Display {
    /// States reachable from `self` in one transition
    fn successors(self) -> &'static [Self];

    /// Whether `self` is terminal (no transition out, including onto itself)
    fn is_terminal(self) -> bool;
}

/// One recorded transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord<S> {
    pub from: S,
    pub to: S,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// State machine with append-only history
///
/// Serialization round-trips the current state and the full history
/// losslessly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMachine<S> {
    current: S,
    history: Vec<TransitionRecord<S>>,
}

impl<S: StateSpec + 'static> StateMachine<S> {
    pub fn new(initial: S) -> Self {
        Self {
            current: initial,
            history: Vec::new(),
        }
    }

    pub fn current(&self) -> S {
        self.current
    }

    /// Non-raising probe; agrees with `transition` for every target
    pub fn can_transition(&self, target: S) -> bool {
        self.current.successors().contains(&target)
    }

    /// Move to `target`, recording the transition
    ///
    /// Fails with `StateError::InvalidTransition` if `target` is not in
    /// the adjacency table for the current state.
    pub fn transition(&mut self, target: S, reason: Option<&str>) -> Result<(), StateError> {
        if !self.can_transition(target) {
            return Err(StateError::InvalidTransition {
                from: self.current.to_string(),
                to: target.to_string(),
                from_terminal: self.current.is_terminal(),
            });
        }

        self.history.push(TransitionRecord {
            from: self.current,
            to: target,
            at: Utc::now(),
            reason: reason.map(|r| r.to_string()),
        });
        self.current = target;

        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn history(&self) -> &[TransitionRecord<S>] {
        &self.history
    }

    /// Wall-clock span covered by the history (last entry minus first)
    ///
    /// Returns zero until at least two transitions are recorded.
    pub fn duration(&self) -> chrono::Duration {
        match (self.history.first(), self.history.last()) {
            (Some(first), Some(last)) => last.at - first.at,
            _ => chrono::Duration::zero(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::run::RunStatus;

    fn all_run_states() -> [RunStatus; 7] {
        [
            RunStatus::Pending,
            RunStatus::Preparing,
            RunStatus::Running,
            RunStatus::Completing,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ]
    }

    #[test]
    fn test_probe_agrees_with_transition_everywhere() {
        for from in all_run_states() {
            for to in all_run_states() {
                let mut machine = StateMachine::new(from);
                let allowed = machine.can_transition(to);
                assert_eq!(
                    machine.transition(to, None).is_ok(),
                    allowed,
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for from in all_run_states().into_iter().filter(|s| s.is_terminal()) {
            for to in all_run_states() {
                let mut machine = StateMachine::new(from);
                let err = machine.transition(to, None).unwrap_err();
                match err {
                    StateError::InvalidTransition { from_terminal, .. } => {
                        assert!(from_terminal)
                    }
                    other => panic!("unexpected error: {:?}", other),
                }
            }
        }
    }

    #[test]
    fn test_history_is_append_only_and_ordered() {
        let mut machine = StateMachine::new(RunStatus::Pending);
        machine
            .transition(RunStatus::Preparing, Some("workspace created"))
            .unwrap();
        machine.transition(RunStatus::Running, None).unwrap();

        let history = machine.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from, RunStatus::Pending);
        assert_eq!(history[0].to, RunStatus::Preparing);
        assert_eq!(history[0].reason.as_deref(), Some("workspace created"));
        assert_eq!(history[1].from, RunStatus::Preparing);
        assert_eq!(history[1].to, RunStatus::Running);
        assert!(history[0].at <= history[1].at);
    }

    #[test]
    fn test_failed_transition_leaves_state_untouched() {
        let mut machine = StateMachine::new(RunStatus::Pending);
        assert!(machine.transition(RunStatus::Completed, None).is_err());
        assert_eq!(machine.current(), RunStatus::Pending);
        assert!(machine.history().is_empty());
    }

    #[test]
    fn test_serde_round_trip_preserves_history() {
        let mut machine = StateMachine::new(RunStatus::Pending);
        machine.transition(RunStatus::Preparing, Some("x")).unwrap();
        machine.transition(RunStatus::Running, None).unwrap();

        let json = serde_json::to_string(&machine).unwrap();
        let restored: StateMachine<RunStatus> = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, machine);
        assert_eq!(restored.current(), RunStatus::Running);
        assert_eq!(restored.history().len(), 2);
    }

    #[test]
    fn test_duration_spans_history() {
        let mut machine = StateMachine::new(RunStatus::Pending);
        assert_eq!(machine.duration(), chrono::Duration::zero());
        machine.transition(RunStatus::Preparing, None).unwrap();
        machine.transition(RunStatus::Running, None).unwrap();
        assert!(machine.duration() >= chrono::Duration::zero());
    }
}
