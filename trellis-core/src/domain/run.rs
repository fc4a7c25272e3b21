//! Pipeline run lifecycle
//!
//! A PipelineRun is one execution of a pipeline definition. Step
//! completion and failure callbacks roll up into the run's state
//! machine; the run auto-transitions to COMPLETING once every step has
//! settled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::domain::step::StepPolicy;
use crate::error::StateError;
use crate::statemachine::{StateMachine, StateSpec};

/// Pipeline run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Preparing,
    Running,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

impl StateSpec for RunStatus {
    fn successors(self) -> &'static [Self] {
        use RunStatus::*;
        match self {
            Pending => &[Preparing, Cancelled],
            Preparing => &[Running, Failed, Cancelled],
            Running => &[Completing, Failed, Cancelled],
            Completing => &[Completed, Failed],
            Completed | Failed | Cancelled => &[],
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Preparing => write!(f, "preparing"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completing => write!(f, "completing"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What kind of event started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Push,
    Card,
    Manual,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerType::Push => write!(f, "push"),
            TriggerType::Card => write!(f, "card"),
            TriggerType::Manual => write!(f, "manual"),
        }
    }
}

/// One execution of a pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub trigger_type: TriggerType,
    pub trigger_ref: Option<String>,
    pub steps_total: usize,
    pub steps_completed: BTreeSet<usize>,
    pub current_step_index: Option<usize>,
    pub current_step_name: Option<String>,
    pub failed_step_index: Option<usize>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub state: StateMachine<RunStatus>,
}

impl PipelineRun {
    pub fn new(
        pipeline_id: Uuid,
        trigger_type: TriggerType,
        trigger_ref: Option<String>,
        steps_total: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id,
            trigger_type,
            trigger_ref,
            steps_total,
            steps_completed: BTreeSet::new(),
            current_step_index: None,
            current_step_name: None,
            failed_step_index: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            state: StateMachine::new(RunStatus::Pending),
        }
    }

    pub fn status(&self) -> RunStatus {
        self.state.current()
    }

    /// Transition the run, maintaining started_at/completed_at
    ///
    /// started_at is set on first entry to PREPARING; completed_at on any
    /// terminal entry.
    pub fn transition(&mut self, target: RunStatus, reason: Option<&str>) -> Result<(), StateError> {
        self.state.transition(target, reason)?;

        if target == RunStatus::Preparing && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if target.is_terminal() {
            self.completed_at = Some(Utc::now());
        }

        Ok(())
    }

    /// Record the step the run is currently working on
    pub fn set_current_step(&mut self, index: usize, name: impl Into<String>) {
        self.current_step_index = Some(index);
        self.current_step_name = Some(name.into());
    }

    /// A step settled successfully
    ///
    /// Marks the index done; when the completed count reaches steps_total
    /// the run auto-fires COMPLETING.
    pub fn on_step_completed(&mut self, index: usize) -> Result<(), StateError> {
        self.steps_completed.insert(index);

        if self.steps_completed.len() == self.steps_total
            && self.state.current() == RunStatus::Running
        {
            self.transition(RunStatus::Completing, Some("all steps completed"))?;
        }

        Ok(())
    }

    /// A step failed
    ///
    /// With policy "next" the step is marked done for progress purposes
    /// and the run keeps going; any other policy fails the run.
    pub fn on_step_failed(
        &mut self,
        index: usize,
        error: &str,
        on_failure: &StepPolicy,
    ) -> Result<(), StateError> {
        if *on_failure == StepPolicy::Next {
            return self.on_step_completed(index);
        }

        self.failed_step_index = Some(index);
        let message = format!("step {} failed: {}", index, error);
        self.error = Some(message.clone());
        self.transition(RunStatus::Failed, Some(&message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_with_steps(n: usize) -> PipelineRun {
        let mut run = PipelineRun::new(Uuid::new_v4(), TriggerType::Manual, None, n);
        run.transition(RunStatus::Preparing, None).unwrap();
        run.transition(RunStatus::Running, None).unwrap();
        run
    }

    #[test]
    fn test_three_steps_complete_in_turn() {
        let mut run = run_with_steps(3);

        run.on_step_completed(0).unwrap();
        assert_eq!(run.status(), RunStatus::Running);
        run.on_step_completed(1).unwrap();
        assert_eq!(run.status(), RunStatus::Running);
        run.on_step_completed(2).unwrap();
        assert_eq!(run.status(), RunStatus::Completing);
        assert_eq!(run.steps_completed.len(), 3);
        assert_eq!(run.steps_completed.len(), run.steps_total);

        run.transition(RunStatus::Completed, None).unwrap();
        assert_eq!(run.status(), RunStatus::Completed);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_on_failure_next_degrades_then_stop_fails() {
        // Steps: A(on_failure=stop), B(on_failure=next), C(on_failure=stop)
        let mut run = run_with_steps(3);

        run.on_step_completed(0).unwrap();

        // B fails but its policy is "next": run keeps going, B counts as done
        run.on_step_failed(1, "flaky test", &StepPolicy::Next).unwrap();
        assert_eq!(run.status(), RunStatus::Running);
        assert!(run.steps_completed.contains(&1));
        assert!(run.failed_step_index.is_none());

        // C fails with "stop": whole run fails
        run.on_step_failed(2, "build broke", &StepPolicy::Stop).unwrap();
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.failed_step_index, Some(2));
        assert!(run.error.as_deref().unwrap().contains("step 2 failed"));
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_started_at_set_on_first_preparing() {
        let mut run = PipelineRun::new(Uuid::new_v4(), TriggerType::Push, Some("main".into()), 1);
        assert!(run.started_at.is_none());
        run.transition(RunStatus::Preparing, None).unwrap();
        assert!(run.started_at.is_some());
    }

    #[test]
    fn test_duplicate_completion_is_idempotent() {
        let mut run = run_with_steps(2);
        run.on_step_completed(0).unwrap();
        run.on_step_completed(0).unwrap();
        assert_eq!(run.status(), RunStatus::Running);
        assert_eq!(run.steps_completed.len(), 1);
    }

    #[test]
    fn test_cancel_from_pending() {
        let mut run = PipelineRun::new(Uuid::new_v4(), TriggerType::Manual, None, 1);
        run.transition(RunStatus::Cancelled, Some("operator request")).unwrap();
        assert_eq!(run.status(), RunStatus::Cancelled);
        assert!(run.completed_at.is_some());
        assert!(run.state.is_terminal());
    }

    #[test]
    fn test_completing_cannot_be_cancelled() {
        let mut run = run_with_steps(1);
        run.on_step_completed(0).unwrap();
        assert_eq!(run.status(), RunStatus::Completing);
        assert!(run.transition(RunStatus::Cancelled, None).is_err());
    }
}
