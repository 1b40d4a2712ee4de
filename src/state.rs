use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }

    pub fn is_terminal_success(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

#[derive(Debug, Error, Clone)]
#[error("illegal transition from {from:?} to {to:?}")]
pub struct InvalidTransition<S: std::fmt::Debug> {
    pub from: S,
    pub to: S,
}

/// Checks whether `from -> to` is a legal workflow transition.
pub fn workflow_transition_allowed(from: WorkflowStatus, to: WorkflowStatus) -> bool {
    use WorkflowStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Cancelled)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Paused)
            | (Running, Cancelled)
            | (Paused, Running)
            | (Paused, Cancelled)
            | (Failed, Running)
            | (Cancelled, Pending)
    )
}

/// Checks whether `from -> to` is a legal step transition.
///
/// Includes `(Retrying, Cancelled)` beyond the strict `Retrying -> {Running, Failed, Skipped}`
/// table: a step sleeping out its retry delay must still be cancellable from that state, or
/// cancellation could only ever be observed on the next `Running` re-entry, which can be
/// arbitrarily far away for a long backoff. Resolved and justified in DESIGN.md's "Open
/// Questions resolved" section rather than added silently.
pub fn step_transition_allowed(from: StepStatus, to: StepStatus) -> bool {
    use StepStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Skipped)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Retrying)
            | (Running, Cancelled)
            | (Failed, Retrying)
            | (Retrying, Running)
            | (Retrying, Failed)
            | (Retrying, Skipped)
            | (Retrying, Cancelled)
    )
}

/// Attempts a workflow status transition, returning the previous status on success.
/// Callers treat a failure here as a programmer error: the engine never requests an
/// illegal transition in normal operation.
pub fn transition_workflow(
    current: &mut WorkflowStatus,
    to: WorkflowStatus,
) -> Result<WorkflowStatus, InvalidTransition<WorkflowStatus>> {
    if !workflow_transition_allowed(*current, to) {
        return Err(InvalidTransition { from: *current, to });
    }
    let from = *current;
    *current = to;
    Ok(from)
}

pub fn transition_step(
    current: &mut StepStatus,
    to: StepStatus,
) -> Result<StepStatus, InvalidTransition<StepStatus>> {
    if !step_transition_allowed(*current, to) {
        return Err(InvalidTransition { from: *current, to });
    }
    let from = *current;
    *current = to;
    Ok(from)
}

/// Error captured on a step, never a panic payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub message: String,
    pub code: Option<String>,
    pub trace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub step_id: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<StepError>,
    pub output: std::collections::HashMap<String, serde_json::Value>,
    pub log: Vec<String>,
}

impl StepState {
    pub fn new(step_id: impl Into<String>, max_attempts: u32) -> Self {
        StepState {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            started_at: None,
            completed_at: None,
            error: None,
            output: Default::default(),
            log: Vec::new(),
        }
    }

    pub fn mark_running(&mut self) -> Result<(), InvalidTransition<StepStatus>> {
        let is_first = self.started_at.is_none();
        transition_step(&mut self.status, StepStatus::Running)?;
        if is_first {
            self.started_at = Some(Utc::now());
        }
        self.attempts += 1;
        Ok(())
    }

    pub fn mark_completed(
        &mut self,
        output: std::collections::HashMap<String, serde_json::Value>,
    ) -> Result<(), InvalidTransition<StepStatus>> {
        transition_step(&mut self.status, StepStatus::Completed)?;
        self.output = output;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_skipped(&mut self) -> Result<(), InvalidTransition<StepStatus>> {
        transition_step(&mut self.status, StepStatus::Skipped)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_retrying(&mut self, error: StepError) -> Result<(), InvalidTransition<StepStatus>> {
        transition_step(&mut self.status, StepStatus::Retrying)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn mark_failed(&mut self, error: StepError) -> Result<(), InvalidTransition<StepStatus>> {
        transition_step(&mut self.status, StepStatus::Failed)?;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> Result<(), InvalidTransition<StepStatus>> {
        transition_step(&mut self.status, StepStatus::Cancelled)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowFailure {
    pub message: String,
    pub code: Option<String>,
    pub failed_step_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub status: WorkflowStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: std::collections::HashMap<String, StepState>,
    pub current_steps: std::collections::HashSet<String>,
    pub completed_steps: std::collections::HashSet<String>,
    pub failed_steps: std::collections::HashSet<String>,
    pub skipped_steps: std::collections::HashSet<String>,
    pub failure: Option<WorkflowFailure>,
    pub variables: std::collections::HashMap<String, serde_json::Value>,
}

impl WorkflowState {
    pub fn new(steps: std::collections::HashMap<String, StepState>) -> Self {
        WorkflowState {
            status: WorkflowStatus::Pending,
            started_at: None,
            completed_at: None,
            steps,
            current_steps: Default::default(),
            completed_steps: Default::default(),
            failed_steps: Default::default(),
            skipped_steps: Default::default(),
            failure: None,
            variables: Default::default(),
        }
    }
}
