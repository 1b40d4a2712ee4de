use thiserror::Error;

/// The crate's error taxonomy. Registration errors are returned to the caller directly;
/// step-level failures are captured into `StepState` and never surface here.
#[derive(Debug, Error, Clone)]
pub enum DagFlowError {
    #[error("workflow '{workflow_id}' is invalid: {reasons:?}")]
    InvalidWorkflow {
        workflow_id: String,
        reasons: Vec<String>,
    },

    #[error("workflow '{workflow_id}' contains a cycle: {cycle:?}")]
    CycleDetected {
        workflow_id: String,
        cycle: Vec<String>,
    },

    #[error("step '{step_id}' timed out after {elapsed_ms}ms")]
    StepTimeout { step_id: String, elapsed_ms: u64 },

    #[error("step '{step_id}' failed: {message}")]
    StepExecutionError { step_id: String, message: String },

    #[error("execution '{execution_id}' was cancelled")]
    Cancelled { execution_id: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },
}

impl DagFlowError {
    pub fn invalid_workflow(workflow_id: impl Into<String>, reasons: Vec<String>) -> Self {
        DagFlowError::InvalidWorkflow {
            workflow_id: workflow_id.into(),
            reasons,
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        DagFlowError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type DagFlowResult<T> = Result<T, DagFlowError>;
