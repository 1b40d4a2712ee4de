pub mod context;
pub mod dag;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod loader;
pub mod model;
pub mod retry;
pub mod state;

pub use engine::{Engine, EngineConfig, Snapshot};
pub use error::{DagFlowError, DagFlowResult};
pub use events::{EventKind, WorkflowEvent};
pub use executor::{NoopExecutor, ScriptedExecutor, StepExecutionError, StepExecutor, StepOutcome};
pub use model::{BackoffKind, Condition, FailurePolicy, RetryPolicySpec, Step, Workflow};
pub use state::{StepState, StepStatus, WorkflowState, WorkflowStatus};
