use std::collections::HashMap;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::model::Step;

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub output: HashMap<String, Value>,
}

impl StepOutcome {
    pub fn empty() -> Self {
        StepOutcome {
            output: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepExecutionError {
    pub message: String,
}

impl std::fmt::Display for StepExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StepExecutionError {}

/// The capability a host implements to actually run a step. Must be re-entrant: the engine
/// may invoke it again for the same step on retry, and concurrently for different steps in
/// the same layer.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        step: &Step,
        context: &ExecutionContext,
    ) -> Result<StepOutcome, StepExecutionError>;
}

/// Always succeeds immediately with no output. Useful for tests that only exercise
/// scheduling/state-machine behaviour.
pub struct NoopExecutor;

#[async_trait]
impl StepExecutor for NoopExecutor {
    async fn execute(
        &self,
        _step: &Step,
        _context: &ExecutionContext,
    ) -> Result<StepOutcome, StepExecutionError> {
        Ok(StepOutcome::empty())
    }
}

/// A demo/test executor that simulates work with a randomised sleep and fails steps whose
/// id is registered in `fail_steps`. Mirrors the shape of a scripted test double; not meant
/// for production use.
pub struct ScriptedExecutor {
    fail_steps: std::collections::HashSet<String>,
    min_delay_ms: u64,
    max_delay_ms: u64,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        ScriptedExecutor {
            fail_steps: Default::default(),
            min_delay_ms: 10,
            max_delay_ms: 30,
        }
    }

    pub fn with_failing_steps(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.fail_steps = ids.into_iter().collect();
        self
    }

    pub fn with_delay_range(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.min_delay_ms = min_ms;
        self.max_delay_ms = max_ms.max(min_ms + 1);
        self
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        step: &Step,
        _context: &ExecutionContext,
    ) -> Result<StepOutcome, StepExecutionError> {
        let delay_ms = rand::thread_rng().gen_range(self.min_delay_ms..self.max_delay_ms);
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;

        if self.fail_steps.contains(&step.id) {
            debug!(step_id = %step.id, "scripted executor failing step");
            return Err(StepExecutionError {
                message: format!("step '{}' scripted to fail", step.id),
            });
        }

        let mut output = HashMap::new();
        for name in &step.outputs {
            output.insert(name.clone(), Value::Bool(true));
        }
        Ok(StepOutcome { output })
    }
}
