use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::dag;
use crate::error::DagFlowError;
use crate::events::{EventHub, EventKind, WorkflowEvent};
use crate::executor::StepExecutor;
use crate::model::{FailurePolicy, RetryPolicySpec, Workflow};
use crate::retry;
use crate::state::{
    StepError, StepState, StepStatus, WorkflowFailure, WorkflowState, WorkflowStatus,
};

/// Engine-wide defaults applied when a workflow or step doesn't declare its own.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_step_timeout: Duration,
    pub default_retry_policy: RetryPolicySpec,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            default_step_timeout: Duration::from_secs(300),
            default_retry_policy: retry::default_policy(),
            event_capacity: 1024,
        }
    }
}

struct ExecutionHandle {
    workflow: Arc<Workflow>,
    state: Mutex<WorkflowState>,
    context: Arc<ExecutionContext>,
    cancel: CancellationToken,
    paused: std::sync::atomic::AtomicBool,
    pause_notify: Notify,
}

/// A point-in-time, deep copy of an execution's state — safe to hand to callers without
/// holding any lock.
pub type Snapshot = WorkflowState;

/// The DAG workflow engine. Instance-scoped: no ambient or process-wide state is required,
/// so an application may run multiple independent `Engine`s concurrently.
pub struct Engine {
    config: EngineConfig,
    executor: Arc<dyn StepExecutor>,
    workflows: DashMap<String, Arc<Workflow>>,
    executions: DashMap<Uuid, Arc<ExecutionHandle>>,
    events: Arc<EventHub>,
}

impl Engine {
    pub fn new(executor: Arc<dyn StepExecutor>, config: EngineConfig) -> Self {
        Engine {
            events: Arc::new(EventHub::new(config.event_capacity)),
            config,
            executor,
            workflows: DashMap::new(),
            executions: DashMap::new(),
        }
    }

    /// Validates and stores a workflow definition. Re-registering an identical workflow
    /// (same id and step set) is treated as a no-op rather than an error.
    pub fn register(&self, workflow: Workflow) -> Result<(), DagFlowError> {
        if let Some(existing) = self.workflows.get(&workflow.id) {
            if same_shape(&existing, &workflow) {
                return Ok(());
            }
        }

        if workflow.on_failure == FailurePolicy::RetryAll {
            return Err(DagFlowError::invalid_workflow(
                workflow.id.clone(),
                vec!["on_failure: retryAll is not supported by this engine".to_string()],
            ));
        }

        let report = dag::validate(&workflow);
        if !report.valid {
            return Err(DagFlowError::invalid_workflow(workflow.id.clone(), report.errors));
        }

        self.workflows.insert(workflow.id.clone(), Arc::new(workflow));
        Ok(())
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub fn list_active(&self) -> Vec<Uuid> {
        self.executions
            .iter()
            .filter(|entry| !entry.value().cancel.is_cancelled())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Starts a new execution of a registered workflow and returns its id immediately.
    /// Execution proceeds on a spawned task.
    pub fn start(
        &self,
        workflow_id: &str,
        initial_vars: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<Uuid, DagFlowError> {
        let workflow = self
            .workflows
            .get(workflow_id)
            .map(|w| Arc::clone(&w))
            .ok_or_else(|| DagFlowError::not_found("workflow", workflow_id))?;

        let execution_id = Uuid::new_v4();
        let mut step_states = HashMap::new();
        for step in &workflow.steps {
            let policy = step
                .retry
                .clone()
                .unwrap_or_else(|| self.config.default_retry_policy.clone());
            step_states.insert(step.id.clone(), StepState::new(step.id.clone(), policy.max_attempts));
        }

        let mut variables = workflow.variables.clone();
        if let Some(vars) = initial_vars {
            variables.extend(vars);
        }

        let mut state = WorkflowState::new(step_states);
        state.variables = variables.clone();
        crate::state::transition_workflow(&mut state.status, WorkflowStatus::Running)
            .expect("Pending -> Running is always legal");
        state.started_at = Some(Utc::now());

        let handle = Arc::new(ExecutionHandle {
            workflow: Arc::clone(&workflow),
            state: Mutex::new(state),
            context: Arc::new(ExecutionContext::new(variables)),
            cancel: CancellationToken::new(),
            paused: std::sync::atomic::AtomicBool::new(false),
            pause_notify: Notify::new(),
        });

        self.executions.insert(execution_id, Arc::clone(&handle));

        self.events.publish(WorkflowEvent::workflow(
            EventKind::WorkflowStart,
            execution_id.to_string(),
            workflow.id.clone(),
            Some(WorkflowStatus::Pending),
            WorkflowStatus::Running,
        ));

        let config = self.config.clone();
        let executor = Arc::clone(&self.executor);
        let events = Arc::clone(&self.events);
        tokio::spawn(run_execution(execution_id, handle, config, executor, events));

        Ok(execution_id)
    }

    pub async fn pause(&self, execution_id: Uuid) -> bool {
        let Some(handle) = self.executions.get(&execution_id).map(|e| Arc::clone(&e)) else {
            return false;
        };
        let mut state = handle.state.lock().await;
        if crate::state::transition_workflow(&mut state.status, WorkflowStatus::Paused).is_ok() {
            handle.paused.store(true, std::sync::atomic::Ordering::SeqCst);
            self.events.publish(WorkflowEvent::workflow(
                EventKind::WorkflowPause,
                execution_id.to_string(),
                handle.workflow.id.clone(),
                Some(WorkflowStatus::Running),
                WorkflowStatus::Paused,
            ));
            true
        } else {
            false
        }
    }

    pub async fn resume(&self, execution_id: Uuid) -> bool {
        let Some(handle) = self.executions.get(&execution_id).map(|e| Arc::clone(&e)) else {
            return false;
        };
        let mut state = handle.state.lock().await;
        if crate::state::transition_workflow(&mut state.status, WorkflowStatus::Running).is_ok() {
            handle.paused.store(false, std::sync::atomic::Ordering::SeqCst);
            handle.pause_notify.notify_waiters();
            self.events.publish(WorkflowEvent::workflow(
                EventKind::WorkflowResume,
                execution_id.to_string(),
                handle.workflow.id.clone(),
                Some(WorkflowStatus::Paused),
                WorkflowStatus::Running,
            ));
            true
        } else {
            false
        }
    }

    /// Idempotent: a second `cancel` call, or a call against an execution that already
    /// reached a terminal status on its own (Completed/Failed/Cancelled), is a no-op and
    /// returns `false` without publishing an event.
    pub async fn cancel(&self, execution_id: Uuid) -> bool {
        let Some(handle) = self.executions.get(&execution_id).map(|e| Arc::clone(&e)) else {
            return false;
        };
        if handle.cancel.is_cancelled() {
            return false;
        }
        let state = handle.state.lock().await;
        if state.status.is_terminal() {
            return false;
        }
        drop(state);
        handle.cancel.cancel();
        handle.pause_notify.notify_waiters();
        self.events.publish(WorkflowEvent::workflow(
            EventKind::WorkflowCancel,
            execution_id.to_string(),
            handle.workflow.id.clone(),
            None,
            WorkflowStatus::Cancelled,
        ));
        true
    }

    pub async fn get_state(&self, execution_id: Uuid) -> Result<Snapshot, DagFlowError> {
        let handle = self
            .executions
            .get(&execution_id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| DagFlowError::not_found("execution", execution_id.to_string()))?;
        Ok(handle.state.lock().await.clone())
    }
}

fn same_shape(a: &Workflow, b: &Workflow) -> bool {
    a.id == b.id
        && a.steps.len() == b.steps.len()
        && a.steps.iter().zip(b.steps.iter()).all(|(sa, sb)| {
            sa.id == sb.id && sa.depends_on == sb.depends_on
        })
}

async fn wait_while_paused(handle: &ExecutionHandle) {
    while handle.paused.load(std::sync::atomic::Ordering::SeqCst) {
        if handle.cancel.is_cancelled() {
            return;
        }
        handle.pause_notify.notified().await;
    }
}

enum StepOutcomeKind {
    Completed,
    Failed(String),
    Cancelled,
}

/// Drives one execution through its topological layers to a terminal status. Spawned once
/// per `Engine::start` call; never awaited by the caller.
async fn run_execution(
    execution_id: Uuid,
    handle: Arc<ExecutionHandle>,
    config: EngineConfig,
    executor: Arc<dyn StepExecutor>,
    events: Arc<EventHub>,
) {
    let workflow = Arc::clone(&handle.workflow);
    let layers = match dag::topological_layers(&workflow) {
        Ok(layers) => layers,
        Err(err) => {
            warn!(execution_id = %execution_id, error = %err, "failed to compute layers for an already-validated workflow");
            let mut state = handle.state.lock().await;
            crate::state::transition_workflow(&mut state.status, WorkflowStatus::Failed)
                .expect("Running -> Failed is always legal");
            state.failure = Some(WorkflowFailure {
                message: err.to_string(),
                code: None,
                failed_step_id: None,
            });
            state.completed_at = Some(Utc::now());
            return;
        }
    };

    // Steps whose dependency failed or was cancelled never get dispatched; `continue`
    // policy still runs every step whose dependencies are all satisfied.
    let mut blocked: HashSet<String> = HashSet::new();
    let mut first_failure: Option<String> = None;

    'layers: for layer in layers {
        wait_while_paused(&handle).await;
        if handle.cancel.is_cancelled() {
            break;
        }

        let mut join_set: JoinSet<(String, StepOutcomeKind)> = JoinSet::new();

        for step_id in layer {
            let Some(step) = workflow.steps.iter().find(|s| s.id == step_id) else {
                continue;
            };

            if step.depends_on.iter().any(|d| blocked.contains(d)) {
                blocked.insert(step_id.clone());
                continue;
            }

            if let Some(cond) = &step.condition {
                if !handle.context.evaluate(cond) {
                    let mut state = handle.state.lock().await;
                    if let Some(step_state) = state.steps.get_mut(&step_id) {
                        step_state.mark_skipped().expect("Pending -> Skipped is always legal");
                    }
                    state.skipped_steps.insert(step_id.clone());
                    drop(state);
                    events.publish(WorkflowEvent::step(
                        EventKind::StepSkip,
                        execution_id.to_string(),
                        workflow.id.clone(),
                        step_id.clone(),
                        Some(StepStatus::Pending),
                        StepStatus::Skipped,
                        0,
                    ));
                    continue;
                }
            }

            let step = step.clone();
            let retry_policy = step
                .retry
                .clone()
                .unwrap_or_else(|| config.default_retry_policy.clone());
            let step_timeout = step
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(config.default_step_timeout);
            let execution_handle = Arc::clone(&handle);
            let exec = Arc::clone(&executor);
            let ev = Arc::clone(&events);
            let exec_id = execution_id.to_string();

            {
                let mut state = handle.state.lock().await;
                state.current_steps.insert(step_id.clone());
                if let Some(step_state) = state.steps.get_mut(&step_id) {
                    step_state.max_attempts = retry_policy.max_attempts;
                }
            }

            join_set.spawn(run_step_with_retries(
                step,
                retry_policy,
                step_timeout,
                execution_handle,
                exec,
                ev,
                exec_id,
            ));
        }

        // Drain every task in this layer before deciding whether to stop: under `Stop`,
        // a failure must let the rest of the layer's in-flight steps finish (SPEC_FULL.md
        // §4.5) rather than dropping the `JoinSet` (which would abort them) mid-layer.
        let mut stop_after_layer = false;
        while let Some(joined) = join_set.join_next().await {
            let (step_id, outcome) = match joined {
                Ok(pair) => pair,
                Err(join_err) => {
                    warn!(error = %join_err, "step task panicked");
                    continue;
                }
            };

            let mut state = handle.state.lock().await;
            state.current_steps.remove(&step_id);
            match outcome {
                StepOutcomeKind::Completed => {
                    state.completed_steps.insert(step_id.clone());
                }
                StepOutcomeKind::Failed(_) => {
                    state.failed_steps.insert(step_id.clone());
                    blocked.insert(step_id.clone());
                    if first_failure.is_none() {
                        first_failure = Some(step_id.clone());
                    }
                }
                StepOutcomeKind::Cancelled => {
                    state.failed_steps.insert(step_id.clone());
                    blocked.insert(step_id.clone());
                }
            }
            drop(state);

            if workflow.on_failure == FailurePolicy::Stop && first_failure.is_some() {
                stop_after_layer = true;
            }
        }

        if stop_after_layer {
            break 'layers;
        }
    }

    let mut state = handle.state.lock().await;
    if handle.cancel.is_cancelled() {
        crate::state::transition_workflow(&mut state.status, WorkflowStatus::Cancelled)
            .expect("Running/Paused -> Cancelled is always legal");
        state.completed_at = Some(Utc::now());
    } else if let Some(failed_step) = first_failure {
        crate::state::transition_workflow(&mut state.status, WorkflowStatus::Failed)
            .expect("Running -> Failed is always legal");
        let message = format!("step '{failed_step}' failed");
        state.failure = Some(WorkflowFailure {
            message: message.clone(),
            code: None,
            failed_step_id: Some(failed_step),
        });
        state.completed_at = Some(Utc::now());
        drop(state);
        events.publish(
            WorkflowEvent::workflow(
                EventKind::WorkflowFail,
                execution_id.to_string(),
                workflow.id.clone(),
                Some(WorkflowStatus::Running),
                WorkflowStatus::Failed,
            )
            .with_message(message),
        );
    } else {
        crate::state::transition_workflow(&mut state.status, WorkflowStatus::Completed)
            .expect("Running -> Completed is always legal");
        state.completed_at = Some(Utc::now());
        drop(state);
        events.publish(WorkflowEvent::workflow(
            EventKind::WorkflowComplete,
            execution_id.to_string(),
            workflow.id.clone(),
            Some(WorkflowStatus::Running),
            WorkflowStatus::Completed,
        ));
    }

    debug!(execution_id = %execution_id, "execution finished");
}

/// Applies a transition to the canonical `StepState` kept in the execution's `WorkflowState`
/// and mirrors the new status into the `ExecutionContext` so condition expressions
/// (`steps.ID.status`) can observe it. Returns the status the step was in before.
async fn transition_shared_step<F>(
    handle: &ExecutionHandle,
    step_id: &str,
    mutate: F,
    context_status: &str,
) -> StepStatus
where
    F: FnOnce(&mut StepState),
{
    let mut state = handle.state.lock().await;
    let previous = state
        .steps
        .get(step_id)
        .map(|s| s.status)
        .unwrap_or(StepStatus::Pending);
    if let Some(step_state) = state.steps.get_mut(step_id) {
        mutate(step_state);
    }
    drop(state);
    handle.context.set_step_status(step_id, context_status);
    previous
}

/// Runs a single step through as many attempts as its retry policy allows, racing every
/// suspension point (executor call, timeout, retry delay) against the execution's
/// cancellation token. Every transition is written back into the shared `WorkflowState` so
/// `Engine::get_state` and condition expressions observe it immediately.
async fn run_step_with_retries(
    step: crate::model::Step,
    retry_policy: RetryPolicySpec,
    step_timeout: Duration,
    handle: Arc<ExecutionHandle>,
    executor: Arc<dyn StepExecutor>,
    events: Arc<EventHub>,
    execution_id: String,
) -> (String, StepOutcomeKind) {
    let workflow_id = handle.workflow.id.clone();
    let cancel = handle.cancel.clone();
    let context = Arc::clone(&handle.context);
    let mut attempts: u32 = 0;

    loop {
        // Only a re-entry from Retrying may be pre-empted here: Pending has no direct
        // transition to Cancelled, so the first attempt always proceeds to Running and lets
        // the select! below observe cancellation from there instead.
        if attempts > 0 && cancel.is_cancelled() {
            let previous =
                transition_shared_step(
                    &handle,
                    &step.id,
                    |s| s.mark_cancelled().expect("Retrying -> Cancelled is always legal"),
                    "cancelled",
                )
                    .await;
            events.publish(WorkflowEvent::step(
                EventKind::StepCancel,
                execution_id.clone(),
                workflow_id.clone(),
                step.id.clone(),
                Some(previous),
                StepStatus::Cancelled,
                attempts,
            ));
            return (step.id.clone(), StepOutcomeKind::Cancelled);
        }

        attempts += 1;
        transition_shared_step(
            &handle,
            &step.id,
            |s| s.mark_running().expect("Pending/Retrying -> Running is always legal"),
            "running",
        )
        .await;
        events.publish(WorkflowEvent::step(
            EventKind::StepStart,
            execution_id.clone(),
            workflow_id.clone(),
            step.id.clone(),
            Some(StepStatus::Pending),
            StepStatus::Running,
            attempts,
        ));

        let exec_future = executor.execute(&step, &context);

        let timeout_result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(step_timeout, exec_future) => Some(result),
        };

        let Some(timeout_result) = timeout_result else {
            transition_shared_step(
                &handle,
                &step.id,
                |s| s.mark_cancelled().expect("Running -> Cancelled is always legal"),
                "cancelled",
            )
            .await;
            events.publish(WorkflowEvent::step(
                EventKind::StepCancel,
                execution_id.clone(),
                workflow_id.clone(),
                step.id.clone(),
                Some(StepStatus::Running),
                StepStatus::Cancelled,
                attempts,
            ));
            return (step.id.clone(), StepOutcomeKind::Cancelled);
        };

        let failure_message = match timeout_result {
            Ok(Ok(outcome)) => {
                context.set_step_output(&step.id, outcome.output.clone());
                let output = outcome.output;
                transition_shared_step(
                    &handle,
                    &step.id,
                    |s| s.mark_completed(output).expect("Running -> Completed is always legal"),
                    "completed",
                )
                .await;
                events.publish(WorkflowEvent::step(
                    EventKind::StepComplete,
                    execution_id.clone(),
                    workflow_id.clone(),
                    step.id.clone(),
                    Some(StepStatus::Running),
                    StepStatus::Completed,
                    attempts,
                ));
                return (step.id.clone(), StepOutcomeKind::Completed);
            }
            Ok(Err(exec_err)) => exec_err.message,
            Err(_elapsed) => format!("step '{}' timed out after {:?}", step.id, step_timeout),
        };

        let attempts_exhausted = attempts >= retry_policy.max_attempts;
        if !attempts_exhausted {
            let message = failure_message.clone();
            transition_shared_step(
                &handle,
                &step.id,
                move |s| {
                    s.attempts = attempts;
                    s.mark_retrying(StepError {
                        message,
                        code: None,
                        trace: None,
                    })
                    .expect("Running -> Retrying is always legal");
                },
                "retrying",
            )
            .await;
            events.publish(WorkflowEvent::step(
                EventKind::StepRetry,
                execution_id.clone(),
                workflow_id.clone(),
                step.id.clone(),
                Some(StepStatus::Running),
                StepStatus::Retrying,
                attempts,
            ));

            let delay = retry::delay_for(attempts, &retry_policy);
            tokio::select! {
                _ = cancel.cancelled() => {
                    transition_shared_step(
                        &handle,
                        &step.id,
                        |s| s.mark_cancelled().expect("Retrying -> Cancelled is always legal"),
                        "cancelled",
                    )
                    .await;
                    return (step.id.clone(), StepOutcomeKind::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            continue;
        }

        let message = failure_message.clone();
        transition_shared_step(
            &handle,
            &step.id,
            move |s| {
                s.attempts = attempts;
                s.mark_failed(StepError {
                    message,
                    code: None,
                    trace: None,
                })
                .expect("Running -> Failed is always legal");
            },
            "failed",
        )
        .await;
        events.publish(WorkflowEvent::step(
            EventKind::StepFail,
            execution_id.clone(),
            workflow_id.clone(),
            step.id.clone(),
            Some(StepStatus::Running),
            StepStatus::Failed,
            attempts,
        ));
        return (step.id.clone(), StepOutcomeKind::Failed(failure_message));
    }
}
