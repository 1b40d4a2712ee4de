use std::sync::Arc;
use std::time::Duration;

use dagflow::{
    BackoffKind, Engine, EngineConfig, FailurePolicy, NoopExecutor, RetryPolicySpec,
    ScriptedExecutor, Step, StepExecutionError, StepExecutor, StepOutcome, StepStatus, Workflow,
    WorkflowStatus,
};

fn workflow(id: &str, steps: Vec<Step>, on_failure: FailurePolicy) -> Workflow {
    Workflow {
        id: id.to_string(),
        name: None,
        version: 1,
        steps,
        variables: Default::default(),
        on_failure,
        timeout_secs: None,
    }
}

fn step(id: &str, deps: &[&str]) -> Step {
    Step {
        id: id.to_string(),
        depends_on: deps.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

async fn run_to_completion(engine: &Engine, execution_id: uuid::Uuid) -> dagflow::Snapshot {
    loop {
        let snapshot = engine.get_state(execution_id).await.unwrap();
        if snapshot.status.is_terminal() {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn sequential_success_completes_every_step() {
    let wf = workflow(
        "seq",
        vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])],
        FailurePolicy::Stop,
    );

    let engine = Engine::new(Arc::new(NoopExecutor), EngineConfig::default());
    engine.register(wf).unwrap();
    let execution_id = engine.start("seq", None).unwrap();

    let snapshot = run_to_completion(&engine, execution_id).await;
    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    assert_eq!(snapshot.completed_steps.len(), 3);
}

#[tokio::test]
async fn fan_out_fan_in_runs_the_middle_layer_concurrently() {
    let wf = workflow(
        "diamond",
        vec![
            step("start", &[]),
            step("left", &["start"]),
            step("right", &["start"]),
            step("join", &["left", "right"]),
        ],
        FailurePolicy::Stop,
    );

    let engine = Engine::new(
        Arc::new(ScriptedExecutor::new().with_delay_range(5, 15)),
        EngineConfig::default(),
    );
    engine.register(wf).unwrap();
    let execution_id = engine.start("diamond", None).unwrap();

    let snapshot = run_to_completion(&engine, execution_id).await;
    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    assert_eq!(snapshot.completed_steps.len(), 4);
}

struct FlakyExecutor {
    succeed_on_attempt: u32,
    calls: std::sync::atomic::AtomicU32,
}

#[async_trait::async_trait]
impl StepExecutor for FlakyExecutor {
    async fn execute(
        &self,
        _step: &Step,
        _context: &dagflow::context::ExecutionContext,
    ) -> Result<StepOutcome, StepExecutionError> {
        let attempt = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        if attempt < self.succeed_on_attempt {
            Err(StepExecutionError {
                message: format!("transient failure on attempt {attempt}"),
            })
        } else {
            Ok(StepOutcome::empty())
        }
    }
}

#[tokio::test]
async fn step_succeeds_on_third_attempt_after_two_retries() {
    let mut flaky_step = step("flaky", &[]);
    flaky_step.retry = Some(RetryPolicySpec {
        max_attempts: 5,
        backoff: BackoffKind::Fixed,
        delay_ms: 5,
    });
    let wf = workflow("retry-wf", vec![flaky_step], FailurePolicy::Stop);

    let executor = Arc::new(FlakyExecutor {
        succeed_on_attempt: 3,
        calls: std::sync::atomic::AtomicU32::new(0),
    });
    let engine = Engine::new(executor.clone(), EngineConfig::default());
    engine.register(wf).unwrap();
    let execution_id = engine.start("retry-wf", None).unwrap();

    let snapshot = run_to_completion(&engine, execution_id).await;
    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    assert_eq!(
        snapshot.steps.get("flaky").unwrap().status,
        StepStatus::Completed
    );
    assert_eq!(executor.calls.load(std::sync::atomic::Ordering::SeqCst), 3);
}

struct HangingExecutor;

#[async_trait::async_trait]
impl StepExecutor for HangingExecutor {
    async fn execute(
        &self,
        _step: &Step,
        _context: &dagflow::context::ExecutionContext,
    ) -> Result<StepOutcome, StepExecutionError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(StepOutcome::empty())
    }
}

#[tokio::test(start_paused = true)]
async fn step_exhausts_retries_after_repeated_timeouts() {
    let mut slow_step = step("slow", &[]);
    slow_step.timeout_secs = Some(1);
    slow_step.retry = Some(RetryPolicySpec {
        max_attempts: 2,
        backoff: BackoffKind::Fixed,
        delay_ms: 10,
    });
    let wf = workflow("timeout-wf", vec![slow_step], FailurePolicy::Stop);

    let engine = Engine::new(Arc::new(HangingExecutor), EngineConfig::default());
    engine.register(wf).unwrap();
    let execution_id = engine.start("timeout-wf", None).unwrap();

    let snapshot = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let snapshot = engine.get_state(execution_id).await.unwrap();
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::advance(Duration::from_millis(500)).await;
        }
    })
    .await
    .expect("execution should reach a terminal state");

    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert_eq!(
        snapshot.steps.get("slow").unwrap().status,
        StepStatus::Failed
    );
}

#[tokio::test]
async fn false_condition_skips_the_step_without_failing_the_workflow() {
    let mut conditional_step = step("maybe", &[]);
    conditional_step.condition = Some(dagflow::Condition::VariableEquals {
        variable: "run_it".to_string(),
        equals: serde_json::Value::Bool(true),
    });
    let wf = workflow("skip-wf", vec![conditional_step], FailurePolicy::Stop);

    let engine = Engine::new(Arc::new(NoopExecutor), EngineConfig::default());
    engine.register(wf).unwrap();

    let mut vars = std::collections::HashMap::new();
    vars.insert("run_it".to_string(), serde_json::Value::Bool(false));
    let execution_id = engine.start("skip-wf", Some(vars)).unwrap();

    let snapshot = run_to_completion(&engine, execution_id).await;
    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    assert_eq!(
        snapshot.steps.get("maybe").unwrap().status,
        StepStatus::Skipped
    );
}

#[tokio::test]
async fn cancel_mid_run_stops_the_workflow_without_retrying() {
    let wf = workflow("cancel-wf", vec![step("long", &[])], FailurePolicy::Stop);

    let engine = Engine::new(Arc::new(HangingExecutor), EngineConfig::default());
    engine.register(wf).unwrap();
    let execution_id = engine.start("cancel-wf", None).unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(engine.cancel(execution_id).await);
    assert!(
        !engine.cancel(execution_id).await,
        "second cancel must be a no-op"
    );

    let snapshot = run_to_completion(&engine, execution_id).await;
    assert_eq!(snapshot.status, WorkflowStatus::Cancelled);
    assert!(
        !engine.cancel(execution_id).await,
        "cancel after reaching a terminal status must be a no-op"
    );
}

#[tokio::test]
async fn continue_policy_runs_independent_steps_after_a_failure() {
    let wf = workflow(
        "continue-wf",
        vec![
            step("will_fail", &[]),
            step("depends_on_failure", &["will_fail"]),
            step("independent", &[]),
        ],
        FailurePolicy::Continue,
    );

    let failing = ScriptedExecutor::new().with_failing_steps(["will_fail".to_string()]);
    let engine = Engine::new(Arc::new(failing), EngineConfig::default());
    engine.register(wf).unwrap();
    let execution_id = engine.start("continue-wf", None).unwrap();

    let snapshot = run_to_completion(&engine, execution_id).await;
    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert!(snapshot.completed_steps.contains("independent"));
    assert!(snapshot.failed_steps.contains("will_fail"));
    assert!(!snapshot.completed_steps.contains("depends_on_failure"));
}

/// Fails immediately for configured step ids; sleeps a configured delay first for every
/// other step, so a test can make one step in a layer fail well before its siblings finish.
struct PerStepExecutor {
    fail_steps: std::collections::HashSet<String>,
    delay: Duration,
}

#[async_trait::async_trait]
impl StepExecutor for PerStepExecutor {
    async fn execute(
        &self,
        step: &Step,
        _context: &dagflow::context::ExecutionContext,
    ) -> Result<StepOutcome, StepExecutionError> {
        if self.fail_steps.contains(&step.id) {
            return Err(StepExecutionError {
                message: format!("step '{}' scripted to fail", step.id),
            });
        }
        tokio::time::sleep(self.delay).await;
        Ok(StepOutcome::empty())
    }
}

#[tokio::test]
async fn stop_policy_lets_in_flight_layer_siblings_finish_before_failing_the_workflow() {
    let wf = workflow(
        "stop-wf",
        vec![
            step("fails_fast", &[]),
            step("slower_sibling_one", &[]),
            step("slower_sibling_two", &[]),
        ],
        FailurePolicy::Stop,
    );

    let executor = Arc::new(PerStepExecutor {
        fail_steps: ["fails_fast".to_string()].into_iter().collect(),
        delay: Duration::from_millis(60),
    });
    let engine = Engine::new(executor, EngineConfig::default());
    engine.register(wf).unwrap();
    let execution_id = engine.start("stop-wf", None).unwrap();

    let snapshot = run_to_completion(&engine, execution_id).await;
    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert!(snapshot.failed_steps.contains("fails_fast"));
    // The slower siblings were in the same layer; `stop` must let them run to completion
    // rather than aborting them the instant `fails_fast` fails.
    assert!(snapshot.completed_steps.contains("slower_sibling_one"));
    assert!(snapshot.completed_steps.contains("slower_sibling_two"));
    assert_eq!(
        snapshot.steps.get("slower_sibling_one").unwrap().status,
        StepStatus::Completed
    );
    assert_eq!(
        snapshot.steps.get("slower_sibling_two").unwrap().status,
        StepStatus::Completed
    );
}
