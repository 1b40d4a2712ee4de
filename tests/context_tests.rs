use std::collections::HashMap;

use dagflow::context::ExecutionContext;
use dagflow::Condition;
use serde_json::Value;

#[test]
fn context_is_shared_across_variable_and_output_reads() {
    let ctx = ExecutionContext::new(HashMap::new());
    ctx.set_variable("region", Value::String("eu".to_string()));
    assert_eq!(ctx.get_variable("region"), Some(Value::String("eu".to_string())));

    let mut output = HashMap::new();
    output.insert("status_code".to_string(), Value::Number(200.into()));
    ctx.set_step_output("fetch", output);
    assert_eq!(
        ctx.get_step_output("fetch").unwrap().get("status_code"),
        Some(&Value::Number(200.into()))
    );
}

#[test]
fn expression_condition_reads_live_step_output() {
    let ctx = ExecutionContext::new(HashMap::new());
    ctx.set_step_status("build", "completed");
    let mut output = HashMap::new();
    output.insert("artifact_count".to_string(), Value::Number(2.into()));
    ctx.set_step_output("build", output);

    let condition = Condition::Expr {
        expr: "steps.build.status == \"completed\" && steps.build.output.artifact_count >= 1"
            .to_string(),
    };
    assert!(ctx.evaluate(&condition));
}

#[test]
fn unresolved_variable_never_panics_and_evaluates_falsy() {
    let ctx = ExecutionContext::new(HashMap::new());
    let condition = Condition::Expr {
        expr: "variables.does_not_exist == \"x\"".to_string(),
    };
    assert!(!ctx.evaluate(&condition));
}
