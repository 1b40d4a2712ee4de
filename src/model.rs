use serde::Deserialize;
use std::collections::HashMap;

/// A complete workflow definition, as loaded from YAML/JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub version: u32,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// A single step definition (a node in the DAG).
#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: Option<String>,

    /// Step IDs this one depends on. Scheduling is driven exclusively by this field.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Informational only — never consulted for scheduling, only for cycle-witness formatting.
    #[serde(default)]
    pub next: Vec<String>,

    #[serde(default)]
    pub condition: Option<Condition>,

    #[serde(default)]
    pub retry: Option<RetryPolicySpec>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub parameters: serde_yaml::Value,

    #[serde(default)]
    pub outputs: Vec<String>,

    /// Carried over from the upstream flow format; inert at the core level since step
    /// execution bodies are out of scope, but preserved for hosts that want it.
    #[serde(default)]
    pub idempotency_key: Option<String>,

    #[serde(default)]
    pub compensation: Option<Compensation>,
}

impl Default for Step {
    fn default() -> Self {
        Step {
            id: String::new(),
            name: None,
            depends_on: vec![],
            next: vec![],
            condition: None,
            retry: None,
            timeout_secs: None,
            parameters: serde_yaml::Value::Null,
            outputs: vec![],
            idempotency_key: None,
            compensation: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Compensation {
    pub kind: String,
    #[serde(default)]
    pub config: serde_yaml::Value,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    #[default]
    Stop,
    Continue,
    RetryAll,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicySpec {
    pub max_attempts: u32,
    #[serde(default = "default_backoff_kind")]
    pub backoff: BackoffKind,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_backoff_kind() -> BackoffKind {
    BackoffKind::Fixed
}

fn default_delay_ms() -> u64 {
    1000
}

/// The condition grammar evaluated against execution context. `Expr` carries a raw
/// expression string parsed lazily by the evaluator; `VariableEquals` is the equality shorthand.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    VariableEquals {
        variable: String,
        equals: serde_json::Value,
    },
    Expr { expr: String },
}
