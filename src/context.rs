use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::model::Condition;

/// Per-execution variable and step-output store. Concurrent steps reading disjoint keys
/// never block each other; cross-key atomicity is neither required nor provided.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    variables: DashMap<String, Value>,
    outputs: DashMap<String, std::collections::HashMap<String, Value>>,
    statuses: DashMap<String, String>,
}

impl ExecutionContext {
    pub fn new(initial_variables: std::collections::HashMap<String, Value>) -> Self {
        let variables = DashMap::new();
        for (k, v) in initial_variables {
            variables.insert(k, v);
        }
        ExecutionContext {
            variables,
            outputs: DashMap::new(),
            statuses: DashMap::new(),
        }
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.get(name).map(|v| v.clone())
    }

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn get_step_output(&self, step_id: &str) -> Option<std::collections::HashMap<String, Value>> {
        self.outputs.get(step_id).map(|v| v.clone())
    }

    pub fn set_step_output(
        &self,
        step_id: impl Into<String>,
        output: std::collections::HashMap<String, Value>,
    ) {
        self.outputs.insert(step_id.into(), output);
    }

    pub fn set_step_status(&self, step_id: impl Into<String>, status: impl Into<String>) {
        self.statuses.insert(step_id.into(), status.into());
    }

    pub fn get_step_status(&self, step_id: &str) -> Option<String> {
        self.statuses.get(step_id).map(|v| v.clone())
    }

    /// Resolves a dotted atom (`variables.NAME`, `steps.ID.status`, `steps.ID.output.FIELD`)
    /// against this context. Unresolvable references return `None`, the "undefined" sentinel
    /// which compares unequal to every literal.
    fn resolve_atom(&self, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        match parts.next()? {
            "variables" => {
                let name = parts.next()?;
                self.get_variable(name)
            }
            "steps" => {
                let step_id = parts.next()?;
                match parts.next()? {
                    "status" => self.get_step_status(step_id).map(Value::String),
                    "output" => {
                        let field = parts.next()?;
                        self.get_step_output(step_id)?.get(field).cloned()
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Evaluates a `Condition` against this context. Parse failures evaluate to `false`
    /// rather than propagating an error into the scheduler.
    pub fn evaluate(&self, condition: &Condition) -> bool {
        match condition {
            Condition::VariableEquals { variable, equals } => {
                self.get_variable(variable).as_ref() == Some(equals)
            }
            Condition::Expr { expr } => {
                let parser = ExprParser {
                    ctx: Some(self),
                    input: expr,
                };
                let result = parser
                    .parse_or()
                    .and_then(|(value, rest)| if rest.trim().is_empty() { Some(value) } else { None })
                    .map(|value| value.as_bool())
                    .unwrap_or(false);
                debug!(expr, result, "evaluated condition expression");
                result
            }
        }
    }

    fn eval_atom(&self, atom: &str) -> Value {
        if let Some(v) = parse_literal(atom) {
            return v;
        }
        self.resolve_atom(atom).unwrap_or(Value::Null)
    }
}

fn parse_literal(s: &str) -> Option<Value> {
    let s = s.trim();
    match s {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        _ => {}
    }
    if s.starts_with('"') && s.ends_with('"') && s.len() >= 2 {
        return Some(Value::String(s[1..s.len() - 1].to_string()));
    }
    if let Ok(n) = s.parse::<i64>() {
        return Some(Value::Number(n.into()));
    }
    if let Ok(f) = s.parse::<f64>() {
        return serde_json::Number::from_f64(f).map(Value::Number);
    }
    None
}

trait AsBool {
    fn as_bool(&self) -> bool;
}

impl AsBool for Value {
    fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Null => false,
            _ => true,
        }
    }
}

/// A small recursive-descent parser for the condition expression grammar:
/// `!`-prefixed unary, `==`/`!=`/`<`/`<=`/`>`/`>=` comparisons, `&&`/`||` with the usual
/// precedence, and parenthesisation. Each `parse_*` method returns the parsed value together
/// with the unconsumed remainder of the input, or `None` on malformed input.
struct ExprParser<'a> {
    ctx: Option<&'a ExecutionContext>,
    input: &'a str,
}

impl<'a> ExprParser<'a> {
    fn parse_or(&self) -> Option<(Value, &'a str)> {
        self.parse_or_inner(self.input)
    }

    fn parse_and(&self, input: &'a str) -> Option<(Value, &'a str)> {
        let (mut left, mut rest) = self.parse_unary(input)?;
        loop {
            let trimmed = rest.trim_start();
            if let Some(next) = trimmed.strip_prefix("&&") {
                let (right, r2) = self.parse_unary(next)?;
                left = Value::Bool(left.as_bool() && right.as_bool());
                rest = r2;
            } else {
                return Some((left, rest));
            }
        }
    }

    fn parse_unary(&self, input: &'a str) -> Option<(Value, &'a str)> {
        let trimmed = input.trim_start();
        if let Some(rest) = trimmed.strip_prefix('!') {
            let (value, rest) = self.parse_unary(rest)?;
            return Some((Value::Bool(!value.as_bool()), rest));
        }
        self.parse_comparison(trimmed)
    }

    fn parse_comparison(&self, input: &'a str) -> Option<(Value, &'a str)> {
        let (left, rest) = self.parse_primary(input)?;
        let trimmed = rest.trim_start();

        for op in ["==", "!=", "<=", ">=", "<", ">"] {
            if let Some(after_op) = trimmed.strip_prefix(op) {
                let (right, rest2) = self.parse_primary(after_op)?;
                let result = compare(&left, &right, op)?;
                return Some((Value::Bool(result), rest2));
            }
        }

        Some((left, rest))
    }

    fn parse_primary(&self, input: &'a str) -> Option<(Value, &'a str)> {
        let trimmed = input.trim_start();
        if trimmed.is_empty() {
            return None;
        }
        if let Some(rest) = trimmed.strip_prefix('(') {
            let (value, rest) = self.parse_or_inner(rest)?;
            let rest = rest.trim_start().strip_prefix(')')?;
            return Some((value, rest));
        }

        let end = trimmed
            .find(|c: char| "()!&|<>=".contains(c) || c.is_whitespace())
            .unwrap_or(trimmed.len());
        let (token, rest) = trimmed.split_at(end.max(1));
        if token.is_empty() {
            return None;
        }

        let value = match self.ctx {
            Some(ctx) => ctx.eval_atom(token),
            None => parse_literal(token).unwrap_or(Value::Null),
        };
        Some((value, rest))
    }

    fn parse_or_inner(&self, input: &'a str) -> Option<(Value, &'a str)> {
        let (mut left, mut rest) = self.parse_and(input)?;
        loop {
            let trimmed = rest.trim_start();
            if let Some(next) = trimmed.strip_prefix("||") {
                let (right, r2) = self.parse_and(next)?;
                left = Value::Bool(left.as_bool() || right.as_bool());
                rest = r2;
            } else {
                return Some((left, rest));
            }
        }
    }
}

fn compare(left: &Value, right: &Value, op: &str) -> Option<bool> {
    match op {
        "==" => Some(left == right),
        "!=" => Some(left != right),
        _ => {
            let l = left.as_f64()?;
            let r = right.as_f64()?;
            Some(match op {
                "<" => l < r,
                "<=" => l <= r,
                ">" => l > r,
                ">=" => l >= r,
                _ => unreachable!(),
            })
        }
    }
}
