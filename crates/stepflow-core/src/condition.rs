//! Choice condition evaluation
//!
//! Evaluates a single `{operator, variable, value}` against an execution
//! context. The contract is total: extraction misses, type mismatches and
//! parse failures all yield `false`, never an error.

use serde_json::Value;

use crate::definition::Condition;

/// Evaluate a condition against a JSON context object.
///
/// The variable is a dotted path (an optional `$.` prefix is stripped) and is
/// traversed strictly through object keys; anything else resolves to null.
/// Null-vs-null comparisons are `true` for the equality operators.
pub fn evaluate_condition(condition: &Condition, context: &Value) -> bool {
    let (Some(operator), Some(variable)) = (&condition.operator, &condition.variable) else {
        return false;
    };

    let lhs = lookup(context, variable);
    let rhs = non_null(&condition.value);

    match operator.as_str() {
        "booleanEquals" | "stringEquals" => string_equals(lhs, rhs),
        "numericEquals" => numeric_compare(lhs, rhs, |a, b| (a - b).abs() < 1e-6),
        "numericGreaterThan" => numeric_compare(lhs, rhs, |a, b| a > b),
        "numericLessThan" => numeric_compare(lhs, rhs, |a, b| a < b),
        _ => false,
    }
}

/// Resolve a dotted path against the context.
///
/// Returns `None` when any segment is missing or a non-object is hit before
/// the path is consumed.
fn lookup<'a>(context: &'a Value, variable: &str) -> Option<&'a Value> {
    let path = variable.strip_prefix("$.").unwrap_or(variable);
    let mut current = context;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    non_null(current)
}

fn non_null(value: &Value) -> Option<&Value> {
    match value {
        Value::Null => None,
        other => Some(other),
    }
}

fn string_equals(lhs: Option<&Value>, rhs: Option<&Value>) -> bool {
    match (lhs, rhs) {
        (None, None) => true,
        (Some(a), Some(b)) => to_string_repr(a) == to_string_repr(b),
        _ => false,
    }
}

fn numeric_compare(lhs: Option<&Value>, rhs: Option<&Value>, cmp: fn(f64, f64) -> bool) -> bool {
    match (lhs.and_then(to_f64), rhs.and_then(to_f64)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

fn to_string_repr(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        other => other.to_string(),
    }
}

fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
