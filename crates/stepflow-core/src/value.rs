//! The shallow-merge data-flow operator
//!
//! The input of a step is the input its predecessor received, overlaid with
//! the predecessor's output at the top level. This is the only data-flow
//! contract between states.

use serde_json::Value;

/// Shallow-merge `output` over `previous`.
///
/// Both objects: every top-level key of `output` overwrites the corresponding
/// key of `previous`. A null output leaves `previous` untouched; a non-object
/// output replaces it wholesale. Idempotent in the second argument:
/// `shallow_merge(&shallow_merge(a, b), b) == shallow_merge(a, b)`.
pub fn shallow_merge(previous: &Value, output: &Value) -> Value {
    match (previous, output) {
        (_, Value::Null) => previous.clone(),
        (Value::Object(prev), Value::Object(out)) => {
            let mut merged = prev.clone();
            for (key, value) in out {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => output.clone(),
    }
}
