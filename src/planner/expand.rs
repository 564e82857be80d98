//! Control-flow expansion of raw plans.
//!
//! Gated by `ADVANCED_PLANNING` (read per call). Conditionals, bounded loops
//! and a once-evaluated while are flattened into a plain step list before
//! validation; anything unrecognized passes through untouched.

use serde_json::Value;

use crate::config::env_flag;

/// JSON truthiness for plan conditions: booleans as-is, numbers ≠ 0,
/// the strings "true"/"1"/"yes"/"always" (case-insensitive), non-empty
/// arrays and objects.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => {
            matches!(s.to_lowercase().as_str(), "true" | "1" | "yes" | "always")
        }
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Null => false,
    }
}

/// Expand `if`/`loop`/`while` nodes recursively. Without `ADVANCED_PLANNING`
/// the plan is returned as-is.
pub fn expand_plan(raw_steps: Vec<Value>) -> Vec<Value> {
    if !env_flag("ADVANCED_PLANNING", false) {
        return raw_steps;
    }
    let mut expanded = Vec::new();
    expand_into(&raw_steps, &mut expanded);
    expanded
}

fn expand_into(steps: &[Value], out: &mut Vec<Value>) {
    for item in steps {
        if let (Some(cond), Some(then)) = (item.get("if"), item.get("then").and_then(Value::as_array))
        {
            if is_truthy(cond) {
                expand_into(then, out);
            } else if let Some(otherwise) = item.get("else").and_then(Value::as_array) {
                expand_into(otherwise, out);
            }
        } else if let (Some(spec), Some(body)) =
            (item.get("while"), item.get("steps").and_then(Value::as_array))
        {
            let cond = spec.get("cond").map(is_truthy).unwrap_or(true);
            let max = spec.get("max").and_then(Value::as_i64).unwrap_or(1).max(0);
            if cond {
                for _ in 0..max {
                    expand_into(body, out);
                }
            }
        } else if let (Some(spec), Some(body)) =
            (item.get("loop"), item.get("steps").and_then(Value::as_array))
        {
            let n = spec
                .get("range")
                .or_else(|| spec.get("times"))
                .and_then(Value::as_i64)
                .unwrap_or(0)
                .max(0);
            for _ in 0..n {
                expand_into(body, out);
            }
        } else {
            out.push(item.clone());
        }
    }
}
