//! Reflection checkpoint after the main DAG.
//!
//! All switches are read per call: `ENABLE_REFLECTION` turns the checkpoint
//! on, `REPLAN_ON_EMPTY` bootstraps a default step when nothing was
//! produced, and `ESCALATE_ON_FAILURE` hands the prompt to `agent.delegate`
//! when at least half of the attempted steps failed.

use serde_json::{Value, json};

use crate::config::env_flag;
use crate::store::Store;

/// Decide whether to append a tail phase. Returns raw steps; empty means no
/// replan.
pub fn maybe_replan(
    store: &Store,
    trace_id: &str,
    prompt: &str,
    outputs: usize,
    failed: usize,
) -> Vec<Value> {
    if !env_flag("ENABLE_REFLECTION", false) {
        return Vec::new();
    }
    log(store, trace_id, "reflect:checkpoint", json!({"num_outputs": outputs}));

    if env_flag("REPLAN_ON_EMPTY", false) && outputs == 0 {
        log(store, trace_id, "reflect:replan", json!({"reason": "empty_outputs"}));
        return vec![json!({"tool": "web_fetch", "args": {"url": "https://example.com"}})];
    }

    let attempted = outputs + failed;
    if env_flag("ESCALATE_ON_FAILURE", false) && failed >= 1 && failed * 2 >= attempted {
        log(store, trace_id, "reflect:escalate", json!({"failures": failed}));
        return vec![json!({
            "tool": "agent.delegate",
            "args": { "prompt": prompt, "tags": ["escalated"] }
        })];
    }
    Vec::new()
}

fn log(store: &Store, trace_id: &str, role: &str, payload: Value) {
    if let Err(err) = store.log_event(trace_id, "decision", role, &payload) {
        tracing::warn!(%role, error = %err, "reflection event write failed");
    }
}
