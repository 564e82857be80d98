//! Human-in-the-loop approval barrier.
//!
//! Approval is a filesystem token: the runtime logs `hitl:await` and polls
//! for the token file once per second, consuming it when it appears. The
//! wait is unbounded; the operator (or hosting UI) creates the file to
//! approve the phase. `HITL_DEFAULT` (default true) gates multi-phase plans;
//! `HITL_PER_STEP` additionally gates each step.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;

use crate::config::env_flag;
use crate::context::RunContext;
use crate::store::Store;

use super::step::Step;

/// Where the approval token lives: `HITL_TOKEN` (absolute), or relative to
/// `LOCAL_ROOT`.
fn token_path() -> PathBuf {
    let token = std::env::var("HITL_TOKEN").unwrap_or_else(|_| "/run/hitl.ok".into());
    let token = PathBuf::from(token);
    if token.is_absolute() {
        token
    } else {
        let root = std::env::var("LOCAL_ROOT").unwrap_or_else(|_| ".".into());
        PathBuf::from(root).join(token)
    }
}

/// Whether multi-phase plans require approval at all.
pub fn hitl_enabled() -> bool {
    env_flag("HITL_DEFAULT", true)
}

/// Whether each individual step is additionally gated.
pub fn per_step_enabled() -> bool {
    env_flag("HITL_PER_STEP", false)
}

/// Block until the operator approves `phase`. No-op when HITL is off.
pub async fn await_approval(store: &Store, ctx: &RunContext, phase: &str, steps: &[Step]) {
    if !hitl_enabled() {
        return;
    }
    let names: Vec<&str> = steps.iter().map(|s| s.tool.as_str()).collect();
    if let Err(err) = store.log_event(
        &ctx.trace_id,
        "decision",
        "hitl:await",
        &json!({ "phase": phase, "steps": names }),
    ) {
        tracing::warn!(error = %err, "hitl event write failed");
    }

    let path = token_path();
    tracing::info!(%phase, token = %path.display(), "awaiting human approval");
    loop {
        if path.exists() {
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::warn!(token = %path.display(), error = %err, "could not consume approval token");
            }
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ENV_MUTEX;
    use crate::executor::step::parse_steps;

    #[tokio::test]
    async fn disabled_hitl_returns_immediately() {
        let _guard = ENV_MUTEX.lock();
        unsafe { std::env::set_var("HITL_DEFAULT", "false") };
        let store = Store::open_in_memory().unwrap();
        let ctx = RunContext::default();
        // Must not block and must not log.
        await_approval(&store, &ctx, "phase:plan_review", &[]).await;
        unsafe { std::env::remove_var("HITL_DEFAULT") };
        assert!(store.recent_events(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn waits_for_token_and_consumes_it() {
        let _guard = ENV_MUTEX.lock();
        let dir = tempfile::tempdir().unwrap();
        let token = dir.path().join("hitl.ok");
        unsafe {
            std::env::set_var("HITL_DEFAULT", "true");
            std::env::set_var("HITL_TOKEN", token.display().to_string());
        }

        let store = std::sync::Arc::new(Store::open_in_memory().unwrap());
        let trace = store.start_trace(None).unwrap();
        let ctx = RunContext::new(None, trace.clone(), vec![]);
        let steps = parse_steps(&[serde_json::json!({"tool": "a"})]).unwrap();

        // Token already present: returns promptly and removes the file.
        std::fs::write(&token, "ok").unwrap();
        await_approval(&store, &ctx, "phase:wave_start", &steps).await;
        assert!(!token.exists());

        let events = store.events_for_trace(&trace).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].role, "hitl:await");
        assert_eq!(events[0].payload["phase"], "phase:wave_start");
        assert_eq!(events[0].payload["steps"][0], "a");

        unsafe {
            std::env::remove_var("HITL_DEFAULT");
            std::env::remove_var("HITL_TOKEN");
        }
    }

    #[test]
    fn relative_token_joins_local_root() {
        let _guard = ENV_MUTEX.lock();
        unsafe {
            std::env::set_var("HITL_TOKEN", "approvals/go.ok");
            std::env::set_var("LOCAL_ROOT", "/var/agent");
        }
        assert_eq!(token_path(), PathBuf::from("/var/agent/approvals/go.ok"));
        unsafe {
            std::env::set_var("HITL_TOKEN", "/run/custom.ok");
        }
        assert_eq!(token_path(), PathBuf::from("/run/custom.ok"));
        unsafe {
            std::env::remove_var("HITL_TOKEN");
            std::env::remove_var("LOCAL_ROOT");
        }
    }
}
