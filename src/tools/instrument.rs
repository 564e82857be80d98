//! Instrumentation middleware.
//!
//! Every tool is wrapped at registration time so that each invocation emits
//! `executor:start` immediately before and `executor:done` / `executor:error`
//! immediately after, with elapsed milliseconds and the ambient tags. Event
//! write failures never fail the tool call.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::context::RunContext;
use crate::store::Store;
use crate::tools::{Tool, ToolError};

pub struct Instrumented {
    inner: Arc<dyn Tool>,
    store: Arc<Store>,
}

impl Instrumented {
    pub fn new(inner: Arc<dyn Tool>, store: Arc<Store>) -> Self {
        Self { inner, store }
    }

    fn log(&self, trace_id: &str, role: &str, payload: Value) {
        if let Err(err) = self.store.log_event(trace_id, "decision", role, &payload) {
            tracing::warn!(tool = %self.inner.name(), %role, error = %err, "trace event write failed");
        }
    }
}

#[async_trait]
impl Tool for Instrumented {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn input_schema(&self) -> Option<Value> {
        self.inner.input_schema()
    }

    async fn run(&self, args: Value, ctx: &RunContext) -> Result<Value, ToolError> {
        // A tool invoked outside a run (no open trace) gets its own trace so
        // the events still land somewhere queryable.
        let owned_trace;
        let trace_id = if ctx.trace_id.is_empty() {
            owned_trace = self
                .store
                .start_trace(ctx.thread_id.as_deref())
                .unwrap_or_default();
            owned_trace.as_str()
        } else {
            ctx.trace_id.as_str()
        };

        self.log(
            trace_id,
            "executor:start",
            json!({ "tool": self.inner.name(), "args": &args, "tags": &ctx.tags }),
        );
        let start = Instant::now();
        match self.inner.run(args, ctx).await {
            Ok(output) => {
                self.log(
                    trace_id,
                    "executor:done",
                    json!({
                        "tool": self.inner.name(),
                        "ms": start.elapsed().as_millis() as u64,
                        "ok": true,
                        "tags": &ctx.tags,
                    }),
                );
                Ok(output)
            }
            Err(err) => {
                self.log(
                    trace_id,
                    "executor:error",
                    json!({
                        "tool": self.inner.name(),
                        "ms": start.elapsed().as_millis() as u64,
                        "ok": false,
                        "error": err.kind(),
                        "msg": err.to_string(),
                        "tags": &ctx.tags,
                    }),
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OkTool;

    #[async_trait]
    impl Tool for OkTool {
        fn name(&self) -> &str {
            "ok_tool"
        }
        async fn run(&self, _args: Value, _ctx: &RunContext) -> Result<Value, ToolError> {
            Ok(json!({"done": true}))
        }
    }

    struct FailTool;

    #[async_trait]
    impl Tool for FailTool {
        fn name(&self) -> &str {
            "fail_tool"
        }
        async fn run(&self, _args: Value, _ctx: &RunContext) -> Result<Value, ToolError> {
            Err(ToolError::ExecutionFailed("nope".into()))
        }
    }

    #[tokio::test]
    async fn success_emits_start_and_done() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tool = Instrumented::new(Arc::new(OkTool), store.clone());
        let trace = store.start_trace(None).unwrap();
        let ctx = RunContext::new(None, trace.clone(), vec!["t1".into()]);

        tool.run(json!({}), &ctx).await.unwrap();

        let events = store.events_for_trace(&trace).unwrap();
        let roles: Vec<&str> = events.iter().map(|e| e.role.as_str()).collect();
        assert_eq!(roles, vec!["executor:start", "executor:done"]);
        assert_eq!(events[1].payload["ok"], true);
        assert_eq!(events[0].payload["tags"][0], "t1");
    }

    #[tokio::test]
    async fn failure_emits_error_with_kind() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tool = Instrumented::new(Arc::new(FailTool), store.clone());
        let trace = store.start_trace(None).unwrap();
        let ctx = RunContext::new(None, trace.clone(), vec![]);

        let err = tool.run(json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));

        let events = store.events_for_trace(&trace).unwrap();
        assert_eq!(events[1].role, "executor:error");
        assert_eq!(events[1].payload["error"], "execution_failed");
    }

    #[tokio::test]
    async fn missing_trace_opens_one() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tool = Instrumented::new(Arc::new(OkTool), store.clone());

        tool.run(json!({}), &RunContext::default()).await.unwrap();

        let traces = store.list_recent_traces(10).unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].event_count, 2);
    }
}
