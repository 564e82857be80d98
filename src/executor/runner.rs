//! Per-step execution: policy gate, cache, attempt loop with backoff,
//! sandbox routing, and fallback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::context::RunContext;
use crate::error::ExecError;
use crate::metrics::Metrics;
use crate::policy::{PolicyEngine, is_risky_tool};
use crate::sandbox::SandboxRunner;
use crate::store::Store;
use crate::tools::manifest::ToolManifest;
use crate::tools::{Registry, Tool, ToolError};

use super::step::Step;

/// Backoff before attempt `i+1`: exponential with base 1.5, capped at 5 s.
fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1.5_f64.powi(attempt.saturating_sub(1) as i32).min(5.0);
    Duration::from_secs_f64(secs)
}

/// SHA-256 over a canonical (recursively key-sorted) JSON encoding.
pub fn args_hash(args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(args));
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Result of a successfully completed step. `tool` is the tool that actually
/// produced the output, which differs from the step's tool after a fallback.
#[derive(Debug, Clone)]
pub struct StepSuccess {
    pub tool: String,
    pub output: Value,
}

/// Borrowed view of the runtime's singletons for one `execute_steps` call.
pub(crate) struct StepRunner<'a> {
    pub store: &'a Store,
    pub metrics: &'a Metrics,
    pub policy: &'a PolicyEngine,
    pub registry: &'a Registry,
    pub sandbox: &'a dyn SandboxRunner,
    pub manifest: &'a ToolManifest,
}

impl StepRunner<'_> {
    fn log(&self, ctx: &RunContext, role: &str, payload: Value) {
        if let Err(err) = self.store.log_event(&ctx.trace_id, "decision", role, &payload) {
            tracing::warn!(%role, error = %err, "trace event write failed");
        }
    }

    /// Drive one step through the policy → cache → attempts → fallback
    /// machine.
    pub async fn run_step(
        &self,
        step: &Step,
        tool: Arc<dyn Tool>,
        ctx: &RunContext,
    ) -> Result<StepSuccess, ExecError> {
        self.policy.check_tool_allowed(&step.tool, &step.args)?;

        let hash = args_hash(&step.args);
        if step.ttl_s > 0 {
            if let Some(output) = self.cache_lookup(step, &hash, ctx) {
                return Ok(StepSuccess {
                    tool: step.tool.clone(),
                    output,
                });
            }
        }

        let timeout = Duration::from_secs(step.timeout_s);
        let mut last_err: Option<ToolError> = None;
        for attempt in 1..=step.retries.max(1) {
            let started = Instant::now();
            let result = if is_risky_tool(&step.tool) {
                self.sandbox
                    .run(tool.clone(), step.args.clone(), ctx, timeout)
                    .await
            } else {
                match tokio::time::timeout(timeout, tool.run(step.args.clone(), ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(ToolError::Timeout(timeout)),
                }
            };
            let elapsed_ms = started.elapsed().as_millis() as f64;

            match result {
                Ok(output) => {
                    if let Err(denied) = self.policy.enforce_output_limits(&step.tool, &output) {
                        // An oversized output will not shrink on retry.
                        self.metrics.tool_calls_total.inc(&[step.tool.as_str(), "false"]);
                        self.metrics
                            .tool_latency_ms
                            .observe(&[step.tool.as_str()], elapsed_ms);
                        self.log(
                            ctx,
                            "tool:result",
                            json!({
                                "tool": &step.tool, "success": false,
                                "error": denied.kind(), "attempt": attempt,
                            }),
                        );
                        self.manifest.register_usage(&step.tool, false);
                        return Err(denied.into());
                    }
                    self.metrics.tool_calls_total.inc(&[step.tool.as_str(), "true"]);
                    self.metrics
                        .tool_latency_ms
                        .observe(&[step.tool.as_str()], elapsed_ms);
                    if step.ttl_s > 0 {
                        self.cache_store(step, &hash, &output);
                    }
                    self.manifest.register_usage(&step.tool, true);
                    self.log(
                        ctx,
                        "tool:result",
                        json!({ "tool": &step.tool, "success": true }),
                    );
                    return Ok(StepSuccess {
                        tool: step.tool.clone(),
                        output,
                    });
                }
                Err(err) => {
                    self.metrics.tool_calls_total.inc(&[step.tool.as_str(), "false"]);
                    self.metrics
                        .tool_latency_ms
                        .observe(&[step.tool.as_str()], elapsed_ms);
                    self.log(
                        ctx,
                        "tool:result",
                        json!({
                            "tool": &step.tool, "success": false,
                            "error": err.kind(), "msg": err.to_string(), "attempt": attempt,
                        }),
                    );
                    self.log(
                        ctx,
                        "executor:error",
                        json!({
                            "tool": &step.tool,
                            "error": err.kind(), "msg": err.to_string(), "attempt": attempt,
                        }),
                    );
                    last_err = Some(err);
                    if attempt < step.retries {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        if let Some(fallback) = &step.fallback_tool {
            if let Some(success) = self.try_fallback(step, fallback, ctx).await {
                return Ok(success);
            }
        }

        self.manifest.register_usage(&step.tool, false);
        Err(ExecError::ToolFailed {
            name: step.tool.clone(),
            attempts: step.retries.max(1),
            source: last_err
                .unwrap_or_else(|| ToolError::ExecutionFailed("tool_failed".into())),
        })
    }

    fn cache_lookup(&self, step: &Step, hash: &str, ctx: &RunContext) -> Option<Value> {
        match self.store.cache_get(&step.tool, hash) {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(output) => {
                    self.metrics
                        .cache_lookups_total
                        .inc(&[step.tool.as_str(), "true"]);
                    self.log(ctx, "executor:cache_hit", json!({ "tool": &step.tool }));
                    Some(output)
                }
                Err(err) => {
                    tracing::warn!(tool = %step.tool, error = %err, "cached value unreadable, treating as miss");
                    self.metrics
                        .cache_lookups_total
                        .inc(&[step.tool.as_str(), "false"]);
                    None
                }
            },
            Ok(None) => {
                self.metrics
                    .cache_lookups_total
                    .inc(&[step.tool.as_str(), "false"]);
                None
            }
            Err(err) => {
                tracing::warn!(tool = %step.tool, error = %err, "cache read failed, treating as miss");
                self.metrics
                    .cache_lookups_total
                    .inc(&[step.tool.as_str(), "false"]);
                None
            }
        }
    }

    fn cache_store(&self, step: &Step, hash: &str, output: &Value) {
        let Ok(raw) = serde_json::to_string(output) else {
            return;
        };
        if let Err(err) = self.store.cache_put(&step.tool, hash, &raw, step.ttl_s) {
            tracing::warn!(tool = %step.tool, error = %err, "cache write failed");
        }
    }

    /// One fallback attempt under the same timeout; never sandboxed, never
    /// retried. `None` means the fallback also failed.
    async fn try_fallback(
        &self,
        step: &Step,
        fallback: &str,
        ctx: &RunContext,
    ) -> Option<StepSuccess> {
        let tool = match self.registry.get(fallback) {
            Ok(tool) => tool,
            Err(err) => {
                self.log(
                    ctx,
                    "executor:fallback_error",
                    json!({ "from": &step.tool, "to": fallback, "error": "tool_not_found" }),
                );
                tracing::warn!(from = %step.tool, to = %fallback, error = %err, "fallback tool missing");
                return None;
            }
        };

        let timeout = Duration::from_secs(step.timeout_s);
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, tool.run(step.args.clone(), ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout(timeout)),
        };
        let elapsed_ms = started.elapsed().as_millis() as f64;

        match result {
            Ok(output) => {
                if let Err(denied) = self.policy.enforce_output_limits(fallback, &output) {
                    self.log(
                        ctx,
                        "executor:fallback_error",
                        json!({ "from": &step.tool, "to": fallback, "error": denied.kind() }),
                    );
                    return None;
                }
                self.metrics.tool_calls_total.inc(&[fallback, "true"]);
                self.metrics.tool_latency_ms.observe(&[fallback], elapsed_ms);
                self.manifest.register_usage(fallback, true);
                self.log(
                    ctx,
                    "executor:fallback",
                    json!({ "from": &step.tool, "to": fallback }),
                );
                Some(StepSuccess {
                    tool: fallback.to_string(),
                    output,
                })
            }
            Err(err) => {
                self.metrics.tool_calls_total.inc(&[fallback, "false"]);
                self.metrics.tool_latency_ms.observe(&[fallback], elapsed_ms);
                self.log(
                    ctx,
                    "executor:fallback_error",
                    json!({ "from": &step.tool, "to": fallback, "error": err.kind() }),
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::config::RegistryConfig;
    use crate::sandbox::TaskSandbox;

    /// Mock tool that fails a configurable number of times, then succeeds.
    struct FailNThenSucceed {
        name: &'static str,
        calls: AtomicU32,
        failures: u32,
    }

    impl FailNThenSucceed {
        fn new(name: &'static str, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicU32::new(0),
                failures,
            })
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Tool for FailNThenSucceed {
        fn name(&self) -> &str {
            self.name
        }
        async fn run(&self, _args: Value, _ctx: &RunContext) -> Result<Value, ToolError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(ToolError::ExecutionFailed(format!("failure {n}")))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    struct Fixture {
        store: Arc<Store>,
        metrics: Arc<Metrics>,
        policy: PolicyEngine,
        registry: Registry,
        sandbox: TaskSandbox,
        manifest: ToolManifest,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(Store::open_in_memory().unwrap());
            let metrics = Arc::new(Metrics::new());
            let config = RegistryConfig {
                manifest_path: dir.path().join("m.json").display().to_string(),
                microtool_dirs: vec![],
                plugin_dirs: vec![],
                ..RegistryConfig::default()
            };
            let registry = Registry::new(
                config,
                store.clone(),
                metrics.clone(),
                reqwest::Client::new(),
            );
            let manifest = ToolManifest::new(dir.path().join("usage.json"));
            Self {
                policy: PolicyEngine::new(store.clone()),
                store,
                metrics,
                registry,
                sandbox: TaskSandbox,
                manifest,
                _dir: dir,
            }
        }

        fn runner(&self) -> StepRunner<'_> {
            StepRunner {
                store: self.store.as_ref(),
                metrics: self.metrics.as_ref(),
                policy: &self.policy,
                registry: &self.registry,
                sandbox: &self.sandbox,
                manifest: &self.manifest,
            }
        }

        fn ctx(&self) -> RunContext {
            let trace = self.store.start_trace(None).unwrap();
            RunContext::new(Some("th".into()), trace, vec![])
        }

        fn roles(&self, ctx: &RunContext) -> Vec<String> {
            self.store
                .events_for_trace(&ctx.trace_id)
                .unwrap()
                .into_iter()
                .map(|e| e.role)
                .collect()
        }
    }

    fn step(value: Value) -> Step {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn retry_then_succeed() {
        let _guard = crate::config::ENV_MUTEX.lock();
        let fixture = Fixture::new();
        let tool = FailNThenSucceed::new("flaky", 1);
        let ctx = fixture.ctx();

        let result = fixture
            .runner()
            .run_step(
                &step(json!({"tool": "flaky", "args": {}, "retries": 2, "timeout_s": 5})),
                tool.clone(),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(result.output, json!({"ok": true}));
        assert_eq!(tool.call_count(), 2);
        assert_eq!(fixture.metrics.tool_calls_total.get(&["flaky", "false"]), 1);
        assert_eq!(fixture.metrics.tool_calls_total.get(&["flaky", "true"]), 1);
        assert_eq!(fixture.metrics.tool_latency_ms.count(&["flaky"]), 2);

        let events = fixture.store.events_for_trace(&ctx.trace_id).unwrap();
        let failures: Vec<_> = events
            .iter()
            .filter(|e| e.role == "tool:result" && e.payload["success"] == false)
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].payload["attempt"], 1);
        assert_eq!(
            events
                .iter()
                .filter(|e| e.role == "tool:result" && e.payload["success"] == true)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_last_error() {
        let _guard = crate::config::ENV_MUTEX.lock();
        let fixture = Fixture::new();
        let tool = FailNThenSucceed::new("doomed", 100);
        let ctx = fixture.ctx();

        let err = fixture
            .runner()
            .run_step(
                &step(json!({"tool": "doomed", "args": {}, "retries": 3, "timeout_s": 5})),
                tool.clone(),
                &ctx,
            )
            .await
            .unwrap_err();

        match err {
            ExecError::ToolFailed { name, attempts, .. } => {
                assert_eq!(name, "doomed");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected ToolFailed, got {other:?}"),
        }
        assert_eq!(tool.call_count(), 3);
        // Exactly N failed tool:result events on terminal failure.
        let events = fixture.store.events_for_trace(&ctx.trace_id).unwrap();
        assert_eq!(
            events
                .iter()
                .filter(|e| e.role == "tool:result" && e.payload["success"] == false)
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn timeout_counts_as_attempt_failure() {
        let _guard = crate::config::ENV_MUTEX.lock();
        struct Slow;
        #[async_trait]
        impl Tool for Slow {
            fn name(&self) -> &str {
                "slow"
            }
            async fn run(&self, _args: Value, _ctx: &RunContext) -> Result<Value, ToolError> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!({}))
            }
        }

        let fixture = Fixture::new();
        let ctx = fixture.ctx();
        let err = fixture
            .runner()
            .run_step(
                &step(json!({"tool": "slow", "args": {}, "timeout_s": 1})),
                Arc::new(Slow),
                &ctx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert_eq!(fixture.metrics.tool_calls_total.get(&["slow", "false"]), 1);
        assert_eq!(fixture.metrics.tool_latency_ms.count(&["slow"]), 1);
    }

    #[tokio::test]
    async fn cache_hit_skips_the_tool() {
        let _guard = crate::config::ENV_MUTEX.lock();
        let fixture = Fixture::new();
        let tool = FailNThenSucceed::new("cached", 0);
        let spec = step(json!({"tool": "cached", "args": {"q": 1}, "ttl_s": 60, "timeout_s": 5}));

        let ctx1 = fixture.ctx();
        fixture
            .runner()
            .run_step(&spec, tool.clone(), &ctx1)
            .await
            .unwrap();
        assert_eq!(tool.call_count(), 1);

        let ctx2 = fixture.ctx();
        let result = fixture
            .runner()
            .run_step(&spec, tool.clone(), &ctx2)
            .await
            .unwrap();
        assert_eq!(result.output, json!({"ok": true}));
        assert_eq!(tool.call_count(), 1, "second run must be served from cache");

        let roles = fixture.roles(&ctx2);
        assert!(roles.contains(&"executor:cache_hit".to_string()));
        assert!(!roles.contains(&"tool:result".to_string()));
        assert_eq!(fixture.metrics.cache_lookups_total.get(&["cached", "true"]), 1);
        assert_eq!(fixture.metrics.cache_lookups_total.get(&["cached", "false"]), 1);
    }

    #[tokio::test]
    async fn ttl_zero_disables_caching() {
        let _guard = crate::config::ENV_MUTEX.lock();
        let fixture = Fixture::new();
        let tool = FailNThenSucceed::new("uncached", 0);
        let spec = step(json!({"tool": "uncached", "args": {}, "ttl_s": 0, "timeout_s": 5}));

        let ctx = fixture.ctx();
        fixture.runner().run_step(&spec, tool.clone(), &ctx).await.unwrap();
        fixture.runner().run_step(&spec, tool.clone(), &ctx).await.unwrap();
        assert_eq!(tool.call_count(), 2);
        assert_eq!(fixture.metrics.cache_lookups_total.get(&["uncached", "false"]), 0);
    }

    #[tokio::test]
    async fn fallback_runs_once_after_exhaustion() {
        let _guard = crate::config::ENV_MUTEX.lock();
        let fixture = Fixture::new();
        fixture
            .registry
            .register(FailNThenSucceed::new("backup", 0));
        let tool = FailNThenSucceed::new("primary", 100);
        let ctx = fixture.ctx();

        let result = fixture
            .runner()
            .run_step(
                &step(json!({
                    "tool": "primary", "args": {}, "retries": 2,
                    "fallback_tool": "backup", "timeout_s": 5
                })),
                tool.clone(),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(result.tool, "backup");
        assert_eq!(tool.call_count(), 2);
        let roles = fixture.roles(&ctx);
        assert!(roles.contains(&"executor:fallback".to_string()));
    }

    #[tokio::test]
    async fn missing_fallback_reports_and_fails() {
        let _guard = crate::config::ENV_MUTEX.lock();
        let fixture = Fixture::new();
        let tool = FailNThenSucceed::new("primary", 100);
        let ctx = fixture.ctx();

        let err = fixture
            .runner()
            .run_step(
                &step(json!({
                    "tool": "primary", "args": {},
                    "fallback_tool": "ghost", "timeout_s": 5
                })),
                tool,
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::ToolFailed { .. }));
        assert!(fixture.roles(&ctx).contains(&"executor:fallback_error".to_string()));
    }

    #[tokio::test]
    async fn policy_denial_prevents_any_attempt() {
        let _guard = crate::config::ENV_MUTEX.lock();
        unsafe {
            std::env::set_var("POLICY_ENGINE_ENABLED", "true");
            std::env::set_var("ALLOWED_TOOLS", "something_else");
        }
        let fixture = Fixture::new();
        let tool = FailNThenSucceed::new("denied", 0);
        let ctx = fixture.ctx();

        let err = fixture
            .runner()
            .run_step(&step(json!({"tool": "denied", "args": {}})), tool.clone(), &ctx)
            .await
            .unwrap_err();
        unsafe {
            std::env::remove_var("POLICY_ENGINE_ENABLED");
            std::env::remove_var("ALLOWED_TOOLS");
        }

        assert_eq!(err.kind(), "tool_not_allowed");
        assert_eq!(tool.call_count(), 0);
        assert!(!fixture.roles(&ctx).contains(&"executor:start".to_string()));
    }

    #[test]
    fn backoff_is_capped_exponential() {
        assert_eq!(backoff_delay(1), Duration::from_secs_f64(1.0));
        assert_eq!(backoff_delay(2), Duration::from_secs_f64(1.5));
        assert_eq!(backoff_delay(3), Duration::from_secs_f64(2.25));
        assert_eq!(backoff_delay(10), Duration::from_secs_f64(5.0));
    }

    #[test]
    fn args_hash_is_order_insensitive() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": [1, 2]}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": [1, 2], "y": 2}, "b": 1}"#).unwrap();
        assert_eq!(args_hash(&a), args_hash(&b));
        let c: Value = serde_json::from_str(r#"{"b": 2, "a": {"y": 2, "x": [1, 2]}}"#).unwrap();
        assert_ne!(args_hash(&a), args_hash(&c));
    }
}
