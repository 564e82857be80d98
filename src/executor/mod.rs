//! Executor: DAG scheduling with bounded waves, the HITL barrier, budget
//! gating, and the reflection tail.

mod dag;
mod hitl;
mod runner;
mod step;

pub use runner::{StepSuccess, args_hash};
pub use step::{Step, is_multi_phase, parse_steps};

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use serde::Serialize;
use serde_json::{Value, json};

use crate::budget::BudgetManager;
use crate::config::Config;
use crate::context::RunContext;
use crate::error::{Error, ExecError};
use crate::insights::{Insights, compute_insights};
use crate::metrics::Metrics;
use crate::planner::{Planner, expand::expand_plan, reflection};
use crate::policy::PolicyEngine;
use crate::sandbox::{SandboxRunner, TaskSandbox};
use crate::store::{Store, TraceDetail, TraceSummary};
use crate::tools::builtin::{BuiltinDeps, builtin_tools};
use crate::tools::manifest::ToolManifest;
use crate::tools::{Registry, Tool};

use runner::StepRunner;

/// Concurrent tasks per wave.
const WAVE_PARALLELISM: usize = 4;

/// One completed step in execution order. `tool` is the producing tool,
/// which is the fallback's name when the fallback supplied the output.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutput {
    pub tool: String,
    pub output: Value,
}

/// Result of one `execute_steps` call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub trace_id: String,
    pub outputs: Vec<StepOutput>,
    /// Steps never scheduled because a budget ran out.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub queued: Vec<Step>,
}

/// The assembled runtime: registry, planner, executor and their shared
/// singletons. Construct once per process with [`Runtime::new`].
pub struct Runtime {
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    registry: Arc<Registry>,
    policy: PolicyEngine,
    budget: BudgetManager,
    sandbox: Arc<dyn SandboxRunner>,
    planner: Planner,
    manifest: Arc<ToolManifest>,
}

impl Runtime {
    /// Open the store, build the registry, register built-ins and run
    /// discovery.
    pub async fn new(config: Config) -> Result<Arc<Self>, Error> {
        let store = Arc::new(Store::open(&config.store.db_path)?);
        let metrics = Arc::new(Metrics::new());
        let http = reqwest::Client::new();
        let registry = Arc::new(Registry::new(
            config.registry.clone(),
            store.clone(),
            metrics.clone(),
            http.clone(),
        ));
        let planner = Planner::new(
            config.planner.clone(),
            registry.clone(),
            metrics.clone(),
            http.clone(),
        );
        let manifest = registry.manifest();

        let runtime = Arc::new(Self {
            policy: PolicyEngine::new(store.clone()),
            budget: BudgetManager::from_env(),
            sandbox: Arc::new(TaskSandbox),
            planner,
            manifest,
            registry: registry.clone(),
            metrics,
            store: store.clone(),
        });

        let deps = BuiltinDeps {
            store,
            http,
            runtime: Arc::downgrade(&runtime),
        };
        for tool in builtin_tools(&deps, config.registry.enable_mcp) {
            registry.register_from(tool, Path::new("builtin"), &[], "");
        }
        registry.discover();

        Ok(runtime)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn budget(&self) -> &BudgetManager {
        &self.budget
    }

    /// Prompt → raw steps, without executing them.
    pub async fn plan_steps(&self, prompt: &str) -> Vec<Value> {
        expand_plan(self.planner.plan_steps(prompt).await)
    }

    /// Most recent traces, newest first.
    pub fn list_recent_traces(&self, limit: usize) -> Result<Vec<TraceSummary>, Error> {
        Ok(self.store.list_recent_traces(limit)?)
    }

    /// One trace with its full event history.
    pub fn trace_summary(&self, trace_id: &str) -> Result<Option<TraceDetail>, Error> {
        Ok(self.store.trace_summary(trace_id)?)
    }

    /// Aggregate metrics and recent events into an insights report.
    pub fn compute_insights(&self) -> Result<Insights, Error> {
        Ok(compute_insights(&self.metrics, &self.store)?)
    }

    /// Execute a plan (or plan one from the prompt), returning the trace id
    /// and outputs in completion order.
    ///
    /// The whole schedule is always driven to completion: failed steps skip
    /// their dependents and the reflection tail still runs. If any step
    /// failed terminally the first such error is returned; the durable trace
    /// carries the complete event history either way. Budget exhaustion is
    /// not a failure: the unscheduled remainder comes back in `queued`.
    pub async fn execute_steps(
        &self,
        prompt: &str,
        steps: Option<Vec<Value>>,
        thread_id: Option<String>,
        tags: Vec<String>,
    ) -> Result<ExecutionReport, Error> {
        let trace_id = self.store.start_trace(thread_id.as_deref())?;
        let ctx = RunContext::new(thread_id, trace_id.clone(), tags);

        // Adopt the provided steps, or plan.
        let raw = match steps {
            Some(raw) if !raw.is_empty() => raw,
            _ => {
                let planned = expand_plan(self.planner.plan_steps(prompt).await);
                self.log(&ctx, "planner:proposed", json!({ "steps": &planned }));
                planned
            }
        };

        let parsed = parse_steps(&raw)?;
        for step in &parsed {
            self.log(&ctx, "planner:step", json!({ "step": step }));
        }

        if is_multi_phase(&parsed) {
            hitl::await_approval(&self.store, &ctx, "phase:plan_review", &parsed).await;
        }

        let order = dag::toposort(&parsed);
        let schedule: Vec<Step> = order.into_iter().map(|i| parsed[i].clone()).collect();
        let deps = dag::dependency_edges(&schedule);

        let mut remaining: BTreeSet<usize> = (0..schedule.len()).collect();
        let mut outputs: Vec<StepOutput> = Vec::new();
        let mut queued: Vec<Step> = Vec::new();
        let mut failed_steps: usize = 0;
        let mut first_error: Option<ExecError> = None;

        while !remaining.is_empty() {
            let ready: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&i| deps[i].iter().all(|d| !remaining.contains(d)))
                .collect();

            if ready.is_empty() {
                // Cycle or unresolved dependencies: report and stop.
                for &i in remaining.iter() {
                    self.skip(&ctx, &schedule[i].tool, "blocked");
                }
                remaining.clear();
                break;
            }

            self.registry.reload_if_needed();

            if ready.len() > 1 {
                let wave: Vec<Step> = ready.iter().map(|&i| schedule[i].clone()).collect();
                hitl::await_approval(&self.store, &ctx, "phase:wave_start", &wave).await;
            }

            // Resolve, gate and dispatch the wave.
            let mut dispatch: Vec<(usize, Arc<dyn Tool>)> = Vec::new();
            let mut budget_exhausted = false;
            for &i in &ready {
                let step = &schedule[i];
                if budget_exhausted {
                    self.queue_step(&ctx, i, &schedule, &mut remaining, &mut queued);
                    continue;
                }
                if let Err(err) = self.budget.check_and_decrement(&step.tool, 1, &ctx.tags) {
                    self.log(
                        &ctx,
                        "executor:budget_exceeded",
                        json!({ "tool": &step.tool, "msg": err.to_string() }),
                    );
                    budget_exhausted = true;
                    self.queue_step(&ctx, i, &schedule, &mut remaining, &mut queued);
                    continue;
                }

                let tool = match self.registry.get(&step.tool) {
                    Ok(tool) => tool,
                    Err(err) => {
                        self.log(&ctx, "tool:lookup_error", json!({ "tool": &step.tool }));
                        self.metrics
                            .tool_skipped_total
                            .inc(&[step.tool.as_str(), "not_found"]);
                        failed_steps += 1;
                        let tool_name = step.tool.clone();
                        first_error.get_or_insert(err.into());
                        remaining.remove(&i);
                        self.skip_dependents(&ctx, &tool_name, &schedule, &mut remaining);
                        continue;
                    }
                };

                if hitl::per_step_enabled() {
                    hitl::await_approval(
                        &self.store,
                        &ctx,
                        "phase:step",
                        std::slice::from_ref(step),
                    )
                    .await;
                }
                dispatch.push((i, tool));
            }

            if budget_exhausted {
                // The rest of the schedule waits for a fresh budget; steps
                // already dispatched this wave still run to completion.
                let waiting: Vec<usize> = remaining
                    .iter()
                    .copied()
                    .filter(|j| !dispatch.iter().any(|(d, _)| d == j))
                    .collect();
                for j in waiting {
                    self.queue_step(&ctx, j, &schedule, &mut remaining, &mut queued);
                }
            }

            if dispatch.is_empty() {
                continue;
            }

            let runner = StepRunner {
                store: self.store.as_ref(),
                metrics: self.metrics.as_ref(),
                policy: &self.policy,
                registry: self.registry.as_ref(),
                sandbox: self.sandbox.as_ref(),
                manifest: self.manifest.as_ref(),
            };
            let limit = dispatch.len().min(WAVE_PARALLELISM);
            let mut wave_futures: Vec<
                std::pin::Pin<Box<dyn std::future::Future<Output = (usize, Result<StepSuccess, ExecError>)> + Send + '_>>,
            > = Vec::with_capacity(dispatch.len());
            for (i, tool) in dispatch.into_iter() {
                let runner = &runner;
                let ctx = &ctx;
                let step = &schedule[i];
                wave_futures.push(Box::pin(async move { (i, runner.run_step(step, tool, ctx).await) }));
            }
            let results: Vec<(usize, Result<StepSuccess, ExecError>)> =
                stream::iter(wave_futures).buffer_unordered(limit).collect().await;

            for (i, result) in results {
                remaining.remove(&i);
                match result {
                    Ok(success) => {
                        let output = StepOutput {
                            tool: success.tool,
                            output: success.output,
                        };
                        self.persist_output(&ctx, &output);
                        outputs.push(output);
                    }
                    Err(err) => {
                        failed_steps += 1;
                        let tool_name = schedule[i].tool.clone();
                        tracing::warn!(tool = %tool_name, error = %err, "step failed terminally");
                        first_error.get_or_insert(err);
                        self.skip_dependents(&ctx, &tool_name, &schedule, &mut remaining);
                    }
                }
            }
        }

        // Reflection tail: extra steps run sequentially, failures swallowed.
        let extra = reflection::maybe_replan(
            &self.store,
            &ctx.trace_id,
            prompt,
            outputs.len(),
            failed_steps,
        );
        if !extra.is_empty() {
            self.run_tail(&ctx, &extra, &mut outputs).await;
        }

        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(ExecutionReport {
                trace_id,
                outputs,
                queued,
            }),
        }
    }

    async fn run_tail(&self, ctx: &RunContext, raw: &[Value], outputs: &mut Vec<StepOutput>) {
        let runner = StepRunner {
            store: self.store.as_ref(),
            metrics: self.metrics.as_ref(),
            policy: &self.policy,
            registry: self.registry.as_ref(),
            sandbox: self.sandbox.as_ref(),
            manifest: self.manifest.as_ref(),
        };
        for value in raw {
            let Ok(steps) = parse_steps(std::slice::from_ref(value)) else {
                continue;
            };
            let step = &steps[0];
            let tool = match self.registry.get(&step.tool) {
                Ok(tool) => tool,
                Err(_) => {
                    self.log(ctx, "tool:lookup_error", json!({ "tool": &step.tool }));
                    continue;
                }
            };
            match runner.run_step(step, tool, ctx).await {
                Ok(success) => {
                    let output = StepOutput {
                        tool: success.tool,
                        output: success.output,
                    };
                    self.persist_output(ctx, &output);
                    outputs.push(output);
                }
                Err(err) => {
                    tracing::warn!(tool = %step.tool, error = %err, "reflection step failed");
                }
            }
        }
    }

    /// Persist a step output to the session scratchpad for later recall.
    fn persist_output(&self, ctx: &RunContext, output: &StepOutput) {
        let Ok(blob) = serde_json::to_string(output) else {
            return;
        };
        let key = format!("step:{}", output.tool);
        if let Err(err) = self.store.kv_put(ctx.thread_id.as_deref(), &key, &blob) {
            tracing::warn!(tool = %output.tool, error = %err, "session kv write failed");
        }
    }

    /// Move a pending step into the queued remainder after budget
    /// exhaustion.
    fn queue_step(
        &self,
        ctx: &RunContext,
        index: usize,
        schedule: &[Step],
        remaining: &mut BTreeSet<usize>,
        queued: &mut Vec<Step>,
    ) {
        self.skip(ctx, &schedule[index].tool, "budget");
        queued.push(schedule[index].clone());
        remaining.remove(&index);
    }

    fn skip(&self, ctx: &RunContext, tool: &str, reason: &str) {
        self.metrics.tool_skipped_total.inc(&[tool, reason]);
        self.log(
            ctx,
            "executor:skip",
            json!({ "tool": tool, "reason": reason }),
        );
    }

    /// Drop every pending step that names `failed_tool` in its dependencies.
    fn skip_dependents(
        &self,
        ctx: &RunContext,
        failed_tool: &str,
        schedule: &[Step],
        remaining: &mut BTreeSet<usize>,
    ) {
        let dependents: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&i| schedule[i].deps().iter().any(|d| d == failed_tool))
            .collect();
        for i in dependents {
            self.skip(ctx, &schedule[i].tool, "prior_error");
            remaining.remove(&i);
        }
    }

    fn log(&self, ctx: &RunContext, role: &str, payload: Value) {
        if let Err(err) = self.store.log_event(&ctx.trace_id, "decision", role, &payload) {
            tracing::warn!(%role, error = %err, "trace event write failed");
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("tools", &self.registry.tool_names().len())
            .finish()
    }
}
