//! Planner: prompt → ordered step list.
//!
//! A local LLM endpoint (Ollama-compatible, `OLLAMA_HOST`) is tried first
//! when configured; any failure at any stage falls through silently to the
//! keyword rules, so the runtime always produces at least one step.

pub mod expand;
pub mod reflection;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::config::PlannerConfig;
use crate::metrics::Metrics;
use crate::tools::Registry;

const LLM_TIMEOUT: Duration = Duration::from_secs(8);
const DEFAULT_MODEL: &str = "llama3.1:8b";

pub struct Planner {
    config: PlannerConfig,
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    http: reqwest::Client,
}

impl Planner {
    pub fn new(
        config: PlannerConfig,
        registry: Arc<Registry>,
        metrics: Arc<Metrics>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config,
            registry,
            metrics,
            http,
        }
    }

    /// Produce raw (unvalidated) steps for a prompt.
    pub async fn plan_steps(&self, prompt: &str) -> Vec<Value> {
        if let Some(host) = self.config.ollama_host.clone() {
            match self.llm_plan(&host, prompt).await {
                Some(steps) => {
                    self.metrics.llm_calls_total.inc(&["ollama", "true"]);
                    return steps;
                }
                None => {
                    self.metrics.llm_calls_total.inc(&["ollama", "false"]);
                }
            }
        }
        rule_based_plan(prompt)
    }

    /// Ask the local model for a JSON step array. `None` on any failure.
    async fn llm_plan(&self, host: &str, prompt: &str) -> Option<Vec<Value>> {
        let tool_list = self.registry.tool_names().join(", ");
        let question = format!(
            "You are a planner. Given a task: '{prompt}', propose a short ordered \
             JSON list of steps using tools from: [{tool_list}]. Each step object \
             must be of the form {{\"tool\": \"...\", \"args\": {{...}}}}."
        );
        let model = self
            .config
            .ollama_model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let url = format!("{}/api/generate", host.trim_end_matches('/'));

        let response = self
            .http
            .post(&url)
            .timeout(LLM_TIMEOUT)
            .json(&json!({ "model": model, "prompt": question, "stream": false }))
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?;
        let body: Value = response.json().await.ok()?;
        let text = body.get("response")?.as_str()?;
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(steps)) => Some(steps),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("ollama_host", &self.config.ollama_host)
            .finish()
    }
}

/// Keyword fallback: always yields at least one step.
pub fn rule_based_plan(prompt: &str) -> Vec<Value> {
    let lowered = prompt.to_lowercase();
    let mut steps = Vec::new();
    if lowered.contains("http") || lowered.contains("url") || lowered.contains("web") {
        steps.push(json!({"tool": "web_fetch", "args": {"url": "https://example.com"}}));
    }
    if lowered.contains(".pdf") {
        steps.push(json!({"tool": "pdf.text", "args": {"path": "./document.pdf"}}));
    }
    if steps.is_empty() {
        steps.push(json!({"tool": "web_fetch", "args": {"url": "https://example.com"}}));
    }
    steps
}
