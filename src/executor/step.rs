//! Step records: parsing and validation of raw plan entries.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PlanError;

fn default_args() -> Value {
    Value::Object(serde_json::Map::new())
}

fn default_timeout_s() -> u64 {
    20
}

fn default_retries() -> u32 {
    1
}

/// One planned tool invocation with its control policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Registry name; resolved at execution time.
    pub tool: String,
    /// Named arguments passed to the tool.
    #[serde(default = "default_args")]
    pub args: Value,
    /// Upstream tool names that must complete first. A name matching several
    /// upstream steps means all of them; a name matching none is a no-op.
    #[serde(default)]
    pub depends_on: Option<Vec<String>>,
    /// Cache TTL in seconds; 0 disables caching for this step.
    #[serde(default)]
    pub ttl_s: u64,
    /// Alternate tool tried once after the last failed attempt.
    #[serde(default)]
    pub fallback_tool: Option<String>,
    /// Wall-clock limit per attempt.
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    /// Total attempts, not additional ones.
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Step {
    pub fn deps(&self) -> &[String] {
        self.depends_on.as_deref().unwrap_or(&[])
    }

    fn validate(&self, index: usize) -> Result<(), PlanError> {
        if self.tool.trim().is_empty() {
            return Err(PlanError::InvalidStep {
                index,
                reason: "tool name is empty".into(),
            });
        }
        if self.timeout_s == 0 {
            return Err(PlanError::InvalidStep {
                index,
                reason: "timeout_s must be positive".into(),
            });
        }
        if self.retries == 0 {
            return Err(PlanError::InvalidStep {
                index,
                reason: "retries must be at least 1 (total attempts)".into(),
            });
        }
        if !self.args.is_object() {
            return Err(PlanError::InvalidStep {
                index,
                reason: "args must be an object".into(),
            });
        }
        Ok(())
    }
}

/// Parse and validate a raw plan.
pub fn parse_steps(raw: &[Value]) -> Result<Vec<Step>, PlanError> {
    raw.iter()
        .enumerate()
        .map(|(index, value)| {
            let step: Step =
                serde_json::from_value(value.clone()).map_err(|e| PlanError::InvalidStep {
                    index,
                    reason: e.to_string(),
                })?;
            step.validate(index)?;
            Ok(step)
        })
        .collect()
}

/// A plan is multi-phase when it has more than one step or any dependency;
/// multi-phase plans are what the HITL barrier gates.
pub fn is_multi_phase(steps: &[Step]) -> bool {
    steps.len() > 1 || steps.iter().any(|s| !s.deps().is_empty())
}
