//! Step templates registered as pseudo-tools.
//!
//! `templates.json` maps template names to step lists. Each template becomes
//! a tool whose output is `{"steps": [...]}` with `${var}` placeholders
//! substituted from the call arguments; callers (typically the planner or a
//! delegating agent) feed the expanded steps back into the executor.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::context::RunContext;
use crate::tools::{Tool, ToolError};

/// One entry of `templates.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateDef {
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Value>,
}

/// Parse a templates file into `(name, definition)` pairs.
pub fn load_templates(path: &Path) -> Result<Vec<(String, TemplateDef)>, ToolError> {
    let raw = std::fs::read_to_string(path)?;
    let map: BTreeMap<String, TemplateDef> = serde_json::from_str(&raw)?;
    Ok(map.into_iter().collect())
}

/// Substitute `${var}` placeholders in `value` from the fields of `args`.
///
/// A string that is exactly one placeholder is replaced by the argument value
/// itself, preserving its JSON type; placeholders embedded in longer strings
/// are spliced in as text. Unknown variables are left as-is.
pub fn substitute_vars(value: &Value, args: &Value) -> Value {
    match value {
        Value::String(s) => {
            if let Some(var) = s
                .strip_prefix("${")
                .and_then(|rest| rest.strip_suffix('}'))
            {
                if !var.contains("${") {
                    if let Some(replacement) = args.get(var) {
                        return replacement.clone();
                    }
                    return value.clone();
                }
            }
            let mut out = s.clone();
            if let Some(obj) = args.as_object() {
                for (key, val) in obj {
                    let needle = format!("${{{key}}}");
                    if out.contains(&needle) {
                        let text = match val {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        out = out.replace(&needle, &text);
                    }
                }
            }
            Value::String(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_vars(v, args)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_vars(v, args)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// A template materialized as a tool.
pub struct TemplateTool {
    name: String,
    description: String,
    steps: Vec<Value>,
}

impl TemplateTool {
    pub fn new(name: impl Into<String>, def: TemplateDef) -> Self {
        Self {
            name: name.into(),
            description: def.description,
            steps: def.steps,
        }
    }
}

#[async_trait]
impl Tool for TemplateTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, args: Value, _ctx: &RunContext) -> Result<Value, ToolError> {
        let steps: Vec<Value> = self
            .steps
            .iter()
            .map(|s| substitute_vars(s, &args))
            .collect();
        Ok(json!({ "steps": steps }))
    }
}
