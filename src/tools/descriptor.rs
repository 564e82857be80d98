//! Microtool descriptors.
//!
//! A microtool is a tool defined by a plain JSON file in one of the
//! `MICROTOOL_DIRS` directories (or referenced by a plugin manifest's
//! `entry`). Exactly one backing is declared per descriptor:
//!
//! - `command`: an argv template run as a child process; `${var}` entries are
//!   substituted from the call arguments and the tool returns
//!   `{stdout, stderr, exit_code}`.
//! - `steps`: an inline step template behaving like a `templates.json` entry.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::context::RunContext;
use crate::tools::templates::{TemplateDef, TemplateTool, substitute_vars};
use crate::tools::{Tool, ToolError};

/// A parsed descriptor file.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub command: Option<CommandSpec>,
    #[serde(default)]
    pub steps: Option<Vec<Value>>,
}

/// Child-process backing for a descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_command_timeout")]
    pub timeout_s: u64,
}

fn default_command_timeout() -> u64 {
    20
}

/// Parse one descriptor file and materialize it into a tool.
pub fn load_descriptor(path: &Path) -> Result<(ToolDescriptor, std::sync::Arc<dyn Tool>), ToolError> {
    let raw = std::fs::read_to_string(path)?;
    let descriptor: ToolDescriptor = serde_json::from_str(&raw)?;
    let tool = materialize(&descriptor)?;
    Ok((descriptor, tool))
}

/// Build the tool for a descriptor.
pub fn materialize(descriptor: &ToolDescriptor) -> Result<std::sync::Arc<dyn Tool>, ToolError> {
    match (&descriptor.command, &descriptor.steps) {
        (Some(command), None) => Ok(std::sync::Arc::new(CommandTool {
            name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            command: command.clone(),
        })),
        (None, Some(steps)) => Ok(std::sync::Arc::new(TemplateTool::new(
            descriptor.name.clone(),
            TemplateDef {
                description: descriptor.description.clone(),
                steps: steps.clone(),
            },
        ))),
        _ => Err(ToolError::InvalidParameters(format!(
            "descriptor '{}' must declare exactly one of 'command' or 'steps'",
            descriptor.name
        ))),
    }
}

/// A descriptor-defined tool that shells out to a child process.
pub struct CommandTool {
    name: String,
    description: String,
    command: CommandSpec,
}

#[async_trait]
impl Tool for CommandTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, args: Value, _ctx: &RunContext) -> Result<Value, ToolError> {
        let argv: Vec<String> = self
            .command
            .args
            .iter()
            .map(|a| match substitute_vars(&Value::String(a.clone()), &args) {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect();

        let mut cmd = tokio::process::Command::new(&self.command.program);
        cmd.args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn()?;
        let timeout = Duration::from_secs(self.command.timeout_s.max(1));
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ToolError::Timeout(timeout))??;

        Ok(json!({
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
            "exit_code": output.status.code(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_tool_substitutes_and_captures_stdout() {
        let tool = CommandTool {
            name: "greet".into(),
            description: String::new(),
            command: CommandSpec {
                program: "echo".into(),
                args: vec!["hello".into(), "${who}".into()],
                timeout_s: 5,
            },
        };
        let out = tool
            .run(json!({"who": "world"}), &RunContext::default())
            .await
            .unwrap();
        assert_eq!(out["exit_code"], 0);
        assert_eq!(out["stdout"].as_str().unwrap().trim(), "hello world");
    }

    #[tokio::test]
    async fn command_tool_times_out() {
        let tool = CommandTool {
            name: "sleepy".into(),
            description: String::new(),
            command: CommandSpec {
                program: "sleep".into(),
                args: vec!["5".into()],
                timeout_s: 1,
            },
        };
        let err = tool.run(json!({}), &RunContext::default()).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }

    #[test]
    fn descriptor_requires_exactly_one_backing() {
        let both: ToolDescriptor = serde_json::from_value(json!({
            "name": "bad",
            "command": {"program": "true"},
            "steps": []
        }))
        .unwrap();
        assert!(materialize(&both).is_err());

        let neither: ToolDescriptor = serde_json::from_value(json!({"name": "bad"})).unwrap();
        assert!(materialize(&neither).is_err());
    }

    #[tokio::test]
    async fn step_descriptor_behaves_like_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fetch.json");
        std::fs::write(
            &path,
            r#"{"name": "fetch_pair", "steps": [{"tool": "web_fetch", "args": {"url": "${url}"}}]}"#,
        )
        .unwrap();
        let (descriptor, tool) = load_descriptor(&path).unwrap();
        assert_eq!(descriptor.name, "fetch_pair");
        let out = tool
            .run(json!({"url": "https://x.test"}), &RunContext::default())
            .await
            .unwrap();
        assert_eq!(out["steps"][0]["args"]["url"], "https://x.test");
    }
}
