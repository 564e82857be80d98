//! Remote HTTP tool descriptors.
//!
//! Each entry of the `REMOTE_TOOLS_CONFIG` file materializes into a tool that
//! performs one HTTP call: GET sends the arguments as query parameters, any
//! other method posts them as a JSON body. An optional dot path extracts a
//! sub-value from the response.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::context::RunContext;
use crate::tools::{Tool, ToolError};

/// One entry of the remote tools config.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteToolConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_s: u64,
    #[serde(default)]
    pub result_path: Option<String>,
}

fn default_method() -> String {
    "POST".into()
}

fn default_timeout() -> u64 {
    20
}

/// Parse the config file: either a bare list or `{"tools": [...]}`.
/// Individual malformed entries are skipped with a warning; only an
/// unreadable file is an error.
pub fn parse_remote_config(raw: &str) -> Result<Vec<RemoteToolConfig>, ToolError> {
    let value: Value = serde_json::from_str(raw)?;
    let entries = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("tools") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    Ok(entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value(entry) {
            Ok(config) => Some(config),
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed remote tool entry");
                None
            }
        })
        .collect())
}

/// Walk a `a.b.c` dot path into a JSON value.
fn extract_path(value: Value, path: &str) -> Value {
    let mut current = value;
    for part in path.split('.') {
        current = match current {
            Value::Object(mut map) => map.remove(part).unwrap_or(Value::Null),
            _ => Value::Null,
        };
    }
    current
}

/// A tool backed by a remote HTTP endpoint.
pub struct RemoteTool {
    config: RemoteToolConfig,
    client: reqwest::Client,
}

impl RemoteTool {
    pub fn new(config: RemoteToolConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn description(&self) -> &str {
        "Remote HTTP tool"
    }

    async fn run(&self, args: Value, _ctx: &RunContext) -> Result<Value, ToolError> {
        let timeout = Duration::from_secs(self.config.timeout_s.max(1));
        let mut request = if self.config.method.eq_ignore_ascii_case("GET") {
            let params: Vec<(String, String)> = args
                .as_object()
                .map(|obj| {
                    obj.iter()
                        .map(|(k, v)| {
                            let text = match v {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            (k.clone(), text)
                        })
                        .collect()
                })
                .unwrap_or_default();
            self.client.get(&self.config.url).query(&params)
        } else {
            self.client.post(&self.config.url).json(&args)
        };
        request = request.timeout(timeout);
        if let Some(env_key) = &self.config.api_key_env {
            if let Ok(key) = std::env::var(env_key) {
                if !key.is_empty() {
                    request = request.bearer_auth(key);
                }
            }
        }

        let response = request.send().await?.error_for_status()?;
        let mut data: Value = response.json().await?;
        if let Some(path) = &self.config.result_path {
            data = extract_path(data, path);
        }
        Ok(json!({ "result": data }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_list_and_wrapped_object() {
        let raw = r#"[{"name": "a", "url": "http://x.test"}]"#;
        let tools = parse_remote_config(raw).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].method, "POST");
        assert_eq!(tools[0].timeout_s, 20);

        let raw = r#"{"tools": [{"name": "b", "url": "http://y.test", "method": "GET"}]}"#;
        let tools = parse_remote_config(raw).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].method, "GET");
    }

    #[test]
    fn bad_entries_are_skipped_not_fatal() {
        let raw = r#"[{"url": "missing-name"}, {"name": "good", "url": "http://x.test"}]"#;
        let tools = parse_remote_config(raw).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "good");

        assert!(parse_remote_config("not json").is_err());
    }

    #[test]
    fn dot_path_extraction() {
        let data = json!({"data": {"items": {"first": 42}}});
        assert_eq!(extract_path(data.clone(), "data.items.first"), json!(42));
        assert_eq!(extract_path(data, "data.missing.x"), Value::Null);
    }
}
