//! Tool trait and types.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::context::RunContext;

/// Error type for tool execution.
///
/// Display strings for the sandbox variants double as the stable error kinds
/// recorded in trace events.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("sandbox_timeout after {0:?}")]
    SandboxTimeout(Duration),

    #[error("sandbox_error:{kind}:{message}")]
    Sandbox { kind: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ToolError {
    /// Stable kind string for trace events and roll-ups.
    pub fn kind(&self) -> String {
        match self {
            Self::InvalidParameters(..) => "invalid_parameters".into(),
            Self::ExecutionFailed(..) => "execution_failed".into(),
            Self::Timeout(..) => "timeout".into(),
            Self::ExternalService(..) => "external_service".into(),
            Self::SandboxTimeout(..) => "sandbox_timeout".into(),
            Self::Sandbox { kind, .. } => format!("sandbox_error:{kind}"),
            Self::Io(..) => "io".into(),
            Self::Http(..) => "http".into(),
            Self::Json(..) => "json".into(),
        }
    }
}

/// Trait for tools the executor can schedule.
///
/// `run` takes a JSON object of named arguments and returns a JSON object.
/// Implementations must be cheap to share behind `Arc<dyn Tool>`; per-call
/// state belongs in `args` or the store, not in `self`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique registry key.
    fn name(&self) -> &str;

    /// What the tool does; surfaced to planners and the usage ledger.
    fn description(&self) -> &str {
        ""
    }

    /// JSON Schema for the accepted arguments, if the tool declares one.
    fn input_schema(&self) -> Option<Value> {
        None
    }

    /// Execute with the given arguments and ambient context.
    async fn run(&self, args: Value, ctx: &RunContext) -> Result<Value, ToolError>;
}

/// Extract a required string parameter from a JSON object.
///
/// Returns `ToolError::InvalidParameters` if the key is missing or not a string.
pub fn require_str<'a>(args: &'a Value, name: &str) -> Result<&'a str, ToolError> {
    args.get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{}' parameter", name)))
}

/// Extract an optional u64 parameter, falling back to `default`.
pub fn optional_u64(args: &Value, name: &str, default: u64) -> u64 {
    args.get(name).and_then(|v| v.as_u64()).unwrap_or(default)
}
