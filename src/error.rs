//! Error types for the runtime.
//!
//! Each subsystem has its own `thiserror` enum; `Error` is the top-level
//! union callers match on. Display strings double as the stable error kinds
//! surfaced in trace events (`tool_not_allowed`, `rate_limited:http_per_min`,
//! `sandbox_timeout`, ...), so they must not be reworded casually.

use crate::tools::ToolError;

/// Top-level error type for the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Budget error: {0}")]
    Budget(#[from] BudgetError),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Environment variable {0} is not valid unicode")]
    NotUnicode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tool registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tool_not_found: {name}")]
    NotFound { name: String },
}

/// Policy engine denials.
///
/// Display strings are the wire-stable error kinds; `kind()` returns the
/// bare kind for event payloads.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("tool_not_allowed:{name}")]
    ToolNotAllowed { name: String },

    #[error("path_restricted: {path}")]
    PathRestricted { path: String },

    #[error("rate_limited:{scope}")]
    RateLimited { scope: String },

    #[error("output_too_large: {size} bytes exceeds {limit}")]
    OutputTooLarge { size: usize, limit: usize },
}

impl PolicyError {
    /// Stable kind string for trace events and metrics labels.
    pub fn kind(&self) -> String {
        match self {
            Self::ToolNotAllowed { .. } => "tool_not_allowed".into(),
            Self::PathRestricted { .. } => "path_restricted".into(),
            Self::RateLimited { scope } => format!("rate_limited:{scope}"),
            Self::OutputTooLarge { .. } => "output_too_large".into(),
        }
    }
}

/// Budget manager errors.
#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error("budget_exceeded: {scope} at {used}+{amount}/{limit}")]
    Exceeded {
        scope: String,
        limit: u64,
        used: u64,
        amount: u64,
    },
}

/// Plan parsing/validation errors.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("invalid_step at index {index}: {reason}")]
    InvalidStep { index: usize, reason: String },
}

/// Per-step terminal failures surfaced by the executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("tool_not_found: {name}")]
    ToolNotFound { name: String },

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("tool_failed: {name} after {attempts} attempts: {source}")]
    ToolFailed {
        name: String,
        attempts: u32,
        source: ToolError,
    },

    #[error("tool_failed: fallback {name}: {source}")]
    FallbackFailed { name: String, source: ToolError },
}

impl ExecError {
    /// Stable kind string for trace events.
    pub fn kind(&self) -> String {
        match self {
            Self::ToolNotFound { .. } => "tool_not_found".into(),
            Self::Policy(p) => p.kind(),
            Self::ToolFailed { source, .. } | Self::FallbackFailed { source, .. } => source.kind(),
        }
    }
}

impl From<RegistryError> for ExecError {
    fn from(err: RegistryError) -> Self {
        let RegistryError::NotFound { name } = err;
        Self::ToolNotFound { name }
    }
}
