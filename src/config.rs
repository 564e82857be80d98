//! Configuration for the runtime.
//!
//! `Config::from_env()` captures the settings that are fixed for the lifetime
//! of a [`Runtime`](crate::Runtime): store path, discovery sources, planner
//! endpoint. Policy, HITL, reflection and planning-expansion switches are
//! deliberately *not* captured here: those subsystems re-read the
//! environment on every call so tests and operators can toggle them at
//! runtime.

use std::env;

use crate::error::ConfigError;

/// Read an optional environment variable, treating empty as unset.
pub fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(v) if v.is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode(key.to_string())),
    }
}

/// Boolean flag semantics shared across the runtime: "1", "true" and "yes"
/// (case-insensitive) are truthy; anything else is falsy.
pub fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

/// Split a separator-delimited env var into non-empty trimmed entries.
pub fn env_list(key: &str, sep: char) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(sep)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse an optional numeric env var; unparseable values read as `None`.
pub fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Serializes tests that mutate process environment variables.
///
/// `std::env::set_var` is process-global; concurrent test threads that flip
/// policy/HITL flags must hold this lock for the duration of the test.
pub static ENV_MUTEX: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

/// Main configuration for the runtime.
#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub registry: RegistryConfig,
    pub planner: PlannerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Ok(Self {
            store: StoreConfig::from_env()?,
            registry: RegistryConfig::from_env()?,
            planner: PlannerConfig::from_env()?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            registry: RegistryConfig::default(),
            planner: PlannerConfig::default(),
        }
    }
}

/// Durable store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite database path. The parent directory is created on open.
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: "data/agent.sqlite3".into(),
        }
    }
}

impl StoreConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            db_path: optional_env("AGENT_DB")?.unwrap_or_else(|| Self::default().db_path),
        })
    }
}

/// Tool discovery configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Register the built-in `mcp.*` adapter family.
    pub enable_mcp: bool,
    /// Re-run file-based discovery sources when the remote config changes.
    pub hot_reload: bool,
    /// Directories scanned for microtool descriptor files.
    pub microtool_dirs: Vec<String>,
    /// Roots of the plugin-manifest tree (subdirs holding `plugin.json`).
    pub plugin_dirs: Vec<String>,
    /// Remote tools config file, if any.
    pub remote_config: Option<String>,
    /// Step template file.
    pub templates_path: String,
    /// Usage-ledger file.
    pub manifest_path: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enable_mcp: true,
            hot_reload: false,
            microtool_dirs: vec!["tools".into()],
            plugin_dirs: vec!["plugins".into()],
            remote_config: None,
            templates_path: "data/templates.json".into(),
            manifest_path: "data/tools_manifest.json".into(),
        }
    }
}

impl RegistryConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let microtool_dirs = match optional_env("MICROTOOL_DIRS")? {
            Some(raw) => raw
                .split(':')
                .map(str::to_string)
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.microtool_dirs,
        };
        let plugin_dirs = match optional_env("PLUGIN_DIRS")? {
            Some(raw) => raw
                .split(':')
                .map(str::to_string)
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.plugin_dirs,
        };
        Ok(Self {
            enable_mcp: env_flag("ENABLE_MCP", true),
            hot_reload: env_flag("TOOL_HOT_RELOAD", false),
            microtool_dirs,
            plugin_dirs,
            remote_config: optional_env("REMOTE_TOOLS_CONFIG")?,
            templates_path: optional_env("TEMPLATES_PATH")?.unwrap_or(defaults.templates_path),
            manifest_path: optional_env("TOOLS_MANIFEST_PATH")?.unwrap_or(defaults.manifest_path),
        })
    }
}

/// Planner configuration.
#[derive(Debug, Clone, Default)]
pub struct PlannerConfig {
    /// Ollama-compatible endpoint; `None` disables the LLM attempt entirely.
    pub ollama_host: Option<String>,
    /// Model passed to the endpoint.
    pub ollama_model: Option<String>,
}

impl PlannerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            ollama_host: optional_env("OLLAMA_HOST")?,
            ollama_model: optional_env("OLLAMA_MODEL")?,
        })
    }
}
