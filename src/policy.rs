//! Policy engine: allowlist, filesystem roots, HTTP rate limiting, output
//! caps, and the risky-tool set.
//!
//! Configuration is read from the environment on every call so operators and
//! tests can toggle enforcement without rebuilding the runtime. With
//! `POLICY_ENGINE_ENABLED` unset or falsy, every check passes.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::config::{env_flag, env_list, env_u64};
use crate::error::PolicyError;
use crate::store::Store;

/// Argument names subject to filesystem root restriction, in check order.
const PATH_ARGS: &[&str] = &["path", "db_path", "repo"];

/// Tools counted against the shared HTTP budget.
fn is_http_tool(name: &str) -> bool {
    name.starts_with("mcp.http.") || name.ends_with("_fetch") || name == "web_fetch"
}

fn enabled() -> bool {
    env_flag("POLICY_ENGINE_ENABLED", false)
}

/// Whether a tool must run inside the sandbox. Independent of the master
/// policy switch: risky is a property of the tool, not of enforcement.
pub fn is_risky_tool(name: &str) -> bool {
    let risky: HashSet<String> = match std::env::var("RISKY_TOOLS") {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => HashSet::from(["mcp.shell.run".to_string()]),
    };
    risky.contains(name)
}

/// Lexically absolutize a path against the current directory: `.` and `..`
/// components are resolved without touching the filesystem, mirroring what
/// callers expect from an allowlist check on not-yet-existing paths.
fn normalize(path: &str) -> PathBuf {
    let path = Path::new(path);
    let mut absolute = if path.is_absolute() {
        PathBuf::new()
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
    };
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                absolute.pop();
            }
            other => absolute.push(other.as_os_str()),
        }
    }
    absolute
}

/// Gate for every step the executor schedules.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    store: Arc<Store>,
}

impl PolicyEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Allowlist, then path restriction, then HTTP rate limit.
    pub fn check_tool_allowed(&self, name: &str, args: &Value) -> Result<(), PolicyError> {
        if !enabled() {
            return Ok(());
        }
        self.check_allowlist(name)?;
        self.check_path_restrictions(args)?;
        self.check_http_rate_limit(name)?;
        Ok(())
    }

    fn check_allowlist(&self, name: &str) -> Result<(), PolicyError> {
        let allowed = env_list("ALLOWED_TOOLS", ',');
        if !allowed.is_empty() && !allowed.iter().any(|t| t == name) {
            return Err(PolicyError::ToolNotAllowed {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn check_path_restrictions(&self, args: &Value) -> Result<(), PolicyError> {
        let roots = env_list("FS_SAFE_ROOTS", ',');
        if roots.is_empty() {
            return Ok(());
        }
        for arg in PATH_ARGS {
            // Non-string values are left for the tool's own validation.
            let Some(path) = args.get(arg).and_then(|v| v.as_str()) else {
                continue;
            };
            let normalized = normalize(path);
            let ok = roots
                .iter()
                .any(|root| normalized.starts_with(normalize(root)));
            if !ok {
                return Err(PolicyError::PathRestricted {
                    path: normalized.display().to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_http_rate_limit(&self, name: &str) -> Result<(), PolicyError> {
        let limit = env_u64("HTTP_RATE_LIMIT_PER_MIN").unwrap_or(0);
        if limit == 0 || !is_http_tool(name) {
            return Ok(());
        }
        let count = self.store.incr_rate_counter("http").map_err(|err| {
            // A broken counter store must fail closed, not open.
            tracing::error!(error = %err, "rate counter unavailable");
            PolicyError::RateLimited {
                scope: "http_per_min".into(),
            }
        })?;
        if count > limit {
            return Err(PolicyError::RateLimited {
                scope: "http_per_min".into(),
            });
        }
        Ok(())
    }

    /// Reject successful outputs whose JSON serialization exceeds
    /// `MAX_OUTPUT_BYTES`.
    pub fn enforce_output_limits(&self, _name: &str, output: &Value) -> Result<(), PolicyError> {
        if !enabled() {
            return Ok(());
        }
        let limit = env_u64("MAX_OUTPUT_BYTES").unwrap_or(0) as usize;
        if limit == 0 {
            return Ok(());
        }
        let size = serde_json::to_string(output).map(|s| s.len()).unwrap_or(0);
        if size > limit {
            return Err(PolicyError::OutputTooLarge { size, limit });
        }
        Ok(())
    }
}
