//! Token budgets: global, per-tool and per-tag.
//!
//! Limits come from an optional YAML file (`BUDGET_CONFIG`) overridden by
//! `BUDGET_GLOBAL`, `BUDGET_TOOL_*` and `BUDGET_TAG_*` environment
//! variables. `check_and_decrement` is atomic: all applicable limits are
//! verified before any counter moves.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::config::optional_env;
use crate::error::BudgetError;

/// YAML layout:
///
/// ```yaml
/// global: 1000
/// tools:
///   web_fetch: 500
/// tags:
///   escalated: 50
/// ```
#[derive(Debug, Default, Deserialize)]
struct BudgetFile {
    #[serde(default)]
    global: Option<u64>,
    #[serde(default)]
    tools: HashMap<String, u64>,
    #[serde(default)]
    tags: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct BudgetState {
    global_limit: Option<u64>,
    global_used: u64,
    tool_limits: HashMap<String, u64>,
    tool_used: HashMap<String, u64>,
    tag_limits: HashMap<String, u64>,
    tag_used: HashMap<String, u64>,
}

/// Process-wide budget manager.
#[derive(Debug, Default)]
pub struct BudgetManager {
    state: Mutex<BudgetState>,
}

impl BudgetManager {
    /// Load limits from `BUDGET_CONFIG` (if set and readable) and the
    /// `BUDGET_*` environment overrides. Unreadable config is logged and
    /// treated as empty.
    pub fn from_env() -> Self {
        let mut state = BudgetState::default();

        if let Ok(Some(path)) = optional_env("BUDGET_CONFIG") {
            match std::fs::read_to_string(&path) {
                Ok(raw) => match serde_yml::from_str::<BudgetFile>(&raw) {
                    Ok(file) => {
                        state.global_limit = file.global;
                        state.tool_limits = file.tools;
                        state.tag_limits = file.tags;
                    }
                    Err(err) => {
                        tracing::warn!(config = %path, error = %err, "budget config unparseable");
                    }
                },
                Err(err) => {
                    tracing::warn!(config = %path, error = %err, "budget config unreadable");
                }
            }
        }

        if let Some(global) = std::env::var("BUDGET_GLOBAL")
            .ok()
            .and_then(|v| v.trim().parse().ok())
        {
            state.global_limit = Some(global);
        }
        for (key, value) in std::env::vars() {
            let Ok(limit) = value.trim().parse::<u64>() else {
                continue;
            };
            if let Some(tool) = key.strip_prefix("BUDGET_TOOL_") {
                state.tool_limits.insert(tool.to_ascii_lowercase(), limit);
            } else if let Some(tag) = key.strip_prefix("BUDGET_TAG_") {
                state.tag_limits.insert(tag.to_ascii_lowercase(), limit);
            }
        }

        Self {
            state: Mutex::new(state),
        }
    }

    /// Verify that `amount` fits under the global, per-tool and every
    /// per-tag limit, then decrement them all. On failure nothing changes.
    ///
    /// Per-tool env overrides are keyed by the lowercased tool name.
    pub fn check_and_decrement(
        &self,
        tool: &str,
        amount: u64,
        tags: &[String],
    ) -> Result<(), BudgetError> {
        let mut state = self.state.lock();
        let tool_key = tool.to_ascii_lowercase();

        if let Some(limit) = state.global_limit {
            if state.global_used + amount > limit {
                return Err(BudgetError::Exceeded {
                    scope: "global".into(),
                    limit,
                    used: state.global_used,
                    amount,
                });
            }
        }
        if let Some(&limit) = state.tool_limits.get(&tool_key) {
            let used = state.tool_used.get(&tool_key).copied().unwrap_or(0);
            if used + amount > limit {
                return Err(BudgetError::Exceeded {
                    scope: tool.to_string(),
                    limit,
                    used,
                    amount,
                });
            }
        }
        for tag in tags {
            let tag_key = tag.to_ascii_lowercase();
            if let Some(&limit) = state.tag_limits.get(&tag_key) {
                let used = state.tag_used.get(&tag_key).copied().unwrap_or(0);
                if used + amount > limit {
                    return Err(BudgetError::Exceeded {
                        scope: tag.clone(),
                        limit,
                        used,
                        amount,
                    });
                }
            }
        }

        state.global_used += amount;
        *state.tool_used.entry(tool_key).or_insert(0) += amount;
        for tag in tags {
            let tag_key = tag.to_ascii_lowercase();
            if state.tag_limits.contains_key(&tag_key) {
                *state.tag_used.entry(tag_key).or_insert(0) += amount;
            }
        }
        Ok(())
    }

    /// Remaining global budget, or `None` when unlimited.
    pub fn remaining_global(&self) -> Option<u64> {
        let state = self.state.lock();
        state
            .global_limit
            .map(|limit| limit.saturating_sub(state.global_used))
    }

    /// Remaining budget for one tool, or `None` when unlimited.
    pub fn remaining_tool(&self, tool: &str) -> Option<u64> {
        let state = self.state.lock();
        let key = tool.to_ascii_lowercase();
        state.tool_limits.get(&key).map(|limit| {
            limit.saturating_sub(state.tool_used.get(&key).copied().unwrap_or(0))
        })
    }

    #[cfg(test)]
    fn with_limits(
        global: Option<u64>,
        tools: &[(&str, u64)],
        tags: &[(&str, u64)],
    ) -> Self {
        Self {
            state: Mutex::new(BudgetState {
                global_limit: global,
                tool_limits: tools.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                tag_limits: tags.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                ..Default::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_by_default() {
        let budget = BudgetManager::default();
        for _ in 0..100 {
            budget.check_and_decrement("anything", 10, &[]).unwrap();
        }
        assert_eq!(budget.remaining_global(), None);
    }

    #[test]
    fn global_limit_enforced() {
        let budget = BudgetManager::with_limits(Some(3), &[], &[]);
        budget.check_and_decrement("a", 2, &[]).unwrap();
        let err = budget.check_and_decrement("a", 2, &[]).unwrap_err();
        let BudgetError::Exceeded { scope, limit, used, amount } = err;
        assert_eq!(scope, "global");
        assert_eq!((limit, used, amount), (3, 2, 2));
        // The failed call changed nothing.
        assert_eq!(budget.remaining_global(), Some(1));
        budget.check_and_decrement("a", 1, &[]).unwrap();
    }

    #[test]
    fn failure_leaves_all_counters_unchanged() {
        let budget = BudgetManager::with_limits(Some(10), &[("web_fetch", 1)], &[("net", 5)]);
        budget
            .check_and_decrement("web_fetch", 1, &["net".into()])
            .unwrap();
        // Tool budget exhausted: global and tag must not move either.
        assert!(
            budget
                .check_and_decrement("web_fetch", 1, &["net".into()])
                .is_err()
        );
        assert_eq!(budget.remaining_global(), Some(9));
        assert_eq!(budget.remaining_tool("web_fetch"), Some(0));
        // Other tools still draw from global and tag normally.
        budget
            .check_and_decrement("pdf.text", 4, &["net".into()])
            .unwrap();
        assert_eq!(budget.remaining_global(), Some(5));
    }

    #[test]
    fn tag_limits_apply_to_every_listed_tag() {
        let budget = BudgetManager::with_limits(None, &[], &[("escalated", 1)]);
        budget
            .check_and_decrement("t", 1, &["escalated".into(), "other".into()])
            .unwrap();
        let err = budget
            .check_and_decrement("t", 1, &["escalated".into()])
            .unwrap_err();
        let BudgetError::Exceeded { scope, .. } = err;
        assert_eq!(scope, "escalated");
    }

    #[test]
    fn env_overrides_win_over_yaml() {
        let _guard = crate::config::ENV_MUTEX.lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("budget.yaml");
        std::fs::write(&path, "global: 100\ntools:\n  web_fetch: 50\n").unwrap();
        unsafe {
            std::env::set_var("BUDGET_CONFIG", path.display().to_string());
            std::env::set_var("BUDGET_GLOBAL", "2");
            std::env::set_var("BUDGET_TOOL_WEB_FETCH", "1");
        }

        let budget = BudgetManager::from_env();
        budget.check_and_decrement("WEB_FETCH", 1, &[]).unwrap();
        assert!(budget.check_and_decrement("web_fetch", 1, &[]).is_err());
        assert_eq!(budget.remaining_global(), Some(1));

        unsafe {
            std::env::remove_var("BUDGET_CONFIG");
            std::env::remove_var("BUDGET_GLOBAL");
            std::env::remove_var("BUDGET_TOOL_WEB_FETCH");
        }
    }
}
