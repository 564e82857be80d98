//! Tool registry and discovery.
//!
//! The registry is the single name → tool map the executor resolves against.
//! Discovery pulls from, in order: built-in adapters, microtool descriptor
//! directories, the plugin-manifest tree, the remote tools config, and step
//! templates. Discovery errors are logged as `discovery:error` events and
//! never abort the scan.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use serde_json::json;

use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::metrics::Metrics;
use crate::store::Store;
use crate::tools::descriptor::load_descriptor;
use crate::tools::instrument::Instrumented;
use crate::tools::manifest::ToolManifest;
use crate::tools::plugin::scan_plugin_root;
use crate::tools::remote::{RemoteTool, parse_remote_config};
use crate::tools::templates::{TemplateTool, load_templates};
use crate::tools::{Tool, ToolError};

#[derive(Default)]
struct DiscoveryState {
    discovery_trace: Option<String>,
    plugin_mtimes: HashMap<PathBuf, SystemTime>,
    remote_mtime: Option<SystemTime>,
}

/// Process-wide tool registry.
pub struct Registry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    manifest: Arc<ToolManifest>,
    config: RegistryConfig,
    http: reqwest::Client,
    state: Mutex<DiscoveryState>,
}

impl Registry {
    pub fn new(
        config: RegistryConfig,
        store: Arc<Store>,
        metrics: Arc<Metrics>,
        http: reqwest::Client,
    ) -> Self {
        let manifest = Arc::new(ToolManifest::new(&config.manifest_path));
        Self {
            tools: RwLock::new(HashMap::new()),
            store,
            metrics,
            manifest,
            config,
            http,
            state: Mutex::new(DiscoveryState::default()),
        }
    }

    /// The usage ledger shared with the executor.
    pub fn manifest(&self) -> Arc<ToolManifest> {
        self.manifest.clone()
    }

    /// Insert or replace a tool by name. Every tool is wrapped with the
    /// instrumentation middleware here, so callers register bare tools.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.register_from(tool, Path::new("builtin"), &[], "")
    }

    /// Register with discovery provenance for the usage ledger.
    pub fn register_from(&self, tool: Arc<dyn Tool>, origin: &Path, tags: &[String], desc: &str) {
        let name = tool.name().to_string();
        let description = if desc.is_empty() {
            tool.description().to_string()
        } else {
            desc.to_string()
        };
        let wrapped: Arc<dyn Tool> = Arc::new(Instrumented::new(tool, self.store.clone()));
        let replaced = self.tools.write().insert(name.clone(), wrapped);
        if replaced.is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous definition replaced");
        }
        self.manifest.ensure_entry(&name, origin, tags, &description);
    }

    /// Look up a tool. Every call increments `tool_requests_total{tool,found}`
    /// exactly once.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>, RegistryError> {
        let found = self.tools.read().get(name).cloned();
        self.metrics.tool_requests_total.inc(&[
            name,
            if found.is_some() { "true" } else { "false" },
        ]);
        found.ok_or_else(|| RegistryError::NotFound {
            name: name.to_string(),
        })
    }

    /// Registered tool names, sorted. Feeds the planner prompt.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// Run all file-based discovery sources.
    pub fn discover(&self) {
        self.discover_microtools();
        self.discover_plugins();
        self.discover_remote_tools();
        self.discover_templates();
    }

    /// Re-run file-based discovery when hot reload is on and the remote
    /// config file has changed since the last scan. Called between waves.
    pub fn reload_if_needed(&self) {
        if !self.config.hot_reload {
            return;
        }
        let Some(path) = self.config.remote_config.as_deref() else {
            return;
        };
        let Ok(mtime) = std::fs::metadata(path).and_then(|m| m.modified()) else {
            return;
        };
        let stale = {
            let state = self.state.lock();
            state.remote_mtime != Some(mtime)
        };
        if stale {
            tracing::info!(config = %path, "remote tools config changed, re-running discovery");
            self.discover_remote_tools();
            self.discover_microtools();
        }
    }

    fn discover_microtools(&self) {
        for dir in &self.config.microtool_dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                // Missing directories are fine: every source is optional.
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match load_descriptor(&path) {
                    Ok((descriptor, tool)) => {
                        self.register_from(
                            tool,
                            &path,
                            &descriptor.tags,
                            &descriptor.description,
                        );
                    }
                    Err(err) => self.log_discovery_error("microtool", &path, &err),
                }
            }
        }
    }

    fn discover_plugins(&self) {
        for root in &self.config.plugin_dirs {
            let seen: HashMap<PathBuf, SystemTime> = self.state.lock().plugin_mtimes.clone();
            let (loaded, failures) =
                scan_plugin_root(Path::new(root), |p| seen.get(p).copied());
            for plugin in loaded {
                self.register_from(
                    plugin.tool,
                    &plugin.manifest_path,
                    &plugin.descriptor.tags,
                    &plugin.descriptor.description,
                );
                self.state
                    .lock()
                    .plugin_mtimes
                    .insert(plugin.manifest_path, plugin.mtime);
            }
            for (path, err) in failures {
                self.log_discovery_error("plugin", &path, &err);
            }
        }
    }

    fn discover_remote_tools(&self) {
        let Some(path) = self.config.remote_config.as_deref() else {
            return;
        };
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        match parse_remote_config(&raw) {
            Ok(configs) => {
                for config in configs {
                    let tool = Arc::new(RemoteTool::new(config, self.http.clone()));
                    self.register_from(tool, Path::new(path), &[], "");
                }
            }
            Err(err) => self.log_discovery_error("remote", Path::new(path), &err),
        }
        if let Ok(mtime) = std::fs::metadata(path).and_then(|m| m.modified()) {
            self.state.lock().remote_mtime = Some(mtime);
        }
    }

    fn discover_templates(&self) {
        let path = Path::new(&self.config.templates_path);
        if !path.exists() {
            return;
        }
        match load_templates(path) {
            Ok(templates) => {
                for (name, def) in templates {
                    let tags = vec!["template".to_string()];
                    let tool = Arc::new(TemplateTool::new(name, def));
                    self.register_from(tool, path, &tags, "");
                }
            }
            Err(err) => self.log_discovery_error("templates", path, &err),
        }
    }

    /// Discovery failures are observable but never fatal.
    fn log_discovery_error(&self, source: &str, path: &Path, err: &ToolError) {
        tracing::warn!(%source, path = %path.display(), error = %err, "tool discovery failed");
        let trace_id = {
            let mut state = self.state.lock();
            match &state.discovery_trace {
                Some(id) => id.clone(),
                None => match self.store.start_trace(None) {
                    Ok(id) => {
                        state.discovery_trace = Some(id.clone());
                        id
                    }
                    Err(_) => return,
                },
            }
        };
        let _ = self.store.log_event(
            &trace_id,
            "decision",
            "discovery:error",
            &json!({
                "source": source,
                "path": path.display().to_string(),
                "error": err.kind(),
                "msg": err.to_string(),
            }),
        );
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("tools", &self.tool_names())
            .finish()
    }
}
