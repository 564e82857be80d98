//! Plugin-manifest tree discovery.
//!
//! Each subdirectory of a plugin root containing a `plugin.json` describes
//! one plugin: `{name, version, entry, scopes?, commands?}`. The `entry`
//! field names a microtool descriptor file relative to the plugin directory.
//! Manifests whose mtime has not advanced since the last scan are skipped.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Deserialize;

use crate::tools::ToolError;
use crate::tools::descriptor::{ToolDescriptor, load_descriptor};

/// A parsed `plugin.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    pub entry: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
}

/// A plugin ready for registration.
pub struct LoadedPlugin {
    pub manifest: PluginManifest,
    pub manifest_path: PathBuf,
    pub mtime: SystemTime,
    pub descriptor: ToolDescriptor,
    pub tool: std::sync::Arc<dyn crate::tools::Tool>,
}

/// Scan one plugin root. `seen(path)` returns the mtime recorded at the last
/// scan, letting unchanged manifests be skipped; failures on individual
/// plugins are returned alongside the successes so the registry can log them
/// without aborting discovery.
pub fn scan_plugin_root(
    root: &Path,
    seen: impl Fn(&Path) -> Option<SystemTime>,
) -> (Vec<LoadedPlugin>, Vec<(PathBuf, ToolError)>) {
    let mut loaded = Vec::new();
    let mut failures = Vec::new();

    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        // A missing root is not an error: discovery sources are optional.
        Err(_) => return (loaded, failures),
    };

    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let manifest_path = dir.join("plugin.json");
        if !manifest_path.exists() {
            continue;
        }
        match load_plugin(&manifest_path, &seen) {
            Ok(Some(plugin)) => loaded.push(plugin),
            Ok(None) => {} // unchanged since last scan
            Err(err) => failures.push((manifest_path, err)),
        }
    }
    (loaded, failures)
}

fn load_plugin(
    manifest_path: &Path,
    seen: &impl Fn(&Path) -> Option<SystemTime>,
) -> Result<Option<LoadedPlugin>, ToolError> {
    let mtime = std::fs::metadata(manifest_path)?.modified()?;
    if seen(manifest_path) == Some(mtime) {
        return Ok(None);
    }

    let raw = std::fs::read_to_string(manifest_path)?;
    let manifest: PluginManifest = serde_json::from_str(&raw)?;

    let dir = manifest_path.parent().unwrap_or(Path::new("."));
    let entry_path = dir.join(&manifest.entry);
    let (descriptor, tool) = load_descriptor(&entry_path)?;

    Ok(Some(LoadedPlugin {
        manifest,
        manifest_path: manifest_path.to_path_buf(),
        mtime,
        descriptor,
        tool,
    }))
}
