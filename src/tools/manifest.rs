//! Tool usage ledger (`tools_manifest.json`).
//!
//! A JSON map from tool name to discovery metadata and usage counters,
//! rewritten after every invocation. Ledger IO failures are logged and
//! swallowed; the ledger is advisory, never load-bearing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::store::now_secs;

/// One ledger entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub uses: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub composite_of: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub last_used: i64,
}

/// File-backed ledger with serialized writes.
#[derive(Debug)]
pub struct ToolManifest {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ToolManifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load_locked(&self) -> BTreeMap<String, ManifestEntry> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                tracing::warn!(path = %self.path.display(), error = %err, "manifest unreadable, starting fresh");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        }
    }

    fn save_locked(&self, entries: &BTreeMap<String, ManifestEntry>) {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        match serde_json::to_string_pretty(entries) {
            Ok(blob) => {
                if let Err(err) = std::fs::write(&self.path, blob) {
                    tracing::warn!(path = %self.path.display(), error = %err, "manifest write failed");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "manifest serialization failed");
            }
        }
    }

    /// Create an entry for a newly discovered tool if none exists yet.
    pub fn ensure_entry(&self, name: &str, path: &Path, tags: &[String], description: &str) {
        let _guard = self.lock.lock();
        let mut entries = self.load_locked();
        if !entries.contains_key(name) {
            entries.insert(
                name.to_string(),
                ManifestEntry {
                    path: path.display().to_string(),
                    tags: tags.to_vec(),
                    description: description.to_string(),
                    ..Default::default()
                },
            );
            self.save_locked(&entries);
        }
    }

    /// Record one invocation outcome.
    pub fn register_usage(&self, name: &str, success: bool) {
        let _guard = self.lock.lock();
        let mut entries = self.load_locked();
        let entry = entries.entry(name.to_string()).or_default();
        entry.uses += 1;
        if !success {
            entry.errors += 1;
        }
        entry.last_used = now_secs();
        self.save_locked(&entries);
    }

    /// The `k` most-used tools, ties broken by name.
    pub fn top_tools(&self, k: usize) -> Vec<(String, ManifestEntry)> {
        let _guard = self.lock.lock();
        let entries = self.load_locked();
        let mut items: Vec<(String, ManifestEntry)> = entries.into_iter().collect();
        items.sort_by(|a, b| b.1.uses.cmp(&a.1.uses).then_with(|| a.0.cmp(&b.0)));
        items.truncate(k);
        items
    }
}
