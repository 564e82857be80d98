//! Ambient execution context.
//!
//! One `RunContext` is created per `execute_steps` call and passed explicitly
//! to every scheduler method and tool invocation; nested calls (fallbacks,
//! delegation) inherit it by clone rather than through globals.

use serde::{Deserialize, Serialize};

/// Request-scoped identifiers and tags carried through a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunContext {
    /// User-supplied grouping key for related traces, if any.
    pub thread_id: Option<String>,
    /// Trace this invocation writes events to. Empty until a trace is open.
    pub trace_id: String,
    /// Free-form tags; consulted by per-tag budgets and logged with events.
    pub tags: Vec<String>,
}

impl RunContext {
    pub fn new(thread_id: Option<String>, trace_id: String, tags: Vec<String>) -> Self {
        Self {
            thread_id,
            trace_id,
            tags,
        }
    }
}
