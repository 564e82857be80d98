//! Agent execution runtime.
//!
//! Given a natural-language prompt and/or an explicit plan, the runtime
//! schedules and executes a graph of named tools under retry, timeout,
//! caching, sandboxing, policy and budget controls, writing a durable event
//! trace and updating metrics throughout.
//!
//! ```no_run
//! use conductor::{Config, Runtime};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), conductor::Error> {
//! let runtime = Runtime::new(Config::from_env()?).await?;
//! let report = runtime
//!     .execute_steps(
//!         "",
//!         Some(vec![json!({"tool": "web_fetch", "args": {"url": "https://example.com"}})]),
//!         Some("thread-1".into()),
//!         vec![],
//!     )
//!     .await?;
//! println!("trace {} produced {} outputs", report.trace_id, report.outputs.len());
//! # Ok(())
//! # }
//! ```

pub mod budget;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod insights;
pub mod metrics;
pub mod planner;
pub mod policy;
pub mod sandbox;
pub mod store;
pub mod tools;

/// Install a `tracing` subscriber honoring `RUST_LOG`. Intended for hosting
/// binaries and tests; calling it twice is a no-op.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub use config::Config;
pub use context::RunContext;
pub use error::{
    BudgetError, ConfigError, Error, ExecError, PlanError, PolicyError, RegistryError, StoreError,
};
pub use executor::{ExecutionReport, Runtime, Step, StepOutput, parse_steps};
pub use insights::Insights;
pub use metrics::Metrics;
pub use sandbox::{SandboxRunner, TaskSandbox};
pub use store::Store;
pub use tools::{Registry, Tool, ToolError};
