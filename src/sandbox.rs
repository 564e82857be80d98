//! Sandboxed execution for risky tools.
//!
//! The executor routes tools flagged by `RISKY_TOOLS` through a
//! [`SandboxRunner`] instead of awaiting them inline. The default
//! [`TaskSandbox`] isolates the invocation on its own spawned task: a panic
//! is contained and reported as `sandbox_error:panic:<msg>`, a wall-clock
//! timeout aborts the task and reports `sandbox_timeout`, and tool errors are
//! folded into `sandbox_error:<kind>:<msg>`. Command-backed tools get OS
//! process isolation on top of this for free, since they spawn their child
//! with `kill_on_drop`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::RunContext;
use crate::tools::{Tool, ToolError};

/// Runs one tool invocation in isolation with a hard wall-clock deadline.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(
        &self,
        tool: Arc<dyn Tool>,
        args: Value,
        ctx: &RunContext,
        timeout: Duration,
    ) -> Result<Value, ToolError>;
}

/// Default sandbox: dedicated tokio task with panic containment and abort on
/// timeout.
#[derive(Debug, Default)]
pub struct TaskSandbox;

#[async_trait]
impl SandboxRunner for TaskSandbox {
    async fn run(
        &self,
        tool: Arc<dyn Tool>,
        args: Value,
        ctx: &RunContext,
        timeout: Duration,
    ) -> Result<Value, ToolError> {
        let ctx = ctx.clone();
        let mut handle = tokio::spawn(async move { tool.run(args, &ctx).await });

        let joined = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return Err(ToolError::SandboxTimeout(timeout));
            }
        };

        match joined {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(ToolError::Sandbox {
                kind: err.kind(),
                message: err.to_string(),
            }),
            Err(join_err) => {
                let message = join_err
                    .try_into_panic()
                    .ok()
                    .and_then(|payload| {
                        payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                    })
                    .unwrap_or_else(|| "task aborted".to_string());
                Err(ToolError::Sandbox {
                    kind: "panic".into(),
                    message,
                })
            }
        }
    }
}
