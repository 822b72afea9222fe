use async_trait::async_trait;
use tracing::{error, info};

use super::{Middleware, MiddlewareDecision};
use crate::error::TaskError;
use crate::types::{TaskContext, TaskResult};

/// Structured start / finish / failure lines for every execution.
#[derive(Debug, Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn before(&self, ctx: &TaskContext) -> anyhow::Result<MiddlewareDecision> {
        info!(
            execution_id = %ctx.execution_id,
            task = %ctx.task_name,
            source = %ctx.source,
            trigger = ctx.trigger_name.as_deref().unwrap_or("-"),
            "task started"
        );
        Ok(MiddlewareDecision::Continue)
    }

    async fn after(&self, ctx: &TaskContext, result: &TaskResult) -> anyhow::Result<()> {
        info!(
            execution_id = %ctx.execution_id,
            task = %ctx.task_name,
            duration_ms = result.duration_ms,
            retry_count = result.retry_count,
            "task succeeded"
        );
        Ok(())
    }

    async fn on_error(&self, ctx: &TaskContext, err: &TaskError) -> anyhow::Result<()> {
        error!(
            execution_id = %ctx.execution_id,
            task = %ctx.task_name,
            status = %ctx.status,
            retry_count = ctx.retry_count,
            error = %err,
            "task failed"
        );
        Ok(())
    }
}
