//! Writes every execution into the history store.
//!
//! A store failure is returned from the hook, which the chain logs and
//! swallows, so a broken database never fails the task itself.

use std::sync::Arc;

use async_trait::async_trait;
use harvester_store::{ExecutionStore, ExecutionUpdate, NewExecution};
use serde_json::json;

use super::{Middleware, MiddlewareDecision};
use crate::error::TaskError;
use crate::types::{TaskContext, TaskResult};

pub struct PersistenceMiddleware {
    store: Arc<dyn ExecutionStore>,
}

impl PersistenceMiddleware {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Middleware for PersistenceMiddleware {
    fn name(&self) -> &str {
        "persistence"
    }

    async fn before(&self, ctx: &TaskContext) -> anyhow::Result<MiddlewareDecision> {
        self.store.create(&NewExecution {
            id: ctx.execution_id.clone(),
            task_name: ctx.task_name.clone(),
            trigger_source: ctx.source,
            trigger_name: ctx.trigger_name.clone(),
            params: ctx.params.clone(),
            status: ctx.status,
            max_retries: ctx.max_retries,
            started_at: ctx.started_at,
        })?;
        Ok(MiddlewareDecision::Continue)
    }

    async fn after(&self, ctx: &TaskContext, result: &TaskResult) -> anyhow::Result<()> {
        self.store.update(
            &ctx.execution_id,
            &ExecutionUpdate {
                status: ctx.status,
                result: result.data.clone(),
                error: None,
                retry_count: result.retry_count,
                finished_at: Some(result.finished_at),
                duration_ms: Some(result.duration_ms),
            },
        )?;
        Ok(())
    }

    async fn on_error(&self, ctx: &TaskContext, err: &TaskError) -> anyhow::Result<()> {
        let (finished_at, duration_ms) = match &ctx.result {
            Some(r) => (Some(r.finished_at), Some(r.duration_ms)),
            None => (None, None),
        };
        self.store.update(
            &ctx.execution_id,
            &ExecutionUpdate {
                status: ctx.status,
                result: ctx
                    .result
                    .as_ref()
                    .filter(|r| r.cancelled)
                    .map(|_| json!({ "cancelled": true })),
                error: Some(err.to_string()),
                retry_count: ctx.retry_count,
                finished_at,
                duration_ms,
            },
        )?;
        Ok(())
    }
}
