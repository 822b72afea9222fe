//! Runs registered tasks with retry, timeout and cooperative cancellation.
//!
//! Every execution gets its own controller [`CancelSignal`], combined with
//! whatever signal the caller passed in. The execution sits in the running
//! map from admission until it settles; a drop guard removes it and fires
//! the controller on every exit path, panics included.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use harvester_core::config::ExecutorConfig;
use harvester_core::{CancelSignal, ExecutionId, ExecutionStatus, TriggerSource};
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, TaskError};
use crate::middleware::{Middleware, MiddlewareChain, MiddlewareDecision};
use crate::registry::{TaskDefinition, TaskRegistry};
use crate::retry::{self, Backoff};
use crate::types::{lock, RunningTask, RunningTaskInfo, SharedContext, TaskContext, TaskResult};

/// Everything needed to start one execution.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_name: String,
    pub params: JsonValue,
    pub source: TriggerSource,
    pub trigger_name: Option<String>,
    /// Caller-owned signal, e.g. tied to an HTTP request.
    pub signal: Option<CancelSignal>,
}

impl ExecutionRequest {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            params: JsonValue::Object(Default::default()),
            source: TriggerSource::Manual,
            trigger_name: None,
            signal: None,
        }
    }

    pub fn params(mut self, params: JsonValue) -> Self {
        self.params = params;
        self
    }

    pub fn source(mut self, source: TriggerSource) -> Self {
        self.source = source;
        self
    }

    pub fn trigger_name(mut self, name: impl Into<String>) -> Self {
        self.trigger_name = Some(name.into());
        self
    }

    pub fn signal(mut self, signal: CancelSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// An execution registered in the running map but not yet driven.
struct Admitted {
    def: Arc<TaskDefinition>,
    execution_id: ExecutionId,
    context: SharedContext,
    controller: CancelSignal,
    effective: CancelSignal,
}

/// Removes the execution from the running map and fires its controller.
struct RunningGuard<'a> {
    running: &'a DashMap<ExecutionId, RunningTaskInfo>,
    execution_id: ExecutionId,
    controller: CancelSignal,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.execution_id);
        self.controller.cancel();
    }
}

pub struct TaskExecutor {
    registry: Arc<TaskRegistry>,
    middleware: MiddlewareChain,
    running: DashMap<ExecutionId, RunningTaskInfo>,
    backoff: Backoff,
}

impl TaskExecutor {
    pub fn new(registry: Arc<TaskRegistry>, config: &ExecutorConfig) -> Self {
        Self {
            registry,
            middleware: MiddlewareChain::new(),
            running: DashMap::new(),
            backoff: Backoff::from_config(config),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Append `middleware` to the chain. Order of calls is hook order.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware.push(middleware);
    }

    /// Run one execution to completion.
    ///
    /// Only fails for an unknown task name. Handler failures, timeouts and
    /// cancellation all come back as a `TaskResult` with `success: false`.
    #[instrument(skip_all, fields(task = %req.task_name))]
    pub async fn execute(&self, req: ExecutionRequest) -> Result<TaskResult> {
        let admitted = self.admit(req)?;
        Ok(self.drive(admitted).await)
    }

    /// Start an execution in the background and return its id right away.
    ///
    /// The execution is already listed in the running map when this returns,
    /// so it can be stopped immediately.
    pub fn submit(self: &Arc<Self>, req: ExecutionRequest) -> Result<ExecutionId> {
        let admitted = self.admit(req)?;
        let execution_id = admitted.execution_id.clone();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.drive(admitted).await;
            if !result.success {
                debug!(
                    execution_id = %result.execution_id,
                    error = result.error.as_deref().unwrap_or(""),
                    "background execution finished unsuccessfully"
                );
            }
        });
        Ok(execution_id)
    }

    fn admit(&self, req: ExecutionRequest) -> Result<Admitted> {
        let def = self
            .registry
            .get(&req.task_name)
            .ok_or_else(|| TaskError::NotFound {
                name: req.task_name.clone(),
            })?;

        let execution_id = ExecutionId::new();
        let controller = CancelSignal::new();
        let effective = match &req.signal {
            Some(external) => CancelSignal::combine(&[controller.clone(), external.clone()]),
            None => controller.clone(),
        };

        let now = Utc::now();
        let context = Arc::new(Mutex::new(TaskContext {
            execution_id: execution_id.clone(),
            task_name: def.name.clone(),
            params: req.params,
            source: req.source,
            trigger_name: req.trigger_name,
            retry_count: 0,
            max_retries: def.options.retries,
            started_at: now,
            attempt_started_at: now,
            status: ExecutionStatus::Running,
            logs: Vec::new(),
            result: None,
            signal: effective.clone(),
        }));

        self.running.insert(
            execution_id.clone(),
            RunningTaskInfo {
                execution_id: execution_id.clone(),
                task_name: def.name.clone(),
                controller: controller.clone(),
                context: Arc::clone(&context),
                started_at: now,
            },
        );

        Ok(Admitted {
            def,
            execution_id,
            context,
            controller,
            effective,
        })
    }

    async fn drive(&self, admitted: Admitted) -> TaskResult {
        let Admitted {
            def,
            execution_id,
            context,
            controller,
            effective,
        } = admitted;
        let _guard = RunningGuard {
            running: &self.running,
            execution_id: execution_id.clone(),
            controller: controller.clone(),
        };

        let snapshot = lock(&context).clone();
        if self.middleware.run_before(&snapshot).await == MiddlewareDecision::Abort {
            return self.settle_aborted(&context);
        }

        let cancelled = || controller.is_cancelled() || effective.is_cancelled();
        let handler = def.handler();
        let timeout = def.options.effective_timeout();
        let max_retries = def.options.retries;
        let mut attempt: u32 = 0;

        let outcome = loop {
            if attempt > 0 {
                let delay = self.backoff.delay_for(attempt);
                let delay_ms = delay.as_millis() as u64;
                debug!(%execution_id, attempt, delay_ms, "waiting before retry");
                lock(&context).log(format!("retry {attempt} of {max_retries} in {delay_ms}ms"));
                tokio::select! {
                    biased;
                    _ = effective.cancelled() => break Err(TaskError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancelled() {
                break Err(TaskError::Cancelled);
            }

            let params = {
                let mut ctx = lock(&context);
                ctx.retry_count = attempt;
                ctx.attempt_started_at = Utc::now();
                ctx.log(format!("attempt {} of {} started", attempt + 1, max_retries + 1));
                ctx.params.clone()
            };

            let attempt_signal = CancelSignal::combine(&[effective.clone()]);
            let output =
                retry::run_attempt(Arc::clone(&handler), params, attempt_signal.clone(), timeout)
                    .await;
            attempt_signal.cancel();

            match output {
                Ok(data) => break Ok(data),
                Err(_) if cancelled() => break Err(TaskError::Cancelled),
                Err(e) if !e.is_retryable() || attempt >= max_retries => break Err(e),
                Err(e) => {
                    warn!(%execution_id, task = %def.name, attempt, error = %e, "attempt failed, retrying");
                    lock(&context).log(format!("attempt {} failed: {e}", attempt + 1));
                    attempt += 1;
                }
            }
        };

        self.settle(&context, outcome).await
    }

    fn settle_aborted(&self, context: &SharedContext) -> TaskResult {
        let mut ctx = lock(context);
        let finished_at = Utc::now();
        ctx.status = ExecutionStatus::Failed;
        ctx.log("aborted by middleware");
        let result = TaskResult {
            execution_id: ctx.execution_id.clone(),
            success: false,
            data: None,
            error: Some(TaskError::AbortedByMiddleware.to_string()),
            started_at: ctx.started_at,
            finished_at,
            duration_ms: elapsed_ms(ctx.started_at, finished_at),
            retry_count: 0,
            cancelled: false,
        };
        ctx.result = Some(result.clone());
        result
    }

    /// Reports the index of the last attempt that actually started, so a
    /// cancel during back-off does not count the retry that never ran.
    async fn settle(
        &self,
        context: &SharedContext,
        outcome: std::result::Result<JsonValue, TaskError>,
    ) -> TaskResult {
        let finished_at = Utc::now();
        let (snapshot, result, failure) = {
            let mut ctx = lock(context);
            let duration_ms = elapsed_ms(ctx.started_at, finished_at);
            let retry_count = ctx.retry_count;
            let (result, failure) = match outcome {
                Ok(data) => {
                    ctx.status = ExecutionStatus::Success;
                    let result = TaskResult {
                        execution_id: ctx.execution_id.clone(),
                        success: true,
                        data: Some(data),
                        error: None,
                        started_at: ctx.started_at,
                        finished_at,
                        duration_ms,
                        retry_count,
                        cancelled: false,
                    };
                    (result, None)
                }
                Err(e) => {
                    let cancelled = matches!(e, TaskError::Cancelled);
                    ctx.status = if cancelled {
                        ExecutionStatus::Cancelled
                    } else {
                        ExecutionStatus::Failed
                    };
                    let result = TaskResult {
                        execution_id: ctx.execution_id.clone(),
                        success: false,
                        data: None,
                        error: Some(e.to_string()),
                        started_at: ctx.started_at,
                        finished_at,
                        duration_ms,
                        retry_count,
                        cancelled,
                    };
                    (result, Some(e))
                }
            };
            let status = ctx.status;
            ctx.log(format!("finished with status {status}"));
            ctx.result = Some(result.clone());
            (ctx.clone(), result, failure)
        };

        match failure {
            None => self.middleware.run_after(&snapshot, &result).await,
            Some(e) => self.middleware.run_on_error(&snapshot, &e).await,
        }
        result
    }

    /// Snapshot of every in-flight execution, oldest first.
    pub fn list_running(&self) -> Vec<RunningTask> {
        let mut list: Vec<RunningTask> = self.running.iter().map(|e| e.snapshot()).collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }

    pub fn list_running_for_task(&self, task_name: &str) -> Vec<RunningTask> {
        self.list_running()
            .into_iter()
            .filter(|t| t.task_name == task_name)
            .collect()
    }

    pub fn get_running(&self, id: &ExecutionId) -> Option<RunningTask> {
        self.running.get(id).map(|e| e.snapshot())
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Ask one execution to stop. Cooperative: the handler has to observe
    /// its signal for the run to actually end early.
    pub fn stop(&self, id: &ExecutionId) -> Result<()> {
        let entry = self
            .running
            .get(id)
            .ok_or_else(|| TaskError::ExecutionNotFound { id: id.to_string() })?;
        entry.controller.cancel();
        let mut ctx = lock(&entry.context);
        ctx.status = ExecutionStatus::Cancelled;
        ctx.log("stop requested");
        info!(execution_id = %id, task = %entry.task_name, "execution stop requested");
        Ok(())
    }

    /// Stop every listed execution that is still running. Returns the ids
    /// that were actually signalled.
    pub fn stop_many(&self, ids: &[ExecutionId]) -> Vec<ExecutionId> {
        ids.iter()
            .filter(|id| self.stop(id).is_ok())
            .cloned()
            .collect()
    }

    /// Stop every running execution of `task_name`.
    pub fn stop_task(&self, task_name: &str) -> Vec<ExecutionId> {
        let ids: Vec<ExecutionId> = self
            .running
            .iter()
            .filter(|e| e.task_name == task_name)
            .map(|e| e.key().clone())
            .collect();
        self.stop_many(&ids)
    }

    pub fn stop_all(&self) -> Vec<ExecutionId> {
        let ids: Vec<ExecutionId> = self.running.iter().map(|e| e.key().clone()).collect();
        self.stop_many(&ids)
    }

    /// Signal every in-flight execution. Does not wait for handlers to exit.
    pub fn shutdown(&self) {
        let stopped = self.stop_all();
        if stopped.is_empty() {
            info!("executor shut down, nothing running");
        } else {
            warn!(count = stopped.len(), "executor shut down, running executions signalled");
        }
    }
}

fn elapsed_ms(from: chrono::DateTime<Utc>, to: chrono::DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}
