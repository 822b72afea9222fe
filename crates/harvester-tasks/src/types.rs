use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use harvester_core::{CancelSignal, ExecutionId, ExecutionStatus, TriggerSource};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Static per-task policy, fixed at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Per-attempt budget. `None` or zero means unbounded.
    pub timeout: Option<Duration>,
    /// Extra attempts after the first failure.
    pub retries: u32,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub(crate) fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| !t.is_zero())
    }
}

/// One line of an execution's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Per-execution record, owned by the executor for the execution's lifetime.
///
/// Middleware hooks receive a snapshot; only the executor mutates it.
#[derive(Debug, Clone, Serialize)]
pub struct TaskContext {
    pub execution_id: ExecutionId,
    pub task_name: String,
    pub params: JsonValue,
    pub source: TriggerSource,
    pub trigger_name: Option<String>,
    /// Index of the current attempt (0 for the first one).
    pub retry_count: u32,
    pub max_retries: u32,
    /// Fixed for the whole execution.
    pub started_at: DateTime<Utc>,
    /// Reset at the start of every attempt.
    pub attempt_started_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub logs: Vec<LogEntry>,
    pub result: Option<TaskResult>,
    /// Effective signal: executor controller combined with the caller's signal.
    #[serde(skip)]
    pub signal: CancelSignal,
}

impl TaskContext {
    pub fn log(&mut self, message: impl Into<String>) {
        self.logs.push(LogEntry {
            at: Utc::now(),
            message: message.into(),
        });
    }
}

pub(crate) type SharedContext = Arc<Mutex<TaskContext>>;

pub(crate) fn lock(ctx: &SharedContext) -> MutexGuard<'_, TaskContext> {
    ctx.lock().expect("task context poisoned")
}

/// Outcome of one execution. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub execution_id: ExecutionId,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

/// Entry of the executor's running map.
pub(crate) struct RunningTaskInfo {
    pub execution_id: ExecutionId,
    pub task_name: String,
    pub controller: CancelSignal,
    pub context: SharedContext,
    pub started_at: DateTime<Utc>,
}

impl RunningTaskInfo {
    pub fn snapshot(&self) -> RunningTask {
        RunningTask {
            execution_id: self.execution_id.clone(),
            task_name: self.task_name.clone(),
            started_at: self.started_at,
            context: lock(&self.context).clone(),
        }
    }
}

/// Point-in-time view of an in-flight execution.
#[derive(Debug, Clone, Serialize)]
pub struct RunningTask {
    pub execution_id: ExecutionId,
    pub task_name: String,
    pub started_at: DateTime<Utc>,
    pub context: TaskContext,
}
