use thiserror::Error;

/// Errors produced by the registry, the executor and task handlers.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// A second registration tried to claim an existing name.
    #[error("Task name conflict: {name} is already registered")]
    NameConflict { name: String },

    /// Execution requested for a name nobody registered. Never retried.
    #[error("Task not found: {name}")]
    NotFound { name: String },

    /// No in-flight execution has this id.
    #[error("Execution not found: {id}")]
    ExecutionNotFound { id: String },

    /// One attempt exceeded its budget. Retryable.
    #[error("Task timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Cooperative cancellation was observed. Terminal, never retried.
    #[error("Task was cancelled")]
    Cancelled,

    /// A `before` hook denied the execution.
    #[error("Task aborted by middleware")]
    AbortedByMiddleware,

    /// The handler reported a failure. Retryable.
    #[error("Task failed: {0}")]
    Failed(String),
}

impl TaskError {
    pub fn failed(reason: impl Into<String>) -> Self {
        TaskError::Failed(reason.into())
    }

    /// True when another attempt may be made after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Timeout { .. } | TaskError::Failed(_))
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        TaskError::Failed(format!("{e:#}"))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        TaskError::Failed(format!("invalid params: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
