//! `harvester-tasks`: registry, middleware chain and executor for named tasks.
//!
//! # Overview
//!
//! Tasks are registered once at startup into a [`TaskRegistry`], either one by
//! one or through a [`TaskSource`] that declares a group of tasks bound to a
//! shared owning instance. The registry is then frozen behind an `Arc` and
//! handed to a [`TaskExecutor`], which runs executions with:
//!
//! | Concern       | Behaviour                                                       |
//! |---------------|-----------------------------------------------------------------|
//! | Retry         | up to `retries` extra attempts, capped exponential back-off     |
//! | Timeout       | per-attempt budget, attempt fails with [`TaskError::Timeout`]   |
//! | Cancellation  | cooperative, via the [`CancelSignal`] handed to the handler     |
//! | Middleware    | `before` / `after` / `on_error` hooks in registration order     |
//!
//! [`CancelSignal`]: harvester_core::CancelSignal

pub mod error;
pub mod executor;
pub mod handler;
pub mod middleware;
pub mod registry;
mod retry;
pub mod types;

pub use error::{Result, TaskError};
pub use executor::{ExecutionRequest, TaskExecutor};
pub use handler::{bind, InstanceCell, TaskHandler, TaskOutput};
pub use middleware::{
    logging::LoggingMiddleware, persistence::PersistenceMiddleware, Middleware,
    MiddlewareChain, MiddlewareDecision,
};
pub use registry::{TaskDeclaration, TaskDefinition, TaskInfo, TaskRegistry, TaskSource};
pub use types::{LogEntry, RunningTask, TaskContext, TaskOptions, TaskResult};
