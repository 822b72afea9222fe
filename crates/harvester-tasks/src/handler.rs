use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use harvester_core::CancelSignal;
use serde_json::Value as JsonValue;
use tracing::info;

use crate::error::TaskError;

pub type TaskOutput = Result<JsonValue, TaskError>;

/// The callable behind a registered task.
///
/// Handlers must observe `signal` to stop early; the executor never kills a
/// handler outright except by dropping it when its timeout elapses.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, params: JsonValue, signal: CancelSignal) -> TaskOutput;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(JsonValue, CancelSignal) -> Fut + Send + Sync,
    Fut: Future<Output = TaskOutput> + Send + 'static,
{
    async fn run(&self, params: JsonValue, signal: CancelSignal) -> TaskOutput {
        (self)(params, signal).await
    }
}

/// Slot holding the live owning instance of a group of tasks.
///
/// Handlers produced by [`bind`] look the instance up on every call, so a
/// [`replace`](InstanceCell::replace) is observed by the next execution
/// without touching the registry.
pub struct InstanceCell<S> {
    current: Arc<RwLock<Arc<S>>>,
}

impl<S> Clone for InstanceCell<S> {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
        }
    }
}

impl<S: Send + Sync + 'static> InstanceCell<S> {
    pub fn new(instance: S) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(instance))),
        }
    }

    pub fn current(&self) -> Arc<S> {
        Arc::clone(&self.current.read().expect("instance cell poisoned"))
    }

    /// Swap in a new owning instance. Executions already running keep the
    /// instance they started with.
    pub fn replace(&self, instance: S) {
        *self.current.write().expect("instance cell poisoned") = Arc::new(instance);
        info!(instance = std::any::type_name::<S>(), "task owner instance replaced");
    }
}

/// Bind `method` to whatever instance `cell` holds at call time.
pub fn bind<S, M, Fut>(cell: &InstanceCell<S>, method: M) -> impl TaskHandler
where
    S: Send + Sync + 'static,
    M: Fn(Arc<S>, JsonValue, CancelSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskOutput> + Send + 'static,
{
    let cell = cell.clone();
    move |params: JsonValue, signal: CancelSignal| method(cell.current(), params, signal)
}
