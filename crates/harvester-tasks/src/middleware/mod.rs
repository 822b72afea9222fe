//! Ordered before / after / on_error hooks around every execution.

pub mod logging;
pub mod persistence;

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{debug, error, warn};

use crate::error::TaskError;
use crate::types::{TaskContext, TaskResult};

/// What a `before` hook wants the executor to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareDecision {
    Continue,
    Abort,
}

/// A pluggable observer of (and, through `before`, gate on) executions.
///
/// Every hook has a no-op default so implementations only override what they
/// need. Errors returned from any hook are logged and swallowed by the chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn before(&self, _ctx: &TaskContext) -> anyhow::Result<MiddlewareDecision> {
        Ok(MiddlewareDecision::Continue)
    }

    async fn after(&self, _ctx: &TaskContext, _result: &TaskResult) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_error(&self, _ctx: &TaskContext, _error: &TaskError) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Registration-ordered list of middleware.
#[derive(Default)]
pub struct MiddlewareChain {
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the end of the chain.
    pub fn push(&self, middleware: Arc<dyn Middleware>) {
        let mut list = self.middleware.write().expect("middleware chain poisoned");
        debug!(middleware = middleware.name(), position = list.len(), "middleware registered");
        list.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middleware.read().expect("middleware chain poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // The lock is never held across an await.
    fn snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.middleware.read().expect("middleware chain poisoned").clone()
    }

    /// Run every `before` hook in order, stopping at the first `Abort`.
    ///
    /// A hook that errors or panics counts as `Continue`.
    pub async fn run_before(&self, ctx: &TaskContext) -> MiddlewareDecision {
        for mw in self.snapshot() {
            let t = Instant::now();
            let outcome = AssertUnwindSafe(mw.before(ctx)).catch_unwind().await;
            let elapsed_ms = t.elapsed().as_millis() as u64;

            match outcome {
                Ok(Ok(MiddlewareDecision::Continue)) => {
                    debug!(middleware = mw.name(), duration_ms = elapsed_ms, "before hook completed");
                }
                Ok(Ok(MiddlewareDecision::Abort)) => {
                    warn!(
                        middleware = mw.name(),
                        execution_id = %ctx.execution_id,
                        task = %ctx.task_name,
                        "middleware aborted execution"
                    );
                    return MiddlewareDecision::Abort;
                }
                Ok(Err(e)) => {
                    error!(middleware = mw.name(), error = %format!("{e:#}"), "before hook failed");
                }
                Err(_) => {
                    error!(middleware = mw.name(), "before hook panicked");
                }
            }
        }
        MiddlewareDecision::Continue
    }

    /// Run every `after` hook in order. Never fails.
    pub async fn run_after(&self, ctx: &TaskContext, result: &TaskResult) {
        for mw in self.snapshot() {
            let outcome = AssertUnwindSafe(mw.after(ctx, result)).catch_unwind().await;
            report(mw.name(), "after", outcome);
        }
    }

    /// Run every `on_error` hook in order. Never fails.
    pub async fn run_on_error(&self, ctx: &TaskContext, err: &TaskError) {
        for mw in self.snapshot() {
            let outcome = AssertUnwindSafe(mw.on_error(ctx, err)).catch_unwind().await;
            report(mw.name(), "on_error", outcome);
        }
    }
}

fn report(
    name: &str,
    hook: &'static str,
    outcome: std::thread::Result<anyhow::Result<()>>,
) {
    match outcome {
        Ok(Ok(())) => debug!(middleware = name, hook, "hook completed"),
        Ok(Err(e)) => error!(middleware = name, hook, error = %format!("{e:#}"), "hook failed"),
        Err(_) => error!(middleware = name, hook, "hook panicked"),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use harvester_core::{CancelSignal, ExecutionId, ExecutionStatus, TriggerSource};
    use serde_json::json;
    use std::sync::Mutex;

    pub(crate) fn sample_context() -> TaskContext {
        let now = Utc::now();
        TaskContext {
            execution_id: ExecutionId::new(),
            task_name: "sample".into(),
            params: json!({}),
            source: TriggerSource::Manual,
            trigger_name: None,
            retry_count: 0,
            max_retries: 0,
            started_at: now,
            attempt_started_at: now,
            status: ExecutionStatus::Running,
            logs: Vec::new(),
            result: None,
            signal: CancelSignal::new(),
        }
    }

    /// Records every hook call into a shared journal.
    pub(crate) struct Recorder {
        pub label: &'static str,
        pub journal: Arc<Mutex<Vec<String>>>,
        pub decision: MiddlewareDecision,
        pub fail: bool,
    }

    impl Recorder {
        pub fn new(label: &'static str, journal: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                label,
                journal: Arc::clone(journal),
                decision: MiddlewareDecision::Continue,
                fail: false,
            }
        }

        fn note(&self, hook: &str) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}.{hook}", self.label));
        }
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        async fn before(&self, _ctx: &TaskContext) -> anyhow::Result<MiddlewareDecision> {
            self.note("before");
            if self.fail {
                anyhow::bail!("{} broke", self.label);
            }
            Ok(self.decision)
        }

        async fn after(&self, _ctx: &TaskContext, _result: &TaskResult) -> anyhow::Result<()> {
            self.note("after");
            if self.fail {
                anyhow::bail!("{} broke", self.label);
            }
            Ok(())
        }

        async fn on_error(&self, _ctx: &TaskContext, _err: &TaskError) -> anyhow::Result<()> {
            self.note("on_error");
            if self.fail {
                anyhow::bail!("{} broke", self.label);
            }
            Ok(())
        }
    }

    struct Panicker;

    #[async_trait]
    impl Middleware for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }

        async fn on_error(&self, _ctx: &TaskContext, _err: &TaskError) -> anyhow::Result<()> {
            panic!("observer bug");
        }
    }

    #[tokio::test]
    async fn before_stops_at_first_abort() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new();
        chain.push(Arc::new(Recorder::new("a", &journal)));
        let mut gate = Recorder::new("gate", &journal);
        gate.decision = MiddlewareDecision::Abort;
        chain.push(Arc::new(gate));
        chain.push(Arc::new(Recorder::new("c", &journal)));

        let decision = chain.run_before(&sample_context()).await;
        assert_eq!(decision, MiddlewareDecision::Abort);
        assert_eq!(*journal.lock().unwrap(), vec!["a.before", "gate.before"]);
    }

    #[tokio::test]
    async fn failing_before_hook_counts_as_continue() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new();
        let mut broken = Recorder::new("broken", &journal);
        broken.fail = true;
        chain.push(Arc::new(broken));
        chain.push(Arc::new(Recorder::new("next", &journal)));

        let decision = chain.run_before(&sample_context()).await;
        assert_eq!(decision, MiddlewareDecision::Continue);
        assert_eq!(*journal.lock().unwrap(), vec!["broken.before", "next.before"]);
    }

    #[tokio::test]
    async fn broken_observers_do_not_block_the_rest() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new();
        let mut broken = Recorder::new("broken", &journal);
        broken.fail = true;
        chain.push(Arc::new(broken));
        chain.push(Arc::new(Panicker));
        chain.push(Arc::new(Recorder::new("logger", &journal)));

        chain
            .run_on_error(&sample_context(), &TaskError::failed("boom"))
            .await;
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["broken.on_error", "logger.on_error"]
        );
    }
}
