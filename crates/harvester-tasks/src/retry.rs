use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use harvester_core::config::ExecutorConfig;
use harvester_core::CancelSignal;
use serde_json::Value as JsonValue;

use crate::error::TaskError;
use crate::handler::{TaskHandler, TaskOutput};

/// Capped exponential back-off between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Backoff {
    floor: Duration,
    ceiling: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling: ceiling.max(floor),
        }
    }

    pub fn from_config(cfg: &ExecutorConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.backoff_floor_ms),
            Duration::from_millis(cfg.backoff_ceiling_ms),
        )
    }

    /// Delay before retry number `retry` (1-based). The first attempt never
    /// waits, so `retry == 0` yields zero.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        self.floor.saturating_mul(factor).min(self.ceiling)
    }
}

/// Run one attempt, racing it against `timeout` when one is set.
///
/// On timeout `attempt_signal` is fired before the handler future is
/// dropped, so a handler that watches the signal sees it. Panics inside the
/// handler become ordinary attempt failures.
pub(crate) async fn run_attempt(
    handler: Arc<dyn TaskHandler>,
    params: JsonValue,
    attempt_signal: CancelSignal,
    timeout: Option<Duration>,
) -> TaskOutput {
    let call = AssertUnwindSafe(handler.run(params, attempt_signal.clone())).catch_unwind();
    let guarded = async move {
        match call.await {
            Ok(output) => output,
            Err(panic) => Err(TaskError::failed(panic_message(&panic))),
        }
    };

    let Some(budget) = timeout else {
        return guarded.await;
    };

    tokio::select! {
        biased;
        output = guarded => output,
        _ = tokio::time::sleep(budget) => {
            attempt_signal.cancel();
            Err(TaskError::Timeout { ms: budget.as_millis() as u64 })
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::Instant;

    #[test]
    fn delay_doubles_then_caps() {
        let b = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(b.delay_for(0), Duration::ZERO);
        assert_eq!(b.delay_for(1), Duration::from_millis(100));
        assert_eq!(b.delay_for(2), Duration::from_millis(200));
        assert_eq!(b.delay_for(3), Duration::from_millis(400));
        assert_eq!(b.delay_for(4), Duration::from_millis(500));
        assert_eq!(b.delay_for(64), Duration::from_millis(500));
    }

    #[test]
    fn ceiling_below_floor_is_raised() {
        let b = Backoff::new(Duration::from_millis(300), Duration::from_millis(10));
        assert_eq!(b.delay_for(5), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn timeout_fires_signal_and_fails_attempt() {
        let handler: Arc<dyn TaskHandler> = Arc::new(|_p: JsonValue, _s: CancelSignal| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, TaskError>(json!("late"))
        });

        let signal = CancelSignal::new();
        let started = Instant::now();
        let out = run_attempt(
            handler,
            json!({}),
            signal.clone(),
            Some(Duration::from_millis(50)),
        )
        .await;

        assert!(matches!(out, Err(TaskError::Timeout { ms: 50 })));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn panic_becomes_failure() {
        let handler: Arc<dyn TaskHandler> =
            Arc::new(|_p: JsonValue, _s: CancelSignal| async move {
                if true {
                    panic!("kaboom");
                }
                Ok::<_, TaskError>(JsonValue::Null)
            });
        let out = run_attempt(handler, json!({}), CancelSignal::new(), None).await;
        match out {
            Err(TaskError::Failed(msg)) => assert!(msg.contains("kaboom")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
