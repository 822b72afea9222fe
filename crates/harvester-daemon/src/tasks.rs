//! Tasks every daemon ships with.

use std::sync::Arc;
use std::time::Duration;

use harvester_core::CancelSignal;
use harvester_tasks::{bind, InstanceCell, TaskDeclaration, TaskError, TaskOutput, TaskSource};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

/// Longest nap the `sleep` task accepts.
const MAX_SLEEP_MS: u64 = 3_600_000;

pub struct Builtins;

impl Builtins {
    async fn echo(&self, params: JsonValue) -> TaskOutput {
        Ok(params)
    }

    async fn sleep(&self, params: JsonValue, signal: CancelSignal) -> TaskOutput {
        let ms = match params.get("ms") {
            None => 1_000,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| TaskError::failed("invalid params: ms must be a non-negative integer"))?,
        };
        if ms > MAX_SLEEP_MS {
            return Err(TaskError::failed(format!(
                "invalid params: ms must be at most {MAX_SLEEP_MS}"
            )));
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "slept_ms": ms })),
            _ = signal.cancelled() => {
                debug!(ms, "sleep interrupted");
                Err(TaskError::Cancelled)
            }
        }
    }
}

/// Declares `echo` and `sleep` bound to the live [`Builtins`] instance.
pub struct BuiltinSource {
    cell: InstanceCell<Builtins>,
}

impl BuiltinSource {
    pub fn new() -> Self {
        Self {
            cell: InstanceCell::new(Builtins),
        }
    }
}

impl TaskSource for BuiltinSource {
    fn name(&self) -> &str {
        "builtins"
    }

    fn tasks(&self) -> Vec<TaskDeclaration> {
        vec![
            TaskDeclaration::new(
                "echo",
                bind(&self.cell, |b: Arc<Builtins>, params, _signal| async move {
                    b.echo(params).await
                }),
            )
            .describe("Return the params unchanged"),
            TaskDeclaration::new(
                "sleep",
                bind(&self.cell, |b: Arc<Builtins>, params, signal| async move {
                    b.sleep(params, signal).await
                }),
            )
            .describe("Wait `ms` milliseconds, stopping early when cancelled"),
        ]
    }
}
