//! One-shot cooperative cancellation.
//!
//! [`CancelSignal`] wraps a [`CancellationToken`] and adds the one operation
//! the token lacks: [`CancelSignal::combine`], which produces a signal that
//! fires as soon as any of its inputs fires. Every execution's effective
//! signal is built this way from the executor's own controller and whatever
//! signal the caller supplied.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cloneable "stop now" flag. Clones share state; cancelling any clone
/// cancels all of them. Cancelling more than once is a no-op.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal has fired (immediately if it already has).
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Run `callback` once, when this signal fires.
    ///
    /// If the signal already fired the callback runs inline and the returned
    /// subscription is inert. Dropping the subscription before the signal
    /// fires unsubscribes the callback. Must be called inside a Tokio runtime.
    #[must_use = "dropping the subscription unsubscribes the callback"]
    pub fn on_cancel<F>(&self, callback: F) -> CancelSubscription
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_cancelled() {
            callback();
            return CancelSubscription { relay: None };
        }
        let token = self.token.clone();
        let relay = tokio::spawn(async move {
            token.cancelled().await;
            callback();
        });
        CancelSubscription { relay: Some(relay) }
    }

    /// Build a signal that fires when any of `signals` fires.
    ///
    /// First signal wins: the combined signal fires exactly once no matter how
    /// many inputs fire afterwards. One relay task is spawned per input and
    /// every relay exits as soon as the combined signal fires, so short-lived
    /// combinations do not accumulate listeners on long-lived inputs as long
    /// as the combined signal is eventually cancelled. Must be called inside a
    /// Tokio runtime.
    pub fn combine(signals: &[CancelSignal]) -> CancelSignal {
        let combined = CancelSignal::new();

        if signals.iter().any(CancelSignal::is_cancelled) {
            combined.cancel();
            return combined;
        }

        for source in signals {
            let source = source.token.clone();
            let target = combined.token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = source.cancelled() => target.cancel(),
                    _ = target.cancelled() => {}
                }
            });
        }

        combined
    }
}

/// Keeps an [`CancelSignal::on_cancel`] callback registered until dropped.
#[derive(Debug)]
pub struct CancelSubscription {
    relay: Option<JoinHandle<()>>,
}

impl CancelSubscription {
    /// Keep the callback registered for the lifetime of the signal.
    pub fn detach(mut self) {
        self.relay.take();
    }
}

impl Drop for CancelSubscription {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn clones_share_state() {
        let a = CancelSignal::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
        b.cancelled().await;
    }

    #[tokio::test]
    async fn combined_fires_when_any_input_fires() {
        let a = CancelSignal::new();
        let b = CancelSignal::new();
        let combined = CancelSignal::combine(&[a.clone(), b.clone()]);
        assert!(!combined.is_cancelled());

        b.cancel();
        tokio::time::timeout(Duration::from_secs(1), combined.cancelled())
            .await
            .expect("combined signal should fire");
        assert!(!a.is_cancelled());
    }

    #[tokio::test]
    async fn combining_an_already_cancelled_input_is_immediate() {
        let a = CancelSignal::new();
        a.cancel();
        let combined = CancelSignal::combine(&[CancelSignal::new(), a]);
        assert!(combined.is_cancelled());
    }

    #[tokio::test]
    async fn combined_fires_once_even_if_every_input_fires() {
        let a = CancelSignal::new();
        let b = CancelSignal::new();
        let combined = CancelSignal::combine(&[a.clone(), b.clone()]);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        combined
            .on_cancel(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .detach();

        a.cancel();
        b.cancel();
        combined.cancel();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelling_combined_does_not_touch_inputs() {
        let a = CancelSignal::new();
        let combined = CancelSignal::combine(&[a.clone()]);
        combined.cancel();
        settle().await;
        assert!(!a.is_cancelled());
    }

    #[tokio::test]
    async fn dropped_subscription_never_runs() {
        let signal = CancelSignal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let sub = signal.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(sub);
        signal.cancel();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn on_cancel_runs_inline_when_already_fired() {
        let signal = CancelSignal::new();
        signal.cancel();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _sub = signal.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
