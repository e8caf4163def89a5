// Copyright (c) 2026, The AmqpSync Authors
// MIT License
// All rights reserved.

//! # Completion Signal
//!
//! This module provides the synchronization primitive used to let a blocking
//! caller wait for an asynchronous broker completion. A signal is a countdown
//! latch: every pending completion registers itself with `begin`, every
//! finished completion calls `end` (or `fail`), and `wait` resolves once the
//! count returns to zero.
//!
//! A single signal may be shared across many in-flight operations, which is
//! how batch patterns work: register N begins up front, hand the same signal
//! to N operations, and `wait` returns only after all N have completed.

use crate::errors::AmqpError;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct SignalState {
    pending: usize,
    result: Option<String>,
    failure: Option<AmqpError>,
}

/// A cloneable countdown latch carrying an optional result value.
///
/// Exactly one completion path per registered `begin` is expected to call
/// `end`, `end_with`, or `fail`. Calling `end` with nothing pending is a
/// logged no-op rather than an error, so a late broker-initiated event
/// (for example a consumer cancellation racing a normal completion) can
/// never underflow the counter.
#[derive(Clone, Debug, Default)]
pub struct CompletionSignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug, Default)]
struct SignalInner {
    state: Mutex<SignalState>,
    notify: Notify,
}

impl CompletionSignal {
    /// Creates a signal with no pending completions.
    ///
    /// A fresh signal resolves immediately; callers register interest with
    /// `begin` before handing it to an operation.
    pub fn new() -> CompletionSignal {
        CompletionSignal::default()
    }

    /// Registers one pending completion.
    pub fn begin(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.pending += 1;
    }

    /// Marks one pending completion as finished.
    pub fn end(&self) {
        self.finish(None, None)
    }

    /// Marks one pending completion as finished, carrying a result value.
    ///
    /// The only operation whose result a caller needs beyond success or
    /// failure is queue declaration, which carries the broker-resolved
    /// queue name here.
    pub fn end_with(&self, result: String) {
        self.finish(Some(result), None)
    }

    /// Marks one pending completion as failed.
    ///
    /// The first recorded failure wins; later ones still decrement the
    /// counter so `wait` can resolve.
    pub fn fail(&self, error: AmqpError) {
        self.finish(None, Some(error))
    }

    /// Number of completions still pending.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().unwrap().pending
    }

    /// Waits until every registered completion has finished.
    ///
    /// Returns the carried result value, or the first recorded failure.
    /// This is the single suspension point of the blocking facade; it
    /// yields to the runtime and never occupies a dedicated thread.
    pub async fn wait(&self) -> Result<Option<String>, AmqpError> {
        loop {
            let notified = self.inner.notify.notified();

            {
                let state = self.inner.state.lock().unwrap();
                if state.pending == 0 {
                    return match &state.failure {
                        Some(err) => Err(err.clone()),
                        None => Ok(state.result.clone()),
                    };
                }
            }

            notified.await;
        }
    }

    fn finish(&self, result: Option<String>, failure: Option<AmqpError>) {
        {
            let mut state = self.inner.state.lock().unwrap();

            if state.pending == 0 {
                debug!("completion signal already resolved, ignoring extra end");
            } else {
                state.pending -= 1;
            }

            if result.is_some() {
                state.result = result;
            }

            if state.failure.is_none() {
                state.failure = failure;
            }
        }

        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn wait_resolves_immediately_without_begins() {
        let signal = CompletionSignal::new();
        assert_eq!(signal.wait().await, Ok(None));
    }

    #[tokio::test]
    async fn wait_resolves_after_matching_end() {
        let signal = CompletionSignal::new();
        signal.begin();

        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        signal.end();

        let resolved = timeout(Duration::from_secs(1), handle)
            .await
            .expect("wait should resolve")
            .unwrap();
        assert_eq!(resolved, Ok(None));
    }

    #[tokio::test]
    async fn wait_returns_carried_result() {
        let signal = CompletionSignal::new();
        signal.begin();
        signal.end_with("amq.gen-abc".to_owned());

        assert_eq!(signal.wait().await, Ok(Some("amq.gen-abc".to_owned())));
    }

    #[tokio::test]
    async fn first_failure_wins() {
        let signal = CompletionSignal::new();
        signal.begin();
        signal.begin();
        signal.fail(AmqpError::PublishingError);
        signal.fail(AmqpError::InternalError);

        assert_eq!(signal.wait().await, Err(AmqpError::PublishingError));
    }

    #[tokio::test]
    async fn extra_end_does_not_underflow() {
        let signal = CompletionSignal::new();
        signal.begin();
        signal.end();
        signal.end();

        assert_eq!(signal.pending(), 0);
        assert_eq!(signal.wait().await, Ok(None));
    }

    #[tokio::test]
    async fn batch_of_hundred_ends_resolves_once() {
        let signal = CompletionSignal::new();
        for _ in 0..100 {
            signal.begin();
        }

        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        for _ in 0..100 {
            let ender = signal.clone();
            tokio::spawn(async move { ender.end() });
        }

        let resolved = timeout(Duration::from_secs(5), handle)
            .await
            .expect("batched wait should resolve")
            .unwrap();
        assert_eq!(resolved, Ok(None));
        assert_eq!(signal.pending(), 0);
    }
}
