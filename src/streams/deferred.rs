//! Settle-once completion cells backing the writer's `ready` and `closed` futures.
//!
//! A [`Deferred`] behaves like a promise: it starts pending or settled, settles at
//! most once, and every [`SignalFuture`] taken from it observes the same outcome.
//! Replacing a deferred (rather than settling it) leaves futures taken from the old
//! one untouched, which is how a resolved `ready` future goes back to pending.

use super::StreamResult;
use super::error::StreamError;
use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

pub(crate) struct Deferred {
    tx: Option<oneshot::Sender<StreamResult<()>>>,
    rx: Shared<oneshot::Receiver<StreamResult<()>>>,
    /// `Some(is_ok)` once settled
    outcome: Option<bool>,
}

impl Deferred {
    pub(crate) fn pending() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Some(tx),
            rx: rx.shared(),
            outcome: None,
        }
    }

    pub(crate) fn settled(result: StreamResult<()>) -> Self {
        let mut deferred = Self::pending();
        deferred.settle(result);
        deferred
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.outcome.is_none()
    }

    /// Settle if still pending; a settled deferred ignores further outcomes.
    pub(crate) fn settle(&mut self, result: StreamResult<()>) {
        if let Some(tx) = self.tx.take() {
            self.outcome = Some(result.is_ok());
            let _ = tx.send(result);
        }
    }

    /// Reject if pending, otherwise swap in a freshly rejected deferred.
    pub(crate) fn ensure_rejected(&mut self, error: StreamError) {
        if self.is_pending() {
            self.settle(Err(error));
        } else {
            *self = Self::settled(Err(error));
        }
    }

    /// Swap in a fresh pending deferred unless this one is still pending.
    pub(crate) fn ensure_pending(&mut self) {
        if !self.is_pending() {
            *self = Self::pending();
        }
    }

    /// Swap in a fresh pending deferred if this one resolved successfully.
    /// A rejected deferred is left alone.
    pub(crate) fn reset_if_resolved(&mut self) {
        if self.outcome == Some(true) {
            *self = Self::pending();
        }
    }

    /// Bring this deferred in line with `target` (`None` meaning pending)
    /// without orphaning futures that already wait on a pending outcome.
    pub(crate) fn reconcile(&mut self, target: Option<StreamResult<()>>) {
        match target {
            None => self.ensure_pending(),
            Some(result) => match self.outcome {
                None => self.settle(result),
                Some(was_ok) if was_ok != result.is_ok() => *self = Self::settled(result),
                Some(_) => {}
            },
        }
    }

    pub(crate) fn future(&self) -> SignalFuture {
        SignalFuture {
            inner: self.rx.clone(),
        }
    }
}

/// Future returned by `ready()` and `closed()` on a writer.
///
/// It does not borrow the writer, so it can be held across `release()`.
#[must_use = "futures do nothing unless polled"]
pub struct SignalFuture {
    inner: Shared<oneshot::Receiver<StreamResult<()>>>,
}

impl Future for SignalFuture {
    type Output = StreamResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner
            .poll_unpin(cx)
            .map(|result| result.unwrap_or(Err(StreamError::TaskDropped)))
    }
}
