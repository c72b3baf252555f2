use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use tokio::sync::oneshot;

use crate::core::Error;

pub type Outcome<V> = Result<V, Arc<Error>>;

type OnPoll = Arc<dyn Fn() + Send + Sync>;

/// Completes the [Pending] it was created with.
pub(crate) struct Responder<V>(oneshot::Sender<Outcome<V>>);

impl<V> Responder<V> {
    pub(crate) fn send(self, outcome: Outcome<V>) {
        // Every caller may have dropped its future.
        let _ = self.0.send(outcome);
    }
}

/// The value of one in-flight key, shared by every caller that asked for it.
///
/// Clones resolve together; [Pending::ptr_eq] tells whether two callers got
/// the same request.
///
/// Like any future it does nothing until polled: the first poll of each clone
/// reports to the loader that a caller is now waiting on its window.
pub struct Pending<V: Clone> {
    inner: Shared<BoxFuture<'static, Outcome<V>>>,
    on_poll: Option<OnPoll>,
}

impl<V: Clone + Send + Sync + 'static> Pending<V> {
    pub(crate) fn channel(on_poll: impl Fn() + Send + Sync + 'static) -> (Responder<V>, Self) {
        let (tx, rx) = oneshot::channel();
        let inner = rx
            .map(|outcome| outcome.unwrap_or_else(|_| Err(Arc::new(Error::Canceled))))
            .boxed()
            .shared();
        (Responder(tx), Self { inner, on_poll: Some(Arc::new(on_poll)) })
    }
}

impl<V: Clone> Pending<V> {
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.inner.ptr_eq(&other.inner)
    }
}

impl<V: Clone> Clone for Pending<V> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), on_poll: self.on_poll.clone() }
    }
}

impl<V: Clone> Future for Pending<V> {
    type Output = Outcome<V>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(on_poll) = this.on_poll.take() {
            on_poll();
        }
        this.inner.poll_unpin(cx)
    }
}
