use std::ops::Deref;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::future::Future;

/// A [`Future`] that a fiber can `.await`.
///
/// Awaiting parks the current fiber: the waker stored in the future's callback slot re-queues
/// the fiber on its loop once the future settles, and the fiber picks up right after the
/// `.await` with the outcome in hand.
///
/// Outside any event loop, [`wait`](Self::wait) and [`get`](Self::get) fall back to blocking
/// the OS thread. On a thread that drives a loop they refuse with
/// [`Error::BlockingInLoop`], since blocking there would stall every fiber on that loop.
pub struct AwaitableFuture<T> {
    inner: Future<T>,
}

impl<T> AwaitableFuture<T> {
    pub fn new() -> Self {
        Self {
            inner: Future::new(),
        }
    }

    /// Blocks the calling OS thread until the future settles.
    pub fn wait(&self) -> Result<()> {
        if EventLoop::is_in_loop() {
            return Err(Error::BlockingInLoop);
        }
        self.inner.wait();
        Ok(())
    }

    /// The plain future this wraps, for handing to channel operations.
    pub fn as_future(&self) -> &Future<T> {
        &self.inner
    }

    pub fn into_inner(self) -> Future<T> {
        self.inner
    }
}

impl<T: Clone> AwaitableFuture<T> {
    /// Blocks until settled and returns the outcome.
    pub fn get(&self) -> Result<T> {
        if EventLoop::is_in_loop() {
            return Err(Error::BlockingInLoop);
        }
        self.inner.get()
    }
}

impl<T> Default for AwaitableFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for AwaitableFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for AwaitableFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AwaitableFuture").field(&self.inner).finish()
    }
}

impl<T> From<Future<T>> for AwaitableFuture<T> {
    fn from(inner: Future<T>) -> Self {
        Self { inner }
    }
}

impl<T> Deref for AwaitableFuture<T> {
    type Target = Future<T>;

    fn deref(&self) -> &Future<T> {
        &self.inner
    }
}

impl<T: Clone> std::future::Future for AwaitableFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let waker = cx.waker().clone();
        match self
            .inner
            .poll_or_register(move || Box::new(move |_: &Future<T>| waker.wake()))
        {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}
