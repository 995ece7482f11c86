//! Delays expressed as futures.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, WeakEventLoop};
use crate::future::{AwaitableFuture, Future};

/// Settles futures after a delay, using its loop's timer queue.
#[derive(Debug, Clone)]
pub struct Timer {
    event_loop: WeakEventLoop,
}

impl Timer {
    pub fn new(event_loop: &EventLoop) -> Self {
        Self {
            event_loop: event_loop.downgrade(),
        }
    }

    /// A timer on the loop driven by the calling thread.
    pub fn local() -> Result<Self> {
        EventLoop::local()
            .map(|l| Timer::new(&l))
            .ok_or(Error::NotRegistered)
    }

    /// Completes `future` once `delay` has elapsed.
    pub fn wait_async(&self, future: &Future<()>, delay: Duration) -> Result<()> {
        let event_loop = self.event_loop.upgrade().ok_or(Error::LoopGone)?;
        let future = future.clone();
        event_loop.run_after(delay, move || future.complete(()));
        Ok(())
    }

    /// Suspends the calling fiber for `delay`.
    pub async fn sleep(&self, delay: Duration) -> Result<()> {
        let future = AwaitableFuture::new();
        self.wait_async(&future, delay)?;
        future.await
    }
}

/// Suspends the calling fiber for `delay` using the current loop's timers.
pub async fn sleep(delay: Duration) -> Result<()> {
    Timer::local()?.sleep(delay).await
}
