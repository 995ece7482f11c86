//! Fibers: cooperatively scheduled units of execution owned by one event loop.
//!
//! A fiber wraps a boxed future. Resuming it means polling that future once on the loop
//! thread; suspending means the poll returned `Pending` after parking a waker somewhere, most
//! often in an [`AwaitableFuture`](crate::AwaitableFuture)'s callback slot. Waking re-queues the
//! fiber on its loop with [`EventLoop::run_in_loop_soon`], so a resumed fiber always runs after
//! the code that woke it and behind every task queued before the wake.
//!
//! Ownership while suspended sits with the loop's fiber table. Wakers only hold a weak
//! reference, so a fiber waiting on a future that never settles is freed with its loop.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use metrics::gauge;
use parking_lot::Mutex;
use tracing::warn;

use crate::error::panic_message;
use crate::event_loop::{EventLoop, FiberContext, WeakEventLoop};
use crate::waker::fiber_waker;

/// Suspended; the next wake queues a resumption.
const IDLE: u8 = 0;
/// A resumption task is queued.
const SCHEDULED: u8 = 1;
/// Being polled right now.
const RUNNING: u8 = 2;
/// Woken while running; re-queue once the current poll returns.
const NOTIFIED: u8 = 3;
const COMPLETE: u8 = 4;

/// A cooperatively scheduled unit of execution.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    event_loop: WeakEventLoop,
}

impl Fiber {
    pub(crate) fn new(
        id: u64,
        future: BoxFuture<'static, ()>,
        event_loop: WeakEventLoop,
    ) -> Arc<Self> {
        gauge!("fibra_fibers_live").increment(1.0);
        Arc::new(Self {
            id,
            state: AtomicU8::new(IDLE),
            future: Mutex::new(Some(future)),
            event_loop,
        })
    }

    /// The fiber executing on the calling thread, if any.
    pub fn current() -> Option<Arc<Fiber>> {
        EventLoop::local_fiber()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETE
    }

    /// The loop that owns this fiber, if it is still alive.
    pub fn event_loop(&self) -> Option<EventLoop> {
        self.event_loop.upgrade()
    }

    /// Queues a resumption unless one is already pending.
    ///
    /// Waking a running fiber marks it so it is re-queued as soon as the current poll returns;
    /// repeated wakes collapse into a single resumption.
    pub(crate) fn schedule(self: &Arc<Self>) {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let next = match state {
                IDLE => SCHEDULED,
                RUNNING => NOTIFIED,
                _ => return,
            };
            match self
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if next == SCHEDULED {
                        self.enqueue();
                    }
                    return;
                }
                Err(actual) => state = actual,
            }
        }
    }

    fn enqueue(self: &Arc<Self>) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            let fiber = self.clone();
            event_loop.run_in_loop_soon(move || fiber.resume());
        }
    }

    /// Polls the fiber once. Runs on the owning loop's thread.
    fn resume(self: Arc<Self>) {
        self.state.store(RUNNING, Ordering::Release);
        let Some(mut future) = self.future.lock().take() else {
            return;
        };

        let waker = fiber_waker(Arc::downgrade(&self));
        let mut cx = Context::from_waker(&waker);
        let polled = {
            let _context = FiberContext::enter(self.clone());
            panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
        };
        let polled = polled.unwrap_or_else(|payload| {
            // Only reachable when settling the output unwinds, e.g. from a user callback.
            warn!(
                fiber_id = self.id,
                panic = %panic_message(payload.as_ref()),
                "fiber unwound while finishing; released"
            );
            Poll::Ready(())
        });

        match polled {
            Poll::Ready(()) => {
                self.state.store(COMPLETE, Ordering::Release);
                drop(future);
                if let Some(event_loop) = self.event_loop.upgrade() {
                    event_loop.release_fiber(self.id);
                }
            }
            Poll::Pending => {
                *self.future.lock() = Some(future);
                if self
                    .state
                    .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Woken during the poll.
                    self.state.store(SCHEDULED, Ordering::Release);
                    self.enqueue();
                }
            }
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        gauge!("fibra_fibers_live").decrement(1.0);
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state.load(Ordering::Acquire))
            .finish()
    }
}
