//! The per-thread event loop.
//!
//! Each iteration of [`EventLoop::run`] does three things, in order:
//!
//! 1. blocks in the [`Selector`] until readiness, a notification, or the next timer,
//! 2. hands each [`IoEvent`] to its channel,
//! 3. fires due timers and runs the tasks queued since the previous iteration.
//!
//! Any thread may queue work with [`EventLoop::run_in_loop_soon`]. Queued tasks go into a
//! pending buffer that the loop swaps out wholesale at step 3, so tasks queued while a batch
//! runs wait for the next iteration, and the selector is notified at most once per batch.
//!
//! Stopping is terminal. Once `run` returns (or a loop that was never run is stopped), the
//! fibers, queued tasks and timers it still holds are dropped, and later submissions are
//! discarded: nothing could ever drive them.

mod context;
mod timer;

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::channel::{Handle, WeakChannel};
use crate::error::{Error, Result, panic_message};
use crate::fiber::Fiber;
use crate::future::{AwaitableFuture, Future};
use crate::reactor::{IoEvent, MioSelector, Selector};

pub(crate) use context::FiberContext;
use timer::TimerQueue;

/// A deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Events collected per `select` unless configured otherwise.
pub const DEFAULT_EVENT_CAPACITY: usize = 128;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

static NEXT_LOOP_ID: AtomicUsize = AtomicUsize::new(0);
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

struct PendingTasks {
    tasks: Vec<Task>,
    /// An execution pass is already scheduled; later enqueues need not notify.
    scheduled: bool,
}

struct Inner {
    id: usize,
    selector: Box<dyn Selector>,
    pending: Mutex<PendingTasks>,
    state: AtomicU8,
    waiting: AtomicBool,
    timers: Mutex<TimerQueue>,
    fibers: Mutex<HashMap<u64, Arc<Fiber>>>,
    event_capacity: usize,
}

/// Handle to an event loop.
///
/// Handles are cheap to clone and may be sent to other threads to queue work. Exactly one
/// thread drives the loop through [`run`](EventLoop::run).
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Inner>,
}

/// Non-owning handle to an [`EventLoop`].
///
/// Channels and fibers hold one of these so they never keep their loop alive.
#[derive(Clone, Default)]
pub struct WeakEventLoop {
    inner: Weak<Inner>,
}

impl WeakEventLoop {
    pub fn upgrade(&self) -> Option<EventLoop> {
        self.inner.upgrade().map(|inner| EventLoop { inner })
    }
}

impl fmt::Debug for WeakEventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakEventLoop")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.load(Ordering::Acquire))
            .field("waiting", &self.is_waiting())
            .field("timers", &self.inner.timers.lock().len())
            .field("fibers", &self.fiber_count())
            .finish()
    }
}

impl EventLoop {
    /// Creates a loop over a [`MioSelector`].
    pub fn new() -> Result<Self> {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Creates a loop over a [`MioSelector`] collecting up to `event_capacity` events per poll.
    pub fn with_capacity(event_capacity: usize) -> Result<Self> {
        let selector = MioSelector::new(event_capacity)?;
        Ok(Self::build(Box::new(selector), event_capacity))
    }

    /// Creates a loop that takes exclusive ownership of `selector`.
    pub fn with_selector<S>(selector: S) -> Self
    where
        S: Selector + 'static,
    {
        Self::build(Box::new(selector), DEFAULT_EVENT_CAPACITY)
    }

    fn build(selector: Box<dyn Selector>, event_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
                selector,
                pending: Mutex::new(PendingTasks {
                    tasks: Vec::with_capacity(32),
                    scheduled: false,
                }),
                state: AtomicU8::new(IDLE),
                waiting: AtomicBool::new(false),
                timers: Mutex::new(TimerQueue::default()),
                fibers: Mutex::new(HashMap::new()),
                event_capacity,
            }),
        }
    }

    /// Process-unique id, used in logs.
    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn downgrade(&self) -> WeakEventLoop {
        WeakEventLoop {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Returns `true` if both handles refer to the same loop.
    pub fn ptr_eq(&self, other: &EventLoop) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The loop driven by the calling thread, if any.
    pub fn local() -> Option<EventLoop> {
        context::current_loop()
    }

    /// `true` if the calling thread is inside [`run`](EventLoop::run) of some loop.
    pub fn is_in_loop() -> bool {
        context::in_loop()
    }

    /// The fiber executing on the calling thread, if any.
    pub fn local_fiber() -> Option<Arc<Fiber>> {
        context::current_fiber()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == RUNNING
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STOPPED
    }

    /// `true` while the driving thread is blocked in the selector.
    pub fn is_waiting(&self) -> bool {
        self.inner.waiting.load(Ordering::Acquire)
    }

    /// Starts delivering events for `channel` to this loop.
    pub fn bind(&self, channel: WeakChannel) -> Result<()> {
        self.inner.selector.register(channel)?;
        Ok(())
    }

    /// Stops delivering events for `handle`.
    pub fn unbind(&self, handle: Handle) -> Result<()> {
        self.inner.selector.deregister(handle)?;
        Ok(())
    }

    /// Looks up a bound channel by its handle.
    pub fn find_channel(&self, handle: Handle) -> Option<crate::channel::ChannelPtr> {
        self.inner.selector.find_channel(handle)
    }

    /// Runs `task` now if called from this loop's own thread, otherwise queues it.
    ///
    /// A panic inside a synchronously executed task is caught and discarded.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if context::is_current_loop(self) {
            self.run_guarded(task);
            return;
        }
        self.run_in_loop_soon(task);
    }

    /// Queues `task` for the loop's next task pass. Safe from any thread.
    ///
    /// On a stopped loop the task is dropped without running.
    pub fn run_in_loop_soon<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut pending = self.inner.pending.lock();
        if self.is_stopped() {
            drop(pending);
            trace!(loop_id = self.inner.id, "task discarded by stopped loop");
            return;
        }
        pending.tasks.push(Box::new(task));
        let already_scheduled = std::mem::replace(&mut pending.scheduled, true);
        drop(pending);
        if !already_scheduled {
            self.notify();
        }
    }

    /// Queues `task` to run on the loop once `delay` has elapsed.
    ///
    /// A delay too large to be represented as a deadline never elapses; the task is dropped.
    /// On a stopped loop the task is dropped as well.
    pub fn run_after<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(deadline) = Instant::now().checked_add(delay) else {
            debug!(loop_id = self.inner.id, ?delay, "timer delay out of range; never fires");
            return;
        };
        let mut timers = self.inner.timers.lock();
        if self.is_stopped() {
            drop(timers);
            trace!(loop_id = self.inner.id, "timer discarded by stopped loop");
            return;
        }
        let earliest = timers.push(deadline, Box::new(task));
        drop(timers);
        if earliest && !context::is_current_loop(self) {
            self.notify();
        }
    }

    /// Starts `future` as a fiber owned by this loop.
    ///
    /// The fiber first runs on the loop's next task pass. The returned future settles with the
    /// fiber's output, with [`Error::FiberPanicked`] if it panics, or with
    /// [`Error::LoopStopped`] if the loop stops before the fiber finishes.
    pub fn launch<F>(&self, future: F) -> AwaitableFuture<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let output = AwaitableFuture::new();
        let slot = FiberOutput(Some(output.as_future().clone()));
        let loop_id = self.inner.id;
        let body = async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(value) => Ok(value),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(loop_id, panic = %message, "fiber panicked");
                    Err(Error::FiberPanicked(message))
                }
            };
            slot.settle(outcome);
        };

        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        let fiber = Fiber::new(id, Box::pin(body), self.downgrade());
        let accepted = {
            let mut fibers = self.inner.fibers.lock();
            if self.is_stopped() {
                false
            } else {
                fibers.insert(id, fiber.clone());
                true
            }
        };
        if !accepted {
            debug!(loop_id, fiber_id = id, "launch on stopped loop");
            return output;
        }
        counter!("fibra_fibers_launched_total").increment(1);
        fiber.schedule();
        output
    }

    /// Number of fibers owned by this loop that have not finished.
    pub fn fiber_count(&self) -> usize {
        self.inner.fibers.lock().len()
    }

    pub(crate) fn release_fiber(&self, id: u64) {
        let released = self.inner.fibers.lock().remove(&id);
        drop(released);
    }

    /// Drives the loop on the calling thread until [`stop`](EventLoop::stop) is called.
    ///
    /// Fails with [`Error::NestedLoop`] if this thread already drives a loop, with
    /// [`Error::LoopStopped`] if the loop was stopped, and with [`Error::AlreadyRunning`] if
    /// another thread drives it.
    pub fn run(&self) -> Result<()> {
        let _context = context::LoopContext::enter(self)?;
        if let Err(state) =
            self.inner
                .state
                .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            return Err(if state == STOPPED {
                Error::LoopStopped
            } else {
                Error::AlreadyRunning
            });
        }

        let loop_id = self.inner.id;
        debug!(loop_id, "event loop started");
        let mut events = Vec::with_capacity(self.inner.event_capacity);
        let mut tasks = Vec::with_capacity(32);

        while self.is_running() {
            let timeout = self.inner.timers.lock().next_timeout(Instant::now());

            self.inner.waiting.store(true, Ordering::Release);
            let selected = self.inner.selector.select(&mut events, timeout);
            self.inner.waiting.store(false, Ordering::Release);
            if let Err(err) = selected {
                error!(loop_id, error = %err, "selector failed; stopping loop");
                self.inner.state.store(STOPPED, Ordering::Release);
                self.release_remaining();
                return Err(err.into());
            }

            for event in events.drain(..) {
                if let Some(channel) = event.channel() {
                    self.run_guarded(move || channel.on_event(&event));
                }
            }

            self.fire_timers();
            self.execute_tasks(&mut tasks);
        }

        self.release_remaining();
        debug!(loop_id, "event loop exited");
        Ok(())
    }

    /// Stops the loop. Idempotent; a stopped loop cannot be run again.
    ///
    /// A running loop finishes its current iteration first. A loop that was never run
    /// releases its fibers, tasks and timers right away.
    pub fn stop(&self) {
        match self.inner.state.swap(STOPPED, Ordering::AcqRel) {
            STOPPED => {}
            IDLE => {
                debug!(loop_id = self.inner.id, "idle event loop stopped");
                self.release_remaining();
            }
            _ => {
                debug!(loop_id = self.inner.id, "event loop stop requested");
                self.notify();
            }
        }
    }

    /// Drops everything a stopped loop still owns.
    ///
    /// Locks are released before anything is dropped: destructors of captured state may call
    /// back into the loop.
    fn release_remaining(&self) {
        loop {
            let fibers = std::mem::take(&mut *self.inner.fibers.lock());
            let tasks = std::mem::take(&mut self.inner.pending.lock().tasks);
            let timers = self.inner.timers.lock().take_all();
            if fibers.is_empty() && tasks.is_empty() && timers.is_empty() {
                return;
            }
            debug!(
                loop_id = self.inner.id,
                fibers = fibers.len(),
                tasks = tasks.len(),
                timers = timers.len(),
                "releasing work left on stopped loop"
            );
            drop(tasks);
            drop(timers);
            drop(fibers);
        }
    }

    fn notify(&self) {
        counter!("fibra_loop_notifications_total").increment(1);
        if let Err(err) = self.inner.selector.notify() {
            error!(loop_id = self.inner.id, error = %err, "failed to notify selector");
        }
    }

    fn fire_timers(&self) {
        let due = self.inner.timers.lock().drain_expired(Instant::now());
        for task in due {
            self.run_guarded(task);
        }
    }

    fn execute_tasks(&self, tasks: &mut Vec<Task>) {
        {
            let mut pending = self.inner.pending.lock();
            pending.scheduled = false;
            std::mem::swap(tasks, &mut pending.tasks);
        }
        counter!("fibra_tasks_executed_total").increment(tasks.len() as u64);
        for task in tasks.drain(..) {
            self.run_guarded(task);
        }
    }

    fn run_guarded<F: FnOnce()>(&self, task: F) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            counter!("fibra_task_panics_total").increment(1);
            warn!(
                loop_id = self.inner.id,
                panic = %panic_message(payload.as_ref()),
                "task panicked; discarded"
            );
        }
    }
}

/// Output slot of a launched fiber.
///
/// Fails the slot with [`Error::LoopStopped`] if the fiber is dropped before settling it.
struct FiberOutput<T>(Option<Future<T>>);

impl<T> FiberOutput<T> {
    fn settle(mut self, outcome: Result<T>) {
        if let Some(slot) = self.0.take() {
            match outcome {
                Ok(value) => slot.complete(value),
                Err(err) => slot.fail(err),
            }
        }
    }
}

impl<T> Drop for FiberOutput<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.0.take() {
            slot.fail(Error::LoopStopped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn spawn_loop() -> (EventLoop, thread::JoinHandle<Result<()>>) {
        let event_loop = EventLoop::new().unwrap();
        let driver = event_loop.clone();
        let handle = thread::spawn(move || driver.run());
        while !event_loop.is_running() {
            thread::yield_now();
        }
        (event_loop, handle)
    }

    #[test]
    fn stop_from_queued_task_ends_run() {
        let event_loop = EventLoop::new().unwrap();
        let stopper = event_loop.clone();
        event_loop.run_in_loop_soon(move || stopper.stop());
        event_loop.run().unwrap();
        assert!(event_loop.is_stopped());
    }

    #[test]
    fn stop_is_idempotent_and_terminal() {
        let (event_loop, handle) = spawn_loop();
        event_loop.stop();
        event_loop.stop();
        handle.join().unwrap().unwrap();
        event_loop.stop();
        assert!(matches!(event_loop.run(), Err(Error::LoopStopped)));
    }

    #[test]
    fn nested_run_is_rejected() {
        let event_loop = EventLoop::new().unwrap();
        let inner = event_loop.clone();
        let nested = Arc::new(Mutex::new(None));
        let seen = nested.clone();
        event_loop.run_in_loop_soon(move || {
            *seen.lock() = Some(inner.run());
            inner.stop();
        });
        event_loop.run().unwrap();
        assert!(matches!(nested.lock().take(), Some(Err(Error::NestedLoop))));
        assert!(EventLoop::local().is_none());
    }

    #[test]
    fn run_in_loop_executes_inline_on_loop_thread() {
        let event_loop = EventLoop::new().unwrap();
        let driver = event_loop.clone();
        let order = Arc::new(Mutex::new(Vec::new()));
        let log = order.clone();
        event_loop.run_in_loop_soon(move || {
            log.lock().push("outer-start");
            let inner_log = log.clone();
            driver.run_in_loop(move || inner_log.lock().push("inline"));
            log.lock().push("outer-end");
            driver.stop();
        });
        event_loop.run().unwrap();
        assert_eq!(*order.lock(), vec!["outer-start", "inline", "outer-end"]);
    }

    #[test]
    fn panicking_task_does_not_stop_siblings() {
        let event_loop = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        event_loop.run_in_loop_soon(|| panic!("task failure"));
        let counter = ran.clone();
        event_loop.run_in_loop_soon(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let stopper = event_loop.clone();
        event_loop.run_in_loop_soon(move || stopper.stop());
        event_loop.run().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tasks_queued_during_a_batch_run_next_iteration() {
        let event_loop = EventLoop::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let driver = event_loop.clone();
        let log = order.clone();
        event_loop.run_in_loop_soon(move || {
            let later = log.clone();
            let stopper = driver.clone();
            driver.run_in_loop_soon(move || {
                later.lock().push(2);
                stopper.stop();
            });
            log.lock().push(1);
        });
        let log = order.clone();
        event_loop.run_in_loop_soon(move || log.lock().push(1));
        event_loop.run().unwrap();
        assert_eq!(*order.lock(), vec![1, 1, 2]);
    }

    #[test]
    fn timers_fire_after_delay() {
        let (event_loop, handle) = spawn_loop();
        let start = Instant::now();
        let fired = crate::Future::new();
        let done = fired.clone();
        event_loop.run_after(Duration::from_millis(20), move || done.complete(Instant::now()));
        let at = fired.get().unwrap();
        assert!(at.duration_since(start) >= Duration::from_millis(20));
        event_loop.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn unrepresentable_delay_never_fires() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        event_loop.run_after(Duration::MAX, move || flag.store(true, Ordering::SeqCst));
        let stopper = event_loop.clone();
        event_loop.run_after(Duration::from_millis(5), move || stopper.stop());
        event_loop.run().unwrap();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn stopping_an_idle_loop_releases_its_work() {
        let event_loop = EventLoop::new().unwrap();
        let captured = Arc::new(());

        let handle = event_loop.clone();
        let held = captured.clone();
        let output = event_loop.launch(async move {
            let _held = held;
            handle.stop();
        });
        let held = captured.clone();
        event_loop.run_in_loop_soon(move || drop(held));
        let held = captured.clone();
        event_loop.run_after(Duration::from_secs(60), move || drop(held));
        assert_eq!(Arc::strong_count(&captured), 4);

        event_loop.stop();
        assert_eq!(Arc::strong_count(&captured), 1);
        assert_eq!(event_loop.fiber_count(), 0);
        assert!(matches!(output.get(), Err(Error::LoopStopped)));
    }

    #[test]
    fn stopped_loop_rejects_new_work() {
        let event_loop = EventLoop::new().unwrap();
        event_loop.stop();

        let captured = Arc::new(());
        let held = captured.clone();
        event_loop.run_in_loop_soon(move || drop(held));
        let held = captured.clone();
        event_loop.run_after(Duration::from_millis(1), move || drop(held));
        let held = captured.clone();
        let output = event_loop.launch(async move { drop(held) });

        assert_eq!(Arc::strong_count(&captured), 1);
        assert_eq!(event_loop.fiber_count(), 0);
        assert!(matches!(output.get(), Err(Error::LoopStopped)));
    }

    #[test]
    fn local_context_is_bound_only_while_running() {
        let event_loop = EventLoop::new().unwrap();
        assert!(!EventLoop::is_in_loop());
        let watcher = event_loop.clone();
        let matched = Arc::new(AtomicBool::new(false));
        let flag = matched.clone();
        event_loop.run_in_loop_soon(move || {
            let local = EventLoop::local().unwrap();
            flag.store(local.ptr_eq(&watcher), Ordering::SeqCst);
            watcher.stop();
        });
        event_loop.run().unwrap();
        assert!(matched.load(Ordering::SeqCst));
        assert!(!EventLoop::is_in_loop());
    }
}
