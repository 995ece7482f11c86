//! Single-assignment completion slots.
//!
//! A [`Future`] is the meeting point between the code that performs an operation and the code
//! that wants its result. Producers settle it exactly once with [`Future::complete`] or
//! [`Future::fail`]; consumers either block on it ([`Future::wait`], [`Future::get`]) or attach a
//! one-shot callback ([`Future::set_callback`]).
//!
//! [`AwaitableFuture`] layers fiber suspension on top: awaiting it from inside a fiber parks the
//! fiber instead of the OS thread.

mod awaitable;

pub use awaitable::AwaitableFuture;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Observable state of a [`Future`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FutureState {
    /// Not settled yet.
    Pending,
    /// Settled with a value.
    Completed,
    /// Settled with an error.
    Error,
}

/// Callback run once when a future settles.
pub type Callback<T> = Box<dyn FnOnce(&Future<T>) + Send + 'static>;

/// Tagged outcome. Holding the value and the error in one enum makes "both present"
/// unrepresentable.
enum Outcome<T> {
    Pending,
    Completed(T),
    Error(Error),
}

impl<T> Outcome<T> {
    fn state(&self) -> FutureState {
        match self {
            Outcome::Pending => FutureState::Pending,
            Outcome::Completed(_) => FutureState::Completed,
            Outcome::Error(_) => FutureState::Error,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }
}

impl<T: Clone> Outcome<T> {
    fn to_result(&self) -> Option<Result<T>> {
        match self {
            Outcome::Pending => None,
            Outcome::Completed(value) => Some(Ok(value.clone())),
            Outcome::Error(err) => Some(Err(err.clone())),
        }
    }
}

struct Slot<T> {
    outcome: Outcome<T>,
    callback: Option<Callback<T>>,
    waiters: u16,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

/// Work left over after a settle transition, performed once the lock is released.
struct Settled<T> {
    notify: bool,
    callback: Option<Callback<T>>,
}

/// A thread-safe, single-assignment result slot.
///
/// Cloning a `Future` yields another handle to the same slot, which is how a producer on one
/// thread and a consumer on another share it.
///
/// # Examples
///
/// ```
/// use fibra::Future;
///
/// let future = Future::new();
/// let producer = future.clone();
/// std::thread::spawn(move || producer.complete(42));
/// assert_eq!(future.get().unwrap(), 42);
/// ```
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<T> Future<T> {
    /// Creates a pending future.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    outcome: Outcome::Pending,
                    callback: None,
                    waiters: 0,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Settles the future with `value`.
    ///
    /// The first settle wins: on an already settled future this is a no-op.
    pub fn complete(&self, value: T) {
        let settled = {
            let mut slot = self.shared.slot.lock();
            if !slot.outcome.is_pending() {
                return;
            }
            slot.outcome = Outcome::Completed(value);
            Self::take_settled(&mut slot)
        };
        self.finish(settled);
    }

    /// Settles the future with `err`.
    ///
    /// A completed value is never replaced. An earlier error is: the most recent failure
    /// reason wins, so a cancellation can supersede whatever failure was recorded before it.
    pub fn fail(&self, err: impl Into<Error>) {
        let err = err.into();
        let settled = {
            let mut slot = self.shared.slot.lock();
            if matches!(slot.outcome, Outcome::Completed(_)) {
                return;
            }
            slot.outcome = Outcome::Error(err);
            Self::take_settled(&mut slot)
        };
        self.finish(settled);
    }

    /// Blocks the calling thread until the future settles.
    pub fn wait(&self) {
        let mut slot = self.shared.slot.lock();
        while slot.outcome.is_pending() {
            slot.waiters = slot.waiters.saturating_add(1);
            self.shared.cond.wait(&mut slot);
        }
    }

    /// Blocks for at most `timeout`. Returns `true` if the future settled.
    ///
    /// A timeout too large to be represented as a deadline waits without limit.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut slot = self.shared.slot.lock();
        while slot.outcome.is_pending() {
            slot.waiters = slot.waiters.saturating_add(1);
            if self.shared.cond.wait_until(&mut slot, deadline).timed_out() {
                return !slot.outcome.is_pending();
            }
        }
        true
    }

    /// Registers `callback` to run when the future settles.
    ///
    /// On a settled future the callback runs right away on the calling thread, before this
    /// returns. Only one callback is kept: registering another one while pending replaces it.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Future<T>) + Send + 'static,
    {
        {
            let mut slot = self.shared.slot.lock();
            if slot.outcome.is_pending() {
                slot.callback = Some(Box::new(callback));
                return;
            }
        }
        callback(self);
    }

    /// Returns the future to [`FutureState::Pending`], dropping any stored value or error.
    ///
    /// Only the sole owner may call this, between two operations. Resetting while another
    /// thread completes or waits on the same slot races with it.
    pub fn reset(&self) {
        let mut slot = self.shared.slot.lock();
        slot.outcome = Outcome::Pending;
    }

    /// Current state.
    pub fn state(&self) -> FutureState {
        self.shared.slot.lock().outcome.state()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == FutureState::Pending
    }

    pub fn is_completed(&self) -> bool {
        self.state() == FutureState::Completed
    }

    pub fn is_error(&self) -> bool {
        self.state() == FutureState::Error
    }

    /// `true` once the future has settled either way.
    pub fn completed_or_error(&self) -> bool {
        !self.is_pending()
    }

    /// The stored error, if the future failed.
    pub fn error(&self) -> Option<Error> {
        match &self.shared.slot.lock().outcome {
            Outcome::Error(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Returns `true` if both handles point at the same slot.
    pub fn ptr_eq(&self, other: &Future<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn take_settled(slot: &mut Slot<T>) -> Settled<T> {
        let notify = slot.waiters != 0;
        slot.waiters = 0;
        Settled {
            notify,
            callback: slot.callback.take(),
        }
    }

    fn finish(&self, settled: Settled<T>) {
        if settled.notify {
            self.shared.cond.notify_all();
        }
        if let Some(callback) = settled.callback {
            callback(self);
        }
    }
}

impl<T: Clone> Future<T> {
    /// Waits for the future, then returns its value or its error.
    pub fn get(&self) -> Result<T> {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(result) = slot.outcome.to_result() {
                return result;
            }
            slot.waiters = slot.waiters.saturating_add(1);
            self.shared.cond.wait(&mut slot);
        }
    }

    /// Returns the outcome without blocking, or `None` while pending.
    pub fn try_get(&self) -> Option<Result<T>> {
        self.shared.slot.lock().outcome.to_result()
    }

    /// Reads the outcome if settled, otherwise installs the callback built by `register`.
    ///
    /// Both happen under one lock acquisition so a settle cannot slip in between the check and
    /// the registration.
    pub(crate) fn poll_or_register<R>(&self, register: R) -> Option<Result<T>>
    where
        R: FnOnce() -> Callback<T>,
    {
        let mut slot = self.shared.slot.lock();
        match slot.outcome.to_result() {
            Some(result) => Some(result),
            None => {
                slot.callback = Some(register());
                None
            }
        }
    }
}
