//! Per-thread execution context.
//!
//! While a thread drives [`EventLoop::run`] it has a current loop, and while a fiber is being
//! resumed it also has a current fiber. Both are bound by guards, so they are cleared when the
//! scope ends even if it unwinds.

use std::cell::RefCell;
use std::sync::Arc;

use super::EventLoop;
use crate::error::{Error, Result};
use crate::fiber::Fiber;

thread_local! {
    static CURRENT_LOOP: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// Binds a loop to the current thread for the duration of `run`.
pub(crate) struct LoopContext {
    _private: (),
}

impl LoopContext {
    pub(crate) fn enter(event_loop: &EventLoop) -> Result<Self> {
        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            if current.is_some() {
                return Err(Error::NestedLoop);
            }
            *current = Some(event_loop.clone());
            Ok(LoopContext { _private: () })
        })
    }
}

impl Drop for LoopContext {
    fn drop(&mut self) {
        // Release outside the borrow: dropping the last handle may run arbitrary destructors.
        let previous_loop = CURRENT_LOOP.with(|current| current.borrow_mut().take());
        let previous_fiber = CURRENT_FIBER.with(|current| current.borrow_mut().take());
        drop(previous_fiber);
        drop(previous_loop);
    }
}

/// Marks `fiber` as the one executing on this thread until dropped.
pub(crate) struct FiberContext {
    previous: Option<Arc<Fiber>>,
}

impl FiberContext {
    pub(crate) fn enter(fiber: Arc<Fiber>) -> Self {
        let previous = CURRENT_FIBER.with(|current| current.borrow_mut().replace(fiber));
        FiberContext { previous }
    }
}

impl Drop for FiberContext {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let ours =
            CURRENT_FIBER.with(|current| std::mem::replace(&mut *current.borrow_mut(), previous));
        drop(ours);
    }
}

pub(crate) fn current_loop() -> Option<EventLoop> {
    CURRENT_LOOP.with(|current| current.borrow().clone())
}

pub(crate) fn is_current_loop(event_loop: &EventLoop) -> bool {
    CURRENT_LOOP.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(|l| l.ptr_eq(event_loop))
    })
}

pub(crate) fn in_loop() -> bool {
    CURRENT_LOOP.with(|current| current.borrow().is_some())
}

pub(crate) fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|current| current.borrow().clone())
}
