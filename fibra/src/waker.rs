use crate::fiber::Fiber;
use std::mem::ManuallyDrop;
use std::sync::Weak;
use std::task::{RawWaker, RawWakerVTable, Waker};
use std::thread::Thread;

/* --- 1. FIBER WAKER (for fibers driven by an event loop) --- */

/// Wakes a suspended fiber so its loop resumes it.
///
/// The waker holds the fiber weakly: a waker parked in a future that outlives the fiber's
/// loop must not keep the fiber (and everything it captured) alive.
pub(crate) fn fiber_waker(fiber: Weak<Fiber>) -> Waker {
    let ptr = Weak::into_raw(fiber) as *const ();
    unsafe { Waker::from_raw(RawWaker::new(ptr, &FIBER_VTABLE)) }
}

unsafe fn clone_fiber(data: *const ()) -> RawWaker {
    // Borrow the weak pointer without taking ownership of it.
    let weak = ManuallyDrop::new(unsafe { Weak::from_raw(data as *const Fiber) });
    let cloned = Weak::clone(&weak);
    RawWaker::new(Weak::into_raw(cloned) as *const (), &FIBER_VTABLE)
}

unsafe fn wake_fiber(data: *const ()) {
    // Take ownership so the weak count drops at the end of this function.
    let weak = unsafe { Weak::from_raw(data as *const Fiber) };
    if let Some(fiber) = weak.upgrade() {
        fiber.schedule();
    }
}

unsafe fn wake_fiber_by_ref(data: *const ()) {
    let weak = ManuallyDrop::new(unsafe { Weak::from_raw(data as *const Fiber) });
    if let Some(fiber) = weak.upgrade() {
        fiber.schedule();
    }
}

unsafe fn drop_fiber(data: *const ()) {
    drop(unsafe { Weak::from_raw(data as *const Fiber) });
}

static FIBER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(clone_fiber, wake_fiber, wake_fiber_by_ref, drop_fiber);

/* --- 2. UNPARK WAKER (for block_on outside any loop) --- */

/// Creates a waker that unparks a specific thread.
pub fn unpark_waker(thread: Thread) -> Waker {
    let ptr = Box::into_raw(Box::new(thread)) as *const ();
    unsafe { Waker::from_raw(RawWaker::new(ptr, &UNPARK_VTABLE)) }
}

unsafe fn clone_unpark(ptr: *const ()) -> RawWaker {
    let thread = unsafe { (*(ptr as *const Thread)).clone() };
    RawWaker::new(Box::into_raw(Box::new(thread)) as *const (), &UNPARK_VTABLE)
}

unsafe fn wake_unpark(ptr: *const ()) {
    let thread = unsafe { *Box::from_raw(ptr as *mut Thread) };
    thread.unpark();
}

unsafe fn wake_unpark_by_ref(ptr: *const ()) {
    let thread = unsafe { &*(ptr as *const Thread) };
    thread.unpark();
}

unsafe fn drop_unpark(ptr: *const ()) {
    let _ = unsafe { Box::from_raw(ptr as *mut Thread) };
}

static UNPARK_VTABLE: RawWakerVTable =
    RawWakerVTable::new(clone_unpark, wake_unpark, wake_unpark_by_ref, drop_unpark);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fiber_waker_outliving_its_fiber_is_inert() {
        let fiber = Fiber::new(
            0,
            Box::pin(async {}),
            crate::event_loop::WeakEventLoop::default(),
        );
        let waker = fiber_waker(Arc::downgrade(&fiber));
        let clone = waker.clone();
        drop(fiber);
        waker.wake_by_ref();
        waker.wake();
        clone.wake();
    }
}
