#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use fibra::channel::{ChannelPtr, Handle, WeakChannel};
use fibra::reactor::{IoEvent, Readiness, Selector};
use fibra::{EventLoop, Result};
use parking_lot::{Condvar, Mutex};

// ============================================================================
// Scripted selector
// ============================================================================

#[derive(Default)]
struct Queue {
    events: Vec<IoEvent>,
    notified: bool,
}

/// A selector whose events are injected by the test instead of the OS.
#[derive(Default)]
pub struct ScriptedSelector {
    queue: Mutex<Queue>,
    cond: Condvar,
    channels: Mutex<HashMap<Handle, WeakChannel>>,
}

impl ScriptedSelector {
    /// Queues a readiness event for a registered handle. Returns `false` if unknown.
    pub fn inject(&self, handle: Handle, readiness: Readiness) -> bool {
        let Some(channel) = self.channels.lock().get(&handle).cloned() else {
            return false;
        };
        self.queue
            .lock()
            .events
            .push(IoEvent::new(channel, handle, readiness));
        self.cond.notify_all();
        true
    }
}

/// Lets the test keep a handle on a selector the loop owns.
#[derive(Clone, Default)]
pub struct SharedSelector(pub Arc<ScriptedSelector>);

impl Selector for SharedSelector {
    fn select(&self, events: &mut Vec<IoEvent>, timeout: Option<Duration>) -> io::Result<()> {
        let selector = &self.0;
        let mut queue = selector.queue.lock();
        if queue.events.is_empty() && !queue.notified {
            match timeout {
                Some(timeout) => {
                    selector.cond.wait_for(&mut queue, timeout);
                }
                None => selector.cond.wait(&mut queue),
            }
        }
        queue.notified = false;
        events.append(&mut queue.events);
        Ok(())
    }

    fn notify(&self) -> io::Result<()> {
        self.0.queue.lock().notified = true;
        self.0.cond.notify_all();
        Ok(())
    }

    fn register(&self, channel: WeakChannel) -> io::Result<()> {
        let handle = channel
            .upgrade()
            .map(|c| c.handle())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        self.0.channels.lock().insert(handle, channel);
        Ok(())
    }

    fn deregister(&self, handle: Handle) -> io::Result<()> {
        self.0.channels.lock().remove(&handle);
        Ok(())
    }

    fn find_channel(&self, handle: Handle) -> Option<ChannelPtr> {
        self.0
            .channels
            .lock()
            .get(&handle)
            .and_then(|weak| weak.upgrade())
    }
}

// ============================================================================
// Loop helpers
// ============================================================================

/// Drives `event_loop` on a fresh thread and waits until it is running.
pub fn spawn_loop(event_loop: &EventLoop) -> thread::JoinHandle<Result<()>> {
    let driver = event_loop.clone();
    let handle = thread::spawn(move || driver.run());
    while !event_loop.is_running() {
        thread::yield_now();
    }
    handle
}

/// Sets a flag when dropped, to observe when captured state is released.
pub struct DropFlag(pub Arc<AtomicBool>);

impl DropFlag {
    pub fn new() -> (Self, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        (DropFlag(flag.clone()), flag)
    }
}

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}
