//! The contract between event loops and I/O endpoints.
//!
//! A channel owns an OS handle. The loop never owns a channel: it only keeps a [`WeakChannel`]
//! in its selector and hands each delivered [`IoEvent`] to [`Channel::on_event`], where the
//! channel finishes whatever operation was waiting on that readiness, usually by settling a
//! [`Future`](crate::Future).

use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::reactor::IoEvent;

/// OS handle identifying a channel inside a selector.
pub type Handle = RawFd;

pub type ChannelPtr = Arc<dyn Channel>;
pub type WeakChannel = Weak<dyn Channel>;

/// An endpoint that receives readiness events from a loop.
pub trait Channel: Send + Sync {
    /// The OS handle the selector watches.
    fn handle(&self) -> Handle;

    /// Called on the loop thread once per delivered event.
    fn on_event(&self, event: &IoEvent);
}

/// Binding of a channel to the loop that drives its operations.
pub trait Register {
    /// Attaches the channel to `event_loop`. Async operations fail with
    /// [`Error::NotRegistered`](crate::Error::NotRegistered) until this is called.
    fn register(&self, event_loop: &EventLoop) -> Result<()>;

    /// The loop this channel is attached to, if it is still alive.
    fn event_loop(&self) -> Option<EventLoop>;

    fn is_registered(&self) -> bool {
        self.event_loop().is_some()
    }
}
