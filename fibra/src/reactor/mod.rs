//! Readiness selection.
//!
//! The [`Selector`] is what an [`EventLoop`](crate::EventLoop) blocks on. It turns OS readiness
//! notifications into [`IoEvent`]s, each pointing back at the [`Channel`] that owns the handle,
//! and can be poked from any thread so a blocked loop notices new work.
//!
//! [`MioSelector`] is the default implementation, built on `mio`.

mod selector;

pub use selector::MioSelector;

use std::fmt;
use std::io;
use std::sync::Weak;
use std::time::Duration;

use crate::channel::{Channel, ChannelPtr, Handle, WeakChannel};

/// Readiness reported for a handle.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness(u8);

impl Readiness {
    pub const EMPTY: Readiness = Readiness(0);
    pub const READABLE: Readiness = Readiness(0b0001);
    pub const WRITABLE: Readiness = Readiness(0b0010);
    pub const ERROR: Readiness = Readiness(0b0100);
    /// The peer closed its half (read or write).
    pub const CLOSED: Readiness = Readiness(0b1000);

    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub const fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    pub const fn is_closed(self) -> bool {
        self.0 & Self::CLOSED.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn add(self, other: Readiness) -> Readiness {
        Readiness(self.0 | other.0)
    }
}

impl std::ops::BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        self.add(rhs)
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.is_readable() {
            set.entry(&"READABLE");
        }
        if self.is_writable() {
            set.entry(&"WRITABLE");
        }
        if self.is_error() {
            set.entry(&"ERROR");
        }
        if self.is_closed() {
            set.entry(&"CLOSED");
        }
        set.finish()
    }
}

/// One readiness notification, addressed to the channel that produced it.
#[derive(Clone)]
pub struct IoEvent {
    channel: WeakChannel,
    handle: Handle,
    readiness: Readiness,
}

impl IoEvent {
    pub fn new(channel: WeakChannel, handle: Handle, readiness: Readiness) -> Self {
        Self {
            channel,
            handle,
            readiness,
        }
    }

    /// The channel this event belongs to, if it is still alive.
    pub fn channel(&self) -> Option<ChannelPtr> {
        self.channel.upgrade()
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn is_readable(&self) -> bool {
        self.readiness.is_readable()
    }

    pub fn is_writable(&self) -> bool {
        self.readiness.is_writable()
    }

    pub fn is_error(&self) -> bool {
        self.readiness.is_error()
    }

    pub fn is_closed(&self) -> bool {
        self.readiness.is_closed()
    }
}

impl fmt::Debug for IoEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoEvent")
            .field("handle", &self.handle)
            .field("readiness", &self.readiness)
            .field("alive", &(self.channel.strong_count() > 0))
            .finish()
    }
}

/// Source of readiness events for an event loop.
///
/// `select` is only ever called by the thread driving the loop. Everything else may be called
/// from any thread.
pub trait Selector: Send + Sync {
    /// Blocks until at least one event is ready, [`notify`](Selector::notify) is called, or
    /// `timeout` elapses, then appends the ready events to `events`.
    ///
    /// Returning with no events is allowed (wakeups, interrupted waits).
    fn select(&self, events: &mut Vec<IoEvent>, timeout: Option<Duration>) -> io::Result<()>;

    /// Makes a concurrent or upcoming `select` return promptly.
    fn notify(&self) -> io::Result<()>;

    /// Starts delivering events for `channel`'s handle. Only a weak reference is kept.
    fn register(&self, channel: WeakChannel) -> io::Result<()>;

    /// Stops delivering events for `handle`.
    fn deregister(&self, handle: Handle) -> io::Result<()>;

    /// Resolves a registered, still-alive channel by handle.
    fn find_channel(&self, handle: Handle) -> Option<ChannelPtr>;
}

/// Downgrades a channel into the form selectors store.
pub fn weak_channel<C: Channel + 'static>(channel: &std::sync::Arc<C>) -> WeakChannel {
    let weak: Weak<C> = std::sync::Arc::downgrade(channel);
    weak
}
