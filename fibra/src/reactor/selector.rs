use std::collections::HashMap;
use std::io;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;

use super::{IoEvent, Readiness, Selector};
use crate::channel::{ChannelPtr, Handle, WeakChannel};

/// Token reserved for cross-thread notifications. File descriptors never reach it.
const NOTIFY_TOKEN: Token = Token(usize::MAX);

struct PollState {
    poll: Poll,
    events: Events,
}

/// [`Selector`] backed by `mio` (epoll on Linux, kqueue on the BSDs and macOS).
///
/// Handles are registered edge-triggered for both directions; channels retry their pending
/// operation on every event and park it again on `WouldBlock`.
///
/// # Architecture
///
/// - **Poll**: only touched by the loop thread inside `select`
/// - **Registry**: a clone of the poll's registry so channels can register from anywhere
/// - **Channel map**: token to weak channel, consulted when translating events
pub struct MioSelector {
    state: Mutex<PollState>,
    registry: Registry,
    waker: Waker,
    channels: Mutex<HashMap<Token, WeakChannel>>,
}

impl MioSelector {
    /// Creates a selector that collects at most `capacity` events per `select`.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), NOTIFY_TOKEN)?;
        Ok(Self {
            state: Mutex::new(PollState {
                poll,
                events: Events::with_capacity(capacity.max(1)),
            }),
            registry,
            waker,
            channels: Mutex::new(HashMap::new()),
        })
    }

    fn token(handle: Handle) -> Token {
        Token(handle as usize)
    }
}

impl Selector for MioSelector {
    fn select(&self, out: &mut Vec<IoEvent>, timeout: Option<Duration>) -> io::Result<()> {
        let mut state = self.state.lock();
        let PollState { poll, events } = &mut *state;

        // Block here until the OS signals readiness or someone notifies us.
        if let Err(e) = poll.poll(events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        let channels = self.channels.lock();
        for event in events.iter() {
            let token = event.token();
            if token == NOTIFY_TOKEN {
                continue;
            }
            let Some(channel) = channels.get(&token) else {
                continue;
            };

            let mut readiness = Readiness::EMPTY;
            if event.is_readable() {
                readiness = readiness | Readiness::READABLE;
            }
            if event.is_writable() {
                readiness = readiness | Readiness::WRITABLE;
            }
            if event.is_error() {
                readiness = readiness | Readiness::ERROR;
            }
            if event.is_read_closed() || event.is_write_closed() {
                readiness = readiness | Readiness::CLOSED;
            }
            out.push(IoEvent::new(channel.clone(), token.0 as Handle, readiness));
        }
        Ok(())
    }

    fn notify(&self) -> io::Result<()> {
        self.waker.wake()
    }

    fn register(&self, channel: WeakChannel) -> io::Result<()> {
        let Some(strong) = channel.upgrade() else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "channel dropped before registration",
            ));
        };
        let fd = strong.handle();
        let token = Self::token(fd);
        let interest = Interest::READABLE | Interest::WRITABLE;

        match self.registry.register(&mut SourceFd(&fd), token, interest) {
            Ok(()) => {}
            // Same descriptor registered again, e.g. after a channel re-registers.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                self.registry.reregister(&mut SourceFd(&fd), token, interest)?;
            }
            Err(e) => return Err(e),
        }
        self.channels.lock().insert(token, channel);
        Ok(())
    }

    fn deregister(&self, handle: Handle) -> io::Result<()> {
        self.channels.lock().remove(&Self::token(handle));
        self.registry.deregister(&mut SourceFd(&handle))
    }

    fn find_channel(&self, handle: Handle) -> Option<ChannelPtr> {
        self.channels
            .lock()
            .get(&Self::token(handle))
            .and_then(|weak| weak.upgrade())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::reactor::weak_channel;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    struct FdChannel(UnixStream);

    impl Channel for FdChannel {
        fn handle(&self) -> Handle {
            self.0.as_raw_fd()
        }

        fn on_event(&self, _event: &IoEvent) {}
    }

    #[test]
    fn notify_interrupts_select() {
        let selector = Arc::new(MioSelector::new(8).unwrap());
        let notifier = selector.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            notifier.notify().unwrap();
        });
        let start = Instant::now();
        let mut events = Vec::new();
        selector
            .select(&mut events, Some(Duration::from_secs(5)))
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(events.is_empty());
        handle.join().unwrap();
    }

    #[test]
    fn delivers_events_for_registered_channels() {
        let selector = MioSelector::new(8).unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let channel = Arc::new(FdChannel(a));
        selector.register(weak_channel(&channel)).unwrap();
        assert!(selector.find_channel(channel.handle()).is_some());

        b.write_all(b"ping").unwrap();
        let mut events = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !events.iter().any(|e: &IoEvent| e.is_readable()) && Instant::now() < deadline {
            selector
                .select(&mut events, Some(Duration::from_millis(100)))
                .unwrap();
        }
        let readable = events.iter().find(|e| e.is_readable()).unwrap();
        assert_eq!(readable.handle(), channel.handle());
        assert!(readable.channel().is_some());

        selector.deregister(channel.handle()).unwrap();
        assert!(selector.find_channel(channel.handle()).is_none());
    }

    #[test]
    fn dropped_channels_are_not_resolved() {
        let selector = MioSelector::new(8).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let channel = Arc::new(FdChannel(a));
        let fd = channel.handle();
        selector.register(weak_channel(&channel)).unwrap();
        drop(channel);
        assert!(selector.find_channel(fd).is_none());
    }
}
