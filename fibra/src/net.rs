//! Non-blocking TCP channels.
//!
//! Sockets are registered edge-triggered with their loop's selector. Every operation is first
//! attempted right away on the loop thread; if the socket answers `WouldBlock`, the operation
//! is parked on the channel and retried from [`Channel::on_event`] when readiness arrives.
//! At most one read, one write and one accept may be outstanding per channel.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use mio::net::{TcpListener as MioListener, TcpStream as MioStream};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::channel::{Channel, Handle, Register};
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, WeakEventLoop};
use crate::future::{AwaitableFuture, Future};
use crate::reactor::{IoEvent, weak_channel};

/* --- LISTENER --- */

type AcceptFuture = Future<(TcpStream, SocketAddr)>;

struct ListenerInner {
    socket: MioListener,
    event_loop: Mutex<WeakEventLoop>,
    pending_accept: Mutex<Option<AcceptFuture>>,
}

impl ListenerInner {
    fn try_accept(&self, future: AcceptFuture) {
        match self.socket.accept() {
            Ok((stream, addr)) => {
                trace!(fd = self.handle(), %addr, "accepted connection");
                future.complete((TcpStream::from_mio(stream), addr));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                *self.pending_accept.lock() = Some(future);
            }
            Err(e) => future.fail(e),
        }
    }

    fn cancel(&self) {
        if let Some(future) = self.pending_accept.lock().take() {
            future.fail(Error::Canceled);
        }
    }
}

impl Channel for ListenerInner {
    fn handle(&self) -> Handle {
        self.socket.as_raw_fd()
    }

    fn on_event(&self, event: &IoEvent) {
        if !(event.is_readable() || event.is_error()) {
            return;
        }
        let pending = self.pending_accept.lock().take();
        if let Some(future) = pending {
            self.try_accept(future);
        }
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.get_mut().upgrade() {
            let _ = event_loop.unbind(self.socket.as_raw_fd());
        }
    }
}

/// A listening TCP socket.
#[derive(Clone)]
pub struct TcpListener {
    inner: Arc<ListenerInner>,
}

impl TcpListener {
    /// Binds a non-blocking listener to `addr`.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = MioListener::bind(addr)?;
        Ok(Self {
            inner: Arc::new(ListenerInner {
                socket,
                event_loop: Mutex::new(WeakEventLoop::default()),
                pending_accept: Mutex::new(None),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Accepts one connection, settling `future` with the new stream and its peer address.
    ///
    /// Accepted streams are not registered; register them with the loop that will drive them.
    pub fn accept_async(&self, future: &AcceptFuture) -> Result<()> {
        let event_loop = self.event_loop().ok_or(Error::NotRegistered)?;
        let inner = self.inner.clone();
        let future = future.clone();
        event_loop.run_in_loop(move || inner.try_accept(future));
        Ok(())
    }

    /// Accepts one connection from inside a fiber.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let future = AwaitableFuture::new();
        self.accept_async(&future)?;
        future.await
    }

    /// Fails a parked accept with [`Error::Canceled`].
    pub fn cancel(&self) {
        let inner = self.inner.clone();
        match self.event_loop() {
            Some(event_loop) => event_loop.run_in_loop(move || inner.cancel()),
            None => inner.cancel(),
        }
    }
}

impl Register for TcpListener {
    fn register(&self, event_loop: &EventLoop) -> Result<()> {
        *self.inner.event_loop.lock() = event_loop.downgrade();
        event_loop.bind(weak_channel(&self.inner))
    }

    fn event_loop(&self) -> Option<EventLoop> {
        self.inner.event_loop.lock().upgrade()
    }
}

/* --- STREAM --- */

struct PendingRead {
    len: usize,
    future: Future<Vec<u8>>,
}

struct PendingWrite {
    buf: Vec<u8>,
    future: Future<usize>,
}

struct StreamInner {
    socket: MioStream,
    event_loop: Mutex<WeakEventLoop>,
    pending_connect: Mutex<Option<Future<()>>>,
    pending_read: Mutex<Option<PendingRead>>,
    pending_write: Mutex<Option<PendingWrite>>,
}

impl StreamInner {
    fn try_read(&self, op: PendingRead) {
        let mut buf = vec![0; op.len];
        match (&self.socket).read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                op.future.complete(buf);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                *self.pending_read.lock() = Some(op);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => self.try_read(op),
            Err(e) => op.future.fail(e),
        }
    }

    fn try_write(&self, op: PendingWrite) {
        match (&self.socket).write(&op.buf) {
            Ok(n) => op.future.complete(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                *self.pending_write.lock() = Some(op);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => self.try_write(op),
            Err(e) => op.future.fail(e),
        }
    }

    fn finish_connect(&self, future: Future<()>) {
        match self.socket.take_error() {
            Ok(Some(err)) | Err(err) => return future.fail(err),
            Ok(None) => {}
        }
        match self.socket.peer_addr() {
            Ok(_) => future.complete(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                // Still in progress; wait for the next writable edge.
                *self.pending_connect.lock() = Some(future);
            }
            Err(e) => future.fail(e),
        }
    }

    fn cancel(&self) {
        if let Some(future) = self.pending_connect.lock().take() {
            future.fail(Error::Canceled);
        }
        if let Some(op) = self.pending_read.lock().take() {
            op.future.fail(Error::Canceled);
        }
        if let Some(op) = self.pending_write.lock().take() {
            op.future.fail(Error::Canceled);
        }
    }
}

impl Channel for StreamInner {
    fn handle(&self) -> Handle {
        self.socket.as_raw_fd()
    }

    fn on_event(&self, event: &IoEvent) {
        let failed = event.is_error() || event.is_closed();
        if event.is_writable() || failed {
            let connect = self.pending_connect.lock().take();
            if let Some(future) = connect {
                self.finish_connect(future);
            }
            let write = self.pending_write.lock().take();
            if let Some(op) = write {
                self.try_write(op);
            }
        }
        if event.is_readable() || failed {
            let read = self.pending_read.lock().take();
            if let Some(op) = read {
                self.try_read(op);
            }
        }
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.get_mut().upgrade() {
            let _ = event_loop.unbind(self.socket.as_raw_fd());
        }
    }
}

/// A connected TCP stream.
#[derive(Clone)]
pub struct TcpStream {
    inner: Arc<StreamInner>,
}

impl TcpStream {
    fn from_mio(socket: MioStream) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                socket,
                event_loop: Mutex::new(WeakEventLoop::default()),
                pending_connect: Mutex::new(None),
                pending_read: Mutex::new(None),
                pending_write: Mutex::new(None),
            }),
        }
    }

    /// Starts a non-blocking connect to `addr` and registers the stream with `event_loop`.
    ///
    /// `future` settles once the connection is established or refused.
    pub fn connect_async(
    addr: SocketAddr,
    event_loop: &EventLoop,
    future: &Future<()>,
) -> Result<TcpStream> {
        let stream = Self::from_mio(MioStream::connect(addr)?);
        // Park the connect before registering so the first writable edge cannot be missed.
        *stream.inner.pending_connect.lock() = Some(future.clone());
        stream.register(event_loop)?;
        debug!(fd = stream.inner.handle(), %addr, "connecting");
        Ok(stream)
    }

    /// Connects to `addr` from inside a fiber running on `event_loop`.
    pub async fn connect(addr: SocketAddr, event_loop: &EventLoop) -> Result<TcpStream> {
        let future = AwaitableFuture::new();
        let stream = Self::connect_async(addr, event_loop, &future)?;
        future.await?;
        Ok(stream)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.peer_addr()?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    pub fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        Ok(self.inner.socket.set_nodelay(nodelay)?)
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        Ok(self.inner.socket.shutdown(how)?)
    }

    /// Reads up to `len` bytes. An empty result means the peer closed the stream.
    pub fn read_async(&self, len: usize, future: &Future<Vec<u8>>) -> Result<()> {
        let event_loop = self.event_loop().ok_or(Error::NotRegistered)?;
        let inner = self.inner.clone();
        let op = PendingRead {
            len,
            future: future.clone(),
        };
        event_loop.run_in_loop(move || inner.try_read(op));
        Ok(())
    }

    /// Writes as much of `buf` as the socket accepts, settling `future` with the byte count.
    pub fn write_async(&self, buf: Vec<u8>, future: &Future<usize>) -> Result<()> {
        let event_loop = self.event_loop().ok_or(Error::NotRegistered)?;
        let inner = self.inner.clone();
        let op = PendingWrite {
            buf,
            future: future.clone(),
        };
        event_loop.run_in_loop(move || inner.try_write(op));
        Ok(())
    }

    pub async fn read(&self, len: usize) -> Result<Vec<u8>> {
        let future = AwaitableFuture::new();
        self.read_async(len, &future)?;
        future.await
    }

    pub async fn write(&self, buf: Vec<u8>) -> Result<usize> {
        let future = AwaitableFuture::new();
        self.write_async(buf, &future)?;
        future.await
    }

    /// Writes all of `buf`, suspending as often as needed.
    pub async fn write_all(&self, mut buf: Vec<u8>) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf.clone()).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            buf.drain(..n);
        }
        Ok(())
    }

    /// Fails every parked operation with [`Error::Canceled`].
    pub fn cancel(&self) {
        let inner = self.inner.clone();
        match self.event_loop() {
            Some(event_loop) => event_loop.run_in_loop(move || inner.cancel()),
            None => inner.cancel(),
        }
    }
}

impl Register for TcpStream {
    fn register(&self, event_loop: &EventLoop) -> Result<()> {
        *self.inner.event_loop.lock() = event_loop.downgrade();
        event_loop.bind(weak_channel(&self.inner))
    }

    fn event_loop(&self) -> Option<EventLoop> {
        self.inner.event_loop.lock().upgrade()
    }
}
