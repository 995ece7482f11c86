//! Positional file I/O on the event loop.
//!
//! Regular files are always "ready", so a [`FileChannel`] is never bound to the selector. Its
//! operations run as tasks on the registered loop and settle the caller's future when the
//! positional read or write returns.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::channel::{Channel, Handle, Register};
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, WeakEventLoop};
use crate::future::{AwaitableFuture, Future};
use crate::reactor::IoEvent;

struct FileInner {
    file: File,
    event_loop: Mutex<WeakEventLoop>,
}

impl Channel for FileInner {
    fn handle(&self) -> Handle {
        self.file.as_raw_fd()
    }

    fn on_event(&self, _event: &IoEvent) {}
}

/// A file whose reads and writes are executed by an event loop.
#[derive(Clone)]
pub struct FileChannel {
    inner: Arc<FileInner>,
}

impl FileChannel {
    /// Opens `path` with `options`.
    pub fn open(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        Ok(Self::from_file(options.open(path)?))
    }

    pub fn from_file(file: File) -> Self {
        Self {
            inner: Arc::new(FileInner {
                file,
                event_loop: Mutex::new(WeakEventLoop::default()),
            }),
        }
    }

    /// Current size of the file in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(self.inner.file.metadata()?.len())
    }

    fn registered_loop(&self) -> Result<EventLoop> {
        self.event_loop().ok_or(Error::NotRegistered)
    }

    /// Writes `buf` at `offset`, settling `future` with the number of bytes written.
    pub fn write_async(&self, buf: Vec<u8>, offset: u64, future: &Future<usize>) -> Result<()> {
        self.write_from_async(buf, 0, offset, future)
    }

    /// Writes `buf[buffer_offset..]` at `offset`.
    ///
    /// Fails immediately with [`Error::BufferTooSmall`] if `buffer_offset` is past the end of
    /// `buf`.
    pub fn write_from_async(
        &self,
        buf: Vec<u8>,
        buffer_offset: usize,
        offset: u64,
        future: &Future<usize>,
    ) -> Result<()> {
        check_range(&buf, buffer_offset)?;
        let event_loop = self.registered_loop()?;
        let inner = self.inner.clone();
        let future = future.clone();
        event_loop.run_in_loop(move || {
            match inner.file.write_at(&buf[buffer_offset..], offset) {
                Ok(n) => {
                    trace!(fd = inner.handle(), n, offset, "file write");
                    future.complete(n);
                }
                Err(err) => future.fail(err),
            }
        });
        Ok(())
    }

    /// Reads up to `len` bytes at `offset`, settling `future` with the bytes read.
    ///
    /// A short (or empty) result means end of file was reached.
    pub fn read_async(&self, len: usize, offset: u64, future: &Future<Vec<u8>>) -> Result<()> {
        let event_loop = self.registered_loop()?;
        let inner = self.inner.clone();
        let future = future.clone();
        event_loop.run_in_loop(move || {
            let mut buf = vec![0; len];
            match inner.file.read_at(&mut buf, offset) {
                Ok(n) => {
                    trace!(fd = inner.handle(), n, offset, "file read");
                    buf.truncate(n);
                    future.complete(buf);
                }
                Err(err) => future.fail(err),
            }
        });
        Ok(())
    }

    /// Writes `buf` at `offset` from inside a fiber.
    pub async fn write(&self, buf: Vec<u8>, offset: u64) -> Result<usize> {
        let future = AwaitableFuture::new();
        self.write_async(buf, offset, &future)?;
        future.await
    }

    /// Reads up to `len` bytes at `offset` from inside a fiber.
    pub async fn read(&self, len: usize, offset: u64) -> Result<Vec<u8>> {
        let future = AwaitableFuture::new();
        self.read_async(len, offset, &future)?;
        future.await
    }
}

impl Register for FileChannel {
    fn register(&self, event_loop: &EventLoop) -> Result<()> {
        *self.inner.event_loop.lock() = event_loop.downgrade();
        Ok(())
    }

    fn event_loop(&self) -> Option<EventLoop> {
        self.inner.event_loop.lock().upgrade()
    }
}

fn check_range(buf: &[u8], offset: usize) -> Result<()> {
    if buf.len() < offset {
        return Err(Error::BufferTooSmall {
            offset,
            len: buf.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, FileChannel) {
        let dir = tempfile::tempdir().unwrap();
        let channel = FileChannel::open(
            dir.path().join("scratch.txt"),
            OpenOptions::new().read(true).write(true).create(true),
        )
        .unwrap();
        (dir, channel)
    }

    #[test]
    fn unregistered_channel_fails_fast() {
        let (_dir, channel) = scratch();
        let future = Future::new();
        assert!(matches!(
            channel.write_async(b"x".to_vec(), 0, &future),
            Err(Error::NotRegistered)
        ));
        assert!(future.is_pending());
    }

    #[test]
    fn buffer_offset_past_end_is_rejected() {
        let (_dir, channel) = scratch();
        let event_loop = EventLoop::new().unwrap();
        channel.register(&event_loop).unwrap();
        let future = Future::new();
        assert!(matches!(
            channel.write_from_async(vec![1, 2], 3, 0, &future),
            Err(Error::BufferTooSmall { offset: 3, len: 2 })
        ));
    }

    #[test]
    fn write_then_read_from_a_fiber() {
        let (_dir, channel) = scratch();
        let event_loop = EventLoop::new().unwrap();
        channel.register(&event_loop).unwrap();

        let stopper = event_loop.clone();
        let io = channel.clone();
        let result = event_loop.launch(async move {
            let written = io.write(b"hello world".to_vec(), 0).await?;
            let read = io.read(5, 6).await?;
            stopper.stop();
            Ok::<_, Error>((written, read))
        });
        event_loop.run().unwrap();

        let (written, read) = result.get().unwrap().unwrap();
        assert_eq!(written, 11);
        assert_eq!(read, b"world");
        assert_eq!(channel.size().unwrap(), 11);
    }

    #[test]
    fn read_past_end_yields_empty_buffer() {
        let (_dir, channel) = scratch();
        let event_loop = EventLoop::new().unwrap();
        channel.register(&event_loop).unwrap();
        let future = Future::new();
        channel.read_async(8, 1024, &future).unwrap();
        let stopper = event_loop.clone();
        event_loop.run_in_loop_soon(move || stopper.stop());
        event_loop.run().unwrap();
        assert_eq!(future.get().unwrap(), Vec::<u8>::new());
    }
}
