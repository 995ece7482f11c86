//! Error type shared by futures, loops and channels.
//!
//! A settled [`Future`](crate::future::Future) hands the same error to every reader, so the
//! error is cheap to clone: foreign payloads are kept behind an `Arc` and never inspected.

use std::io;
use std::sync::Arc;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors reported by the runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// `run` was called on a thread that is already driving an event loop.
    #[error("now is in event loop")]
    NestedLoop,

    /// `run` was called on a loop that is already being driven by another thread.
    #[error("event loop is already running")]
    AlreadyRunning,

    /// The loop was stopped; a stopped loop cannot be driven again.
    #[error("event loop has been stopped")]
    LoopStopped,

    /// The loop that owned an operation has been dropped.
    #[error("event loop is gone")]
    LoopGone,

    /// A blocking wait was attempted on a thread that drives an event loop.
    #[error("blocking wait on an event loop thread")]
    BlockingInLoop,

    /// A channel operation was issued before the channel was registered to a loop.
    #[error("should register to a loop first")]
    NotRegistered,

    /// A caller-provided buffer cannot hold the requested range.
    #[error("buffer size is wrong: offset {offset} exceeds length {len}")]
    BufferTooSmall {
        /// Requested offset into the buffer.
        offset: usize,
        /// Actual buffer length.
        len: usize,
    },

    /// The operation was canceled before it could finish.
    #[error("operation canceled")]
    Canceled,

    /// A fiber panicked before producing its output.
    #[error("fiber panicked: {0}")]
    FiberPanicked(String),

    /// A configuration value could not be parsed.
    #[error("invalid value {value:?} for {key}")]
    Config {
        /// Name of the setting.
        key: &'static str,
        /// The offending raw value.
        value: String,
    },

    /// An OS-level failure.
    #[error(transparent)]
    Io(Arc<io::Error>),

    /// Any other failure reported by a collaborator.
    #[error(transparent)]
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an arbitrary error as an opaque payload.
    pub fn other<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Other(Arc::new(err))
    }

    /// Returns the underlying I/O error kind, if this is an I/O failure.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Error::Io(err) => Some(err.kind()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

/// Renders a caught panic payload for logging.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_kind() {
        let err: Error = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::BrokenPipe));
        assert_eq!(Error::Canceled.io_kind(), None);
    }

    #[test]
    fn panic_payloads_render() {
        let caught = std::panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "boom 7");
    }
}
