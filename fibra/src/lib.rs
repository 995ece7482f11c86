//! A cooperative, event-driven runtime for asynchronous I/O.
//!
//! The crate is built from three pieces that only make sense together:
//!
//! - [`future`]: single-assignment completion slots that bridge callback-style completion to
//!   waiting code, blocking or suspended
//! - [`event_loop`]: the per-thread loop that waits on a [`reactor::Selector`], dispatches
//!   readiness to [`channel::Channel`]s and runs queued tasks
//! - [`fiber`]: cooperatively scheduled units of execution that suspend at `.await` points and
//!   are resumed by their loop
//!
//! Around them sit the [`runtime`] (one loop per worker thread), a loop-driven [`timer`], and
//! reference channels for files ([`fs`]) and TCP sockets ([`net`]).
//!
//! ```no_run
//! use std::time::Duration;
//!
//! #[fibra::main]
//! async fn main() {
//!     fibra::timer::sleep(Duration::from_millis(10)).await.unwrap();
//!     println!("slept without blocking the loop");
//! }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod fiber;
pub mod fs;
pub mod future;
pub mod net;
pub mod reactor;
pub mod runtime;
pub mod timer;
pub mod waker;

pub use channel::{Channel, Register};
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use event_loop::{EventLoop, Task, WeakEventLoop};
pub use fiber::Fiber;
pub use future::{AwaitableFuture, Future, FutureState};
pub use runtime::{Runtime, block_on, launch};

pub use fibra_macros::main;
