//! The multi-loop runtime.
//!
//! A [`Runtime`] owns one [`EventLoop`] per worker thread. Fibers are placed round-robin and
//! stay on the loop they were launched on for their whole life.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::Context;
use std::thread;

use metrics::counter;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::future::AwaitableFuture;

/// A set of event loops, each driven by a dedicated worker thread.
pub struct Runtime {
    loops: Vec<EventLoop>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    next: AtomicUsize,
}

impl Runtime {
    /// Creates and starts a runtime.
    ///
    /// Spawns `config.worker_threads` threads, each running its own loop. When
    /// `config.metrics_port` is set, a Prometheus exporter is installed on that port.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use fibra::{Runtime, RuntimeConfig};
    ///
    /// let runtime = Runtime::new(RuntimeConfig::default().with_worker_threads(2))?;
    /// let answer = runtime.block_on(async { 6 * 7 })?;
    /// assert_eq!(answer, 42);
    /// # Ok::<(), fibra::Error>(())
    /// ```
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;

        if let Some(port) = config.metrics_port {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .with_http_listener(([127, 0, 0, 1], port))
                .install()
                .map_err(Error::other)?;
            info!(port, "metrics enabled at http://localhost:{port}/metrics");
        }

        let event_capacity = config.event_capacity;
        Self::start(&config, || EventLoop::with_capacity(event_capacity))
    }

    /// Starts one worker per loop produced by `make_loop`.
    ///
    /// If any loop or thread fails to come up, the workers already started are stopped and
    /// joined before the error is returned.
    fn start<F>(config: &RuntimeConfig, mut make_loop: F) -> Result<Self>
    where
        F: FnMut() -> Result<EventLoop>,
    {
        let mut loops = Vec::with_capacity(config.worker_threads);
        let mut workers = Vec::with_capacity(config.worker_threads);
        for id in 0..config.worker_threads {
            match Self::spawn_worker(id, &config.thread_name_prefix, &mut make_loop) {
                Ok((event_loop, handle)) => {
                    loops.push(event_loop);
                    workers.push(handle);
                }
                Err(err) => {
                    error!(worker = id, error = %err, "worker failed to start; tearing down");
                    shutdown(&loops, workers);
                    return Err(err);
                }
            }
        }

        info!(workers = loops.len(), "runtime started");
        Ok(Self {
            loops,
            workers: Mutex::new(workers),
            next: AtomicUsize::new(0),
        })
    }

    fn spawn_worker<F>(
        id: usize,
        prefix: &str,
        make_loop: &mut F,
    ) -> Result<(EventLoop, thread::JoinHandle<()>)>
    where
        F: FnMut() -> Result<EventLoop>,
    {
        let event_loop = make_loop()?;
        let driver = event_loop.clone();
        let handle = thread::Builder::new()
            .name(format!("{prefix}-{id}"))
            .spawn(move || {
                if let Err(err) = driver.run() {
                    error!(worker = id, error = %err, "event loop terminated with an error");
                }
            })?;
        Ok((event_loop, handle))
    }

    /// The loops owned by this runtime, in worker order.
    pub fn loops(&self) -> &[EventLoop] {
        &self.loops
    }

    /// Picks the loop the next fiber goes to.
    pub fn next_loop(&self) -> &EventLoop {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        &self.loops[idx]
    }

    /// Launches `future` as a fiber on one of the worker loops.
    pub fn launch<F>(&self, future: F) -> AwaitableFuture<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.next_loop().launch(future)
    }

    /// Runs `future` as a fiber and blocks the calling thread until it finishes.
    ///
    /// Must not be called from a worker thread; that returns [`Error::BlockingInLoop`].
    pub fn block_on<F>(&self, future: F) -> Result<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let finished = self.launch(async move {
            let _ = tx.send(future.await);
        });
        finished.get()?;
        rx.try_recv().map_err(|_| Error::Canceled)
    }

    /// Stops every loop and joins the worker threads. Idempotent.
    pub fn stop(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        shutdown(&self.loops, workers);
    }
}

fn shutdown(loops: &[EventLoop], workers: Vec<thread::JoinHandle<()>>) {
    for event_loop in loops {
        event_loop.stop();
    }
    let current = thread::current().id();
    for worker in workers {
        // A worker cannot join itself.
        if worker.thread().id() == current {
            continue;
        }
        let _ = worker.join();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Launches a fiber on the loop driven by the calling thread.
///
/// # Panics
///
/// Panics if called outside of a loop thread.
///
/// # Examples
///
/// ```ignore
/// #[fibra::main]
/// async fn main() {
///     fibra::launch(async {
///         println!("launched fiber");
///     });
/// }
/// ```
pub fn launch<F>(future: F) -> AwaitableFuture<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    let event_loop = EventLoop::local().expect("fibra: launch called outside of an event loop");
    counter!("fibra_local_launches_total").increment(1);
    event_loop.launch(future)
}

/// Polls `future` on the calling thread, parking it between wakeups.
///
/// This is the off-runtime way to await an [`AwaitableFuture`]: no loop, no fiber, just the
/// current OS thread.
pub fn block_on<F>(future: F) -> F::Output
where
    F: std::future::Future,
{
    let mut future = Box::pin(future);
    let thread = thread::current();

    let waker = crate::waker::unpark_waker(thread);
    let mut ctx = Context::from_waker(&waker);

    loop {
        match future.as_mut().poll(&mut ctx) {
            std::task::Poll::Ready(output) => return output,
            std::task::Poll::Pending => thread::park(),
        }
    }
}
