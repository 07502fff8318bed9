//! Executors that run task attempts.
//!
//! The engine never schedules threads itself. It hands each attempt, boxed
//! as a [`Job`], to an [`Executor`]:
//!
//! - [`DirectExecutor`] runs the job on the submitting thread.
//! - [`ThreadPool`] owns a tokio runtime and runs jobs on its blocking pool.
//! - [`TokioExecutor`] runs jobs on a runtime owned by the caller.

use crate::error::Result;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

/// A unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run jobs.
///
/// After [`Executor::shutdown`] an executor refuses new jobs, but jobs it
/// already accepted (running or waiting for a thread) still run.
pub trait Executor: Send + Sync {
    /// Run `job` now or later. A refused job is handed back.
    fn execute(&self, job: Job) -> std::result::Result<(), Job>;

    /// Stop accepting new jobs.
    fn shutdown(&self);

    fn is_shutdown(&self) -> bool;

    /// Free the executor's threads. Only called after [`Executor::shutdown`]
    /// once no accepted job is left.
    fn release(&self) {}
}

// ---------------------------------------------------------------------------
// Thread count
// ---------------------------------------------------------------------------

/// How many threads an engine runs tasks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Threads {
    /// Grow the pool on demand.
    #[default]
    Unbounded,
    /// Run each task on the thread that submitted it.
    Direct,
    /// At most this many tasks run at once; the rest wait in the queue.
    Fixed(NonZeroUsize),
}

impl Threads {
    /// One thread per available processor.
    pub fn compute() -> Self {
        Threads::Fixed(std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN))
    }
}

/// Negative counts mean unbounded, zero means direct, positive means fixed.
impl From<i64> for Threads {
    fn from(value: i64) -> Self {
        match value {
            n if n < 0 => Threads::Unbounded,
            0 => Threads::Direct,
            n => usize::try_from(n)
                .ok()
                .and_then(NonZeroUsize::new)
                .map(Threads::Fixed)
                .unwrap_or(Threads::Unbounded),
        }
    }
}

impl From<i32> for Threads {
    fn from(value: i32) -> Self {
        Threads::from(i64::from(value))
    }
}

impl From<usize> for Threads {
    fn from(value: usize) -> Self {
        NonZeroUsize::new(value)
            .map(Threads::Fixed)
            .unwrap_or(Threads::Direct)
    }
}

impl std::fmt::Display for Threads {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Threads::Unbounded => write!(f, "unbounded"),
            Threads::Direct => write!(f, "direct"),
            Threads::Fixed(n) => write!(f, "{n}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Direct
// ---------------------------------------------------------------------------

thread_local! {
    /// Jobs handed to a direct executor while another job runs on this
    /// thread. `None` when no direct job is running here.
    static PENDING: RefCell<Option<VecDeque<Job>>> = const { RefCell::new(None) };
}

/// Clears the pending queue when the outermost direct job unwinds.
struct Drain;

impl Drop for Drain {
    fn drop(&mut self) {
        PENDING.with(|pending| pending.borrow_mut().take());
    }
}

/// Runs every job on the calling thread.
///
/// A job submitted while another direct job is running on the same thread
/// (a retry, or a nested submission) is queued and run once the current job
/// returns, so chains of retries never grow the stack. The outermost
/// `execute` call returns only after the queue is empty.
///
/// A direct task must therefore not block on the handle of work it submits
/// to a direct engine: that work has not run yet.
#[derive(Debug, Default)]
pub struct DirectExecutor {
    shutdown: AtomicBool,
}

impl DirectExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Executor for DirectExecutor {
    fn execute(&self, job: Job) -> std::result::Result<(), Job> {
        if self.is_shutdown() {
            return Err(job);
        }
        let first = PENDING.with(|pending| {
            let mut pending = pending.borrow_mut();
            if let Some(queue) = pending.as_mut() {
                queue.push_back(job);
                return None;
            }
            *pending = Some(VecDeque::new());
            Some(job)
        });
        let Some(first) = first else {
            return Ok(());
        };

        let _drain = Drain;
        first();
        while let Some(next) =
            PENDING.with(|pending| pending.borrow_mut().as_mut().and_then(VecDeque::pop_front))
        {
            next();
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Owned pool
// ---------------------------------------------------------------------------

/// Blocking-thread ceiling for pools that grow on demand.
const UNBOUNDED_THREADS: usize = usize::MAX >> 1;

/// A pool of threads backed by a dedicated tokio runtime.
///
/// Jobs run on the runtime's blocking pool, which is capped at the fixed
/// thread count. Jobs beyond the cap wait in the runtime's queue. Unbounded
/// pools start a thread for every job that finds no idle one.
///
/// Dropping a pool outside any runtime waits for running jobs unless the
/// pool is a daemon pool. Daemon pools, and pools dropped from inside a
/// runtime context, shut down in the background. [`Executor::release`]
/// stops the runtime early.
pub struct ThreadPool {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    threads: Threads,
    daemon: bool,
    shutdown: AtomicBool,
}

impl ThreadPool {
    /// A pool running at most `threads` jobs at once.
    pub fn fixed(threads: NonZeroUsize) -> Result<Self> {
        Self::build(Some(threads), false)
    }

    /// A pool that grows on demand.
    pub fn unbounded() -> Result<Self> {
        Self::build(None, false)
    }

    /// A pool whose threads never hold up the owner's drop.
    pub fn daemon(threads: Option<NonZeroUsize>) -> Result<Self> {
        Self::build(threads, true)
    }

    fn build(threads: Option<NonZeroUsize>, daemon: bool) -> Result<Self> {
        let mut builder = Builder::new_multi_thread();
        builder
            .worker_threads(1)
            .thread_name(if daemon {
                "threadle-daemon"
            } else {
                "threadle-worker"
            })
            .enable_all();
        // Tokio caps the blocking pool at 512 threads unless told otherwise.
        builder.max_blocking_threads(threads.map_or(UNBOUNDED_THREADS, NonZeroUsize::get));
        let runtime = builder.build()?;
        let handle = runtime.handle().clone();

        let threads = threads.map(Threads::Fixed).unwrap_or(Threads::Unbounded);
        debug!(%threads, daemon, "thread pool started");

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            threads,
            daemon,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn threads(&self) -> Threads {
        self.threads
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    /// Whether the pool's runtime has been stopped.
    pub fn is_released(&self) -> bool {
        self.runtime.lock().is_none()
    }
}

impl Executor for ThreadPool {
    fn execute(&self, job: Job) -> std::result::Result<(), Job> {
        if self.is_shutdown() {
            return Err(job);
        }
        // Detached: the job reports through its own channel.
        drop(self.handle.spawn_blocking(job));
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn release(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            debug!(threads = %self.threads, "thread pool released");
            runtime.shutdown_background();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.get_mut().take() else {
            return;
        };
        // Blocking on shutdown is not allowed from inside a runtime, which
        // includes the pool's own threads.
        if self.daemon || Handle::try_current().is_ok() {
            runtime.shutdown_background();
        } else {
            drop(runtime);
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("threads", &self.threads)
            .field("daemon", &self.daemon)
            .field("shutdown", &self.is_shutdown())
            .field("released", &self.is_released())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Borrowed runtime
// ---------------------------------------------------------------------------

/// Runs jobs on the blocking pool of a runtime the caller owns.
///
/// Shutting this executor down only stops it from accepting jobs; the
/// runtime itself stays up.
#[derive(Debug)]
pub struct TokioExecutor {
    handle: Handle,
    shutdown: AtomicBool,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Use the runtime the calling thread is running in.
    ///
    /// # Errors
    /// Returns an error when called outside a tokio runtime.
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| crate::error::Error::Other(format!("no tokio runtime: {e}")))?;
        Ok(Self::new(handle))
    }
}

impl From<Handle> for TokioExecutor {
    fn from(handle: Handle) -> Self {
        Self::new(handle)
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, job: Job) -> std::result::Result<(), Job> {
        if self.is_shutdown() {
            return Err(job);
        }
        drop(self.handle.spawn_blocking(job));
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
