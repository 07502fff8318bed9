//! Task execution engine: admission control, retries, and drain-on-close.
//!
//! An [`Engine`] wraps an [`Executor`] and tracks two counters shared by
//! every clone of the engine:
//!
//! - `remaining`: attempts handed to the executor that have not finished.
//! - `queued`: attempts handed to the executor that have not started yet.
//!
//! New submissions wait while `queued >= max_queued`. A failed attempt with
//! retry budget left is resubmitted as a fresh attempt before its own
//! `remaining` slot is released, so `remaining` can briefly count a lineage
//! twice. `remaining` only serves to detect quiescence in [`Engine::close`],
//! where that over-count errs on the side of waiting.

pub mod executor;
pub mod handle;
pub mod needle;

pub use executor::{DirectExecutor, Executor, Job, ThreadPool, Threads, TokioExecutor};
pub use handle::TaskHandle;
pub use needle::Needle;

use crate::error::{BoxError, Error, Result};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_outcome, start_task_span};
use handle::Attempt;
use opentelemetry::KeyValue;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default permit count for facades created without an explicit count.
pub const DEFAULT_NEEDLE_PERMITS: usize = i32::MAX as usize;

/// Upper bound on how long a blocked submitter or closer sleeps between
/// re-checking the counters.
const RECHECK_INTERVAL: Duration = Duration::from_millis(10);

type Work<T> = Arc<dyn Fn() -> std::result::Result<T, BoxError> + Send + Sync>;

/// Construction and tuning settings for an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub threads: Threads,
    /// Pool threads never hold up the engine's drop.
    pub daemon: bool,
    /// Default retry budget for new submissions.
    pub retries: u32,
    /// Admission ceiling on queued attempts.
    pub max_queued: usize,
    /// Default permit count for [`Engine::needle`].
    pub needle_permits: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: Threads::Unbounded,
            daemon: false,
            retries: 0,
            max_queued: usize::MAX,
            needle_permits: DEFAULT_NEEDLE_PERMITS,
        }
    }
}

/// Runs named tasks on an executor with retries and backpressure.
///
/// Cloning is cheap; clones share the executor, counters, and settings.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    executor: Box<dyn Executor>,
    remaining: AtomicUsize,
    queued: AtomicUsize,
    retries: AtomicU32,
    max_queued: AtomicUsize,
    needle_permits: AtomicUsize,
    closed: AtomicBool,
    /// Paired with `changed`; guards nothing but the wakeup handshake.
    signal: Mutex<()>,
    changed: Condvar,
}

/// One attempt of a task lineage.
struct Task<T> {
    name: Arc<str>,
    lineage: Uuid,
    attempt: u32,
    retries_left: u32,
    work: Work<T>,
}

impl<T> Task<T> {
    fn new<E, F>(name: &str, retries: u32, work: F) -> Result<Self>
    where
        E: Into<BoxError>,
        F: Fn() -> std::result::Result<T, E> + Send + Sync + 'static,
    {
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "task name must not be blank".to_string(),
            ));
        }
        Ok(Self {
            name: Arc::from(name),
            lineage: Uuid::new_v4(),
            attempt: 0,
            retries_left: retries,
            work: Arc::new(move || work().map_err(Into::into)),
        })
    }

    fn next_attempt(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            lineage: self.lineage,
            attempt: self.attempt + 1,
            retries_left: self.retries_left.saturating_sub(1),
            work: Arc::clone(&self.work),
        }
    }
}

/// Whether a dispatch waits for a queue slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Wait,
    /// Retries skip admission so a full queue cannot starve them.
    Bypass,
}

impl Engine {
    /// Create an engine running tasks on `threads` threads.
    ///
    /// Accepts a [`Threads`] value or an integer: negative for an unbounded
    /// pool, zero to run tasks on the submitting thread, positive for a
    /// fixed pool.
    pub fn new(threads: impl Into<Threads>) -> Result<Self> {
        Self::build(threads.into(), false)
    }

    /// Create an engine around an executor the caller already has.
    pub fn with_executor(executor: impl Executor + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor: Box::new(executor),
                remaining: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                retries: AtomicU32::new(0),
                max_queued: AtomicUsize::new(usize::MAX),
                needle_permits: AtomicUsize::new(DEFAULT_NEEDLE_PERMITS),
                closed: AtomicBool::new(false),
                signal: Mutex::new(()),
                changed: Condvar::new(),
            }),
        }
    }

    /// A fixed pool with one thread per available processor.
    pub fn for_compute() -> Result<Self> {
        Self::new(Threads::compute())
    }

    /// An engine whose pool threads never hold up its drop.
    pub fn for_daemon(threads: impl Into<Threads>) -> Result<Self> {
        Self::build(threads.into(), true)
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let engine = Self::build(config.threads, config.daemon)?;
        engine
            .set_retries(config.retries)
            .set_max_queued(config.max_queued)
            .set_needle_permits(config.needle_permits);
        Ok(engine)
    }

    fn build(threads: Threads, daemon: bool) -> Result<Self> {
        Ok(match (threads, daemon) {
            (Threads::Direct, _) => Self::with_executor(DirectExecutor::new()),
            (Threads::Unbounded, false) => Self::with_executor(ThreadPool::unbounded()?),
            (Threads::Fixed(n), false) => Self::with_executor(ThreadPool::fixed(n)?),
            (Threads::Unbounded, true) => Self::with_executor(ThreadPool::daemon(None)?),
            (Threads::Fixed(n), true) => Self::with_executor(ThreadPool::daemon(Some(n))?),
        })
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub fn retries(&self) -> u32 {
        self.inner.retries.load(Ordering::SeqCst)
    }

    /// Set the retry budget for later submissions that do not name one.
    pub fn set_retries(&self, retries: u32) -> &Self {
        self.inner.retries.store(retries, Ordering::SeqCst);
        self
    }

    pub fn with_retries(self, retries: u32) -> Self {
        self.set_retries(retries);
        self
    }

    pub fn max_queued(&self) -> usize {
        self.inner.max_queued.load(Ordering::SeqCst)
    }

    /// Set the admission ceiling. Zero blocks every new submission.
    pub fn set_max_queued(&self, max_queued: usize) -> &Self {
        self.inner.max_queued.store(max_queued, Ordering::SeqCst);
        self.inner.notify();
        self
    }

    pub fn with_max_queued(self, max_queued: usize) -> Self {
        self.set_max_queued(max_queued);
        self
    }

    pub fn needle_permits(&self) -> usize {
        self.inner.needle_permits.load(Ordering::SeqCst)
    }

    /// Set the permit count used by [`Engine::needle`].
    pub fn set_needle_permits(&self, permits: usize) -> &Self {
        self.inner.needle_permits.store(permits, Ordering::SeqCst);
        self
    }

    pub fn with_needle_permits(self, permits: usize) -> Self {
        self.set_needle_permits(permits);
        self
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    /// Attempts submitted but not yet finished.
    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::SeqCst)
    }

    /// Attempts handed to the executor that have not started running.
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Submit `work` under `name` with the engine's default retry budget.
    ///
    /// Blocks while the queue is at its admission ceiling. Failures of the
    /// work itself only surface through the returned handle.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for a blank name and
    /// [`Error::Rejected`] once the engine is closed. Neither changes the
    /// counters.
    pub fn submit<T, E, F>(&self, name: &str, work: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        E: Into<BoxError>,
        F: Fn() -> std::result::Result<T, E> + Send + Sync + 'static,
    {
        self.submit_with_retries(name, self.retries(), work)
    }

    /// Submit `work` with an explicit retry budget.
    pub fn submit_with_retries<T, E, F>(
        &self,
        name: &str,
        retries: u32,
        work: F,
    ) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        E: Into<BoxError>,
        F: Fn() -> std::result::Result<T, E> + Send + Sync + 'static,
    {
        let task = Task::new(name, retries, work)?;
        self.inner.dispatch(task, Admission::Wait, None)
    }

    /// Submit work that produces no value.
    pub fn execute<E, F>(&self, name: &str, work: F) -> Result<TaskHandle<()>>
    where
        E: Into<BoxError>,
        F: Fn() -> std::result::Result<(), E> + Send + Sync + 'static,
    {
        self.submit(name, work)
    }

    pub fn execute_with_retries<E, F>(
        &self,
        name: &str,
        retries: u32,
        work: F,
    ) -> Result<TaskHandle<()>>
    where
        E: Into<BoxError>,
        F: Fn() -> std::result::Result<(), E> + Send + Sync + 'static,
    {
        self.submit_with_retries(name, retries, work)
    }

    /// A facade capping in-flight submissions at the engine's current
    /// default permit count.
    pub fn needle(&self) -> Result<Needle> {
        Needle::new(self.clone(), self.needle_permits())
    }

    /// A facade capping in-flight submissions at `permits`.
    pub fn needle_with(&self, permits: usize) -> Result<Needle> {
        Needle::new(self.clone(), permits)
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Wait until every submitted task has finished, then shut the executor
    /// down. Returns whether the engine drained.
    ///
    /// A drained engine also stops an owned pool's threads. After a timed-out
    /// close they live on until the last clone of the engine is dropped.
    ///
    /// Calling this from inside one of the engine's own tasks never returns.
    pub fn close(&self) -> bool {
        self.inner.close(None)
    }

    /// Like [`Engine::close`], but stop waiting after `timeout`. Work still
    /// outstanding keeps running after shutdown; the result is `false`.
    pub fn close_timeout(&self, timeout: Duration) -> bool {
        self.inner.close(Some(timeout))
    }
}

impl Inner {
    fn dispatch<T: Send + 'static>(
        self: &Arc<Self>,
        task: Task<T>,
        admission: Admission,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<TaskHandle<T>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.reject(&task.name));
        }

        match admission {
            Admission::Wait => self.admit(),
            Admission::Bypass => {
                self.queued.fetch_add(1, Ordering::SeqCst);
            }
        }
        if self.closed.load(Ordering::SeqCst) {
            // Closed while waiting for a slot.
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.notify();
            return Err(self.reject(&task.name));
        }
        self.remaining.fetch_add(1, Ordering::SeqCst);

        let kind = match admission {
            Admission::Wait => "original",
            Admission::Bypass => "retry",
        };
        metrics::task_submitted().add(1, &[KeyValue::new("kind", kind)]);

        let (tx, rx) = oneshot::channel();
        let handle = TaskHandle::new(Arc::clone(&task.name), task.attempt, rx);
        let name = Arc::clone(&task.name);
        let inner = Arc::clone(self);
        let job: Job = Box::new(move || inner.run(task, tx, permit));

        if self.executor.execute(job).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.remaining.fetch_sub(1, Ordering::SeqCst);
            self.notify();
            return Err(self.reject(&name));
        }
        Ok(handle)
    }

    /// Block until a queue slot is free, then take it.
    fn admit(&self) {
        loop {
            let queued = self.queued.load(Ordering::SeqCst);
            if queued < self.max_queued.load(Ordering::SeqCst) {
                if self
                    .queued
                    .compare_exchange(queued, queued + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return;
                }
                continue;
            }

            let mut signal = self.signal.lock();
            if self.queued.load(Ordering::SeqCst) >= self.max_queued.load(Ordering::SeqCst) {
                self.changed.wait_for(&mut signal, RECHECK_INTERVAL);
            }
        }
    }

    fn run<T>(
        self: Arc<Self>,
        task: Task<T>,
        tx: oneshot::Sender<Attempt<T>>,
        permit: Option<OwnedSemaphorePermit>,
    ) where
        T: Send + 'static,
    {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        self.notify();

        let span = start_task_span(&task.name, &task.lineage, task.attempt);
        let _entered = span.enter();

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| (task.work)()));
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        drop(permit);

        let error = match result {
            Ok(Ok(value)) => {
                self.finish();
                record_outcome(&span, "ok");
                record_metrics("ok", duration_ms);
                debug!(name = %task.name, duration_ms, "execution finished");
                let _ = tx.send(Attempt::Finished(Ok(value)));
                return;
            }
            Ok(Err(source)) => Error::TaskFailed {
                name: task.name.to_string(),
                attempt: task.attempt,
                source,
            },
            Err(payload) => Error::TaskPanicked {
                name: task.name.to_string(),
                attempt: task.attempt,
                message: panic_message(payload.as_ref()),
            },
        };

        // The retry is dispatched before this attempt releases its slot, so
        // `remaining` never reads zero while the lineage is still alive.
        let retry = if task.retries_left > 0 {
            match self.dispatch(task.next_attempt(), Admission::Bypass, None) {
                Ok(next) => Some(next),
                Err(e) => {
                    warn!(name = %task.name, error = %e, "retry not submitted");
                    None
                }
            }
        } else {
            None
        };

        self.finish();
        let outcome = if retry.is_some() { "failed" } else { "exhausted" };
        record_outcome(&span, outcome);
        record_metrics(outcome, duration_ms);
        warn!(
            name = %task.name,
            retries_left = task.retries_left,
            error = %error,
            "execution failed"
        );

        let _ = tx.send(match retry {
            Some(next) => Attempt::Retried { error, next },
            None => Attempt::Finished(Err(error)),
        });
    }

    fn finish(&self) {
        self.remaining.fetch_sub(1, Ordering::SeqCst);
        self.notify();
    }

    fn notify(&self) {
        let _signal = self.signal.lock();
        self.changed.notify_all();
    }

    fn reject(&self, name: &str) -> Error {
        metrics::task_rejected().add(1, &[]);
        Error::Rejected(name.to_string())
    }

    fn close(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        let mut signal = self.signal.lock();
        while self.remaining.load(Ordering::SeqCst) > 0 {
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    (deadline - now).min(RECHECK_INTERVAL)
                }
                None => RECHECK_INTERVAL,
            };
            self.changed.wait_for(&mut signal, wait);
        }
        drop(signal);

        self.closed.store(true, Ordering::SeqCst);
        self.executor.shutdown();

        let remaining = self.remaining.load(Ordering::SeqCst);
        let drained = remaining == 0;
        if drained {
            self.executor.release();
        }
        info!(drained, remaining, "engine closed");
        drained
    }
}

fn record_metrics(result: &'static str, duration_ms: f64) {
    let labels = [KeyValue::new("result", result)];
    metrics::task_outcomes().add(1, &labels);
    metrics::task_duration_ms().record(duration_ms, &labels);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("remaining", &self.remaining())
            .field("queued", &self.queued())
            .field("retries", &self.retries())
            .field("max_queued", &self.max_queued())
            .field("needle_permits", &self.needle_permits())
            .field("closed", &self.is_closed())
            .finish()
    }
}
