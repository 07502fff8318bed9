//! Per-submission result handles.
//!
//! Each attempt reports through a oneshot channel. A failed attempt that was
//! retried also carries the retry's handle, so a caller can either take the
//! attempt's own outcome or follow the lineage to its last attempt.

use crate::error::{Error, Result};
use futures::executor::block_on;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// What an attempt sends back when it finishes.
pub(crate) enum Attempt<T> {
    Finished(Result<T>),
    Retried { error: Error, next: TaskHandle<T> },
}

/// Handle to one attempt of a submitted task.
///
/// Awaiting the handle (or calling [`TaskHandle::wait`]) yields this
/// attempt's outcome, even when a retry is already running. Use
/// [`TaskHandle::wait_final`] or [`TaskHandle::final_result`] to wait for
/// the lineage's last attempt instead.
///
/// Dropping the handle does not cancel the task.
#[must_use = "the handle is the only way to observe the task's result"]
pub struct TaskHandle<T> {
    name: Arc<str>,
    attempt: u32,
    rx: oneshot::Receiver<Attempt<T>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(name: Arc<str>, attempt: u32, rx: oneshot::Receiver<Attempt<T>>) -> Self {
        Self { name, attempt, rx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Zero for the original submission, `k` for its `k`-th retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Block the calling thread until this attempt finishes.
    ///
    /// Inside an async runtime, `.await` the handle instead: this call
    /// would stall a runtime worker.
    pub fn wait(mut self) -> Result<T> {
        let received = block_on(&mut self.rx);
        settle(&self.name, received)
    }

    /// Block until the last attempt of this lineage finishes.
    pub fn wait_final(self) -> Result<T> {
        let mut handle = self;
        loop {
            match block_on(&mut handle.rx) {
                Ok(Attempt::Retried { next, .. }) => handle = next,
                received => return settle(&handle.name, received),
            }
        }
    }

    /// Await the last attempt of this lineage.
    pub async fn final_result(self) -> Result<T> {
        let mut handle = self;
        loop {
            match (&mut handle.rx).await {
                Ok(Attempt::Retried { next, .. }) => handle = next,
                received => return settle(&handle.name, received),
            }
        }
    }
}

fn settle<T>(
    name: &str,
    received: std::result::Result<Attempt<T>, oneshot::error::RecvError>,
) -> Result<T> {
    match received {
        Ok(Attempt::Finished(result)) => result,
        Ok(Attempt::Retried { error, .. }) => Err(error),
        // Sender dropped without reporting: the executor discarded the job.
        Err(_) => Err(Error::Cancelled(name.to_string())),
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|received| settle(&this.name, received))
    }
}

/// Unlinks a finished retry chain one handle at a time, so dropping the
/// first handle of a long lineage does not recurse through all of it.
impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        let mut next = take_retry(&mut self.rx);
        while let Some(mut handle) = next {
            next = take_retry(&mut handle.rx);
        }
    }
}

fn take_retry<T>(rx: &mut oneshot::Receiver<Attempt<T>>) -> Option<TaskHandle<T>> {
    match rx.try_recv() {
        Ok(Attempt::Retried { next, .. }) => Some(next),
        _ => None,
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("attempt", &self.attempt)
            .finish()
    }
}
