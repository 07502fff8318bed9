//! Permit-bounded view over an engine.
//!
//! A [`Needle`] throttles one class of work without touching the engine's
//! own limits: at most `permits` submissions made through the needle run at
//! once, however many threads the engine has. Other needles and direct
//! submissions on the same engine are unaffected.

use super::{Admission, Engine, Task, TaskHandle};
use crate::error::{BoxError, Error, Result};
use futures::executor::block_on;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// Caps in-flight submissions routed through it.
///
/// A permit is taken before the submission is handed to the engine and given
/// back when that attempt finishes. Retries of a failed attempt are issued by
/// the engine and do not take a permit.
pub struct Needle {
    engine: Engine,
    permits: usize,
    semaphore: Arc<Semaphore>,
}

impl Needle {
    pub(crate) fn new(engine: Engine, permits: usize) -> Result<Self> {
        if permits == 0 {
            return Err(Error::InvalidArgument(
                "needle permits must be positive".to_string(),
            ));
        }
        // acquire_many takes a u32, so `finish` can only gather that many.
        let permits = permits
            .min(Semaphore::MAX_PERMITS)
            .min(u32::MAX as usize);
        debug!(permits, "needle created");
        Ok(Self {
            engine,
            permits,
            semaphore: Arc::new(Semaphore::new(permits)),
        })
    }

    /// Permits this needle was created with.
    pub fn permits(&self) -> usize {
        self.permits
    }

    /// Permits not currently held by a running submission.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Submit through the needle with the engine's default retry budget.
    ///
    /// Blocks until a permit is free, then until the engine admits the task.
    pub fn submit<T, E, F>(&self, name: &str, work: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        E: Into<BoxError>,
        F: Fn() -> std::result::Result<T, E> + Send + Sync + 'static,
    {
        self.submit_with_retries(name, self.engine.retries(), work)
    }

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
        if self.engine.is_closed() {
            return Err(Error::Rejected(name.to_string()));
        }
        let permit = block_on(Arc::clone(&self.semaphore).acquire_owned())
            .map_err(|_| Error::Rejected(name.to_string()))?;
        self.engine
            .inner
            .dispatch(task, Admission::Wait, Some(permit))
    }

    pub fn execute<E, F>(&self, name: &str, work: F) -> Result<TaskHandle<()>>
    where
        E: Into<BoxError>,
        F: Fn() -> std::result::Result<(), E> + Send + Sync + 'static,
    {
        self.submit(name, work)
    }

    /// Block until every submission made through this needle has finished.
    ///
    /// Submissions racing with this call may or may not be waited for.
    pub fn finish(&self) {
        // permits <= u32::MAX, see `new`.
        let all = u32::try_from(self.permits).unwrap_or(u32::MAX);
        if let Ok(held) = block_on(self.semaphore.acquire_many(all)) {
            drop(held);
        }
    }
}

impl fmt::Debug for Needle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Needle")
            .field("permits", &self.permits)
            .field("available", &self.available())
            .finish()
    }
}
