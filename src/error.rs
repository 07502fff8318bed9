//! Error types for threadle.

use thiserror::Error;

/// Boxed error produced by a task body.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("task {name} failed on attempt {attempt}: {source}")]
    TaskFailed {
        name: String,
        attempt: u32,
        #[source]
        source: BoxError,
    },

    #[error("task {name} panicked on attempt {attempt}: {message}")]
    TaskPanicked {
        name: String,
        attempt: u32,
        message: String,
    },

    #[error("task {0} was dropped before it completed")]
    Cancelled(String),

    #[error("task {0} rejected: engine is shut down")]
    Rejected(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error came from running the task body (as opposed to
    /// misuse or a shut-down engine).
    pub fn is_task_failure(&self) -> bool {
        matches!(self, Error::TaskFailed { .. } | Error::TaskPanicked { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
