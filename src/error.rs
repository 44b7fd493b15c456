//! Error types for autorun.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("event queue is full (capacity {0})")]
    QueueFull(usize),

    #[error("{0} has been shut down")]
    ShutDown(&'static str),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("task was cancelled")]
    Cancelled,

    #[error("schedule {0} has an execution in flight")]
    ScheduleRunning(String),

    #[error("playback error: {0}")]
    Playback(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("task failed: {0}")]
    Task(String),

    #[error("task panicked or was aborted: {0}")]
    Join(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Timeouts leave the underlying work in an unknown final state.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
