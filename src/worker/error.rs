use thiserror::Error;

use super::protocol::WorkerFn;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkerError {
    #[error("task \"{function}\" timed out after {elapsed_ms}ms")]
    Timeout {
        function: WorkerFn,
        elapsed_ms: u64,
    },
    #[error("compute unit crashed: {0}")]
    Crashed(String),
    #[error("task cancelled: {0}")]
    Cancelled(String),
    #[error("task \"{function}\" failed: {message}")]
    Remote {
        function: WorkerFn,
        message: String,
    },
    #[error("compute unit unavailable: {0}")]
    Unavailable(String),
    #[error("channel disposed before the task settled")]
    Disposed,
    #[error("task \"{function}\" returned an unexpected payload")]
    UnexpectedPayload { function: WorkerFn },
}

impl WorkerError {
    /// Whether the backing unit is gone and the channel must be recreated.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Crashed(_) | Self::Unavailable(_) | Self::Disposed)
    }
}
