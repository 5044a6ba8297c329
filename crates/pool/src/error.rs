use std::path::PathBuf;

use thiserror::Error;

use crate::state::StateId;

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("invalid thread state transition: {from} -> {to}")]
    InvalidTransition { from: StateId, to: StateId },

    #[error("unexpected thread state '{state}' in {handler}")]
    UnexpectedState { handler: &'static str, state: StateId },

    #[error("too many consecutive worker failures: {worker} failed {failures} times")]
    TooManyFailures { worker: String, failures: u32 },

    #[error("max amount of threads reached: {count}")]
    MaxThreadsReached { count: usize },

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("cannot remove last thread ({count} left)")]
    CannotRemoveLastThread { count: usize },

    #[error("worker already registered: {}", .0.display())]
    DuplicateWorker(PathBuf),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request timed out after waiting {waited_ms}ms for a thread")]
    Timeout { waited_ms: u64 },

    #[error("request cancelled by client")]
    Cancelled,

    #[error("thread pool is shutting down")]
    ShuttingDown,

    #[error("not called from a worker thread")]
    NotAWorkerThread,

    #[error("script engine failed to initialize: {0}")]
    Engine(String),

    #[error("unable to spawn thread {index}: {reason}")]
    Spawn { index: usize, reason: String },
}

impl PoolError {
    /// Fatal errors are logic errors or a crash-looping worker with no way to
    /// recover; everything else is scoped to one request or one admin call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PoolError::InvalidTransition { .. }
                | PoolError::UnexpectedState { .. }
                | PoolError::TooManyFailures { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_category_is_separate_from_request_errors() {
        let invalid = PoolError::InvalidTransition {
            from: StateId::Ready,
            to: StateId::Reserved,
        };
        assert!(invalid.is_fatal());
        assert!(!PoolError::Timeout { waited_ms: 10 }.is_fatal());
        assert!(!PoolError::CannotRemoveLastThread { count: 1 }.is_fatal());
        assert_eq!(
            invalid.to_string(),
            "invalid thread state transition: ready -> reserved"
        );
    }
}
