//! Structured error types for the queue.
//!
//! `QueueError` is the only error surfaced by storage-facing APIs; long
//! running services (`Worker::run`, `Scheduler::run`) use `anyhow::Result`
//! for their outer plumbing. Consumer errors are never represented here:
//! they are encoded into the job's run history by the outcome processor.

use thiserror::Error;

/// Error taxonomy of the queue core.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Any Redis-level failure. Surfaced to the caller of the affected
    /// operation; never retried by the core. Feeds the worker loop's
    /// throttle accounting.
    #[error("storage failure: {0}")]
    Storage(String),

    /// No record exists for the given id (or the stored record belongs to a
    /// different id; data skew is treated the same way).
    #[error("no job record for id {0}")]
    NotFound(String),

    /// The stored record could not be deserialized.
    #[error("corrupt job record for id {id}: {reason}")]
    Corrupt { id: String, reason: String },

    /// A blocking pop returned no job within its timeout. Non-fatal; the
    /// worker loop re-pops.
    #[error("no job available within the pop timeout")]
    Empty,

    /// Invalid caller input, raised synchronously at construction.
    #[error("invalid argument: {0}")]
    BadArgument(String),
}

impl QueueError {
    /// Whether this error is the benign pop-timeout case.
    pub fn is_empty(&self) -> bool {
        matches!(self, QueueError::Empty)
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Storage(err.to_string())
    }
}
