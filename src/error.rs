//! Error taxonomy: store contention and I/O, activity failure classes, and
//! client-facing wrappers. Payload-level errors (what an orchestrator sees
//! from a failed activity) stay plain strings on the wire.

use thiserror::Error;

/// Errors surfaced by a [`crate::providers::HistoryStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Optimistic append lost the race: the log grew since it was read.
    /// Recovered locally by re-reading and retrying the pass.
    #[error("append conflict: expected history length {expected}, found {actual}")]
    Conflict { expected: usize, actual: usize },
    #[error("instance already exists: {0}")]
    InstanceExists(String),
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("storage error: {0}")]
    Io(String),
}

/// Failure classes reported by activity handlers. `Transient` failures are
/// retried by the dispatcher per its [`crate::runtime::RetryPolicy`];
/// `Permanent` failures are recorded terminally on first occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivityError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

/// Errors returned by control-plane client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("encode error: {0}")]
    Encode(String),
}

/// Outcome of a bounded wait for terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("timed out waiting for terminal status")]
    Timeout,
    #[error("{0}")]
    Other(String),
}
