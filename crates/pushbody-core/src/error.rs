//! Protocol error types.

use thiserror::Error;

/// Violations of the producer/consumer body contract.
///
/// Every variant is fatal for the call that detected it. The producer never
/// retries or recovers; the caller is expected to treat these as bugs in the
/// test or in the consumer under test.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A chunk, completion, or error operation ran before registration.
    #[error("not registered")]
    NotRegistered,

    #[error("already registered")]
    AlreadyRegistered,

    /// Synchronous delivery, but the consumer answered "will continue".
    #[error("continuation promised but none possible")]
    ContinuationUnavailable,

    /// The consumer promised to continue, then dropped the continuation
    /// without invoking it.
    #[error("continuation dropped before it was invoked")]
    ContinuationDropped,

    /// A pending continuation would have to be awaited by blocking the only
    /// thread of a current-thread Tokio runtime.
    #[error("cannot wait for a continuation on a current-thread runtime")]
    RuntimeBlocked,

    /// The spawner could not launch the auto-drain task.
    #[error("failed to schedule auto-drain: {0}")]
    SpawnFailed(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
