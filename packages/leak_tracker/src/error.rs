use std::io;

use thiserror::Error;

/// Errors that can occur when operating a [`Tracker`][crate::Tracker].
///
/// None of these are fatal to the host program. An operation that fails with one of these
/// errors has not touched the tracker state or the underlying allocator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An earlier panic happened while the tracker state was locked, so the state can no
    /// longer be trusted to be consistent.
    #[error("tracker lock is poisoned by an earlier panic while it was held")]
    LockPoisoned,

    /// Two threads used the same tracker at the same time but thread safety was not enabled
    /// in its configuration.
    #[error(
        "tracker was used concurrently from multiple threads but thread safety is not enabled"
    )]
    ConcurrentAccess,

    /// The tracker was called from inside its own bookkeeping, for example by an output
    /// writer or a `tracing` subscriber that calls back into the same tracker.
    #[error("tracker was called re-entrantly from inside its own bookkeeping")]
    Reentrant,

    /// Writing a report to the caller-provided destination failed.
    #[error("failed to write report: {0}")]
    Io(#[from] io::Error),
}

/// A specialized `Result` type for tracker operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
