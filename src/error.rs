//! Failure values carried by deferreds and the misuse errors raised by their API.
//!
//! Ordinary asynchronous failures are not panics: they are [`Error`] values that
//! travel down a deferred's errback branch until a handler recovers from them.
//! Calling the API in a way that can never be correct (resolving a deferred twice,
//! resolving a chained deferred from the outside) yields a [`ReuseError`] instead.

use std::sync::Arc;

/// Error code of [`Error::Canceled`].
pub const CANCELED_ERROR: u16 = 419;

/// Error code of [`Error::Generic`] and [`Error::Other`].
pub const GENERIC_ERROR: u16 = 420;

/// Error code of [`Error::Transport`].
pub const TRANSPORT_ERROR: u16 = 421;

/// Error code of [`Error::PoolTimeout`].
pub const POOL_TIMEOUT_ERROR: u16 = 422;

/// Error code of [`Error::Storage`].
pub const STORAGE_ERROR: u16 = 423;

/// A recoverable failure travelling down a deferred's error branch.
///
/// Errors are cheap to clone so that aggregates such as
/// [`DeferredList`](crate::DeferredList) can record a child's failure while the
/// child's own handlers still observe it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The deferred was canceled before it produced a result.
    #[error("deferred was canceled")]
    Canceled,

    /// A failure described only by a message.
    #[error("{0}")]
    Generic(String),

    /// A failure reported verbatim by a transport collaborator.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A pool entry held its concurrency slot longer than the pool timeout.
    #[error("pool entry timed out")]
    PoolTimeout,

    /// A failure reported verbatim by a storage collaborator.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Any other error produced by user code.
    #[error("{0}")]
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::Canceled, Error::Canceled) | (Error::PoolTimeout, Error::PoolTimeout) => true,
            (Error::Generic(a), Error::Generic(b))
            | (Error::Transport(a), Error::Transport(b))
            | (Error::Storage(a), Error::Storage(b)) => a == b,
            (Error::Other(a), Error::Other(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Error {
    /// Builds an [`Error::Generic`] from anything printable.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Generic(message.into())
    }

    /// Wraps an arbitrary error type.
    pub fn other(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Other(Arc::new(error))
    }

    /// Returns the numeric code of this failure kind.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Error::Canceled => CANCELED_ERROR,
            Error::Generic(_) | Error::Other(_) => GENERIC_ERROR,
            Error::Transport(_) => TRANSPORT_ERROR,
            Error::PoolTimeout => POOL_TIMEOUT_ERROR,
            Error::Storage(_) => STORAGE_ERROR,
        }
    }

    /// Returns `true` if this is a cancellation.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

/// Misuse of a deferred instance.
///
/// These are programmer errors: they are reported immediately and retrying the
/// same call can never succeed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReuseError {
    /// The deferred already has a result.
    #[error("deferred has already been fired")]
    AlreadyFired,

    /// The deferred was returned by a handler and is owned by that chain step.
    #[error("chained deferreds can not be re-used")]
    Chained,

    /// The deferred has been fully spent.
    #[error("finalized deferreds can not be re-used")]
    Finalized,
}
