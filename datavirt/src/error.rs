use thiserror::Error;

use crate::PageNumber;

/// Boxed error produced by providers and model stores.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the virtualization engine.
///
/// Cancellation of an in-flight fetch is not an error: a cancelled fetch simply applies nothing.
/// [`Error::Cancelled`] is only returned by operations the caller awaits directly (e.g. a reset
/// superseded by a newer one).
#[derive(Debug, Error)]
pub enum Error {
    /// The host never supplied a UI-thread executor. This is a programming error.
    #[error("no UI-thread executor configured; supply one before using the engine")]
    UiExecutorMissing,

    /// Background work was requested but no tokio runtime handle is available.
    #[error("no tokio runtime available for background work")]
    RuntimeMissing,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The provider returned a different number of items than requested.
    ///
    /// Accepting the short (or long) page would silently shift every index after it, so the
    /// fetch is aborted instead.
    #[error(
        "provider returned {actual} items for a request of {expected} at offset {offset}; \
         the source is inconsistent with the cached count"
    )]
    ProviderContract {
        offset: usize,
        expected: usize,
        actual: usize,
    },

    #[error("index {index} is out of range (count {count})")]
    IndexOutOfRange { index: usize, count: usize },

    /// A mutation was attempted through a source that cannot be edited.
    #[error("the item source is read-only")]
    NotEditable,

    /// A translated slot was missing from a wired page; the cache has been reset.
    #[error("page {page} has no item at offset {offset}")]
    Inconsistent { page: PageNumber, offset: usize },

    #[error("provider failed: {0}")]
    Provider(#[source] BoxError),

    #[error("operation was cancelled")]
    Cancelled,
}

impl Error {
    /// Wraps an arbitrary provider/store failure.
    pub fn provider(err: impl Into<BoxError>) -> Self {
        Self::Provider(err.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
