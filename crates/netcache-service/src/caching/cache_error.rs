use thiserror::Error;

/// An error surfaced to a transaction by the HTTP cache.
///
/// None of these are fatal to the cache itself. Backend failures while opening or creating
/// entries never show up here at all: the affected transaction silently degrades to an uncached
/// network request instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The request may only be served from the cache, but there is no usable entry.
    #[error("cache miss")]
    CacheMiss,
    /// The cached response could not be read back.
    #[error("cache read failure")]
    ReadFailure,
    /// An entry for this key is already active.
    ///
    /// This is a logic error: callers have to look for an active entry before activating a new
    /// one.
    #[error("an entry for `{0}` is already active")]
    EntryAlreadyActive(String),
    /// The cache entry was doomed, and does not take any more transactions.
    #[error("cache entry is doomed")]
    EntryDoomed,
    /// The transaction is not attached to a cache entry.
    #[error("transaction is not attached to a cache entry")]
    NotAttached,
    /// The transaction is already attached to or waiting for a cache entry.
    #[error("transaction is already attached to a cache entry")]
    AlreadyAttached,
    /// The transaction tried to modify an entry it is not the writer of.
    #[error("transaction is not the writer of its cache entry")]
    NotWriter,
    /// The transaction tried to finish reading an entry it is not a reader of.
    #[error("transaction is not a reader of its cache entry")]
    NotReader,
    /// The transaction is not known to the cache.
    #[error("unknown transaction")]
    UnknownTransaction,
    /// The cache service is no longer running.
    #[error("cache service shut down")]
    ServiceClosed,
    /// An unexpected error in netcache itself, like a failing filesystem access.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

/// The result of a cache operation, containing either `Ok(T)` or the [`CacheError`] that
/// prevented it.
pub type CacheContents<T = ()> = Result<T, CacheError>;
