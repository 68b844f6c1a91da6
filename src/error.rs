use std::time::Duration;

use thiserror::Error;

/// An error that happens when loading a resource.
///
/// The cache itself does not distinguish between error kinds. Every variant is
/// cached the same way for the life of its entry. The variants exist so that
/// *loaders* can encode what went wrong for whoever eventually surfaces the
/// failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The resource does not exist upstream.
    #[error("not found")]
    NotFound,
    /// The load did not complete in time.
    #[error("load timed out after {0:?}")]
    Timeout(Duration),
    /// The load failed for another upstream reason, like connection loss or
    /// a 5xx server response.
    ///
    /// The attached string contains the upstream response.
    #[error("load failed: {0}")]
    Fetch(String),
    /// The resource was fetched successfully, but is unusable in some way.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected error in the cache machinery itself.
    ///
    /// This is not intended to be produced by loaders. The cache uses it when
    /// a load task was torn down before it could settle its entry.
    #[error("internal error")]
    Internal,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    /// Logs the given error and turns it into [`CacheError::Internal`].
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::Internal
    }
}

/// The settled outcome of a cached load, containing either `Ok(T)` or the
/// error denoting why the resource could not be loaded.
pub type CacheEntry<T> = Result<T, CacheError>;
