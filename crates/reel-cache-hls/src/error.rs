//! Crate error type.

use reel_cache::CacheError;

/// Result type used by this crate.
pub type HlsResult<T> = Result<T, HlsError>;

/// Unified error type for the `reel-cache-hls` crate.
#[derive(Debug, thiserror::Error)]
pub enum HlsError {
    /// Malformed playlist. Fatal for the URL it came from.
    #[error("invalid playlist: {0}")]
    Format(String),

    /// Error bubbled up from the cache core (network, HTTP status, I/O, cancellation).
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl HlsError {
    /// Convenience helper for playlist format errors.
    pub fn format(msg: impl Into<String>) -> Self {
        HlsError::Format(msg.into())
    }
}

impl From<std::io::Error> for HlsError {
    fn from(e: std::io::Error) -> Self {
        HlsError::Cache(CacheError::Io(e))
    }
}
