//! Crate error type.
//!
//! This module defines [`CacheError`] and the [`CacheResult`] alias used across the crate.
//!
//! Implementation note: cancellation is modeled as an error variant so download tasks can
//! unwind through `?`, but it is never surfaced to callers of the public API; they observe
//! an absence of further progress events instead.

use std::io;

/// Result type used by this crate.
pub type CacheResult<T> = Result<T, CacheError>;

/// Unified error type for the `reel-cache` crate.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A generic error with a message.
    #[error("{0}")]
    Message(String),

    /// DNS, connect, TLS, or socket read failure.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-{200, 206} HTTP status.
    #[error("HTTP error: {status} for {url}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// URL that failed.
        url: String,
    },

    /// Cache directory, file, or metadata I/O.
    ///
    /// Uses the concrete `std::io::Error` to preserve error kinds and sources.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No data arrived within the read idle window.
    #[error("request timeout for {0}")]
    Timeout(String),

    /// Operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl CacheError {
    /// Convenience helper to construct a simple message error.
    pub fn msg(msg: impl Into<String>) -> Self {
        CacheError::Message(msg.into())
    }

    /// Convenience helper for HTTP status errors.
    pub fn http(status: u16, url: impl Into<String>) -> Self {
        CacheError::Http {
            status,
            url: url.into(),
        }
    }

    /// Convenience helper for timeout errors.
    pub fn timeout(target: impl Into<String>) -> Self {
        CacheError::Timeout(target.into())
    }

    /// Returns true if this error is the cancellation marker.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CacheError::Cancelled)
    }
}
