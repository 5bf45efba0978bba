//! Stable content keys for cached resources.
//!
//! A cache key is the lowercase hex MD5 of the request URL's UTF-8 bytes. It only needs to
//! be practically unique within one user's cache, not cryptographically collision resistant;
//! the fixed 32-character width makes it usable as a filename component on every target
//! filesystem. Both the file manager and the metadata store derive on-disk names from this
//! leaf module, so neither has to depend on the other.

use md5::{Digest, Md5};

/// Compute the cache key for a request URL.
///
/// Deterministic: the same URL always produces the same 32-character lowercase hex string.
pub fn hash_url(url: &str) -> String {
    format!("{:x}", Md5::digest(url.as_bytes()))
}
