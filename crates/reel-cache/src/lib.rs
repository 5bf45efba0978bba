//! Progressive video cache core.
//!
//! This crate is the bottom layer of the cache: it knows how to key, store, grow, index and
//! evict cached media files, and nothing about playlists or feeds.
//!
//! - `hash`: stable 128-bit content keys from request URLs.
//! - `files`: the on-disk layout (MP4 files, per-URL HLS directories, the index file).
//! - `metadata`: the durable key→progress index with crash-tolerant reconciliation.
//! - `downloader`: the pooled ranged HTTP fetcher streaming bytes into growing files.
//! - `evict`: size-targeted LRU eviction over mixed file/directory entries.
//! - `settings`: one flattened configuration struct for all of the above.
//!
//! The HLS layer lives in `reel-cache-hls` and the feed-facing scheduler in
//! `reel-cache-feed`; both build on the types re-exported here.

mod downloader;
mod error;
mod evict;
mod files;
mod hash;
mod metadata;
mod settings;

pub use crate::downloader::{
    DownloadProgress, ProgressStream, ProgressiveDownloader, ThresholdHandle,
};
pub use crate::error::{CacheError, CacheResult};
pub use crate::evict::Evictor;
pub use crate::files::{CacheEntry, CacheFileManager, EntryKind, HLS_SUBDIR, METADATA_FILE};
pub use crate::hash::hash_url;
pub use crate::metadata::{CacheMetadataStore, ProgressRecord};
pub use crate::settings::CacheSettings;
