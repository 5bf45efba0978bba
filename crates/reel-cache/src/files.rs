//! On-disk cache layout.
//!
//! Maps content keys to paths under a single cache root, and owns every create/delete on it:
//!
//! - `<cache_root>/<key>.mp4`: MP4 entries (growing, append-only while downloading)
//! - `<cache_root>/hls/<key>/`: HLS entries (local playlist + cached segments)
//! - `<cache_root>/metadata.json`: the progress index
//!
//! Per-entry probes (sizes, access times, enumeration) are best-effort: I/O errors are
//! logged and skipped, never propagated out of enumeration. Creation paths propagate.

use std::fs::FileTimes;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, trace};

use crate::error::CacheResult;
use crate::hash::hash_url;
use crate::metadata::CacheMetadataStore;

/// File name of the progress index inside the cache root.
pub const METADATA_FILE: &str = "metadata.json";

/// Subdirectory of the cache root holding per-URL HLS directories.
pub const HLS_SUBDIR: &str = "hls";

/// What kind of on-disk object a cache entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A single MP4 file directly under the cache root.
    File,
    /// A per-URL HLS directory under `hls/`.
    Directory,
}

/// One enumerated cache entry, as seen by the evictor.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub kind: EntryKind,
    /// Content key: the MP4 filename stem or the HLS directory name.
    pub hash: String,
    /// File length, or recursive directory size.
    pub size: u64,
    /// File atime, or the most recent file atime within the directory.
    /// Epoch 0 when unreadable.
    pub last_access: SystemTime,
    pub path: PathBuf,
}

/// Maps content keys to on-disk paths; enumerates, deletes, and touches entries.
pub struct CacheFileManager {
    root: PathBuf,
    metadata: Arc<CacheMetadataStore>,
}

impl CacheFileManager {
    /// Create a manager rooted at `root`, creating the directory tree if needed.
    pub fn new(root: impl Into<PathBuf>, metadata: Arc<CacheMetadataStore>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(HLS_SUBDIR))?;
        Ok(Self { root, metadata })
    }

    /// Create a manager rooted at the conventional `<os_tmp>/video_cache` location.
    pub fn in_os_temp(metadata: Arc<CacheMetadataStore>) -> io::Result<Self> {
        Self::new(std::env::temp_dir().join("video_cache"), metadata)
    }

    /// The cache root directory.
    pub fn cache_dir(&self) -> &Path {
        &self.root
    }

    /// Path of the progress index for a cache rooted at `root`.
    ///
    /// Exposed so the composition root can construct the metadata store before the manager.
    pub fn metadata_path(root: &Path) -> PathBuf {
        root.join(METADATA_FILE)
    }

    /// Path of the MP4 cache file for `url`. Pure.
    pub fn file_path(&self, url: &str) -> PathBuf {
        self.root.join(format!("{}.mp4", hash_url(url)))
    }

    /// Path of the per-URL HLS directory for `url`. Pure.
    pub fn hls_dir(&self, url: &str) -> PathBuf {
        self.root.join(HLS_SUBDIR).join(hash_url(url))
    }

    /// Whether the MP4 cache file for `url` exists.
    pub async fn exists(&self, url: &str) -> bool {
        tokio::fs::try_exists(self.file_path(url))
            .await
            .unwrap_or(false)
    }

    /// Size of the MP4 cache file for `url`, or 0 when absent.
    pub async fn file_size(&self, url: &str) -> u64 {
        match tokio::fs::metadata(self.file_path(url)).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        }
    }

    /// Ensure the MP4 cache file for `url` exists, creating a zero-byte file if absent.
    ///
    /// Idempotent: an existing file is never truncated.
    pub async fn ensure_file(&self, url: &str) -> CacheResult<PathBuf> {
        let path = self.file_path(url);
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(path)
    }

    /// Delete the MP4 cache file for `url` and drop its metadata record.
    pub async fn delete(&self, url: &str) -> CacheResult<()> {
        match tokio::fs::remove_file(self.file_path(url)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.metadata.remove(url).await;
        Ok(())
    }

    /// Wipe the whole cache directory and the metadata store.
    pub async fn clear_all(&self) -> CacheResult<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(self.root.join(HLS_SUBDIR)).await?;
        self.metadata.clear_all().await;
        Ok(())
    }

    /// Recursive sum of regular-file lengths under the cache root.
    pub async fn total_size(&self) -> u64 {
        dir_size(&self.root)
    }

    /// Bump the access time on the MP4 file for `url`. Errors are swallowed.
    pub async fn update_access_time(&self, url: &str) {
        let path = self.file_path(url);
        let touch = || -> io::Result<()> {
            let file = std::fs::OpenOptions::new().append(true).open(&path)?;
            file.set_times(FileTimes::new().set_accessed(SystemTime::now()))
        };
        if let Err(e) = touch() {
            trace!(path = %path.display(), "access-time update skipped: {e}");
        }
    }

    /// Enumerate cache entries: one per MP4 file directly under the root, one per direct
    /// child directory of `hls/`.
    ///
    /// Per-entry I/O errors are logged and skipped.
    pub async fn enumerate_entries(&self) -> Vec<CacheEntry> {
        let mut entries = Vec::new();

        let dir = match std::fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(e) => {
                debug!(root = %self.root.display(), "cache enumeration failed: {e}");
                return entries;
            }
        };

        for item in dir {
            let Ok(item) = item else { continue };
            let path = item.path();
            if path.extension().and_then(|s| s.to_str()) != Some("mp4") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match std::fs::metadata(&path) {
                Ok(meta) => entries.push(CacheEntry {
                    kind: EntryKind::File,
                    hash: stem.to_string(),
                    size: meta.len(),
                    last_access: accessed_or_epoch(&meta),
                    path,
                }),
                Err(e) => debug!(path = %path.display(), "skipping unreadable entry: {e}"),
            }
        }

        let hls_root = self.root.join(HLS_SUBDIR);
        if let Ok(dir) = std::fs::read_dir(&hls_root) {
            for item in dir {
                let Ok(item) = item else { continue };
                let path = item.path();
                if !path.is_dir() {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                    continue;
                };
                entries.push(CacheEntry {
                    kind: EntryKind::Directory,
                    hash: name.to_string(),
                    size: dir_size(&path),
                    last_access: newest_access_within(&path),
                    path,
                });
            }
        }

        entries
    }
}

fn accessed_or_epoch(meta: &std::fs::Metadata) -> SystemTime {
    meta.accessed()
        .or_else(|_| meta.modified())
        .unwrap_or(UNIX_EPOCH)
}

/// Recursive size of all regular files under `path`. Unreadable entries count as zero.
fn dir_size(path: &Path) -> u64 {
    let Ok(dir) = std::fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0u64;
    for item in dir.flatten() {
        let p = item.path();
        match item.metadata() {
            Ok(meta) if meta.is_file() => total += meta.len(),
            Ok(meta) if meta.is_dir() => total += dir_size(&p),
            _ => {}
        }
    }
    total
}

/// Most recent file atime under `path`, or epoch 0 when nothing is readable.
fn newest_access_within(path: &Path) -> SystemTime {
    let Ok(dir) = std::fs::read_dir(path) else {
        return UNIX_EPOCH;
    };
    let mut newest = UNIX_EPOCH;
    for item in dir.flatten() {
        let p = item.path();
        match item.metadata() {
            Ok(meta) if meta.is_file() => {
                let at = accessed_or_epoch(&meta);
                if at > newest {
                    newest = at;
                }
            }
            Ok(meta) if meta.is_dir() => {
                let at = newest_access_within(&p);
                if at > newest {
                    newest = at;
                }
            }
            _ => {}
        }
    }
    newest
}
