//! Size-targeted LRU eviction over mixed cache entries.
//!
//! Entries are the file manager's enumeration: MP4 files and per-URL HLS directories,
//! ordered by last access. When the total footprint exceeds the ceiling, the oldest entries
//! are deleted until the footprint drops to 80% of it. Deletion failures are ignored; the
//! next pass retries. Entries whose hash is in the caller's protected set (URLs with an
//! in-flight download) are never deleted.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::files::{CacheFileManager, EntryKind};
use crate::metadata::CacheMetadataStore;
use crate::settings::CacheSettings;

#[derive(Default)]
struct EvictState {
    running: bool,
    last_pass: Option<Instant>,
}

/// LRU evictor for the cache directory.
pub struct Evictor {
    files: Arc<CacheFileManager>,
    metadata: Arc<CacheMetadataStore>,
    max_bytes: u64,
    min_interval: Duration,
    state: Mutex<EvictState>,
}

impl Evictor {
    pub fn new(
        files: Arc<CacheFileManager>,
        metadata: Arc<CacheMetadataStore>,
        settings: &CacheSettings,
    ) -> Self {
        Self {
            files,
            metadata,
            max_bytes: settings.max_cache_bytes,
            min_interval: settings.evict_interval,
            state: Mutex::new(EvictState::default()),
        }
    }

    /// Throttled entry point: no-ops while a pass is running or within the minimum interval
    /// of the previous one. This is the variant background callers should use.
    pub async fn evict_if_needed_throttled(&self, protected: &HashSet<String>) {
        {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if st.running {
                trace!("eviction already in flight, skipping");
                return;
            }
            if st
                .last_pass
                .is_some_and(|at| at.elapsed() < self.min_interval)
            {
                trace!("eviction ran recently, skipping");
                return;
            }
            st.running = true;
        }

        self.run_pass(protected).await;

        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.running = false;
        st.last_pass = Some(Instant::now());
    }

    /// Unthrottled algorithmic core: enumerate, and if the footprint exceeds the ceiling,
    /// delete oldest-first down to 80% of it.
    pub async fn evict_if_needed(&self, protected: &HashSet<String>) {
        self.run_pass(protected).await;
    }

    async fn run_pass(&self, protected: &HashSet<String>) {
        let mut entries = self.files.enumerate_entries().await;
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        if total <= self.max_bytes {
            return;
        }

        let target = self.max_bytes / 5 * 4;
        entries.sort_by(|a, b| {
            a.last_access
                .cmp(&b.last_access)
                .then_with(|| a.hash.cmp(&b.hash))
        });

        debug!(
            total,
            target,
            entries = entries.len(),
            "cache over limit, evicting oldest entries"
        );

        for entry in entries {
            if total < target {
                break;
            }
            if protected.contains(&entry.hash) {
                trace!(hash = %entry.hash, "skipping entry with in-flight download");
                continue;
            }

            let removed = match entry.kind {
                EntryKind::File => std::fs::remove_file(&entry.path).is_ok(),
                EntryKind::Directory => std::fs::remove_dir_all(&entry.path).is_ok(),
            };
            if !removed {
                debug!(path = %entry.path.display(), "eviction delete failed, will retry next pass");
                continue;
            }

            self.metadata.remove_by_hash(&entry.hash).await;
            total = total.saturating_sub(entry.size);
            trace!(hash = %entry.hash, size = entry.size, "evicted cache entry");
        }
    }
}
