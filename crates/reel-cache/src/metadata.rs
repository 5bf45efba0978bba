//! Persistent key→progress index.
//!
//! The store keeps one [`ProgressRecord`] per URL and persists the whole map as a single
//! JSON document at `<cache_root>/metadata.json`. It is a *hint*, not a source of truth: a
//! crash mid-write may leave the file corrupted, and [`CacheMetadataStore::reconcile_with`]
//! recovers ground truth from the filesystem on the next start.
//!
//! Persistence is throttled: a progress update is only written to disk when it completes the
//! record or when at least `persist_interval` has passed since the last persisted write for
//! that URL. Writes are serialized through a dedicated persist lock so there is never more
//! than one writer on the file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::hash::hash_url;

/// Download progress for a single URL.
///
/// For HLS entries (`is_hls = true`) the byte fields count *segments*: `downloaded_bytes` is
/// the number of cached segments and `total_bytes` the total segment count. Unified `0..1`
/// progress is available via [`ProgressRecord::fraction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub is_complete: bool,
    pub last_updated: DateTime<Utc>,
    pub is_hls: bool,
}

impl ProgressRecord {
    /// Fractional progress in `0..=1`, when the total is known.
    ///
    /// Works for both units: bytes for MP4 records, segments for HLS records.
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some((self.downloaded_bytes as f64 / total as f64).min(1.0))
            }
            _ => {
                if self.is_complete {
                    Some(1.0)
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Default)]
struct StoreState {
    records: HashMap<String, ProgressRecord>,
    // Last *persisted* write per URL, for the throttle.
    last_persist: HashMap<String, Instant>,
}

/// Durable key→progress index with throttled persistence.
pub struct CacheMetadataStore {
    path: PathBuf,
    persist_interval: Duration,
    state: Mutex<StoreState>,
    // Serializes file writes; snapshots are taken under `state`, written under this lock.
    write_lock: tokio::sync::Mutex<()>,
}

impl CacheMetadataStore {
    /// Load the store from `path`, treating a missing or unparsable file as empty state.
    pub async fn load(path: impl Into<PathBuf>, persist_interval: Duration) -> Self {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, ProgressRecord>>(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    debug!(path = %path.display(), "discarding unparsable metadata: {e}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path,
            persist_interval,
            state: Mutex::new(StoreState {
                records,
                last_persist: HashMap::new(),
            }),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Reconcile the index with the filesystem.
    ///
    /// `disk_size` maps a URL to the current on-disk size of its MP4 file, or `None` when the
    /// file is missing. Supplied as a closure by the composition root so the store does not
    /// depend on the file manager's layout. For every non-HLS record: a missing file drops
    /// the record, and a size mismatch rewrites `downloaded_bytes` to the disk size and
    /// recomputes `is_complete` from `total_bytes` when known.
    pub fn reconcile_with<F>(&self, disk_size: F)
    where
        F: Fn(&str) -> Option<u64>,
    {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let mut dropped = 0usize;
        let mut rewritten = 0usize;

        st.records.retain(|url, record| {
            if record.is_hls {
                return true;
            }
            match disk_size(url) {
                None => {
                    dropped += 1;
                    false
                }
                Some(len) => {
                    if len != record.downloaded_bytes {
                        record.downloaded_bytes = len;
                        record.is_complete = record
                            .total_bytes
                            .is_some_and(|total| total == len);
                        rewritten += 1;
                    }
                    true
                }
            }
        });

        if dropped > 0 || rewritten > 0 {
            debug!(dropped, rewritten, "metadata reconciled against disk");
        }
    }

    /// Record progress for a URL, persisting according to the throttle.
    ///
    /// Persists immediately when the write marks the record complete, otherwise only if the
    /// persist interval has elapsed since the last persisted write for this URL.
    pub async fn update_progress(
        &self,
        url: &str,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        is_hls: bool,
    ) {
        let is_complete = total_bytes.is_some_and(|total| total > 0 && downloaded_bytes >= total);
        let should_persist = {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            st.records.insert(
                url.to_string(),
                ProgressRecord {
                    downloaded_bytes,
                    total_bytes,
                    is_complete,
                    last_updated: Utc::now(),
                    is_hls,
                },
            );

            let due = st
                .last_persist
                .get(url)
                .is_none_or(|at| at.elapsed() >= self.persist_interval);
            if is_complete || due {
                st.last_persist.insert(url.to_string(), Instant::now());
                true
            } else {
                false
            }
        };

        if should_persist {
            self.persist().await;
        }
    }

    /// Mark a URL complete and persist immediately.
    pub async fn mark_complete(&self, url: &str, total_bytes: u64) {
        {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let is_hls = st.records.get(url).map(|r| r.is_hls).unwrap_or(false);
            st.records.insert(
                url.to_string(),
                ProgressRecord {
                    downloaded_bytes: total_bytes,
                    total_bytes: Some(total_bytes),
                    is_complete: true,
                    last_updated: Utc::now(),
                    is_hls,
                },
            );
            st.last_persist.insert(url.to_string(), Instant::now());
        }
        self.persist().await;
    }

    /// Return the record for a URL, if any.
    pub fn get(&self, url: &str) -> Option<ProgressRecord> {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.records.get(url).cloned()
    }

    /// Returns true if the URL's record is marked complete.
    pub fn is_complete(&self, url: &str) -> bool {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.records.get(url).map(|r| r.is_complete).unwrap_or(false)
    }

    /// Downloaded bytes (or cached segments, for HLS) recorded for a URL.
    pub fn downloaded_bytes(&self, url: &str) -> u64 {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.records
            .get(url)
            .map(|r| r.downloaded_bytes)
            .unwrap_or(0)
    }

    /// Remove a URL's record and persist.
    pub async fn remove(&self, url: &str) {
        let removed = {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            st.last_persist.remove(url);
            st.records.remove(url).is_some()
        };
        if removed {
            self.persist().await;
        }
    }

    /// Remove every record whose URL hashes to `hash` and persist.
    ///
    /// Used by eviction, which only knows on-disk names.
    pub async fn remove_by_hash(&self, hash: &str) {
        let removed = {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let before = st.records.len();
            st.records.retain(|url, _| hash_url(url) != hash);
            let removed = before != st.records.len();
            if removed {
                st.last_persist.retain(|url, _| hash_url(url) != hash);
            }
            removed
        };
        if removed {
            self.persist().await;
        }
    }

    /// Drop all records and persist the empty index.
    pub async fn clear_all(&self) {
        {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            st.records.clear();
            st.last_persist.clear();
        }
        self.persist().await;
    }

    /// Write the full index to disk. Best-effort: I/O failures are logged, not propagated.
    async fn persist(&self) {
        let snapshot = {
            let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            match serde_json::to_vec_pretty(&st.records) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!("metadata serialization failed: {e}");
                    return;
                }
            }
        };

        let _guard = self.write_lock.lock().await;
        match tokio::fs::write(&self.path, snapshot).await {
            Ok(()) => trace!(path = %self.path.display(), "metadata persisted"),
            Err(e) => debug!(path = %self.path.display(), "metadata write failed: {e}"),
        }
    }
}
