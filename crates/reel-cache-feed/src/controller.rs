//! Scroll-driven prefetch scheduling.
//!
//! The controller is the feed-facing surface of the cache. It routes URLs to the MP4
//! downloader or the HLS manager, reserves bounded download slots, queues overflow by
//! priority, cancels work that scrolled out of the keep window, and reports unified
//! progress. Background prefetch errors are contained here; a user-initiated request falls
//! back to the remote URL so playback can still stream directly.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use reel_cache::{
    hash_url, CacheError, CacheFileManager, CacheMetadataStore, CacheResult, CacheSettings,
    Evictor, ProgressiveDownloader,
};
use reel_cache_hls::HlsCacheManager;

use crate::network::NetworkQualityMonitor;

/// Default configured concurrency; the effective cap also honors the network class.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

struct QueuedRequest {
    url: String,
    headers: Option<HeaderMap>,
}

#[derive(Default)]
struct ControllerState {
    /// URLs with a reserved MP4 download slot.
    inflight: HashSet<String>,
    /// URLs present in either queue.
    queued: HashSet<String>,
    high: VecDeque<QueuedRequest>,
    low: VecDeque<QueuedRequest>,
    disposed: bool,
}

/// Coordinates downloads against a scroll position.
pub struct ReelPrefetchController {
    files: Arc<CacheFileManager>,
    metadata: Arc<CacheMetadataStore>,
    downloader: Arc<ProgressiveDownloader>,
    hls: Arc<HlsCacheManager>,
    monitor: Arc<NetworkQualityMonitor>,
    evictor: Arc<Evictor>,
    max_concurrent: usize,
    playable_threshold: u64,
    threshold_wait_timeout: Duration,
    state: Mutex<ControllerState>,
}

/// Case-insensitive HLS detection: `.m3u8` suffix, or `.m3u8?` anywhere (query strings).
pub fn is_hls_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.ends_with(".m3u8") || lower.contains(".m3u8?")
}

impl ReelPrefetchController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        files: Arc<CacheFileManager>,
        metadata: Arc<CacheMetadataStore>,
        downloader: Arc<ProgressiveDownloader>,
        hls: Arc<HlsCacheManager>,
        monitor: Arc<NetworkQualityMonitor>,
        evictor: Arc<Evictor>,
        settings: &CacheSettings,
        max_concurrent: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            files,
            metadata,
            downloader,
            hls,
            monitor,
            evictor,
            max_concurrent: max_concurrent.max(1),
            playable_threshold: settings.playable_threshold_bytes,
            threshold_wait_timeout: settings.threshold_wait_timeout,
            state: Mutex::new(ControllerState::default()),
        })
    }

    /// Resolve `url` to something the player can open now: a local path when the cache can
    /// serve it, or the original remote URL as a graceful fallback.
    pub async fn get_playable_path(
        self: &Arc<Self>,
        url: &str,
        headers: Option<HeaderMap>,
    ) -> String {
        if is_hls_url(url) {
            return match self.hls.get_playable_path(url, None, None, headers).await {
                Ok(playback) => playback.playlist_path.to_string_lossy().into_owned(),
                Err(e) => {
                    warn!(url, "HLS caching unavailable, falling back to remote: {e}");
                    url.to_string()
                }
            };
        }

        let path = match self.files.ensure_file(url).await {
            Ok(path) => path,
            Err(e) => {
                warn!(url, "cache file unavailable, falling back to remote: {e}");
                return url.to_string();
            }
        };
        let path_str = path.to_string_lossy().into_owned();

        if self.metadata.is_complete(url) {
            self.files.update_access_time(url).await;
            return path_str;
        }

        let size = self.files.file_size(url).await;
        if size >= self.playable_threshold {
            // Enough to start playback; resume in the background if a slot is free.
            if self.try_reserve_slot(url) {
                let _ = self.spawn_driver(url.to_string(), path, size, headers).await;
            } else {
                self.enqueue(url, headers, true);
            }
            return path_str;
        }

        if self.try_reserve_slot(url) {
            let ready = self.spawn_driver(url.to_string(), path, size, headers).await;
            match tokio::time::timeout(self.threshold_wait_timeout, ready).await {
                Ok(Ok(Ok(()))) => path_str,
                Ok(Ok(Err(e))) => {
                    debug!(url, "download failed before playable threshold: {e}");
                    url.to_string()
                }
                // Driver vanished or the threshold never arrived: the path is still valid,
                // the host player may fall back to the network on its own.
                Ok(Err(_)) | Err(_) => path_str,
            }
        } else if self.is_active(url) {
            // Someone else is already filling the file; poll it up to the timeout.
            self.wait_until_playable(url).await;
            path_str
        } else {
            self.enqueue(url, headers, true);
            path_str
        }
    }

    /// Feed scroll callback: cancel out-of-window work, then prefetch around the index.
    ///
    /// Priority order: ahead `1..=ahead`, then behind `1..=behind`. Errors never surface
    /// out of this call.
    pub async fn on_scroll_update(
        self: &Arc<Self>,
        urls: &[String],
        current_index: usize,
        prefetch_count: Option<usize>,
        prefetch_behind: Option<usize>,
        keep_range: Option<usize>,
        headers: Option<HeaderMap>,
    ) {
        let cfg = self.monitor.prefetch_config();
        let ahead = prefetch_count.unwrap_or(cfg.ahead);
        let behind = prefetch_behind.unwrap_or(cfg.behind);
        let keep = keep_range.unwrap_or(cfg.keep);

        // Cancel anything in flight that is no longer inside ±keep of the current index.
        let mut active: Vec<String> = {
            let st = self.lock_state();
            st.inflight.iter().cloned().collect()
        };
        active.extend(self.hls.inflight_urls());
        for url in active {
            let in_window = urls
                .iter()
                .position(|u| *u == url)
                .is_some_and(|idx| current_index.abs_diff(idx) <= keep);
            if !in_window {
                trace!(url = %url, "cancelling download outside keep window");
                self.cancel_download(&url).await;
            }
        }

        for offset in 1..=ahead {
            let Some(url) = urls.get(current_index + offset) else {
                break;
            };
            self.prefetch(url, headers.clone()).await;
        }
        for offset in 1..=behind {
            let Some(idx) = current_index.checked_sub(offset) else {
                break;
            };
            if let Some(url) = urls.get(idx) {
                self.prefetch(url, headers.clone()).await;
            }
        }
    }

    /// Cancel MP4 and HLS download state for `url` symmetrically.
    pub async fn cancel_download(self: &Arc<Self>, url: &str) {
        self.downloader.cancel(url).await;
        self.hls.cancel(url).await;

        let was_tracked = {
            let mut st = self.lock_state();
            st.queued.remove(url);
            st.high.retain(|req| req.url != url);
            st.low.retain(|req| req.url != url);
            st.inflight.remove(url)
        };
        if was_tracked {
            self.pump_queue().await;
        }
    }

    /// Cancel every download and drop both queues.
    pub async fn cancel_all(self: &Arc<Self>) {
        self.downloader.cancel_all().await;
        self.hls.cancel_all().await;
        let mut st = self.lock_state();
        st.inflight.clear();
        st.queued.clear();
        st.high.clear();
        st.low.clear();
    }

    /// Tear the controller down: no new work is accepted afterwards.
    pub async fn dispose(self: &Arc<Self>) {
        {
            self.lock_state().disposed = true;
        }
        self.cancel_all().await;
    }

    /// True when the URL is fully cached.
    pub fn is_cached(&self, url: &str) -> bool {
        self.metadata.is_complete(url)
    }

    /// Unified `0..=1` progress across MP4 (bytes) and HLS (segments) records.
    pub fn get_progress(&self, url: &str) -> Option<f64> {
        self.metadata.get(url).and_then(|record| record.fraction())
    }

    /// Force the network class used for prefetch sizing.
    pub fn set_network_type(&self, network: crate::network::NetworkType) {
        self.monitor.set_network_type(network);
    }

    // ----------------------------
    // Internals: slots and queues
    // ----------------------------

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn effective_max_concurrent(&self) -> usize {
        self.max_concurrent
            .min(self.monitor.prefetch_config().max_concurrent)
    }

    /// Reserve a download slot for `url`. Fails when the URL is already in flight, the cap
    /// is reached, or the controller is disposed.
    pub(crate) fn try_reserve_slot(&self, url: &str) -> bool {
        let cap = self.effective_max_concurrent();
        let mut st = self.lock_state();
        if st.disposed || st.inflight.contains(url) || st.inflight.len() >= cap {
            return false;
        }
        st.inflight.insert(url.to_string());
        true
    }

    /// Queue a request unless the URL is already in flight or queued.
    pub(crate) fn enqueue(&self, url: &str, headers: Option<HeaderMap>, high_priority: bool) {
        let mut st = self.lock_state();
        if st.disposed || st.inflight.contains(url) || st.queued.contains(url) {
            return;
        }
        st.queued.insert(url.to_string());
        let queue = if high_priority {
            &mut st.high
        } else {
            &mut st.low
        };
        queue.push_back(QueuedRequest {
            url: url.to_string(),
            headers,
        });
    }

    fn is_active(&self, url: &str) -> bool {
        self.lock_state().inflight.contains(url) || self.downloader.is_inflight(url)
    }

    /// Start queued requests (high before low) while slots are free.
    async fn pump_queue(self: &Arc<Self>) {
        loop {
            let next = {
                let cap = self.effective_max_concurrent();
                let mut st = self.lock_state();
                if st.disposed || st.inflight.len() >= cap {
                    None
                } else {
                    let req = match st.high.pop_front() {
                        Some(req) => Some(req),
                        None => st.low.pop_front(),
                    };
                    if let Some(req) = &req {
                        st.queued.remove(&req.url);
                        st.inflight.insert(req.url.clone());
                    }
                    req
                }
            };
            let Some(req) = next else { break };

            match self.files.ensure_file(&req.url).await {
                Ok(path) => {
                    let size = self.files.file_size(&req.url).await;
                    // Boxed to break the async cycle driver → finish → pump → driver.
                    let _ = self.spawn_driver(req.url, path, size, req.headers).await;
                }
                Err(e) => {
                    debug!(url = %req.url, "cannot start queued download: {e}");
                    self.lock_state().inflight.remove(&req.url);
                }
            }
        }
    }

    /// Background prefetch entry point: never awaits thresholds, never raises.
    async fn prefetch(self: &Arc<Self>, url: &str, headers: Option<HeaderMap>) {
        if is_hls_url(url) {
            if let Err(e) = self.hls.get_playable_path(url, None, None, headers).await {
                debug!(url, "HLS prefetch failed: {e}");
            }
            return;
        }

        if self.metadata.is_complete(url) {
            return;
        }
        let path = match self.files.ensure_file(url).await {
            Ok(path) => path,
            Err(e) => {
                debug!(url, "prefetch skipped, cache file unavailable: {e}");
                return;
            }
        };

        if self.try_reserve_slot(url) {
            let size = self.files.file_size(url).await;
            let _ = self.spawn_driver(url.to_string(), path, size, headers).await;
        } else {
            self.enqueue(url, headers, false);
        }
    }

    // ----------------------------
    // Internals: download driver
    // ----------------------------

    /// Start one MP4 download and spawn the task that owns it: it feeds the metadata store,
    /// resolves the returned receiver at the playable threshold, samples bandwidth on
    /// completion, and releases the slot when the stream ends for any reason. The download
    /// is registered with the downloader before this returns.
    fn spawn_driver(
        self: &Arc<Self>,
        url: String,
        path: PathBuf,
        start_byte: u64,
        headers: Option<HeaderMap>,
    ) -> Pin<Box<dyn Future<Output = oneshot::Receiver<CacheResult<()>>> + Send + '_>> {
        Box::pin(async move {
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut stream = self
            .downloader
            .download(&url, &path, start_byte, headers)
            .await;
        let ctrl = Arc::clone(self);
        let threshold = self.playable_threshold;

        tokio::spawn(async move {
            let started = Instant::now();
            let mut ready_tx = Some(ready_tx);

            while let Some(event) = stream.next_event().await {
                match event {
                    Ok(progress) => {
                        ctrl.metadata
                            .update_progress(
                                &url,
                                progress.downloaded_bytes,
                                progress.total_bytes,
                                false,
                            )
                            .await;

                        if progress.downloaded_bytes >= threshold || progress.is_complete {
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(Ok(()));
                            }
                        }
                        if progress.is_complete {
                            let fresh = progress.downloaded_bytes.saturating_sub(start_byte);
                            ctrl.monitor.record_sample(fresh, started.elapsed());
                            trace!(url = %url, bytes = progress.downloaded_bytes, "download complete");
                        }
                    }
                    Err(e) => {
                        debug!(url = %url, "download ended with error: {e}");
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Err(e));
                        }
                        break;
                    }
                }
            }

            // Cancelled before the threshold: the receiver sees a plain drop-out.
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(Err(CacheError::Cancelled));
            }

            ctrl.finish_download(&url).await;
        });

        ready_rx
        })
    }

    async fn finish_download(self: &Arc<Self>, url: &str) {
        {
            self.lock_state().inflight.remove(url);
        }
        self.pump_queue().await;
        self.run_throttled_eviction().await;
    }

    /// Eviction with every in-flight URL protected.
    async fn run_throttled_eviction(&self) {
        let mut protected: HashSet<String> = {
            let st = self.lock_state();
            st.inflight.iter().map(|url| hash_url(url)).collect()
        };
        for url in self.hls.inflight_urls() {
            protected.insert(hash_url(&url));
        }
        self.evictor.evict_if_needed_throttled(&protected).await;
    }

    /// Poll an existing download for the playable threshold, up to the wait timeout.
    async fn wait_until_playable(&self, url: &str) {
        let deadline = Instant::now() + self.threshold_wait_timeout;
        loop {
            if self.files.file_size(url).await >= self.playable_threshold
                || self.metadata.is_complete(url)
                || !self.is_active(url)
            {
                return;
            }
            if Instant::now() >= deadline {
                trace!(url = %url, "threshold wait timed out, returning path anyway");
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

#[cfg(test)]
impl ReelPrefetchController {
    pub(crate) fn queue_depths(&self) -> (usize, usize) {
        let st = self.lock_state();
        (st.high.len(), st.low.len())
    }

    pub(crate) fn inflight_count(&self) -> usize {
        self.lock_state().inflight.len()
    }
}
