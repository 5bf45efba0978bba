//! HLS cache manager.
//!
//! Turns a remote HLS URL into a local playlist path a player can open immediately, while a
//! background loop materializes segments through the progressive downloader. One loop per
//! URL (busy flag); live playlists are refreshed on the target-duration cadence with
//! exponential backoff on failure. All loop tasks run under a retained `JoinHandle` and a
//! `CancellationToken` cancelled explicitly by [`HlsCacheManager::cancel`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use reel_cache::{
    CacheError, CacheFileManager, CacheMetadataStore, CacheSettings, ProgressiveDownloader,
};

use crate::error::{HlsError, HlsResult};
use crate::local::{scan_cached, segment_path, write_local_playlist, LOCAL_PLAYLIST};
use crate::parser::{parse_playlist, HlsPlaylist, MediaPlaylist, MediaSegment};

/// Segments fetched eagerly when a URL is first requested.
pub const DEFAULT_PREFETCH_SEGMENTS: usize = 3;

/// Per-iteration budget once the initial prefetch is satisfied.
const REFILL_SEGMENTS: usize = 2;

const MIN_REFRESH: Duration = Duration::from_secs(3);
const MAX_REFRESH: Duration = Duration::from_secs(30);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// What a caller gets back for an HLS URL: a playable local manifest plus cache state.
#[derive(Debug, Clone)]
pub struct HlsPlayback {
    pub playlist_path: PathBuf,
    pub is_fully_cached: bool,
    pub total_segments: usize,
    pub cached_segments: usize,
}

struct EntryState {
    playlist: MediaPlaylist,
    // Cursor into `playlist.segments`; cached segments are skipped on the fly.
    next_index: usize,
    cached_segments: usize,
    // Current live-refresh backoff; `None` while refreshes succeed.
    backoff: Option<Duration>,
    busy: bool,
}

struct HlsEntry {
    /// Original request URL; the metadata key.
    url: String,
    /// Resolved media playlist URL; the live-refresh target.
    media_url: String,
    dir: PathBuf,
    headers: Option<HeaderMap>,
    token: CancellationToken,
    state: Mutex<EntryState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HlsEntry {
    fn lock(&self) -> std::sync::MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Clone)]
struct Shared {
    metadata: Arc<CacheMetadataStore>,
    downloader: Arc<ProgressiveDownloader>,
    client: Client,
    entries: Arc<Mutex<HashMap<String, Arc<HlsEntry>>>>,
}

impl Shared {
    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<HlsEntry>>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    // Drop the in-flight record, unless a newer entry took the slot.
    fn remove_entry(&self, entry: &Arc<HlsEntry>) {
        let mut map = self.lock_entries();
        if map
            .get(&entry.url)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            map.remove(&entry.url);
        }
    }
}

/// Progressive cache for HLS URLs.
pub struct HlsCacheManager {
    files: Arc<CacheFileManager>,
    shared: Shared,
}

impl HlsCacheManager {
    pub fn new(
        files: Arc<CacheFileManager>,
        metadata: Arc<CacheMetadataStore>,
        downloader: Arc<ProgressiveDownloader>,
        settings: &CacheSettings,
    ) -> Result<Self, CacheError> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .pool_idle_timeout(settings.pool_idle_timeout)
            .read_timeout(settings.read_timeout)
            .build()?;
        Ok(Self {
            files,
            shared: Shared {
                metadata,
                downloader,
                client,
                entries: Arc::new(Mutex::new(HashMap::new())),
            },
        })
    }

    /// Resolve `url` to a playable local playlist path, starting segment caching in the
    /// background.
    ///
    /// An already-generated local playlist is returned immediately: its entries mix local
    /// and remote references, so it is always safe to hand to the player.
    pub async fn get_playable_path(
        &self,
        url: &str,
        prefetch_segments: Option<usize>,
        target_bandwidth: Option<u64>,
        headers: Option<HeaderMap>,
    ) -> HlsResult<HlsPlayback> {
        let dir = match std::path::absolute(self.files.hls_dir(url)) {
            Ok(abs) => abs,
            Err(_) => self.files.hls_dir(url),
        };
        let local = dir.join(LOCAL_PLAYLIST);

        if tokio::fs::try_exists(&local).await.unwrap_or(false) {
            let record = self.shared.metadata.get(url);
            let total = record.as_ref().and_then(|r| r.total_bytes).unwrap_or(0) as usize;
            let cached = record.as_ref().map(|r| r.downloaded_bytes).unwrap_or(0) as usize;
            let is_fully_cached = record.map(|r| r.is_complete).unwrap_or(false);
            trace!(url, cached, total, "serving existing local playlist");
            return Ok(HlsPlayback {
                playlist_path: local,
                is_fully_cached,
                total_segments: total,
                cached_segments: cached,
            });
        }

        let (playlist, media_url) = self
            .resolve_media_playlist(url, target_bandwidth, headers.as_ref())
            .await?;
        tokio::fs::create_dir_all(&dir).await?;

        let total = playlist.segments.len();
        let (cached, first_missing) = scan_cached(&dir, total);
        self.shared
            .metadata
            .update_progress(url, cached as u64, Some(total as u64), true)
            .await;

        let is_live = playlist.is_live;
        let entry = {
            let mut map = self.shared.lock_entries();
            map.entry(url.to_string())
                .or_insert_with(|| {
                    Arc::new(HlsEntry {
                        url: url.to_string(),
                        media_url,
                        dir: dir.clone(),
                        headers,
                        token: CancellationToken::new(),
                        state: Mutex::new(EntryState {
                            playlist,
                            next_index: first_missing,
                            cached_segments: cached,
                            backoff: None,
                            busy: false,
                        }),
                        task: Mutex::new(None),
                    })
                })
                .clone()
        };

        {
            let snapshot = entry.lock().playlist.clone();
            write_local_playlist(&dir, &snapshot).await?;
        }

        let budget = prefetch_segments.unwrap_or(DEFAULT_PREFETCH_SEGMENTS).max(1);
        spawn_loop_if_idle(&self.shared, &entry, budget);

        Ok(HlsPlayback {
            playlist_path: local,
            is_fully_cached: total > 0 && cached == total && !is_live,
            total_segments: total,
            cached_segments: cached,
        })
    }

    /// Cancel the background loop for `url` and drop its in-flight state.
    pub async fn cancel(&self, url: &str) {
        let entry = { self.shared.lock_entries().remove(url) };
        if let Some(entry) = entry {
            trace!(url, "cancelling HLS entry");
            entry.token.cancel();
            let task = entry.task.lock().unwrap_or_else(|p| p.into_inner()).take();
            if let Some(task) = task {
                let _ = task.await;
            }
        }
    }

    /// Cancel every in-flight HLS entry.
    pub async fn cancel_all(&self) {
        let urls: Vec<String> = { self.shared.lock_entries().keys().cloned().collect() };
        for url in urls {
            self.cancel(&url).await;
        }
    }

    /// Cancel `url`, delete its cache directory, and drop its metadata record.
    pub async fn clear_cache(&self, url: &str) -> HlsResult<()> {
        self.cancel(url).await;
        match tokio::fs::remove_dir_all(self.files.hls_dir(url)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.shared.metadata.remove(url).await;
        Ok(())
    }

    /// Returns true while a background loop exists for `url`.
    pub fn is_inflight(&self, url: &str) -> bool {
        self.shared.lock_entries().contains_key(url)
    }

    /// URLs with a live background loop. Used by the scheduler for window cancellation and
    /// eviction protection.
    pub fn inflight_urls(&self) -> Vec<String> {
        self.shared.lock_entries().keys().cloned().collect()
    }

    async fn resolve_media_playlist(
        &self,
        url: &str,
        target_bandwidth: Option<u64>,
        headers: Option<&HeaderMap>,
    ) -> HlsResult<(MediaPlaylist, String)> {
        let body = fetch_playlist(&self.shared.client, url, headers).await?;
        match parse_playlist(&body, url)? {
            HlsPlaylist::Media(media) => Ok((media, url.to_string())),
            HlsPlaylist::Master(master) => {
                let variant = match target_bandwidth {
                    Some(bw) => master.closest_to(bw),
                    None => master.best_variant(),
                }
                .ok_or_else(|| HlsError::format("master playlist has no variants"))?;

                let media_url = variant.url.clone();
                debug!(url, variant = %media_url, bandwidth = variant.bandwidth, "selected variant");
                let body = fetch_playlist(&self.shared.client, &media_url, headers).await?;
                match parse_playlist(&body, &media_url)? {
                    HlsPlaylist::Media(media) => Ok((media, media_url)),
                    HlsPlaylist::Master(_) => Err(HlsError::format(
                        "variant URL did not resolve to a media playlist",
                    )),
                }
            }
        }
    }
}

async fn fetch_playlist(
    client: &Client,
    url: &str,
    headers: Option<&HeaderMap>,
) -> HlsResult<String> {
    let mut request = client.get(url);
    if let Some(headers) = headers {
        request = request.headers(headers.clone());
    }
    let response = request.send().await.map_err(CacheError::from)?;
    let status = response.status();
    if !status.is_success() {
        return Err(CacheError::http(status.as_u16(), url).into());
    }
    Ok(response.text().await.map_err(CacheError::from)?)
}

fn spawn_loop_if_idle(shared: &Shared, entry: &Arc<HlsEntry>, initial_budget: usize) {
    {
        let mut st = entry.lock();
        if st.busy {
            return;
        }
        st.busy = true;
    }

    let shared = shared.clone();
    let entry = entry.clone();
    let task_entry = entry.clone();
    let handle = tokio::spawn(async move {
        run_segment_loop(shared, entry.clone(), initial_budget).await;
        entry.lock().busy = false;
    });
    *task_entry.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
}

/// The per-URL downloader loop: fetch uncached segments, regenerate the local playlist, and
/// for live playlists keep refreshing until cancelled.
async fn run_segment_loop(shared: Shared, entry: Arc<HlsEntry>, initial_budget: usize) {
    let mut budget = initial_budget;

    loop {
        let mut refreshed = false;
        for _ in 0..budget {
            if entry.token.is_cancelled() {
                shared.remove_entry(&entry);
                return;
            }

            let Some(segment) = next_uncached(&entry) else {
                let (is_live, total) = {
                    let st = entry.lock();
                    (st.playlist.is_live, st.playlist.segments.len())
                };

                if !is_live {
                    shared.metadata.mark_complete(&entry.url, total as u64).await;
                    shared.remove_entry(&entry);
                    trace!(url = %entry.url, total, "HLS entry fully processed");
                    return;
                }

                if !refresh_live(&shared, &entry).await {
                    shared.remove_entry(&entry);
                    return;
                }
                refreshed = true;
                break;
            };

            download_segment(&shared, &entry, &segment).await;
        }

        if !refreshed {
            budget = REFILL_SEGMENTS;
        }
    }
}

/// Next segment without a usable file on disk, advancing the cursor past cached ones.
fn next_uncached(entry: &Arc<HlsEntry>) -> Option<MediaSegment> {
    let mut st = entry.lock();
    while st.next_index < st.playlist.segments.len() {
        let segment = st.playlist.segments[st.next_index].clone();
        st.next_index += 1;
        if !crate::local::segment_is_cached(&segment_path(&entry.dir, segment.index)) {
            return Some(segment);
        }
    }
    None
}

/// Fetch one segment to completion. Failures are swallowed; the loop advances regardless.
async fn download_segment(shared: &Shared, entry: &Arc<HlsEntry>, segment: &MediaSegment) {
    let path = segment_path(&entry.dir, segment.index);
    let mut stream = shared
        .downloader
        .download(&segment.url, &path, 0, entry.headers.clone())
        .await;

    let mut completed = false;
    loop {
        tokio::select! {
            biased;
            _ = entry.token.cancelled() => {
                shared.downloader.cancel(&segment.url).await;
                return;
            }
            event = stream.next_event() => match event {
                Some(Ok(progress)) => {
                    if progress.is_complete {
                        completed = true;
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(url = %segment.url, index = segment.index, "segment download failed: {e}");
                    break;
                }
                None => break,
            }
        }
    }

    if !completed {
        return;
    }

    let (cached, total, snapshot) = {
        let mut st = entry.lock();
        st.cached_segments += 1;
        (
            st.cached_segments,
            st.playlist.segments.len(),
            st.playlist.clone(),
        )
    };
    shared
        .metadata
        .update_progress(&entry.url, cached as u64, Some(total as u64), true)
        .await;
    if let Err(e) = write_local_playlist(&entry.dir, &snapshot).await {
        debug!(url = %entry.url, "local playlist rewrite failed: {e}");
    }
}

/// Wait out the refresh interval (or current backoff), then refetch the media playlist.
///
/// Returns false when the entry was cancelled during the wait.
async fn refresh_live(shared: &Shared, entry: &Arc<HlsEntry>) -> bool {
    let wait = {
        let st = entry.lock();
        st.backoff.unwrap_or_else(|| {
            Duration::from_secs(st.playlist.target_duration)
                .clamp(MIN_REFRESH, MAX_REFRESH)
        })
    };

    tokio::select! {
        biased;
        _ = entry.token.cancelled() => return false,
        _ = tokio::time::sleep(wait) => {}
    }

    let fetched = fetch_playlist(&shared.client, &entry.media_url, entry.headers.as_ref()).await;
    let parsed = fetched.and_then(|body| parse_playlist(&body, &entry.media_url));

    match parsed {
        Ok(HlsPlaylist::Media(playlist)) => {
            let total = playlist.segments.len();
            let (cached, first_missing) = scan_cached(&entry.dir, total);
            let snapshot = {
                let mut st = entry.lock();
                st.playlist = playlist;
                st.cached_segments = cached;
                st.next_index = first_missing;
                st.backoff = None;
                st.playlist.clone()
            };
            shared
                .metadata
                .update_progress(&entry.url, cached as u64, Some(total as u64), true)
                .await;
            if let Err(e) = write_local_playlist(&entry.dir, &snapshot).await {
                debug!(url = %entry.url, "local playlist rewrite failed: {e}");
            }
            true
        }
        other => {
            if let Err(e) = other {
                debug!(url = %entry.media_url, "live refresh failed: {e}");
            } else {
                debug!(url = %entry.media_url, "live refresh returned a master playlist");
            }
            let mut st = entry.lock();
            st.backoff = Some(match st.backoff {
                Some(current) => (current * 2).min(MAX_BACKOFF),
                None => MIN_REFRESH,
            });
            true
        }
    }
}
