//! Feed-facing layer of the progressive video cache.
//!
//! - `network`: rolling-average bandwidth estimation → prefetch fan-out.
//! - `controller`: the scroll-driven scheduler with bounded concurrency.
//! - [`ReelCache`]: a convenience facade that wires the whole object graph (file manager,
//!   metadata store with startup reconciliation, downloader, HLS manager, evictor, monitor,
//!   controller) from one settings struct, for callers that want a single handle instead of
//!   assembling the components at their composition root.

use std::path::PathBuf;
use std::sync::Arc;

use reqwest::header::HeaderMap;

use reel_cache::{
    hash_url, CacheFileManager, CacheMetadataStore, CacheResult, Evictor, ProgressiveDownloader,
};
use reel_cache_hls::HlsCacheManager;

mod controller;
mod network;

pub use crate::controller::{is_hls_url, ReelPrefetchController, DEFAULT_MAX_CONCURRENT};
pub use crate::network::{ConnectivityHint, NetworkQualityMonitor, NetworkType, PrefetchConfig};

// Re-export the pieces callers interact with through the facade.
pub use reel_cache::{CacheError, CacheSettings, ProgressRecord};
pub use reel_cache_hls::HlsPlayback;

/// The assembled progressive video cache.
///
/// Components are explicit objects created here at startup and passed to collaborators; the
/// facade only holds the graph together and forwards the controller surface.
pub struct ReelCache {
    files: Arc<CacheFileManager>,
    metadata: Arc<CacheMetadataStore>,
    downloader: Arc<ProgressiveDownloader>,
    hls: Arc<HlsCacheManager>,
    evictor: Arc<Evictor>,
    monitor: Arc<NetworkQualityMonitor>,
    controller: Arc<ReelPrefetchController>,
}

impl ReelCache {
    /// Open (or create) a cache rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>, settings: CacheSettings) -> CacheResult<Self> {
        Self::open_with_concurrency(root, settings, DEFAULT_MAX_CONCURRENT).await
    }

    /// Open the cache at the conventional `<os_tmp>/video_cache` location.
    pub async fn open_in_os_temp(settings: CacheSettings) -> CacheResult<Self> {
        Self::open(std::env::temp_dir().join("video_cache"), settings).await
    }

    /// Open with an explicit configured concurrency cap. The effective cap at runtime is
    /// the smaller of this and the network class's `max_concurrent`.
    pub async fn open_with_concurrency(
        root: impl Into<PathBuf>,
        settings: CacheSettings,
        max_concurrent: usize,
    ) -> CacheResult<Self> {
        let root = root.into();

        let metadata = Arc::new(
            CacheMetadataStore::load(
                CacheFileManager::metadata_path(&root),
                settings.persist_interval,
            )
            .await,
        );

        // Recover ground truth from disk before anything reads the index. The closure keeps
        // the store decoupled from the file manager's layout.
        {
            let root = root.clone();
            metadata.reconcile_with(|url| {
                std::fs::metadata(root.join(format!("{}.mp4", hash_url(url))))
                    .ok()
                    .map(|meta| meta.len())
            });
        }

        let files = Arc::new(CacheFileManager::new(&root, metadata.clone())?);
        let downloader = Arc::new(ProgressiveDownloader::new(&settings)?);
        let hls = Arc::new(HlsCacheManager::new(
            files.clone(),
            metadata.clone(),
            downloader.clone(),
            &settings,
        )?);
        let evictor = Arc::new(Evictor::new(files.clone(), metadata.clone(), &settings));
        let monitor = Arc::new(NetworkQualityMonitor::new());
        let controller = ReelPrefetchController::new(
            files.clone(),
            metadata.clone(),
            downloader.clone(),
            hls.clone(),
            monitor.clone(),
            evictor.clone(),
            &settings,
            max_concurrent,
        );

        Ok(Self {
            files,
            metadata,
            downloader,
            hls,
            evictor,
            monitor,
            controller,
        })
    }

    // ----------------------------
    // Component access
    // ----------------------------

    pub fn controller(&self) -> &Arc<ReelPrefetchController> {
        &self.controller
    }

    pub fn files(&self) -> &Arc<CacheFileManager> {
        &self.files
    }

    pub fn metadata(&self) -> &Arc<CacheMetadataStore> {
        &self.metadata
    }

    pub fn downloader(&self) -> &Arc<ProgressiveDownloader> {
        &self.downloader
    }

    pub fn hls(&self) -> &Arc<HlsCacheManager> {
        &self.hls
    }

    pub fn evictor(&self) -> &Arc<Evictor> {
        &self.evictor
    }

    pub fn monitor(&self) -> &Arc<NetworkQualityMonitor> {
        &self.monitor
    }

    // ----------------------------
    // Controller surface
    // ----------------------------

    /// See [`ReelPrefetchController::get_playable_path`].
    pub async fn get_playable_path(&self, url: &str, headers: Option<HeaderMap>) -> String {
        self.controller.get_playable_path(url, headers).await
    }

    /// See [`ReelPrefetchController::on_scroll_update`].
    pub async fn on_scroll_update(
        &self,
        urls: &[String],
        current_index: usize,
        headers: Option<HeaderMap>,
    ) {
        self.controller
            .on_scroll_update(urls, current_index, None, None, None, headers)
            .await
    }

    pub async fn cancel_download(&self, url: &str) {
        self.controller.cancel_download(url).await
    }

    pub async fn cancel_all(&self) {
        self.controller.cancel_all().await
    }

    pub fn is_cached(&self, url: &str) -> bool {
        self.controller.is_cached(url)
    }

    pub fn get_progress(&self, url: &str) -> Option<f64> {
        self.controller.get_progress(url)
    }

    pub fn set_network_type(&self, network: NetworkType) {
        self.controller.set_network_type(network)
    }

    /// Apply a platform connectivity hint.
    pub fn update_from_connectivity(&self, hint: ConnectivityHint) {
        self.monitor.update_from_connectivity(hint)
    }

    /// Cancel everything and refuse further work.
    pub async fn dispose(&self) {
        self.controller.dispose().await
    }

    /// Cancel everything and wipe the cache directory and index.
    pub async fn clear_all(&self) -> CacheResult<()> {
        self.controller.cancel_all().await;
        self.files.clear_all().await
    }
}
