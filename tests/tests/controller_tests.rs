//! Prefetch controller integration tests.
//!
//! Exercises the scroll-driven scheduler end to end: playable-path resolution with the
//! byte threshold, scroll-window cancellation, concurrency caps, queue pumping, and the
//! remote-URL fallbacks.


use std::time::{Duration, Instant};

use fixture::Fixture;
use reel_cache::hash_url;
use reel_cache_feed::{CacheSettings, NetworkType, ReelCache};

const MIB: usize = 1024 * 1024;

async fn open_cache(dir: &tempfile::TempDir) -> ReelCache {
    ReelCache::open(dir.path(), CacheSettings::default())
        .await
        .unwrap()
}

async fn wait_until(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    probe()
}

#[tokio::test]
async fn playable_path_waits_for_threshold() {
    let server = Fixture::new();
    server.put("v.mp4", Fixture::payload(MIB));
    server.drip("v.mp4", 256 * 1024, Duration::from_secs(5));
    let base = server.start().await;
    let url = format!("{base}v.mp4");

    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(&dir).await;

    let started = Instant::now();
    let path = cache.get_playable_path(&url, None).await;
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "must return at the threshold, not completion"
    );

    let expected = dir.path().join(format!("{}.mp4", hash_url(&url)));
    assert_eq!(path, expected.to_string_lossy());
    let size = tokio::fs::metadata(&expected).await.unwrap().len();
    assert!(size >= 128 * 1024, "returned path must be playable, got {size} bytes");

    cache.cancel_all().await;
}

#[tokio::test]
async fn completed_file_is_returned_without_network() {
    let server = Fixture::new();
    server.put("v.mp4", Fixture::payload(64 * 1024));
    let base = server.start().await;
    let url = format!("{base}v.mp4");

    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(&dir).await;

    let first = cache.get_playable_path(&url, None).await;
    let meta = cache.metadata().clone();
    let url2 = url.clone();
    assert!(wait_until(Duration::from_secs(10), move || meta.is_complete(&url2)).await);
    assert!(cache.is_cached(&url));

    let requests_before = server.request_count("v.mp4");
    let second = cache.get_playable_path(&url, None).await;
    assert_eq!(first, second);
    assert_eq!(server.request_count("v.mp4"), requests_before);
    assert_eq!(cache.get_progress(&url), Some(1.0));
}

#[tokio::test]
async fn scroll_cancels_downloads_outside_keep_range() {
    let server = Fixture::new();
    let urls: Vec<String> = (0..8).map(|i| format!("r{i}.mp4")).collect();
    for name in &urls {
        server.put(name, Fixture::payload(MIB));
        server.drip(name, 64 * 1024, Duration::from_secs(20));
    }
    let base = server.start().await;
    let urls: Vec<String> = urls.iter().map(|n| format!("{base}{n}")).collect();

    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(&dir).await;

    // ahead=2, behind=0, keep=2: indexes 1 and 2 start downloading.
    cache
        .controller()
        .on_scroll_update(&urls, 0, Some(2), Some(0), Some(2), None)
        .await;
    let dl = cache.downloader();
    assert!(dl.is_inflight(&urls[1]));
    assert!(dl.is_inflight(&urls[2]));

    // Jump far ahead: both old downloads leave the keep window and are cancelled.
    cache
        .controller()
        .on_scroll_update(&urls, 5, Some(2), Some(0), Some(2), None)
        .await;

    assert!(!dl.is_inflight(&urls[1]), "r1 left the keep window");
    assert!(!dl.is_inflight(&urls[2]), "r2 left the keep window");
    assert!(dl.is_inflight(&urls[6]));
    assert!(dl.is_inflight(&urls[7]));

    // Cancelled downloads keep their partial bytes on disk.
    let partial = cache.files().file_size(&urls[1]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cache.files().file_size(&urls[1]).await, partial);

    cache.cancel_all().await;
}

#[tokio::test]
async fn zero_fanout_starts_nothing() {
    let server = Fixture::new();
    let urls: Vec<String> = (0..4).map(|i| format!("r{i}.mp4")).collect();
    for name in &urls {
        server.put(name, Fixture::payload(64 * 1024));
    }
    let base = server.start().await;
    let urls: Vec<String> = urls.iter().map(|n| format!("{base}{n}")).collect();

    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(&dir).await;

    cache
        .controller()
        .on_scroll_update(&urls, 1, Some(0), Some(0), None, None)
        .await;
    for name in 0..4 {
        assert_eq!(server.request_count(&format!("r{name}.mp4")), 0);
    }

    // Offline network class has the same effect with no overrides.
    cache.set_network_type(NetworkType::Offline);
    cache.controller().on_scroll_update(&urls, 1, None, None, None, None).await;
    for name in 0..4 {
        assert_eq!(server.request_count(&format!("r{name}.mp4")), 0);
    }
}

#[tokio::test]
async fn slow_network_caps_concurrency_and_queues_the_rest() {
    let server = Fixture::new();
    let urls: Vec<String> = (0..4).map(|i| format!("r{i}.mp4")).collect();
    for name in &urls {
        server.put(name, Fixture::payload(MIB));
        server.drip(name, 64 * 1024, Duration::from_secs(20));
    }
    let base = server.start().await;
    let urls: Vec<String> = urls.iter().map(|n| format!("{base}{n}")).collect();

    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(&dir).await;
    cache.set_network_type(NetworkType::Slow);

    // Slow allows one concurrent download; ask for two ahead.
    cache
        .controller()
        .on_scroll_update(&urls, 0, Some(2), Some(0), Some(3), None)
        .await;

    let dl = cache.downloader();
    assert!(dl.is_inflight(&urls[1]));
    assert!(!dl.is_inflight(&urls[2]), "second must wait in the queue");

    // Releasing the slot starts the queued request.
    cache.cancel_download(&urls[1]).await;
    let dl2 = cache.downloader().clone();
    let queued = urls[2].clone();
    assert!(
        wait_until(Duration::from_secs(5), move || dl2.is_inflight(&queued)).await,
        "queued request should start when the slot frees"
    );

    cache.cancel_all().await;
}

#[tokio::test]
async fn hls_error_falls_back_to_remote_url() {
    let server = Fixture::new();
    // No playlist registered: the fetch 404s.
    let base = server.start().await;
    let url = format!("{base}missing.m3u8");

    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(&dir).await;

    let path = cache.get_playable_path(&url, None).await;
    assert_eq!(path, url, "HLS failure must fall back to the remote URL");
}

#[tokio::test]
async fn hls_urls_route_to_the_hls_manager() {
    let server = Fixture::new();
    server.put(
        "p.m3u8",
        "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nsegment0.ts\n#EXT-X-ENDLIST\n",
    );
    server.put("segment0.ts", Fixture::payload(2048));
    let base = server.start().await;
    let url = format!("{base}p.m3u8");

    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(&dir).await;

    let path = cache.get_playable_path(&url, None).await;
    assert!(path.ends_with("playlist.m3u8"));
    assert!(std::path::Path::new(&path).exists());

    let meta = cache.metadata().clone();
    let url2 = url.clone();
    assert!(wait_until(Duration::from_secs(10), move || meta.is_complete(&url2)).await);
    assert_eq!(cache.get_progress(&url), Some(1.0));

    cache.cancel_all().await;
}

#[tokio::test]
async fn download_errors_fall_back_to_remote_url() {
    let server = Fixture::new();
    server.put("v.mp4", Fixture::payload(MIB));
    server.fail("v.mp4");
    let base = server.start().await;
    let url = format!("{base}v.mp4");

    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(&dir).await;

    let path = cache.get_playable_path(&url, None).await;
    assert_eq!(path, url, "MP4 failure below threshold must fall back");
}
