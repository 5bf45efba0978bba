//! MP4 progressive download integration tests.
//!
//! Covers the downloader's core contract against a local fixture server: fresh downloads,
//! ranged resume, the range-ignored truncate-and-restart path, progress cadence,
//! threshold waits, cancellation, and duplicate-download replacement.


use std::sync::Arc;
use std::time::{Duration, Instant};

use fixture::Fixture;
use reel_cache::{
    hash_url, CacheFileManager, CacheMetadataStore, CacheSettings, DownloadProgress,
    ProgressiveDownloader,
};

const MIB: usize = 1024 * 1024;

async fn cache_parts(
    dir: &tempfile::TempDir,
) -> (Arc<CacheFileManager>, Arc<CacheMetadataStore>, ProgressiveDownloader) {
    let settings = CacheSettings::default();
    let metadata = Arc::new(
        CacheMetadataStore::load(
            CacheFileManager::metadata_path(dir.path()),
            settings.persist_interval,
        )
        .await,
    );
    let files = Arc::new(CacheFileManager::new(dir.path(), metadata.clone()).unwrap());
    let downloader = ProgressiveDownloader::new(&settings).unwrap();
    (files, metadata, downloader)
}

async fn collect_events(
    stream: &mut reel_cache::ProgressStream,
) -> Vec<Result<DownloadProgress, reel_cache::CacheError>> {
    let mut events = Vec::new();
    while let Some(event) = stream.next_event().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn fresh_download_completes_with_full_body() {
    let server = Fixture::new();
    let payload = Fixture::payload(MIB);
    server.put("v.mp4", payload.clone());
    let base = server.start().await;
    let url = format!("{base}v.mp4");

    let dir = tempfile::tempdir().unwrap();
    let (files, _metadata, downloader) = cache_parts(&dir).await;

    let path = files.ensure_file(&url).await.unwrap();
    assert_eq!(path, dir.path().join(format!("{}.mp4", hash_url(&url))));

    let mut stream = downloader.download(&url, &path, 0, None).await;
    let events = collect_events(&mut stream).await;

    let last = events.last().unwrap().as_ref().unwrap();
    assert!(last.is_complete);
    assert_eq!(last.downloaded_bytes, MIB as u64);
    assert_eq!(last.total_bytes, Some(MIB as u64));

    // Progress is monotonically non-decreasing with intermediate emissions.
    let mut prev = 0;
    for event in &events {
        let p = event.as_ref().unwrap();
        assert!(p.downloaded_bytes >= prev);
        prev = p.downloaded_bytes;
    }
    assert!(events.len() > 1, "1 MiB should emit intermediate progress");

    assert_eq!(tokio::fs::read(&path).await.unwrap(), payload.to_vec());
}

#[tokio::test]
async fn resume_sends_range_and_appends_on_206() {
    let server = Fixture::new();
    let payload = Fixture::payload(MIB);
    server.put("v.mp4", payload.clone());
    let base = server.start().await;
    let url = format!("{base}v.mp4");

    let dir = tempfile::tempdir().unwrap();
    let (files, _metadata, downloader) = cache_parts(&dir).await;

    // Pre-existing partial file of 256 KiB.
    let path = files.file_path(&url);
    tokio::fs::write(&path, &payload[..262_144]).await.unwrap();

    let mut stream = downloader.download(&url, &path, 262_144, None).await;
    let events = collect_events(&mut stream).await;
    let last = events.last().unwrap().as_ref().unwrap();
    assert!(last.is_complete);
    assert_eq!(last.downloaded_bytes, MIB as u64);

    let requests = server.requests_for("v.mp4");
    assert_eq!(requests.len(), 1, "resume must be a single request");
    assert_eq!(requests[0].range.as_deref(), Some("bytes=262144-"));

    assert_eq!(tokio::fs::read(&path).await.unwrap(), payload.to_vec());
}

#[tokio::test]
async fn range_ignored_truncates_and_restarts() {
    let server = Fixture::new();
    let payload = Fixture::payload(MIB);
    server.put("v.mp4", payload.clone());
    server.set_ignore_range(true);
    let base = server.start().await;
    let url = format!("{base}v.mp4");

    let dir = tempfile::tempdir().unwrap();
    let (files, _metadata, downloader) = cache_parts(&dir).await;

    let path = files.file_path(&url);
    tokio::fs::write(&path, &payload[..262_144]).await.unwrap();

    let mut stream = downloader.download(&url, &path, 262_144, None).await;
    let events = collect_events(&mut stream).await;
    let last = events.last().unwrap().as_ref().unwrap();
    assert!(last.is_complete);
    assert_eq!(last.downloaded_bytes, MIB as u64);

    let requests = server.requests_for("v.mp4");
    assert_eq!(requests.len(), 2, "200-despite-range must trigger one reissue");
    assert!(requests[0].range.is_some());
    assert!(requests[1].range.is_none());

    // Bytes were written from zero after the truncate, not appended.
    assert_eq!(tokio::fs::read(&path).await.unwrap(), payload.to_vec());
}

#[tokio::test]
async fn small_body_emits_only_the_final_event() {
    let server = Fixture::new();
    server.put("tiny.mp4", Fixture::payload(10 * 1024));
    let base = server.start().await;
    let url = format!("{base}tiny.mp4");

    let dir = tempfile::tempdir().unwrap();
    let (files, _metadata, downloader) = cache_parts(&dir).await;
    let path = files.ensure_file(&url).await.unwrap();

    let mut stream = downloader.download(&url, &path, 0, None).await;
    let events = collect_events(&mut stream).await;

    assert_eq!(events.len(), 1, "bodies under 64 KiB emit no intermediate progress");
    let only = events[0].as_ref().unwrap();
    assert!(only.is_complete);
    assert_eq!(only.downloaded_bytes, 10 * 1024);
}

#[tokio::test]
async fn http_error_status_fails_the_stream() {
    let server = Fixture::new();
    server.put("v.mp4", Fixture::payload(1024));
    server.fail("v.mp4");
    let base = server.start().await;
    let url = format!("{base}v.mp4");

    let dir = tempfile::tempdir().unwrap();
    let (files, _metadata, downloader) = cache_parts(&dir).await;
    let path = files.ensure_file(&url).await.unwrap();

    let mut stream = downloader.download(&url, &path, 0, None).await;
    let events = collect_events(&mut stream).await;
    assert_eq!(events.len(), 1);
    match events[0].as_ref().unwrap_err() {
        reel_cache::CacheError::Http { status, .. } => assert_eq!(*status, 500),
        other => panic!("expected Http error, got {other}"),
    }
}

#[tokio::test]
async fn threshold_wait_resolves_before_completion() {
    let server = Fixture::new();
    server.put("v.mp4", Fixture::payload(MIB));
    server.drip("v.mp4", 200 * 1024, Duration::from_secs(5));
    let base = server.start().await;
    let url = format!("{base}v.mp4");

    let dir = tempfile::tempdir().unwrap();
    let (files, _metadata, downloader) = cache_parts(&dir).await;
    let path = files.ensure_file(&url).await.unwrap();

    let started = Instant::now();
    let handle = downloader
        .download_and_wait_for_bytes(&url, &path, 0, 131_072, None)
        .await;
    let (outcome, _progress) = handle.ready().await;

    let bytes = outcome.expect("threshold should be reached");
    assert!(bytes >= 131_072);
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "threshold wait must not block until completion"
    );

    downloader.cancel(&url).await;
}

#[tokio::test]
async fn zero_threshold_resolves_on_first_event() {
    let server = Fixture::new();
    server.put("v.mp4", Fixture::payload(MIB));
    server.drip("v.mp4", 96 * 1024, Duration::from_secs(5));
    let base = server.start().await;
    let url = format!("{base}v.mp4");

    let dir = tempfile::tempdir().unwrap();
    let (files, _metadata, downloader) = cache_parts(&dir).await;
    let path = files.ensure_file(&url).await.unwrap();

    let handle = downloader
        .download_and_wait_for_bytes(&url, &path, 0, 0, None)
        .await;
    let (outcome, _progress) = handle.ready().await;
    assert!(outcome.unwrap() > 0);

    downloader.cancel(&url).await;
}

#[tokio::test]
async fn stalled_download_fails_with_timeout() {
    let server = Fixture::new();
    server.put("v.mp4", Fixture::payload(MIB));
    // Stall well past the 30 s read idle timeout after the first burst.
    server.drip("v.mp4", 64 * 1024, Duration::from_secs(60));
    let base = server.start().await;
    let url = format!("{base}v.mp4");

    let dir = tempfile::tempdir().unwrap();
    let (files, _metadata, downloader) = cache_parts(&dir).await;
    let path = files.ensure_file(&url).await.unwrap();

    let mut stream = downloader.download(&url, &path, 0, None).await;
    let first = stream.next_event().await.unwrap().unwrap();
    assert!(!first.is_complete);

    // The stream must fail on its own once the idle window expires, not hang.
    let stalled_at = Instant::now();
    let outcome = tokio::time::timeout(Duration::from_secs(35), async {
        loop {
            match stream.next_event().await {
                Some(Err(e)) => break e,
                Some(Ok(_)) => continue,
                None => panic!("stream ended without surfacing the stall"),
            }
        }
    })
    .await
    .expect("stalled download must fail within the idle window");

    assert!(
        matches!(outcome, reel_cache::CacheError::Timeout(_)),
        "expected a timeout error, got {outcome}"
    );
    assert!(
        stalled_at.elapsed() >= Duration::from_secs(25),
        "timeout fired before the idle window elapsed"
    );

    // Partial bytes survive the failure as the resume point.
    assert!(tokio::fs::metadata(&path).await.unwrap().len() > 0);
}

#[tokio::test]
async fn cancel_retains_partial_bytes_for_resume() {
    let server = Fixture::new();
    let payload = Fixture::payload(MIB);
    server.put("v.mp4", payload.clone());
    server.drip("v.mp4", 100 * 1024, Duration::from_secs(5));
    let base = server.start().await;
    let url = format!("{base}v.mp4");

    let dir = tempfile::tempdir().unwrap();
    let (files, _metadata, downloader) = cache_parts(&dir).await;
    let path = files.ensure_file(&url).await.unwrap();

    let mut stream = downloader.download(&url, &path, 0, None).await;
    // First burst observed; the server now stalls.
    let first = stream.next_event().await.unwrap().unwrap();
    assert!(first.downloaded_bytes > 0);
    assert!(!first.is_complete);

    downloader.cancel(&url).await;
    assert!(stream.next_event().await.is_none(), "no events after cancel");

    let partial = tokio::fs::metadata(&path).await.unwrap().len();
    assert!(partial > 0);
    assert_eq!(
        tokio::fs::read(&path).await.unwrap(),
        payload[..partial as usize].to_vec()
    );

    // The partial file is a legitimate resume point.
    let mut stream = downloader.download(&url, &path, partial, None).await;
    let events = collect_events(&mut stream).await;
    let last = events.last().unwrap().as_ref().unwrap();
    assert!(last.is_complete);
    assert_eq!(last.downloaded_bytes, MIB as u64);
    assert_eq!(tokio::fs::read(&path).await.unwrap(), payload.to_vec());
}

#[tokio::test]
async fn duplicate_download_cancels_the_prior_one() {
    let server = Fixture::new();
    server.put("v.mp4", Fixture::payload(MIB));
    server.drip("v.mp4", 100 * 1024, Duration::from_secs(5));
    let base = server.start().await;
    let url = format!("{base}v.mp4");

    let dir = tempfile::tempdir().unwrap();
    let (files, _metadata, downloader) = cache_parts(&dir).await;
    let path = files.ensure_file(&url).await.unwrap();

    let mut first = downloader.download(&url, &path, 0, None).await;
    let burst = first.next_event().await.unwrap().unwrap();
    assert!(!burst.is_complete);

    // Second call for the same URL replaces the first download entirely.
    server.drip("v.mp4", MIB, Duration::ZERO);
    let mut second = downloader.download(&url, &path, 0, None).await;

    assert!(first.next_event().await.is_none(), "prior stream must end");

    let events = collect_events(&mut second).await;
    let last = events.last().unwrap().as_ref().unwrap();
    assert!(last.is_complete);
    assert_eq!(last.downloaded_bytes, MIB as u64);
}
