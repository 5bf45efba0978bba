//! Pooled ranged HTTP fetcher streaming bytes into a growing file.
//!
//! One download task per URL writes body chunks into the cache file and publishes a lazy
//! stream of [`DownloadProgress`] events. Progress is emitted every
//! `progress_emit_bytes` of new data plus a terminal event with `is_complete = true` on
//! clean EOF. Cancellation is cooperative: the token is polled between chunks, the response
//! is dropped eagerly, and partial bytes stay on disk as the resume point.
//!
//! Resume correctness: a request with `start_byte > 0` carries `Range: bytes=<n>-`. A 206
//! appends; a 200 means the server ignored the range, so the file is truncated to zero and
//! the request is reissued from the start. Any other status fails the stream.
//!
//! Each chunk read is bounded by the read idle timeout: a transfer that stops producing
//! bytes (server stall, dead connection) fails the stream with a timeout error instead of
//! hanging. This is independent of the pool-idle timeout, which only governs how long an
//! unused connection stays open for reuse.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, RANGE};
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{CacheError, CacheResult};
use crate::settings::CacheSettings;

/// One progress event from an active download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes on disk for this URL, including any resume offset.
    pub downloaded_bytes: u64,
    /// Expected final size, when the server reported one.
    pub total_bytes: Option<u64>,
    /// Set on the terminal event of a completed download.
    pub is_complete: bool,
}

/// Lazy sequence of progress events for one download.
///
/// Dropping the stream does not cancel the download; the task keeps writing to disk.
pub struct ProgressStream {
    rx: mpsc::Receiver<CacheResult<DownloadProgress>>,
}

impl ProgressStream {
    /// Receive the next event, or `None` when the download task has finished.
    pub async fn next_event(&mut self) -> Option<CacheResult<DownloadProgress>> {
        self.rx.recv().await
    }
}

impl Stream for ProgressStream {
    type Item = CacheResult<DownloadProgress>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Handle returned by [`ProgressiveDownloader::download_and_wait_for_bytes`].
///
/// Resolves once the download has either reached the requested byte threshold or finished;
/// the underlying download keeps running and its remaining events stay available.
pub struct ThresholdHandle {
    ready: oneshot::Receiver<CacheResult<u64>>,
    progress: ProgressStream,
}

impl ThresholdHandle {
    /// Wait for the threshold (or completion), then hand back the live progress stream.
    ///
    /// Fails if the download errored before reaching the threshold.
    pub async fn ready(self) -> (CacheResult<u64>, ProgressStream) {
        let outcome = self.ready.await.unwrap_or(Err(CacheError::Cancelled));
        (outcome, self.progress)
    }

    /// Skip the threshold wait and consume progress events directly.
    pub fn into_progress(self) -> ProgressStream {
        self.progress
    }
}

struct Inflight {
    id: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    inflight: Mutex<HashMap<String, Inflight>>,
}

impl Shared {
    // Remove the in-flight record only if it still belongs to generation `id`; a newer
    // download for the same URL may have replaced it.
    fn finish(&self, url: &str, id: u64) {
        let mut map = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        if map.get(url).is_some_and(|inf| inf.id == id) {
            map.remove(url);
        }
    }
}

/// Connection-pooled progressive downloader.
///
/// Holds a fixed pool of long-lived HTTP clients selected round-robin per request; clients
/// are never torn down per download.
pub struct ProgressiveDownloader {
    clients: Vec<Client>,
    next_client: AtomicUsize,
    next_id: AtomicU64,
    progress_emit_bytes: u64,
    read_timeout: std::time::Duration,
    shared: Arc<Shared>,
}

impl ProgressiveDownloader {
    /// Build the client pool from settings.
    pub fn new(settings: &CacheSettings) -> CacheResult<Self> {
        let clients = (0..settings.pool_size.max(1))
            .map(|_| {
                Client::builder()
                    .connect_timeout(settings.connect_timeout)
                    .pool_idle_timeout(settings.pool_idle_timeout)
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            clients,
            next_client: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            progress_emit_bytes: settings.progress_emit_bytes,
            read_timeout: settings.read_timeout,
            shared: Arc::new(Shared::default()),
        })
    }

    fn client(&self) -> Client {
        let idx = self.next_client.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        self.clients[idx].clone()
    }

    /// Start (or restart) a download for `url` into `file_path`, resuming at `start_byte`.
    ///
    /// An in-flight download for the same URL is cancelled and awaited first, so its file
    /// handle is closed before the new task opens the file.
    pub async fn download(
        &self,
        url: &str,
        file_path: &Path,
        start_byte: u64,
        headers: Option<HeaderMap>,
    ) -> ProgressStream {
        self.cancel(url).await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(16);

        let job = DownloadJob {
            client: self.client(),
            url: url.to_string(),
            file_path: file_path.to_path_buf(),
            start_byte,
            headers,
            emit_every: self.progress_emit_bytes,
            read_timeout: self.read_timeout,
            token: token.clone(),
            tx,
        };
        // The task waits for the registration signal so it cannot finish (and try to
        // deregister) before its in-flight record exists.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let url_key = url.to_string();
        let task = tokio::spawn(async move {
            let _ = registered_rx.await;
            job.run().await;
            shared.finish(&url_key, id);
        });

        {
            let mut map = self
                .shared
                .inflight
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            map.insert(url.to_string(), Inflight { id, token, task });
        }
        let _ = registered_tx.send(());

        ProgressStream { rx }
    }

    /// Start a background download and resolve once `min_bytes` are on disk (or earlier, if
    /// the download finishes first). A failure before the threshold fails the handle.
    pub async fn download_and_wait_for_bytes(
        &self,
        url: &str,
        file_path: &Path,
        start_byte: u64,
        min_bytes: u64,
        headers: Option<HeaderMap>,
    ) -> ThresholdHandle {
        let mut inner = self.download(url, file_path, start_byte, headers).await;

        let (ready_tx, ready_rx) = oneshot::channel();
        let (fwd_tx, fwd_rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            while let Some(event) = inner.next_event().await {
                match &event {
                    Ok(progress) => {
                        if progress.downloaded_bytes >= min_bytes || progress.is_complete {
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(Ok(progress.downloaded_bytes));
                            }
                        }
                    }
                    Err(e) => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Err(CacheError::msg(format!(
                                "download failed before byte threshold: {e}"
                            ))));
                        }
                    }
                }
                if fwd_tx.send(event).await.is_err() {
                    // Handle dropped; stop forwarding but let the download run on.
                    break;
                }
            }
            // Stream ended without reaching the threshold (cancelled mid-flight).
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(Err(CacheError::Cancelled));
            }
        });

        ThresholdHandle {
            ready: ready_rx,
            progress: ProgressStream { rx: fwd_rx },
        }
    }

    /// Returns true while a download task for `url` is alive.
    pub fn is_inflight(&self, url: &str) -> bool {
        let map = self
            .shared
            .inflight
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        map.contains_key(url)
    }

    /// Cancel the download for `url`, if any, and wait for its task to release the file.
    ///
    /// No further progress events are emitted after this returns.
    pub async fn cancel(&self, url: &str) {
        let entry = {
            let mut map = self
                .shared
                .inflight
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            map.remove(url)
        };
        if let Some(inflight) = entry {
            trace!(url, "cancelling in-flight download");
            inflight.token.cancel();
            let _ = inflight.task.await;
        }
    }

    /// Cancel every in-flight download.
    pub async fn cancel_all(&self) {
        let entries: Vec<Inflight> = {
            let mut map = self
                .shared
                .inflight
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            map.drain().map(|(_, inf)| inf).collect()
        };
        for inflight in entries {
            inflight.token.cancel();
            let _ = inflight.task.await;
        }
    }
}

struct DownloadJob {
    client: Client,
    url: String,
    file_path: PathBuf,
    start_byte: u64,
    headers: Option<HeaderMap>,
    emit_every: u64,
    read_timeout: std::time::Duration,
    token: CancellationToken,
    tx: mpsc::Sender<CacheResult<DownloadProgress>>,
}

impl DownloadJob {
    async fn run(self) {
        match self.drive().await {
            Ok(()) => {}
            Err(CacheError::Cancelled) => {
                trace!(url = %self.url, "download cancelled, partial bytes retained");
            }
            Err(e) => {
                debug!(url = %self.url, "download failed: {e}");
                let _ = self.tx.send(Err(e)).await;
            }
        }
    }

    async fn drive(&self) -> CacheResult<()> {
        let mut start = self.start_byte;

        // Request loop: reissued at most once, when a non-zero range is answered with 200.
        let response = loop {
            let mut request = self.client.get(&self.url);
            if let Some(headers) = &self.headers {
                request = request.headers(headers.clone());
            }
            if start > 0 {
                request = request.header(RANGE, format!("bytes={start}-"));
            }

            let response = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(CacheError::Cancelled),
                res = request.send() => res?,
            };

            match response.status() {
                StatusCode::PARTIAL_CONTENT => break response,
                StatusCode::OK if start == 0 => break response,
                StatusCode::OK => {
                    // Range ignored: the body restarts at byte zero, so appending would
                    // corrupt the file. Truncate and reissue without a range.
                    debug!(url = %self.url, start, "range ignored by server, restarting from zero");
                    drop(response);
                    truncate(&self.file_path).await?;
                    start = 0;
                }
                status => return Err(CacheError::http(status.as_u16(), &self.url)),
            }
        };

        let total_bytes = response
            .content_length()
            .filter(|len| *len > 0)
            .map(|len| start + len);

        let mut file = if start == 0 {
            tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.file_path)
                .await?
        } else {
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)
                .await?
        };

        let mut body = response.bytes_stream();
        let mut downloaded = start;
        let mut since_emit = 0u64;

        loop {
            // Each read is bounded by the idle timeout: no chunk within the window fails
            // the stream rather than hanging on a stalled transfer.
            let chunk = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    // Keep partial bytes as the resume point; just make them durable.
                    let _ = file.flush().await;
                    return Err(CacheError::Cancelled);
                }
                read = tokio::time::timeout(self.read_timeout, body.next()) => match read {
                    Ok(chunk) => chunk,
                    Err(_) => {
                        let _ = file.flush().await;
                        return Err(CacheError::timeout(self.url.as_str()));
                    }
                },
            };

            match chunk {
                Some(Ok(bytes)) => {
                    file.write_all(&bytes).await?;
                    downloaded += bytes.len() as u64;
                    since_emit += bytes.len() as u64;

                    if since_emit >= self.emit_every {
                        since_emit = 0;
                        file.flush().await?;
                        let _ = self
                            .tx
                            .send(Ok(DownloadProgress {
                                downloaded_bytes: downloaded,
                                total_bytes,
                                is_complete: false,
                            }))
                            .await;
                    }
                }
                Some(Err(e)) => {
                    let _ = file.flush().await;
                    return Err(e.into());
                }
                None => {
                    file.flush().await?;
                    let _ = self
                        .tx
                        .send(Ok(DownloadProgress {
                            downloaded_bytes: downloaded,
                            total_bytes: total_bytes.or(Some(downloaded)),
                            is_complete: true,
                        }))
                        .await;
                    return Ok(());
                }
            }
        }
    }
}

async fn truncate(path: &Path) -> CacheResult<()> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    Ok(())
}
