//! Chunked downloader: fetches one range-addressable resource as parallel
//! byte-range requests and reassembles them in strict offset order.
//!
//! Workers pull a semaphore permit, fetch their assigned span, and push the
//! result into a completion channel. A single collector owns the sink,
//! buffers out-of-order chunks, and only ever writes the longest available
//! prefix, so the sink never needs to seek.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::DownloadError;
use crate::source::SourceManager;

/// One byte span of the resource; `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkTask {
    index: usize,
    start: u64,
    end: u64,
}

/// Downloads a whole resource through parallel ranged requests.
pub struct ChunkedDownloader {
    client: Client,
}

impl ChunkedDownloader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Downloads the resource behind the first usable candidate URL into
    /// `sink`, as `⌈size / chunk_size⌉` ranged requests with at most
    /// `max_concurrency` in flight.
    ///
    /// Candidates are tried in order until one passes the size/range
    /// capability probe; if none does the download fails with `NoSource`.
    /// Bytes reach the sink in ascending offset order regardless of chunk
    /// completion order. Partial output on failure is the caller's to
    /// discard.
    pub async fn download<W>(
        &self,
        ctx: &CancellationToken,
        urls: &[String],
        chunk_size: u64,
        max_concurrency: usize,
        sink: &mut W,
    ) -> Result<(), DownloadError>
    where
        W: AsyncWrite + Unpin,
    {
        if chunk_size == 0 {
            return Err(DownloadError::Url("chunk size must be non-zero".into()));
        }

        let (url, total_size) = self.select_source(ctx, urls).await?;
        let chunks = plan_chunks(total_size, chunk_size);
        debug!(
            url = %url,
            total_size,
            chunk_count = chunks.len(),
            "starting chunked download"
        );

        self.fetch_and_reassemble(ctx, &url, chunks, max_concurrency.max(1), sink)
            .await
    }

    /// Probes candidates in order and returns the first `(url, size)` that
    /// supports ranged access.
    async fn select_source(
        &self,
        ctx: &CancellationToken,
        urls: &[String],
    ) -> Result<(String, u64), DownloadError> {
        let mut sources = SourceManager::from_urls(urls.iter().cloned());
        if sources.is_empty() {
            return Err(DownloadError::NoSource("no candidate URLs".into()));
        }

        let candidates: Vec<String> = sources.candidates().map(|s| s.url.clone()).collect();
        let mut last_failure = String::new();
        for url in candidates {
            match self.probe(ctx, &url).await {
                Ok(size) => return Ok((url, size)),
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(e) => {
                    warn!(url = %url, error = %e, "candidate failed size probe");
                    last_failure = format!("{url}: {e}");
                    sources.mark_failed(&url);
                }
            }
        }
        Err(DownloadError::NoSource(last_failure))
    }

    /// Determines the total resource size, first strategy to succeed wins:
    /// HEAD, then a ranged GET for `bytes=0-0`, then a plain GET.
    async fn probe(&self, ctx: &CancellationToken, url: &str) -> Result<u64, DownloadError> {
        match self.probe_head(ctx, url).await {
            Ok(size) => return Ok(size),
            Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
            Err(e) => debug!(url, error = %e, "HEAD probe failed, trying ranged GET"),
        }
        match self.probe_ranged(ctx, url).await {
            Ok(size) => return Ok(size),
            Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
            Err(e) => debug!(url, error = %e, "ranged probe failed, trying full GET"),
        }
        self.probe_full(ctx, url).await
    }

    /// HEAD: usable when the server reports a positive content length and
    /// advertises byte-range support.
    async fn probe_head(&self, ctx: &CancellationToken, url: &str) -> Result<u64, DownloadError> {
        let response = send_cancellable(ctx, self.client.head(url)).await?;
        if !response.status().is_success() {
            return Err(DownloadError::Status(response.status()));
        }
        let size = header_content_length(&response)
            .ok_or_else(|| DownloadError::Probe("missing content length".into()))?;
        if size == 0 {
            return Err(DownloadError::Probe("zero-length resource".into()));
        }
        if !accepts_byte_ranges(&response) {
            return Err(DownloadError::Probe("no byte-range support advertised".into()));
        }
        Ok(size)
    }

    /// Ranged GET for `bytes=0-0`: usable when the server answers with
    /// partial content and a `Content-Range` total.
    async fn probe_ranged(&self, ctx: &CancellationToken, url: &str) -> Result<u64, DownloadError> {
        let request = self.client.get(url).header(RANGE, "bytes=0-0");
        let response = send_cancellable(ctx, request).await?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::Status(response.status()));
        }
        let size = content_range_total(&response)
            .ok_or_else(|| DownloadError::Probe("missing Content-Range total".into()))?;
        if size == 0 {
            return Err(DownloadError::Probe("zero-length resource".into()));
        }
        Ok(size)
    }

    /// Plain GET: accepted only when the server both reports a positive
    /// content length and advertises byte-range support. The body is
    /// discarded; only the headers matter.
    async fn probe_full(&self, ctx: &CancellationToken, url: &str) -> Result<u64, DownloadError> {
        let response = send_cancellable(ctx, self.client.get(url)).await?;
        if !response.status().is_success() {
            return Err(DownloadError::Status(response.status()));
        }
        let size = header_content_length(&response)
            .ok_or_else(|| DownloadError::Probe("missing content length".into()))?;
        if size == 0 || !accepts_byte_ranges(&response) {
            return Err(DownloadError::Probe(
                "server does not support ranged downloads".into(),
            ));
        }
        Ok(size)
    }

    async fn fetch_and_reassemble<W>(
        &self,
        ctx: &CancellationToken,
        url: &str,
        chunks: Vec<ChunkTask>,
        max_concurrency: usize,
        sink: &mut W,
    ) -> Result<(), DownloadError>
    where
        W: AsyncWrite + Unpin,
    {
        let expected = chunks.len();
        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let (completion_tx, mut completion_rx) =
            mpsc::channel::<(usize, Result<Bytes, DownloadError>)>(max_concurrency);
        let worker_token = ctx.child_token();

        for task in chunks {
            let semaphore = Arc::clone(&semaphore);
            let tx = completion_tx.clone();
            let client = self.client.clone();
            let url = url.to_owned();
            let token = worker_token.clone();
            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                if token.is_cancelled() {
                    return;
                }
                let result = fetch_chunk(&client, &token, &url, task).await;
                let _ = tx.send((task.index, result)).await;
            });
        }
        drop(completion_tx);

        // Sole writer of the sink: drain completions, hold back anything
        // out of order, flush the longest prefix starting at next_index.
        let mut pending: BTreeMap<usize, Bytes> = BTreeMap::new();
        let mut next_index = 0usize;
        let result = loop {
            if next_index == expected {
                break Ok(());
            }
            let message = tokio::select! {
                biased;
                _ = ctx.cancelled() => break Err(DownloadError::Cancelled),
                message = completion_rx.recv() => message,
            };
            let Some((index, completion)) = message else {
                break Err(DownloadError::Incomplete {
                    expected,
                    flushed: next_index,
                });
            };
            match completion {
                Ok(data) => {
                    pending.insert(index, data);
                    let mut write_error = None;
                    while let Some(data) = pending.remove(&next_index) {
                        if let Err(e) = sink.write_all(&data).await {
                            write_error = Some(e);
                            break;
                        }
                        next_index += 1;
                    }
                    if let Some(e) = write_error {
                        break Err(DownloadError::Io(e));
                    }
                }
                Err(DownloadError::Cancelled) => break Err(DownloadError::Cancelled),
                Err(e) => {
                    break Err(DownloadError::Chunk {
                        index,
                        reason: e.to_string(),
                    });
                }
            }
        };

        // Stop in-flight workers before surfacing the outcome.
        worker_token.cancel();
        result?;
        sink.flush().await?;
        Ok(())
    }
}

/// Splits `total_size` into `⌈total_size / chunk_size⌉` inclusive ranges.
fn plan_chunks(total_size: u64, chunk_size: u64) -> Vec<ChunkTask> {
    let mut chunks = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
    let mut start = 0u64;
    let mut index = 0usize;
    while start < total_size {
        let end = (start + chunk_size - 1).min(total_size - 1);
        chunks.push(ChunkTask { index, start, end });
        start = end + 1;
        index += 1;
    }
    chunks
}

async fn fetch_chunk(
    client: &Client,
    token: &CancellationToken,
    url: &str,
    task: ChunkTask,
) -> Result<Bytes, DownloadError> {
    let request = client
        .get(url)
        .header(RANGE, format!("bytes={}-{}", task.start, task.end));
    let response = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(DownloadError::Cancelled),
        response = request.send() => response?,
    };
    if response.status() != StatusCode::PARTIAL_CONTENT {
        return Err(DownloadError::Status(response.status()));
    }
    let body = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(DownloadError::Cancelled),
        body = response.bytes() => body?,
    };
    Ok(body)
}

async fn send_cancellable(
    ctx: &CancellationToken,
    request: reqwest::RequestBuilder,
) -> Result<Response, DownloadError> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(DownloadError::Cancelled),
        response = request.send() => Ok(response?),
    }
}

fn header_content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

fn accepts_byte_ranges(response: &Response) -> bool {
    response
        .headers()
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("bytes"))
}

/// Parses the total out of `Content-Range: bytes 0-0/12345`.
fn content_range_total(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split('/').nth(1))
        .and_then(|total| total.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::io::Cursor;
    use std::time::Duration;

    fn test_data(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 251) as u8).collect()
    }

    fn downloader() -> ChunkedDownloader {
        ChunkedDownloader::new(Client::new())
    }

    #[test]
    fn plans_ceil_of_size_over_chunk_size() {
        let chunks = plan_chunks(25, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!((chunks[0].start, chunks[0].end), (0, 9));
        assert_eq!((chunks[1].start, chunks[1].end), (10, 19));
        assert_eq!((chunks[2].start, chunks[2].end), (20, 24));

        let chunks = plan_chunks(10, 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].start, chunks[0].end), (0, 9));
    }

    /// Mounts one 206 mock per chunk of `data`, optionally delaying each
    /// chunk so completions arrive in reverse order.
    fn mount_range_mocks(server: &MockServer, path: &str, data: &[u8], chunk_size: u64, stagger: bool) {
        let chunks = plan_chunks(data.len() as u64, chunk_size);
        let count = chunks.len();
        for task in chunks {
            let body = data[task.start as usize..=task.end as usize].to_vec();
            let delay = if stagger {
                Duration::from_millis(((count - task.index) * 40) as u64)
            } else {
                Duration::ZERO
            };
            server.mock(|when, then| {
                when.method(GET)
                    .path(path)
                    .header("range", format!("bytes={}-{}", task.start, task.end));
                then.status(206)
                    .header(
                        "content-range",
                        format!("bytes {}-{}/{}", task.start, task.end, data.len()),
                    )
                    .delay(delay)
                    .body(body);
            });
        }
    }

    #[tokio::test]
    async fn downloads_and_reassembles_in_offset_order() {
        let data = test_data(100);
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::HEAD).path("/video.mp4");
            then.status(200)
                .header("content-length", data.len().to_string())
                .header("accept-ranges", "bytes");
        });
        // Reverse completion order: the first chunk is the slowest.
        mount_range_mocks(&server, "/video.mp4", &data, 40, true);

        let mut sink = Cursor::new(Vec::new());
        downloader()
            .download(
                &CancellationToken::new(),
                &[server.url("/video.mp4")],
                40,
                4,
                &mut sink,
            )
            .await
            .unwrap();
        assert_eq!(sink.into_inner(), data);
    }

    #[tokio::test]
    async fn probe_falls_back_to_ranged_get() {
        let data = test_data(64);
        let server = MockServer::start();
        // No HEAD mock: the HEAD probe gets a 404 and falls through.
        server.mock(|when, then| {
            when.method(GET).path("/clip.bin").header("range", "bytes=0-0");
            then.status(206)
                .header("content-range", format!("bytes 0-0/{}", data.len()))
                .body(vec![data[0]]);
        });
        mount_range_mocks(&server, "/clip.bin", &data, 32, false);

        let mut sink = Cursor::new(Vec::new());
        downloader()
            .download(
                &CancellationToken::new(),
                &[server.url("/clip.bin")],
                32,
                2,
                &mut sink,
            )
            .await
            .unwrap();
        assert_eq!(sink.into_inner(), data);
    }

    #[tokio::test]
    async fn probe_accepts_full_get_with_range_support() {
        let data = test_data(16);
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/file");
            then.status(200)
                .header("accept-ranges", "bytes")
                .body(data.clone());
        });

        let size = downloader()
            .probe(&CancellationToken::new(), &server.url("/file"))
            .await
            .unwrap();
        assert_eq!(size, data.len() as u64);
    }

    #[tokio::test]
    async fn falls_back_to_next_mirror_when_probe_fails() {
        let data = test_data(48);
        let server = MockServer::start();
        // First mirror: nothing mounted, every probe strategy 404s.
        server.mock(|when, then| {
            when.method(httpmock::Method::HEAD).path("/mirror-b");
            then.status(200)
                .header("content-length", data.len().to_string())
                .header("accept-ranges", "bytes");
        });
        mount_range_mocks(&server, "/mirror-b", &data, 16, false);

        let mut sink = Cursor::new(Vec::new());
        downloader()
            .download(
                &CancellationToken::new(),
                &[server.url("/mirror-a"), server.url("/mirror-b")],
                16,
                3,
                &mut sink,
            )
            .await
            .unwrap();
        assert_eq!(sink.into_inner(), data);
    }

    #[tokio::test]
    async fn all_candidates_failing_probe_is_no_source() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::HEAD).path("/empty");
            then.status(200)
                .header("content-length", "0")
                .header("accept-ranges", "bytes");
        });

        let err = downloader()
            .download(
                &CancellationToken::new(),
                &[server.url("/empty")],
                16,
                2,
                &mut Cursor::new(Vec::new()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::NoSource(_)));
    }

    #[tokio::test]
    async fn empty_candidate_list_is_no_source() {
        let err = downloader()
            .download(
                &CancellationToken::new(),
                &[],
                16,
                2,
                &mut Cursor::new(Vec::new()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::NoSource(_)));
    }

    #[tokio::test]
    async fn non_partial_chunk_response_aborts_download() {
        let data = test_data(60);
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::HEAD).path("/broken");
            then.status(200)
                .header("content-length", data.len().to_string())
                .header("accept-ranges", "bytes");
        });
        // First two chunks answer correctly, the third comes back 200.
        for task in plan_chunks(60, 20).into_iter().take(2) {
            let body = data[task.start as usize..=task.end as usize].to_vec();
            server.mock(|when, then| {
                when.method(GET)
                    .path("/broken")
                    .header("range", format!("bytes={}-{}", task.start, task.end));
                then.status(206)
                    .header("content-range", format!("bytes {}-{}/60", task.start, task.end))
                    .body(body);
            });
        }
        server.mock(|when, then| {
            when.method(GET).path("/broken").header("range", "bytes=40-59");
            then.status(200).body(data[40..].to_vec());
        });

        let err = downloader()
            .download(
                &CancellationToken::new(),
                &[server.url("/broken")],
                20,
                3,
                &mut Cursor::new(Vec::new()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Chunk { index: 2, .. }));
    }

    #[tokio::test]
    async fn cancellation_is_terminal() {
        let data = test_data(40);
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::HEAD).path("/slow");
            then.status(200)
                .header("content-length", data.len().to_string())
                .header("accept-ranges", "bytes");
        });
        server.mock(|when, then| {
            when.method(GET).path("/slow");
            then.status(206)
                .header("content-range", "bytes 0-39/40")
                .delay(Duration::from_secs(5))
                .body(data.clone());
        });

        let ctx = CancellationToken::new();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = downloader()
            .download(
                &ctx,
                &[server.url("/slow")],
                40,
                1,
                &mut Cursor::new(Vec::new()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
    }
}
