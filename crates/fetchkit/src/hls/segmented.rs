//! Segmented downloader: fetches independently-addressed media segments,
//! optionally decrypts them, and concatenates them in sequence order.
//!
//! Segments download into private staging buffers owned by their worker, so
//! out-of-order arrivals never touch the sink. Decryption happens after all
//! downloads succeed, into fresh buffers that replace the staged ones; only
//! then does the collector write init segment and media segments in
//! ascending ordinal order.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::format::DecryptionParameters;
use crate::hls::HlsError;
use crate::hls::cipher;

/// Fetches one segment's bytes. The HTTP implementation lives in
/// [`HttpSegmentSource`]; tests substitute their own.
#[async_trait]
pub trait SegmentSource: Send + Sync + 'static {
    async fn fetch(&self, ctx: &CancellationToken, url: &str) -> Result<Bytes, HlsError>;
}

/// Plain-GET segment source requiring a success status.
pub struct HttpSegmentSource {
    client: Client,
}

impl HttpSegmentSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SegmentSource for HttpSegmentSource {
    async fn fetch(&self, ctx: &CancellationToken, url: &str) -> Result<Bytes, HlsError> {
        let response = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(HlsError::Cancelled),
            response = self.client.get(url).send() => response.map_err(HlsError::from)?,
        };
        if !response.status().is_success() {
            return Err(HlsError::Playlist(format!(
                "segment fetch from {url} returned HTTP {}",
                response.status()
            )));
        }
        let body = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(HlsError::Cancelled),
            body = response.bytes() => body.map_err(HlsError::from)?,
        };
        debug!(url, bytes = body.len(), "segment downloaded");
        Ok(body)
    }
}

/// Downloads a segment list into a single concatenated stream.
pub struct SegmentedDownloader {
    source: Arc<dyn SegmentSource>,
}

impl SegmentedDownloader {
    pub fn new(client: Client) -> Self {
        Self {
            source: Arc::new(HttpSegmentSource::new(client)),
        }
    }

    /// Uses a custom segment source instead of plain HTTP GETs.
    pub fn with_source(source: Arc<dyn SegmentSource>) -> Self {
        Self { source }
    }

    /// Downloads `segments` (preceded by `init_segment` when given) into
    /// `sink`, decrypting each staged segment first when `decryption` is
    /// present. At most `max_concurrency` segment fetches run at once.
    ///
    /// Output order is always: init segment, then media segments by
    /// ascending ordinal, regardless of completion order. Any segment
    /// failure aborts the whole operation with the failing index.
    pub async fn download<W>(
        &self,
        ctx: &CancellationToken,
        segments: &[String],
        init_segment: Option<&str>,
        decryption: Option<&DecryptionParameters>,
        max_concurrency: usize,
        sink: &mut W,
    ) -> Result<(), HlsError>
    where
        W: AsyncWrite + Unpin,
    {
        if segments.is_empty() {
            return Err(HlsError::EmptySegmentList);
        }

        let init_data = match init_segment {
            Some(url) => Some(self.source.fetch(ctx, url).await.map_err(|e| match e {
                HlsError::Cancelled => HlsError::Cancelled,
                other => HlsError::InitSegmentFetch(other.to_string()),
            })?),
            None => None,
        };

        let mut staged = self.stage_segments(ctx, segments, max_concurrency.max(1)).await?;

        if let Some(params) = decryption {
            for (index, data) in staged.iter_mut() {
                let sequence = params.media_sequence + *index as u64;
                let plaintext = cipher::decrypt_segment(&params.key, &params.iv, sequence, data)
                    .map_err(|source| HlsError::Decrypt {
                        index: *index,
                        source,
                    })?;
                // Staging-then-commit: the staged ciphertext is only
                // replaced once the whole segment decrypted cleanly.
                *data = Bytes::from(plaintext);
            }
        }

        if let Some(init) = init_data {
            sink.write_all(&init).await?;
        }
        for (_, data) in staged {
            sink.write_all(&data).await?;
        }
        sink.flush().await?;
        Ok(())
    }

    /// Fans segment fetches out over a bounded worker pool and collects
    /// every staged buffer, keyed by ordinal.
    async fn stage_segments(
        &self,
        ctx: &CancellationToken,
        segments: &[String],
        max_concurrency: usize,
    ) -> Result<BTreeMap<usize, Bytes>, HlsError> {
        let expected = segments.len();
        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let (completion_tx, mut completion_rx) =
            mpsc::channel::<(usize, Result<Bytes, HlsError>)>(max_concurrency);
        let worker_token = ctx.child_token();

        for (index, url) in segments.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let source = Arc::clone(&self.source);
            let tx = completion_tx.clone();
            let url = url.clone();
            let token = worker_token.clone();
            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                if token.is_cancelled() {
                    return;
                }
                let result = source.fetch(&token, &url).await;
                let _ = tx.send((index, result)).await;
            });
        }
        drop(completion_tx);

        let mut staged: BTreeMap<usize, Bytes> = BTreeMap::new();
        let result = loop {
            if staged.len() == expected {
                break Ok(());
            }
            let message = tokio::select! {
                biased;
                _ = ctx.cancelled() => break Err(HlsError::Cancelled),
                message = completion_rx.recv() => message,
            };
            let Some((index, completion)) = message else {
                break Err(HlsError::Incomplete {
                    expected,
                    received: staged.len(),
                });
            };
            match completion {
                Ok(data) => {
                    staged.insert(index, data);
                }
                Err(HlsError::Cancelled) => break Err(HlsError::Cancelled),
                Err(e) => {
                    break Err(HlsError::SegmentFetch {
                        index,
                        reason: e.to_string(),
                    });
                }
            }
        };

        worker_token.cancel();
        result.map(|_| staged)
    }
}
