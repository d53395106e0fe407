use reqwest::StatusCode;

use crate::hls::HlsError;

/// Top-level error type for download operations.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    Url(String),

    #[error("server returned status code {0}")]
    Status(StatusCode),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// One probe strategy failed to establish size/range capability.
    #[error("size probe failed: {0}")]
    Probe(String),

    /// Every candidate URL failed the size/range-capability probe.
    #[error("no usable source: {0}")]
    NoSource(String),

    /// A single chunk failed, aborting the whole download.
    #[error("chunk {index} failed: {reason}")]
    Chunk { index: usize, reason: String },

    /// The completion channel closed before every expected chunk arrived.
    #[error("expected {expected} chunks, only {flushed} were flushed")]
    Incomplete { expected: usize, flushed: usize },

    #[error("operation cancelled")]
    Cancelled,

    #[error("HLS error: {0}")]
    Hls(#[from] HlsError),
}
