use std::sync::Arc;

use crate::hls::cipher::CipherError;

/// Errors produced by the HLS side of the engine: playlist parsing,
/// segment fetching, and decryption.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HlsError {
    #[error("playlist error: {0}")]
    Playlist(String),

    #[error("unsupported playlist structure at {0}")]
    UnsupportedPlaylist(String),

    #[error("master playlist {0} has no variants")]
    NoVariants(String),

    #[error("unsupported key method {method} declared by {url}")]
    UnsupportedKeyMethod { url: String, method: String },

    #[error("decryption key fetched from {url} has {length} bytes, expected 16")]
    KeyLength { url: String, length: usize },

    #[error("network error: {source}")]
    Network {
        #[from]
        source: Arc<reqwest::Error>,
    },

    #[error("segment {index} fetch failed: {reason}")]
    SegmentFetch { index: usize, reason: String },

    #[error("initialization segment fetch failed: {0}")]
    InitSegmentFetch(String),

    #[error("segment {index} decryption failed: {source}")]
    Decrypt {
        index: usize,
        #[source]
        source: CipherError,
    },

    #[error("no segments to download")]
    EmptySegmentList,

    #[error("expected {expected} segments, only {received} completed")]
    Incomplete { expected: usize, received: usize },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: Arc<std::io::Error>,
    },

    #[error("operation cancelled")]
    Cancelled,
}

// Arc-wrapped so the enum stays Clone; same shape the rest of the engine
// uses for reqwest/io sources.
impl From<reqwest::Error> for HlsError {
    fn from(err: reqwest::Error) -> Self {
        HlsError::Network {
            source: Arc::new(err),
        }
    }
}

impl From<std::io::Error> for HlsError {
    fn from(err: std::io::Error) -> Self {
        HlsError::Io {
            source: Arc::new(err),
        }
    }
}
