//! # fetchkit
//!
//! A library for retrieving remote audio/video/image content and
//! reassembling it into a single local artifact.
//!
//! ## Features
//!
//! - Chunked downloads: one range-addressable resource fetched as parallel
//!   byte-range requests, written out in strict offset order
//! - HLS support: master/media playlist parsing with variant and
//!   alternative-rendition resolution, segmented downloads, and AES-128
//!   segment decryption
//! - Mirror fallback across candidate source URLs
//! - Explicit cancellation and bounded concurrency on every operation

pub mod builder;
pub mod chunked;
pub mod client;
pub mod config;
pub mod error;
pub mod format;
pub mod hls;
pub mod source;

pub use builder::DownloaderConfigBuilder;
pub use chunked::ChunkedDownloader;
pub use client::create_client;
pub use config::{DownloaderConfig, RequestOptions};
pub use error::DownloadError;
pub use format::{
    AudioCodec, DecryptionParameters, EncryptionMethod, FormatDescriptor, MediaKind, VideoCodec,
};
pub use hls::{HlsError, PlaylistParser, SegmentedDownloader};
pub use source::{ContentSource, SourceManager};
