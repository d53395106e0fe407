//! Format descriptors: the normalized output of playlist parsing and the
//! input handed to the downloaders.

use serde::{Deserialize, Serialize};

use crate::hls::cipher::{self, CipherError};

/// What kind of media a format carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Photo,
}

/// Video codec families recognized from HLS codec strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Vp9,
    Av1,
}

/// Audio codec families recognized from HLS codec strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Opus,
    Mp3,
    Ac3,
}

/// Encryption scheme declared by a media playlist.
///
/// HLS only mandates AES-128 in CBC mode for full-segment encryption, and
/// that is the only method this engine decrypts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionMethod {
    Aes128Cbc,
}

impl std::fmt::Display for EncryptionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncryptionMethod::Aes128Cbc => write!(f, "AES-128-CBC"),
        }
    }
}

/// Key material and IV base for decrypting the segments of one media
/// playlist. Built once by the playlist parser, read-only afterward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionParameters {
    pub method: EncryptionMethod,
    /// Raw AES-128 key, exactly 16 bytes.
    pub key: Vec<u8>,
    /// Base initialization vector, exactly 16 bytes.
    pub iv: Vec<u8>,
    /// Media-sequence number of the playlist's first segment. A segment's
    /// absolute sequence is `media_sequence + ordinal`.
    pub media_sequence: u64,
}

impl DecryptionParameters {
    /// Creates validated parameters. Key and IV must both be exactly
    /// [`cipher::BLOCK_SIZE`] bytes.
    pub fn new(key: Vec<u8>, iv: Vec<u8>, media_sequence: u64) -> Result<Self, CipherError> {
        if key.len() != cipher::BLOCK_SIZE {
            return Err(CipherError::InvalidKeyLength(key.len()));
        }
        if iv.len() != cipher::BLOCK_SIZE {
            return Err(CipherError::InvalidIvLength(iv.len()));
        }
        Ok(Self {
            method: EncryptionMethod::Aes128Cbc,
            key,
            iv,
            media_sequence,
        })
    }
}

/// One downloadable rendition of a piece of content.
///
/// A descriptor is either *direct* (`segments` empty, one or more
/// whole-resource URLs in `urls`, fed to the chunked downloader) or
/// *segmented* (`segments` non-empty, fed to the segmented downloader).
/// For segmented formats `urls` holds the playlist URL the descriptor was
/// resolved from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    /// Format identifier, e.g. `"hls"` or `"hls-1280"`.
    pub id: String,
    pub kind: MediaKind,
    pub video_codec: Option<VideoCodec>,
    pub audio_codec: Option<AudioCodec>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Declared bandwidth in bits per second.
    pub bitrate: Option<u64>,
    /// Total duration in seconds.
    pub duration: Option<f64>,
    /// Candidate source URLs, tried in order as mirrors.
    pub urls: Vec<String>,
    /// Ordered absolute segment URLs; empty for direct formats.
    pub segments: Vec<String>,
    /// Absolute URL of the initialization segment, if the playlist declares
    /// one (fragmented MP4 renditions).
    pub init_segment: Option<String>,
    pub decryption: Option<DecryptionParameters>,
}

impl FormatDescriptor {
    /// Creates a direct (non-segmented) descriptor for a whole resource.
    pub fn direct(id: impl Into<String>, kind: MediaKind, urls: Vec<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            video_codec: None,
            audio_codec: None,
            width: None,
            height: None,
            bitrate: None,
            duration: None,
            urls,
            segments: Vec::new(),
            init_segment: None,
            decryption: None,
        }
    }

    pub fn is_segmented(&self) -> bool {
        !self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decryption_parameters_validate_lengths() {
        assert!(matches!(
            DecryptionParameters::new(vec![0u8; 15], vec![0u8; 16], 0),
            Err(CipherError::InvalidKeyLength(15))
        ));
        assert!(matches!(
            DecryptionParameters::new(vec![0u8; 16], vec![0u8; 17], 0),
            Err(CipherError::InvalidIvLength(17))
        ));

        let params = DecryptionParameters::new(vec![1u8; 16], vec![2u8; 16], 42).unwrap();
        assert_eq!(params.method, EncryptionMethod::Aes128Cbc);
        assert_eq!(params.media_sequence, 42);
    }

    #[test]
    fn direct_descriptor_is_not_segmented() {
        let fmt = FormatDescriptor::direct(
            "source",
            MediaKind::Video,
            vec!["https://cdn.example/video.mp4".into()],
        );
        assert!(!fmt.is_segmented());
        assert!(fmt.decryption.is_none());
    }
}
