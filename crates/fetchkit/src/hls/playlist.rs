//! HLS playlist parser: turns a master or media playlist into normalized
//! [`FormatDescriptor`]s, recursively resolving variant streams and
//! alternative audio renditions.

use std::collections::HashSet;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use m3u8_rs::{AlternativeMediaType, Key, KeyMethod, MasterPlaylist, MediaPlaylist, VariantStream};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::RequestOptions;
use crate::format::{
    AudioCodec, DecryptionParameters, FormatDescriptor, MediaKind, VideoCodec,
};
use crate::hls::HlsError;

/// Fixed cap on simultaneous in-flight sub-playlist fetches; exceeding it
/// queues rather than failing.
const PLAYLIST_FETCH_CONCURRENCY: usize = 4;

/// Variants and alternatives reference leaf media playlists, so anything
/// nested deeper than this is malformed.
const MAX_PLAYLIST_DEPTH: usize = 2;

/// Parses playlists fetched over HTTP into format descriptors.
pub struct PlaylistParser {
    client: Client,
}

impl PlaylistParser {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Fetches and parses the playlist at `url`.
    ///
    /// A media playlist yields exactly one descriptor; a master playlist
    /// yields one descriptor per audio alternative rendition followed by
    /// one per variant stream. Relative URIs resolve against the final
    /// (post-redirect) response URL.
    pub async fn parse(
        &self,
        ctx: &CancellationToken,
        url: &str,
        options: Option<&RequestOptions>,
    ) -> Result<Vec<FormatDescriptor>, HlsError> {
        let url = Url::parse(url)
            .map_err(|e| HlsError::Playlist(format!("invalid playlist URL {url}: {e}")))?;
        self.parse_at_depth(ctx, url, options, 0).await
    }

    fn parse_at_depth<'a>(
        &'a self,
        ctx: &'a CancellationToken,
        url: Url,
        options: Option<&'a RequestOptions>,
        depth: usize,
    ) -> BoxFuture<'a, Result<Vec<FormatDescriptor>, HlsError>> {
        Box::pin(async move {
            if depth > MAX_PLAYLIST_DEPTH {
                return Err(HlsError::Playlist(format!(
                    "playlist nesting exceeds depth {MAX_PLAYLIST_DEPTH} at {url}"
                )));
            }
            let (document_url, body) = self.fetch_document(ctx, url, options).await?;
            match m3u8_rs::parse_playlist_res(&body) {
                Ok(m3u8_rs::Playlist::MediaPlaylist(playlist)) => {
                    let descriptor = self
                        .media_descriptor(ctx, &playlist, &document_url, options)
                        .await?;
                    Ok(vec![descriptor])
                }
                Ok(m3u8_rs::Playlist::MasterPlaylist(playlist)) => {
                    self.master_descriptors(ctx, &playlist, &document_url, options, depth)
                        .await
                }
                Err(_) => Err(HlsError::UnsupportedPlaylist(document_url.to_string())),
            }
        })
    }

    /// Media playlist: one descriptor with the full segment list and, when
    /// the playlist declares a key, fetched decryption parameters.
    async fn media_descriptor(
        &self,
        ctx: &CancellationToken,
        playlist: &MediaPlaylist,
        document_url: &Url,
        options: Option<&RequestOptions>,
    ) -> Result<FormatDescriptor, HlsError> {
        let mut descriptor = build_media_descriptor(playlist, document_url)?;
        if let Some(key) = playlist.segments.iter().find_map(|s| s.key.as_ref()) {
            descriptor.decryption = self
                .decryption_parameters(ctx, key, playlist.media_sequence, document_url, options)
                .await?;
        }
        debug!(
            url = %document_url,
            segments = descriptor.segments.len(),
            encrypted = descriptor.decryption.is_some(),
            "parsed media playlist"
        );
        Ok(descriptor)
    }

    /// Master playlist: audio alternatives first (first occurrence per
    /// group id wins), then variants, both resolved through a bounded
    /// fan-out of recursive sub-playlist parses.
    async fn master_descriptors(
        &self,
        ctx: &CancellationToken,
        playlist: &MasterPlaylist,
        document_url: &Url,
        options: Option<&RequestOptions>,
        depth: usize,
    ) -> Result<Vec<FormatDescriptor>, HlsError> {
        if playlist.variants.is_empty() {
            return Err(HlsError::NoVariants(document_url.to_string()));
        }

        let alternative_futures: Vec<_> = audio_alternatives(playlist)
            .into_iter()
            .map(|alt| self.resolve_alternative(ctx, alt, document_url, options, depth))
            .collect();
        let mut descriptors: Vec<FormatDescriptor> = stream::iter(alternative_futures)
            .buffered(PLAYLIST_FETCH_CONCURRENCY)
            .try_collect()
            .await?;

        let variant_futures: Vec<_> = playlist
            .variants
            .iter()
            .filter(|v| !v.is_i_frame)
            .map(|variant| self.resolve_variant(ctx, variant, document_url, options, depth))
            .collect();
        let variants: Vec<FormatDescriptor> = stream::iter(variant_futures)
            .buffered(PLAYLIST_FETCH_CONCURRENCY)
            .try_collect()
            .await?;

        descriptors.extend(variants);
        Ok(descriptors)
    }

    /// Resolves one audio alternative rendition. Alternatives are leaves;
    /// a failed recursive parse here is terminal, unlike for variants.
    async fn resolve_alternative(
        &self,
        ctx: &CancellationToken,
        alternative: AudioAlternative,
        document_url: &Url,
        options: Option<&RequestOptions>,
        depth: usize,
    ) -> Result<FormatDescriptor, HlsError> {
        let url = resolve_uri(document_url, &alternative.uri)?;
        let mut descriptor = FormatDescriptor::direct("hls", MediaKind::Audio, vec![url.to_string()]);
        descriptor.audio_codec = alternative.codec;

        let children = self
            .parse_at_depth(ctx, url.clone(), options, depth + 1)
            .await?;
        let child = children.into_iter().next().ok_or_else(|| {
            HlsError::Playlist(format!("alternative rendition {url} yielded no formats"))
        })?;
        merge_child(&mut descriptor, child);
        Ok(descriptor)
    }

    /// Resolves one variant stream. A failed recursive parse degrades to
    /// the master-level metadata instead of failing the whole parse.
    async fn resolve_variant(
        &self,
        ctx: &CancellationToken,
        variant: &VariantStream,
        document_url: &Url,
        options: Option<&RequestOptions>,
        depth: usize,
    ) -> Result<FormatDescriptor, HlsError> {
        let url = resolve_uri(document_url, &variant.uri)?;
        let mut descriptor = descriptor_from_variant(variant, &url);

        match self
            .parse_at_depth(ctx, url.clone(), options, depth + 1)
            .await
        {
            Ok(children) => {
                if let Some(child) = children.into_iter().next() {
                    merge_child(&mut descriptor, child);
                }
            }
            Err(HlsError::Cancelled) => return Err(HlsError::Cancelled),
            Err(e) => {
                warn!(
                    url = %url,
                    error = %e,
                    "variant playlist parse failed, keeping master-level metadata"
                );
            }
        }
        Ok(descriptor)
    }

    /// Builds [`DecryptionParameters`] from a playlist key directive:
    /// fetches the key resource and parses the hexadecimal IV.
    async fn decryption_parameters(
        &self,
        ctx: &CancellationToken,
        key: &Key,
        media_sequence: u64,
        document_url: &Url,
        options: Option<&RequestOptions>,
    ) -> Result<Option<DecryptionParameters>, HlsError> {
        match &key.method {
            KeyMethod::AES128 => {}
            KeyMethod::None => return Ok(None),
            other => {
                return Err(HlsError::UnsupportedKeyMethod {
                    url: document_url.to_string(),
                    method: format!("{other:?}"),
                });
            }
        }
        let key_uri = key.uri.as_deref().ok_or_else(|| {
            HlsError::Playlist(format!("key directive in {document_url} has no URI"))
        })?;
        let key_url = resolve_uri(document_url, key_uri)?;

        let key_bytes = self.fetch_bytes(ctx, &key_url, options).await?;
        if key_bytes.len() != 16 {
            return Err(HlsError::KeyLength {
                url: key_url.to_string(),
                length: key_bytes.len(),
            });
        }

        let iv = match key.iv.as_deref() {
            Some(iv_hex) => parse_iv(iv_hex)?,
            None => [0u8; 16],
        };

        let params = DecryptionParameters::new(key_bytes.to_vec(), iv.to_vec(), media_sequence)
            .map_err(|e| HlsError::Playlist(format!("invalid decryption parameters: {e}")))?;
        Ok(Some(params))
    }

    /// Fetches a playlist document, returning the final response URL for
    /// relative-URI resolution alongside the body.
    async fn fetch_document(
        &self,
        ctx: &CancellationToken,
        url: Url,
        options: Option<&RequestOptions>,
    ) -> Result<(Url, Bytes), HlsError> {
        let mut request = self.client.get(url.clone());
        if let Some(options) = options {
            request = options.apply(request);
        }
        let response = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(HlsError::Cancelled),
            response = request.send() => response.map_err(HlsError::from)?,
        };
        if !response.status().is_success() {
            return Err(HlsError::Playlist(format!(
                "failed to fetch playlist {url}: HTTP {}",
                response.status()
            )));
        }
        let final_url = response.url().clone();
        let body = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(HlsError::Cancelled),
            body = response.bytes() => body.map_err(HlsError::from)?,
        };
        Ok((final_url, body))
    }

    async fn fetch_bytes(
        &self,
        ctx: &CancellationToken,
        url: &Url,
        options: Option<&RequestOptions>,
    ) -> Result<Bytes, HlsError> {
        let mut request = self.client.get(url.clone());
        if let Some(options) = options {
            request = options.apply(request);
        }
        let response = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(HlsError::Cancelled),
            response = request.send() => response.map_err(HlsError::from)?,
        };
        if !response.status().is_success() {
            return Err(HlsError::Playlist(format!(
                "failed to fetch {url}: HTTP {}",
                response.status()
            )));
        }
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(HlsError::Cancelled),
            body = response.bytes() => body.map_err(HlsError::from),
        }
    }
}

/// An audio rendition selected from a master playlist, pre-resolution.
#[derive(Debug, Clone)]
struct AudioAlternative {
    uri: String,
    codec: Option<AudioCodec>,
}

/// Selects the audio alternatives to resolve: audio kind only, first
/// occurrence per group id wins, and the codec comes from any variant that
/// references the same group and carries a codec string.
fn audio_alternatives(playlist: &MasterPlaylist) -> Vec<AudioAlternative> {
    let mut seen_groups = HashSet::new();
    let mut alternatives = Vec::new();
    for alternative in &playlist.alternatives {
        if alternative.media_type != AlternativeMediaType::Audio {
            continue;
        }
        let Some(uri) = &alternative.uri else {
            continue;
        };
        if !seen_groups.insert(alternative.group_id.clone()) {
            continue;
        }
        let codec = playlist
            .variants
            .iter()
            .filter(|v| v.audio.as_deref() == Some(alternative.group_id.as_str()))
            .find_map(|v| v.codecs.as_deref().and_then(audio_codec_from_codecs));
        alternatives.push(AudioAlternative {
            uri: uri.clone(),
            codec,
        });
    }
    alternatives
}

/// Builds the master-level descriptor for one variant stream.
fn descriptor_from_variant(variant: &VariantStream, url: &Url) -> FormatDescriptor {
    let codecs = variant.codecs.as_deref().unwrap_or("");
    let video_codec = video_codec_from_codecs(codecs);
    let mut audio_codec = audio_codec_from_codecs(codecs);
    let kind = if video_codec.is_none() && audio_codec.is_some() {
        MediaKind::Audio
    } else {
        MediaKind::Video
    };
    if variant.audio.is_some() {
        // The audio lives in the referenced alternative rendition.
        audio_codec = None;
    }
    let (width, height) = variant
        .resolution
        .map(|r| (r.width as u32, r.height as u32))
        .unzip();

    let mut descriptor = FormatDescriptor::direct(
        format!("hls-{}", variant.bandwidth / 1000),
        kind,
        vec![url.to_string()],
    );
    descriptor.video_codec = video_codec;
    descriptor.audio_codec = audio_codec;
    descriptor.width = width;
    descriptor.height = height;
    descriptor.bitrate = Some(variant.bandwidth);
    descriptor
}

/// Builds the descriptor for a leaf media playlist, minus decryption.
fn build_media_descriptor(
    playlist: &MediaPlaylist,
    document_url: &Url,
) -> Result<FormatDescriptor, HlsError> {
    if playlist.segments.is_empty() {
        return Err(HlsError::Playlist(format!(
            "media playlist {document_url} has no segments"
        )));
    }

    let mut segments = Vec::with_capacity(playlist.segments.len());
    let mut duration = 0f64;
    for segment in &playlist.segments {
        segments.push(resolve_uri(document_url, &segment.uri)?.to_string());
        duration += segment.duration as f64;
    }
    let init_segment = playlist
        .segments
        .iter()
        .find_map(|s| s.map.as_ref())
        .map(|m| resolve_uri(document_url, &m.uri))
        .transpose()?
        .map(|u| u.to_string());

    let mut descriptor =
        FormatDescriptor::direct("hls", MediaKind::Video, vec![document_url.to_string()]);
    descriptor.duration = Some(duration);
    descriptor.segments = segments;
    descriptor.init_segment = init_segment;
    Ok(descriptor)
}

/// Merges data discovered in a nested sub-playlist into its parent
/// descriptor. Child data wins where non-empty; bitrate and resolution
/// deliberately stay the master's.
fn merge_child(parent: &mut FormatDescriptor, child: FormatDescriptor) {
    if !child.segments.is_empty() {
        parent.segments = child.segments;
    }
    if child.init_segment.is_some() {
        parent.init_segment = child.init_segment;
    }
    if child.duration.is_some() {
        parent.duration = child.duration;
    }
    if child.decryption.is_some() {
        parent.decryption = child.decryption;
    }
}

/// Resolves a possibly-relative URI against the playlist's own URL.
fn resolve_uri(base: &Url, uri: &str) -> Result<Url, HlsError> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        Url::parse(uri)
            .map_err(|e| HlsError::Playlist(format!("invalid URI {uri}: {e}")))
    } else {
        base.join(uri).map_err(|e| {
            HlsError::Playlist(format!("could not resolve URI {uri} against {base}: {e}"))
        })
    }
}

/// Parses a playlist IV directive (`0x`-prefixed hexadecimal).
fn parse_iv(iv_hex: &str) -> Result<[u8; 16], HlsError> {
    let trimmed = iv_hex.trim_start_matches("0x").trim_start_matches("0X");
    let mut iv = [0u8; 16];
    hex::decode_to_slice(trimmed, &mut iv)
        .map_err(|e| HlsError::Playlist(format!("failed to parse IV '{iv_hex}': {e}")))?;
    Ok(iv)
}

fn video_codec_from_codecs(codecs: &str) -> Option<VideoCodec> {
    codecs.split(',').map(str::trim).find_map(|token| {
        match token.split('.').next().unwrap_or(token) {
            "avc1" | "avc3" => Some(VideoCodec::H264),
            "hvc1" | "hev1" => Some(VideoCodec::H265),
            "vp09" | "vp9" => Some(VideoCodec::Vp9),
            "av01" => Some(VideoCodec::Av1),
            _ => None,
        }
    })
}

fn audio_codec_from_codecs(codecs: &str) -> Option<AudioCodec> {
    codecs.split(',').map(str::trim).find_map(|token| {
        match token.split('.').next().unwrap_or(token) {
            "mp4a" => Some(AudioCodec::Aac),
            "opus" | "Opus" => Some(AudioCodec::Opus),
            "mp3" => Some(AudioCodec::Mp3),
            "ac-3" | "ec-3" => Some(AudioCodec::Ac3),
            _ => None,
        }
    })
}
