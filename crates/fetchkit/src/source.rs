//! Mirror management for downloads with more than one candidate URL.
//!
//! Candidates are tried in priority order; a candidate that fails its
//! capability probe is marked inactive and never retried within the same
//! operation.

use tracing::debug;

/// A content source (URL) with a priority; lower numbers are tried first.
#[derive(Debug, Clone)]
pub struct ContentSource {
    pub url: String,
    pub priority: u8,
}

impl ContentSource {
    pub fn new(url: impl Into<String>, priority: u8) -> Self {
        Self {
            url: url.into(),
            priority,
        }
    }
}

/// Ordered set of fallback mirrors for one download.
#[derive(Debug, Default)]
pub struct SourceManager {
    sources: Vec<(ContentSource, bool)>,
}

impl SourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a manager from URLs in argument order: the first URL gets the
    /// highest priority.
    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut manager = Self::new();
        for (i, url) in urls.into_iter().enumerate() {
            manager.add_source(ContentSource::new(url, i.min(u8::MAX as usize) as u8));
        }
        manager
    }

    pub fn add_source(&mut self, source: ContentSource) {
        self.sources.push((source, true));
        self.sources.sort_by_key(|(s, _)| s.priority);
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Active candidates in priority order.
    pub fn candidates(&self) -> impl Iterator<Item = &ContentSource> {
        self.sources
            .iter()
            .filter(|(_, active)| *active)
            .map(|(s, _)| s)
    }

    /// Marks a source as failed so later fallback passes skip it.
    pub fn mark_failed(&mut self, url: &str) {
        for (source, active) in &mut self.sources {
            if source.url == url && *active {
                debug!(url = %source.url, "source marked as failed");
                *active = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_follow_argument_order() {
        let manager = SourceManager::from_urls(["https://a/v.mp4", "https://b/v.mp4"]);
        let urls: Vec<_> = manager.candidates().map(|s| s.url.as_str()).collect();
        assert_eq!(urls, ["https://a/v.mp4", "https://b/v.mp4"]);
    }

    #[test]
    fn failed_sources_are_skipped() {
        let mut manager = SourceManager::from_urls(["https://a/v.mp4", "https://b/v.mp4"]);
        manager.mark_failed("https://a/v.mp4");
        let urls: Vec<_> = manager.candidates().map(|s| s.url.as_str()).collect();
        assert_eq!(urls, ["https://b/v.mp4"]);
    }
}
