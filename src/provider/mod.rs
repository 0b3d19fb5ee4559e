//! Site-specific discovery and extraction behind one capability trait.

pub mod royalroad;

use std::path::PathBuf;

use scraper::Html;
use url::Url;

use crate::error::{Error, Result};
use crate::extract::{ExtractOptions, ExtractedChapter};
use crate::fetch::{FetchOptions, Fetcher};

pub use royalroad::RoyalRoadProvider;

/// Where a cover image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverSource {
    Remote(Url),
    Local(PathBuf),
}

impl CoverSource {
    /// `http(s)` URLs are remote; anything else is a local path.
    pub fn parse(reference: &str) -> Self {
        match Url::parse(reference) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Self::Remote(url),
            _ => Self::Local(PathBuf::from(reference)),
        }
    }

    pub fn to_reference(&self) -> String {
        match self {
            Self::Remote(url) => url.to_string(),
            Self::Local(path) => path.display().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FictionMeta {
    pub title: String,
    pub author: String,
    pub language: String,
    pub cover: Option<CoverSource>,
}

/// A discovered, not yet fetched chapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterRef {
    /// Provider-local chapter id.
    pub id: String,
    pub url: Url,
    pub title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Fiction {
    pub uid: String,
    pub source_url: Url,
    pub meta: FictionMeta,
    /// In table-of-contents order.
    pub chapter_refs: Vec<ChapterRef>,
}

pub trait Provider: Send + Sync {
    fn key(&self) -> &'static str;

    fn fiction_uid_from_url(&self, url: &Url) -> Option<String>;

    /// Fetch the fiction page and read its metadata and chapter list.
    /// Fails when no chapters can be found.
    fn discover_fiction(
        &self,
        fetcher: &Fetcher,
        url: &Url,
        options: &FetchOptions,
    ) -> Result<Fiction>;

    fn extract_chapter(
        &self,
        page: &Html,
        options: &ExtractOptions,
    ) -> Result<Option<ExtractedChapter>>;

    fn canonical_chapter_url(&self, chapter_id: &str) -> Result<Url>;
}

/// Static lookup from provider key to implementation.
pub struct ProviderRegistry {
    providers: Vec<Box<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Every provider shipped with the crate. `toc_tiers` caps how far chapter
    /// discovery escalates.
    pub fn builtin(toc_tiers: u8) -> Result<Self> {
        let mut registry = Self::empty();
        registry.register(RoyalRoadProvider::new(toc_tiers)?);
        Ok(registry)
    }

    pub fn register(&mut self, provider: impl Provider + 'static) {
        self.providers.retain(|existing| existing.key() != provider.key());
        self.providers.push(Box::new(provider));
    }

    pub fn get(&self, key: &str) -> Result<&dyn Provider> {
        self.providers
            .iter()
            .find(|provider| provider.key() == key)
            .map(|provider| provider.as_ref())
            .ok_or_else(|| Error::UnknownProvider(key.to_string()))
    }

    /// First provider that can derive a fiction id from `url`.
    pub fn for_url(&self, url: &Url) -> Result<&dyn Provider> {
        self.providers
            .iter()
            .find(|provider| provider.fiction_uid_from_url(url).is_some())
            .map(|provider| provider.as_ref())
            .ok_or_else(|| Error::InvalidFictionUrl(url.to_string()))
    }

    pub fn keys(&self) -> Vec<&'static str> {
        self.providers.iter().map(|provider| provider.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_is_a_typed_error() {
        let registry = ProviderRegistry::builtin(3).unwrap();
        assert_eq!(registry.keys(), ["royalroad"]);
        assert!(registry.get("royalroad").is_ok());
        assert!(matches!(
            registry.get("wattpad"),
            Err(Error::UnknownProvider(key)) if key == "wattpad"
        ));
    }

    #[test]
    fn for_url_picks_the_provider_that_recognizes_the_url() {
        let registry = ProviderRegistry::builtin(3).unwrap();
        let url = Url::parse("https://www.royalroad.com/fiction/21220/mother-of-learning").unwrap();
        assert_eq!(registry.for_url(&url).unwrap().key(), "royalroad");

        let other = Url::parse("https://example.com/stories/1").unwrap();
        assert!(matches!(
            registry.for_url(&other),
            Err(Error::InvalidFictionUrl(_))
        ));
    }

    #[test]
    fn cover_source_distinguishes_remote_and_local() {
        assert!(matches!(
            CoverSource::parse("https://cdn.test/c.png"),
            CoverSource::Remote(_)
        ));
        assert_eq!(
            CoverSource::parse("covers/c.png"),
            CoverSource::Local(PathBuf::from("covers/c.png"))
        );
    }
}
