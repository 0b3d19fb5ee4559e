use std::sync::LazyLock;

use regex::Regex;
use scraper::Html;
use url::Url;

use crate::error::{Error, FetchError, Result};
use crate::extract::{
    self, ChapterLocators, ExtractOptions, ExtractedChapter, Locators, Strictness, TocLocators,
};
use crate::fetch::{FetchOptions, Fetcher};
use crate::provider::{ChapterRef, CoverSource, Fiction, FictionMeta, Provider};

pub const PROVIDER_KEY: &str = "royalroad";

const TITLE_LOCATORS: &[&str] = &[
    "div.fic-header h1",
    "#chapter-inner h1",
    "#chapter-content h1",
    ".chapter-inner h1",
];
const CONTENT_LOCATORS: &[&str] = &[
    "div.chapter-inner",
    "#chapter-inner",
    "#chapter-content",
    "div#chapter-content",
    "article.chapter-content",
    "div.chapter-content",
];
const TOC_CANONICAL: &str = "#chapters";
const TOC_BROADER: &[&str] = &["div.chapters", "div.chapter-list", "div.fic-contents", "section"];
const CHAPTER_LINK: &str = r"(?i)/chapter/(?P<id>\d+)";

const FICTION_TITLE: &[&str] = &["div.fic-header h1", "h1"];
const FICTION_AUTHOR: &[&str] = &[r#"a[href*="/profile/"]"#, r#"a[href*="/author/"]"#];
const FICTION_COVER: &[&str] = &["div.fic-header img", r#"img[src*="royalroadcdn"]"#, "img"];
const FICTION_LANGUAGE: &[&str] = &[r#"meta[http-equiv="content-language"]"#, r#"meta[name="language"]"#];

static FICTION_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)/fiction/(\d+)(?:/|$)").expect("fiction id regex"));

struct MetaLocators {
    title: Locators,
    author: Locators,
    cover: Locators,
    language: Locators,
}

pub struct RoyalRoadProvider {
    chapter: ChapterLocators,
    toc: TocLocators,
    meta: MetaLocators,
    max_tier: u8,
}

impl RoyalRoadProvider {
    pub fn new(max_tier: u8) -> Result<Self> {
        Ok(Self {
            chapter: ChapterLocators {
                title: Locators::parse(TITLE_LOCATORS)?,
                content: Locators::parse(CONTENT_LOCATORS)?,
            },
            toc: TocLocators::new(TOC_CANONICAL, TOC_BROADER, CHAPTER_LINK)?,
            meta: MetaLocators {
                title: Locators::parse(FICTION_TITLE)?,
                author: Locators::parse(FICTION_AUTHOR)?,
                cover: Locators::parse(FICTION_COVER)?,
                language: Locators::parse(FICTION_LANGUAGE)?,
            },
            max_tier,
        })
    }

    fn parse_meta(&self, base_url: &Url, doc: &Html) -> FictionMeta {
        let title = self
            .meta
            .title
            .first_text(doc)
            .unwrap_or_else(|| "Untitled".to_string());
        let author = self
            .meta
            .author
            .first_text(doc)
            .unwrap_or_else(|| "Unknown".to_string());
        let cover = self
            .meta
            .cover
            .first_attr(doc, "src")
            .and_then(|src| base_url.join(&src).ok())
            .map(CoverSource::Remote);
        let language = self
            .meta
            .language
            .first_attr(doc, "content")
            .unwrap_or_else(|| "en".to_string())
            .to_lowercase();

        FictionMeta {
            title,
            author,
            language,
            cover,
        }
    }
}

impl Provider for RoyalRoadProvider {
    fn key(&self) -> &'static str {
        PROVIDER_KEY
    }

    fn fiction_uid_from_url(&self, url: &Url) -> Option<String> {
        FICTION_ID
            .captures(url.path())
            .map(|caps| caps[1].to_string())
    }

    fn discover_fiction(
        &self,
        fetcher: &Fetcher,
        url: &Url,
        options: &FetchOptions,
    ) -> Result<Fiction> {
        let uid = self
            .fiction_uid_from_url(url)
            .ok_or_else(|| Error::InvalidFictionUrl(url.to_string()))?;
        let doc = fetcher.fetch_html(url, options)?;

        let meta = self.parse_meta(url, &doc);
        let links =
            extract::discover_chapter_links(url, &doc, &self.toc, self.max_tier, Strictness::Strict)?;
        tracing::info!(url = %url, uid = %uid, chapters = links.len(), title = %meta.title, "discovered fiction");

        let chapter_refs = links
            .into_iter()
            .map(|link| ChapterRef {
                id: link.id,
                url: link.url,
                title: link.title,
            })
            .collect();

        Ok(Fiction {
            uid,
            source_url: url.clone(),
            meta,
            chapter_refs,
        })
    }

    fn extract_chapter(
        &self,
        page: &Html,
        options: &ExtractOptions,
    ) -> Result<Option<ExtractedChapter>> {
        Ok(extract::extract_chapter(page, &self.chapter, options)?)
    }

    fn canonical_chapter_url(&self, chapter_id: &str) -> Result<Url> {
        let raw = format!("https://www.royalroad.com/fiction/chapter/{chapter_id}");
        Url::parse(&raw).map_err(|source| Error::Fetch(FetchError::InvalidUrl { url: raw, source }))
    }
}
