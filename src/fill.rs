//! Fetching chapter bodies for indexed chapters.

use chrono::Utc;
use url::Url;

use crate::error::{Error, ParseError, Result};
use crate::extract::{ExtractOptions, Strictness};
use crate::fetch::{FetchOptions, Fetcher};
use crate::provider::{Provider, ProviderRegistry};
use crate::store::{BodyWrite, BookId, BookStore, Chapter, ChapterBody, ChapterFilter, ChapterId};

/// Fill up to `limit` unfetched chapters of a book, in index order. Returns
/// how many were filled. A chapter that cannot be fetched or parsed is
/// logged and skipped.
pub fn fill_missing_content(
    store: &dyn BookStore,
    fetcher: &Fetcher,
    registry: &ProviderRegistry,
    book_id: BookId,
    limit: Option<usize>,
) -> Result<usize> {
    let book = store.get_book(book_id)?;
    let provider = registry.get(&book.provider)?;
    let pending = store.list_chapters(book_id, ChapterFilter::Missing, limit)?;

    let mut filled = 0;
    for chapter in &pending {
        match fill_chapter(store, fetcher, provider, chapter) {
            Ok(true) => filled += 1,
            Ok(false) => {}
            Err(err @ Error::Store(_)) => return Err(err),
            Err(err) => {
                tracing::warn!(
                    book_id,
                    chapter_id = chapter.id,
                    url = %chapter.source_url,
                    err = %err,
                    "chapter fill failed; skipping"
                );
            }
        }
    }

    tracing::info!(book_id, pending = pending.len(), filled, "content fill finished");
    Ok(filled)
}

fn fill_chapter(
    store: &dyn BookStore,
    fetcher: &Fetcher,
    provider: &dyn Provider,
    chapter: &Chapter,
) -> Result<bool> {
    let url = chapter_url(provider, chapter)?;
    let page = fetcher.fetch_html(&url, &FetchOptions::default())?;
    let options = ExtractOptions {
        url: Some(url.to_string()),
        strictness: Strictness::Lenient,
        fallback_title: Some(chapter.title.clone()),
    };

    let Some(extracted) = provider.extract_chapter(&page, &options)? else {
        tracing::warn!(chapter_id = chapter.id, url = %url, "no chapter content found; skipping");
        return Ok(false);
    };

    let body = ChapterBody {
        title: Some(extracted.title),
        body: extracted.content_html,
        fetched_at: Utc::now(),
    };
    let applied = store.write_chapter_body(chapter.id, &body, BodyWrite::IfMissing)?;
    if !applied {
        tracing::debug!(chapter_id = chapter.id, "chapter already filled; left untouched");
    }
    Ok(applied)
}

/// Explicitly re-download one chapter, bypassing the page cache, and
/// replace its stored body. Extraction is strict.
pub fn refetch_chapter(
    store: &dyn BookStore,
    fetcher: &Fetcher,
    registry: &ProviderRegistry,
    chapter_id: ChapterId,
) -> Result<bool> {
    let chapter = store.get_chapter(chapter_id)?;
    let book = store.get_book(chapter.book_id)?;
    let provider = registry.get(&book.provider)?;
    let url = chapter_url(provider, &chapter)?;

    let page = fetcher.fetch_html(&url, &FetchOptions { ignore_cache: true })?;
    let options = ExtractOptions {
        url: Some(url.to_string()),
        strictness: Strictness::Strict,
        fallback_title: Some(chapter.title.clone()),
    };
    let extracted =
        provider
            .extract_chapter(&page, &options)?
            .ok_or_else(|| ParseError::Chapter {
                reason: "Could not locate chapter content".to_string(),
                url: Some(url.to_string()),
                tried: Vec::new(),
            })?;

    let body = ChapterBody {
        title: Some(extracted.title),
        body: extracted.content_html,
        fetched_at: Utc::now(),
    };
    let applied = store.write_chapter_body(chapter.id, &body, BodyWrite::Replace)?;
    tracing::info!(chapter_id, url = %url, "chapter re-fetched");
    Ok(applied)
}

/// The stored source URL, or the provider's canonical one if that is unusable.
fn chapter_url(provider: &dyn Provider, chapter: &Chapter) -> Result<Url> {
    match Url::parse(&chapter.source_url) {
        Ok(url) => Ok(url),
        Err(_) => provider.canonical_chapter_url(&chapter.provider_chapter_id),
    }
}
