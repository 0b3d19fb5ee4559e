//! Book metadata upsert and the chapter index builder.

use url::Url;

use crate::error::{Error, FetchError, Result, StoreError};
use crate::fetch::{FetchOptions, Fetcher};
use crate::provider::{ChapterRef, FictionMeta, Provider, ProviderRegistry};
use crate::store::{Book, BookId, BookMetaUpdate, BookStore, NewBook, NewChapter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub inserted: usize,
    pub updated: usize,
    /// Refs without a usable chapter id.
    pub rejected: usize,
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub book: Book,
    pub created: bool,
    pub index: IndexReport,
}

/// Insert the book, or refresh its metadata. Returns the row and whether it
/// was created.
pub fn upsert_book_meta(
    store: &dyn BookStore,
    provider_key: &str,
    fiction_uid: &str,
    source_url: &Url,
    meta: &FictionMeta,
) -> Result<(Book, bool)> {
    if let Some(existing) = store.find_book(provider_key, fiction_uid)? {
        return Ok((refresh_meta(store, &existing, meta)?, false));
    }

    let new = NewBook {
        provider: provider_key.to_string(),
        fiction_uid: fiction_uid.to_string(),
        source_url: source_url.to_string(),
        title: meta.title.clone(),
        author: meta.author.clone(),
        language: meta.language.clone(),
        cover: meta.cover.as_ref().map(|cover| cover.to_reference()),
    };
    match store.insert_book(new) {
        Ok(book) => Ok((book, true)),
        Err(StoreError::DuplicateKey(key)) => {
            tracing::debug!(key = %key, "book inserted concurrently; updating instead");
            let existing = store
                .find_book(provider_key, fiction_uid)?
                .ok_or(StoreError::DuplicateKey(key))?;
            Ok((refresh_meta(store, &existing, meta)?, false))
        }
        Err(err) => Err(err.into()),
    }
}

fn refresh_meta(store: &dyn BookStore, book: &Book, meta: &FictionMeta) -> Result<Book> {
    let non_empty = |value: &str| Some(value.trim().to_string()).filter(|v| !v.is_empty());
    let update = BookMetaUpdate {
        title: non_empty(&meta.title),
        author: non_empty(&meta.author),
        language: non_empty(&meta.language),
        cover: meta.cover.as_ref().map(|cover| cover.to_reference()),
    };
    Ok(store.update_book_meta(book.id, &update)?)
}

/// Make the stored chapter index match `refs`: chapter `i` of the accepted
/// refs gets `index = i`. Existing rows keep their body and fetched state.
pub fn upsert_chapter_index(
    store: &dyn BookStore,
    book_id: BookId,
    refs: &[ChapterRef],
) -> Result<IndexReport> {
    let mut report = IndexReport::default();
    let mut position = 0;

    for chapter_ref in refs {
        let id = chapter_ref.id.trim();
        if id.is_empty() {
            tracing::warn!(book_id, url = %chapter_ref.url, "chapter ref without id; rejected");
            report.rejected += 1;
            continue;
        }

        let title = chapter_ref
            .title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty());
        let url = chapter_ref.url.as_str();

        if let Some(existing) = store.find_chapter(book_id, id)? {
            store.update_chapter_ref(existing.id, position, title, url)?;
            report.updated += 1;
        } else {
            let new = NewChapter {
                book_id,
                index: position,
                title: title
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Chapter {}", position + 1)),
                provider_chapter_id: id.to_string(),
                source_url: url.to_string(),
            };
            match store.insert_chapter(new) {
                Ok(_) => report.inserted += 1,
                Err(StoreError::DuplicateKey(key)) => {
                    tracing::debug!(book_id, key = %key, "chapter inserted concurrently; updating instead");
                    let existing = store
                        .find_chapter(book_id, id)?
                        .ok_or(StoreError::DuplicateKey(key))?;
                    store.update_chapter_ref(existing.id, position, title, url)?;
                    report.updated += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
        position += 1;
    }

    Ok(report)
}

/// Discover a fiction and record it. A discovery failure aborts before
/// anything is written.
pub fn ingest_fiction(
    store: &dyn BookStore,
    fetcher: &Fetcher,
    provider: &dyn Provider,
    url: &Url,
    options: &FetchOptions,
) -> Result<IngestReport> {
    let fiction = provider.discover_fiction(fetcher, url, options)?;
    let (book, created) = upsert_book_meta(
        store,
        provider.key(),
        &fiction.uid,
        &fiction.source_url,
        &fiction.meta,
    )?;
    let index = upsert_chapter_index(store, book.id, &fiction.chapter_refs)?;

    tracing::info!(
        book_id = book.id,
        created,
        inserted = index.inserted,
        updated = index.updated,
        rejected = index.rejected,
        "ingested fiction"
    );
    Ok(IngestReport {
        book,
        created,
        index,
    })
}

/// Re-run discovery for a stored book through its own provider. The fiction
/// page is always re-downloaded.
pub fn refresh_toc(
    store: &dyn BookStore,
    fetcher: &Fetcher,
    registry: &ProviderRegistry,
    book_id: BookId,
) -> Result<IngestReport> {
    let book = store.get_book(book_id)?;
    let provider = registry.get(&book.provider)?;
    let url = Url::parse(&book.source_url).map_err(|source| {
        Error::Fetch(FetchError::InvalidUrl {
            url: book.source_url.clone(),
            source,
        })
    })?;
    ingest_fiction(store, fetcher, provider, &url, &FetchOptions { ignore_cache: true })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::Utc;

    use super::*;
    use crate::fetch::tests::{FakeTransport, fetcher_with};
    use crate::provider::CoverSource;
    use crate::store::{
        BodyWrite, Chapter, ChapterBody, ChapterFilter, ChapterId, MemoryBookStore,
    };

    fn meta(title: &str) -> FictionMeta {
        FictionMeta {
            title: title.to_string(),
            author: "Author".to_string(),
            language: "en".to_string(),
            cover: Some(CoverSource::Remote(
                Url::parse("https://rr.test/cover.png").unwrap(),
            )),
        }
    }

    fn chapter_ref(id: &str, title: Option<&str>) -> ChapterRef {
        ChapterRef {
            id: id.to_string(),
            url: Url::parse(&format!("https://rr.test/chapter/{id}")).unwrap(),
            title: title.map(str::to_string),
        }
    }

    fn book(store: &dyn BookStore) -> Book {
        let url = Url::parse("https://rr.test/fiction/1").unwrap();
        upsert_book_meta(store, "royalroad", "1", &url, &meta("Story")).unwrap().0
    }

    fn snapshot(store: &dyn BookStore, book_id: BookId) -> Vec<(String, usize, String, String)> {
        store
            .list_chapters(book_id, ChapterFilter::All, None)
            .unwrap()
            .into_iter()
            .map(|c| (c.provider_chapter_id, c.index, c.title, c.source_url))
            .collect()
    }

    #[test]
    fn book_meta_is_refreshed_not_duplicated() {
        let store = MemoryBookStore::new();
        let url = Url::parse("https://rr.test/fiction/1").unwrap();
        let (first, created) = upsert_book_meta(&store, "royalroad", "1", &url, &meta("Old")).unwrap();
        assert!(created);

        let mut blank = meta("  ");
        blank.cover = None;
        let (same, created) = upsert_book_meta(&store, "royalroad", "1", &url, &blank).unwrap();
        assert!(!created);
        assert_eq!(same.id, first.id);
        assert_eq!(same.title, "Old");
        assert_eq!(same.cover.as_deref(), Some("https://rr.test/cover.png"));

        let (renamed, _) = upsert_book_meta(&store, "royalroad", "1", &url, &meta("New")).unwrap();
        assert_eq!(renamed.title, "New");
        assert_eq!(store.list_books().unwrap().len(), 1);
    }

    #[test]
    fn indices_follow_discovery_order() {
        let store = MemoryBookStore::new();
        let book = book(&store);
        let refs = [
            chapter_ref("10", Some("Ten")),
            chapter_ref("20", None),
            chapter_ref("30", Some("Thirty")),
        ];

        let report = upsert_chapter_index(&store, book.id, &refs).unwrap();
        assert_eq!(report.inserted, 3);
        assert_eq!(
            snapshot(&store, book.id),
            [
                ("10".to_string(), 0, "Ten".to_string(), "https://rr.test/chapter/10".to_string()),
                ("20".to_string(), 1, "Chapter 2".to_string(), "https://rr.test/chapter/20".to_string()),
                ("30".to_string(), 2, "Thirty".to_string(), "https://rr.test/chapter/30".to_string()),
            ]
        );
    }

    #[test]
    fn repeated_upsert_is_idempotent() {
        let store = MemoryBookStore::new();
        let book = book(&store);
        let refs = [chapter_ref("1", Some("One")), chapter_ref("2", None)];

        upsert_chapter_index(&store, book.id, &refs).unwrap();
        let before = snapshot(&store, book.id);
        let report = upsert_chapter_index(&store, book.id, &refs).unwrap();

        assert_eq!(report, IndexReport { inserted: 0, updated: 2, rejected: 0 });
        assert_eq!(snapshot(&store, book.id), before);
    }

    #[test]
    fn reorder_reassigns_indices_and_keeps_bodies() {
        let store = MemoryBookStore::new();
        let book = book(&store);
        upsert_chapter_index(&store, book.id, &[chapter_ref("a", None), chapter_ref("b", None)]).unwrap();

        let a = store.find_chapter(book.id, "a").unwrap().unwrap();
        store
            .write_chapter_body(
                a.id,
                &ChapterBody {
                    title: Some("Fetched A".to_string()),
                    body: "<p>a</p>".to_string(),
                    fetched_at: Utc::now(),
                },
                BodyWrite::IfMissing,
            )
            .unwrap();

        upsert_chapter_index(
            &store,
            book.id,
            &[chapter_ref("c", None), chapter_ref("b", None), chapter_ref("a", None)],
        )
        .unwrap();

        let order: Vec<_> = snapshot(&store, book.id).into_iter().map(|s| (s.0, s.1)).collect();
        assert_eq!(order, [("c".to_string(), 0), ("b".to_string(), 1), ("a".to_string(), 2)]);

        let a = store.get_chapter(a.id).unwrap();
        assert!(a.fetched);
        assert_eq!(a.body.as_deref(), Some("<p>a</p>"));
        assert_eq!(a.title, "Fetched A");
    }

    #[test]
    fn refs_without_id_are_rejected_not_aliased() {
        let store = MemoryBookStore::new();
        let book = book(&store);
        let report = upsert_chapter_index(
            &store,
            book.id,
            &[chapter_ref("1", None), chapter_ref(" ", None), chapter_ref("2", None)],
        )
        .unwrap();

        assert_eq!(report, IndexReport { inserted: 2, updated: 0, rejected: 1 });
        let indices: Vec<_> = snapshot(&store, book.id).into_iter().map(|s| s.1).collect();
        assert_eq!(indices, [0, 1]);
    }

    /// Hides an existing chapter from the first lookup, as if another worker
    /// inserted it between our read and our insert.
    struct RacyStore {
        inner: MemoryBookStore,
        hide_next_lookup: AtomicBool,
    }

    impl BookStore for RacyStore {
        fn find_book(&self, provider: &str, uid: &str) -> Result<Option<Book>, StoreError> {
            self.inner.find_book(provider, uid)
        }
        fn get_book(&self, id: BookId) -> Result<Book, StoreError> {
            self.inner.get_book(id)
        }
        fn insert_book(&self, book: NewBook) -> Result<Book, StoreError> {
            self.inner.insert_book(book)
        }
        fn update_book_meta(&self, id: BookId, update: &BookMetaUpdate) -> Result<Book, StoreError> {
            self.inner.update_book_meta(id, update)
        }
        fn list_books(&self) -> Result<Vec<Book>, StoreError> {
            self.inner.list_books()
        }
        fn find_chapter(&self, book_id: BookId, id: &str) -> Result<Option<Chapter>, StoreError> {
            if self.hide_next_lookup.swap(false, Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.find_chapter(book_id, id)
        }
        fn get_chapter(&self, id: ChapterId) -> Result<Chapter, StoreError> {
            self.inner.get_chapter(id)
        }
        fn insert_chapter(&self, chapter: NewChapter) -> Result<Chapter, StoreError> {
            self.inner.insert_chapter(chapter)
        }
        fn update_chapter_ref(
            &self,
            id: ChapterId,
            index: usize,
            title: Option<&str>,
            url: &str,
        ) -> Result<Chapter, StoreError> {
            self.inner.update_chapter_ref(id, index, title, url)
        }
        fn write_chapter_body(
            &self,
            id: ChapterId,
            body: &ChapterBody,
            mode: BodyWrite,
        ) -> Result<bool, StoreError> {
            self.inner.write_chapter_body(id, body, mode)
        }
        fn list_chapters(
            &self,
            book_id: BookId,
            filter: ChapterFilter,
            limit: Option<usize>,
        ) -> Result<Vec<Chapter>, StoreError> {
            self.inner.list_chapters(book_id, filter, limit)
        }
        fn count_chapters(&self, book_id: BookId, filter: ChapterFilter) -> Result<usize, StoreError> {
            self.inner.count_chapters(book_id, filter)
        }
    }

    #[test]
    fn duplicate_key_on_insert_becomes_an_update() {
        let store = RacyStore {
            inner: MemoryBookStore::new(),
            hide_next_lookup: AtomicBool::new(false),
        };
        let book = book(&store);
        upsert_chapter_index(&store, book.id, &[chapter_ref("1", Some("Old"))]).unwrap();

        store.hide_next_lookup.store(true, Ordering::SeqCst);
        let report = upsert_chapter_index(&store, book.id, &[chapter_ref("1", Some("New"))]).unwrap();

        assert_eq!(report, IndexReport { inserted: 0, updated: 1, rejected: 0 });
        let chapters = store.list_chapters(book.id, ChapterFilter::All, None).unwrap();
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].title, "New");
    }

    const FICTION_PAGE: &str = r#"<html><body>
        <div class="fic-header"><h1>Scenario</h1><a href="/profile/1">Writer</a></div>
        <div id="chapters">
          <a href="/fiction/5/s/chapter/1/a">A</a>
          <a href="/fiction/5/s/chapter/2/b">B</a>
        </div></body></html>"#;

    #[test]
    fn ingest_then_refresh_converges() {
        let dir = tempfile::TempDir::new().unwrap();
        let page = "https://rr.test/fiction/5/s";
        let (fetcher, _) = fetcher_with(dir.path(), FakeTransport::default().with(page, FICTION_PAGE));
        let registry = ProviderRegistry::builtin(3).unwrap();
        let store = MemoryBookStore::new();
        let url = Url::parse(page).unwrap();

        let first = ingest_fiction(
            &store,
            &fetcher,
            registry.for_url(&url).unwrap(),
            &url,
            &FetchOptions::default(),
        )
        .unwrap();
        assert!(first.created);
        assert_eq!(first.book.title, "Scenario");
        assert_eq!(first.index.inserted, 2);

        let again = refresh_toc(&store, &fetcher, &registry, first.book.id).unwrap();
        assert!(!again.created);
        assert_eq!(again.book.id, first.book.id);
        assert_eq!(again.index, IndexReport { inserted: 0, updated: 2, rejected: 0 });
    }

    #[test]
    fn failed_discovery_writes_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let page = "https://rr.test/fiction/6/empty";
        let (fetcher, _) = fetcher_with(
            dir.path(),
            FakeTransport::default().with(page, "<html><body><h1>x</h1></body></html>"),
        );
        let registry = ProviderRegistry::builtin(3).unwrap();
        let store = MemoryBookStore::new();
        let url = Url::parse(page).unwrap();

        let err = ingest_fiction(
            &store,
            &fetcher,
            registry.get("royalroad").unwrap(),
            &url,
            &FetchOptions::default(),
        );
        assert!(matches!(err, Err(Error::Parse(_))));
        assert!(store.list_books().unwrap().is_empty());
    }
}
