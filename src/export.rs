//! Export of a stored book: make sure it has an index and bodies, then
//! assemble the fetched chapters.

use std::path::{Path, PathBuf};

use url::Url;

use crate::epub::{AssemblyOptions, AssemblyReport, BookMetadata, EpubAssembler};
use crate::error::{Error, Result};
use crate::fetch::{Fetcher, ImageBounds};
use crate::fill;
use crate::ingest;
use crate::provider::{CoverSource, ProviderRegistry};
use crate::store::{Book, BookId, BookStore, ChapterFilter};

/// Per-export choices. Metadata fields override what is stored on the book.
#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub title: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
    /// URL or local path.
    pub cover: Option<String>,
    pub include_images: bool,
    pub include_chapter_titles: bool,
    pub image_bounds: ImageBounds,
    pub stylesheet: Option<PathBuf>,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            title: None,
            author: None,
            language: None,
            cover: None,
            include_images: true,
            include_chapter_titles: false,
            image_bounds: ImageBounds::default(),
            stylesheet: None,
        }
    }
}

pub fn default_output_path(output_dir: &Path, book: &Book) -> PathBuf {
    let stem: String = format!("{}-{}", book.provider, book.fiction_uid)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    output_dir.join(format!("{stem}.epub"))
}

pub fn export_book(
    store: &dyn BookStore,
    fetcher: &Fetcher,
    registry: &ProviderRegistry,
    book_id: BookId,
    settings: &ExportSettings,
    out_path: &Path,
) -> Result<AssemblyReport> {
    if store.count_chapters(book_id, ChapterFilter::All)? == 0 {
        tracing::info!(book_id, "book has no chapter index; discovering");
        ingest::refresh_toc(store, fetcher, registry, book_id)?;
    }
    fill::fill_missing_content(store, fetcher, registry, book_id, None)?;

    let book = store.get_book(book_id)?;
    let chapters = store.list_chapters(book_id, ChapterFilter::Fetched, None)?;
    if chapters.is_empty() {
        return Err(Error::EmptyBook(book_id));
    }
    let missing = store.count_chapters(book_id, ChapterFilter::Missing)?;
    if missing > 0 {
        tracing::warn!(book_id, missing, "exporting without chapters that could not be fetched");
    }

    let metadata = BookMetadata {
        identifier: format!("urn:serialbook:{}:{}", book.provider, book.fiction_uid),
        title: settings.title.clone().unwrap_or(book.title),
        author: settings.author.clone().unwrap_or(book.author),
        language: settings.language.clone().unwrap_or(book.language),
    };
    let cover = settings
        .cover
        .as_deref()
        .or(book.cover.as_deref())
        .map(CoverSource::parse);
    let options = AssemblyOptions {
        include_images: settings.include_images,
        include_chapter_titles: settings.include_chapter_titles,
        image_bounds: settings.image_bounds,
    };

    let mut assembler = EpubAssembler::new(metadata, options).with_cover(cover);
    if let Some(path) = &settings.stylesheet {
        let css = std::fs::read_to_string(path).map_err(|source| Error::Assembly {
            path: path.clone(),
            source,
        })?;
        assembler = assembler.with_stylesheet(css);
    }

    for chapter in &chapters {
        let Some(body) = &chapter.body else {
            continue;
        };
        let base_url = Url::parse(&chapter.source_url).ok();
        assembler.add_chapter(&chapter.title, body, base_url.as_ref());
    }

    assembler.write(fetcher, out_path)
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use super::*;
    use crate::fetch::tests::{FakeTransport, fetcher_with, png_bytes};
    use crate::ingest::upsert_book_meta;
    use crate::provider::FictionMeta;
    use crate::store::MemoryBookStore;

    const FICTION: &str = "https://rr.test/fiction/4/saga";

    fn fiction_page() -> &'static str {
        r#"<html><body>
            <div class="fic-header"><img src="/cover.png"><h1>Saga</h1><a href="/profile/2">Teller</a></div>
            <div id="chapters">
              <a href="/fiction/4/saga/chapter/41/a">A</a>
              <a href="/fiction/4/saga/chapter/42/b">B</a>
              <a href="/fiction/4/saga/chapter/43/c">C</a>
            </div></body></html>"#
    }

    fn chapter_page(text: &str) -> String {
        format!(
            "<html><body><div class=\"chapter-inner\"><p>{text}</p><img src=\"/art/shared.png\"></div></body></html>"
        )
    }

    fn transport() -> FakeTransport {
        FakeTransport::default()
            .with(FICTION, fiction_page())
            .with("https://rr.test/fiction/4/saga/chapter/41/a", chapter_page("alpha"))
            .with("https://rr.test/fiction/4/saga/chapter/42/b", chapter_page("beta"))
            .with("https://rr.test/art/shared.png", png_bytes(16, 16, false))
            .with("https://rr.test/cover.png", png_bytes(16, 24, false))
    }

    fn read_entry(path: &Path, name: &str) -> String {
        let mut archive = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
        let mut out = String::new();
        archive.by_name(name).unwrap().read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn export_discovers_fills_and_assembles_in_index_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let (fetcher, _) = fetcher_with(&dir.path().join("cache"), transport());
        let registry = ProviderRegistry::builtin(3).unwrap();
        let store = MemoryBookStore::new();

        let meta = FictionMeta {
            title: "Stub".to_string(),
            author: "Nobody".to_string(),
            language: "en".to_string(),
            cover: None,
        };
        let url = Url::parse(FICTION).unwrap();
        let (book, _) = upsert_book_meta(&store, "royalroad", "4", &url, &meta).unwrap();

        let out = dir.path().join("saga.epub");
        let report = export_book(
            &store,
            &fetcher,
            &registry,
            book.id,
            &ExportSettings {
                author: Some("Override".to_string()),
                ..ExportSettings::default()
            },
            &out,
        )
        .unwrap();

        assert_eq!(report.chapters, 2);
        assert_eq!(report.images_packaged, 1);
        assert!(report.cover);

        let opf = read_entry(&out, "OEBPS/content.opf");
        assert!(opf.contains("<dc:title>Saga</dc:title>"));
        assert!(opf.contains("<dc:creator>Override</dc:creator>"));
        assert!(read_entry(&out, "OEBPS/chapter_1.xhtml").contains("alpha"));
        assert!(read_entry(&out, "OEBPS/chapter_2.xhtml").contains("beta"));
        assert_eq!(store.count_chapters(book.id, ChapterFilter::Missing).unwrap(), 1);
    }

    #[test]
    fn book_without_fetched_chapters_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let (fetcher, _) = fetcher_with(
            dir.path(),
            FakeTransport::default().with(FICTION, fiction_page()),
        );
        let registry = ProviderRegistry::builtin(3).unwrap();
        let store = MemoryBookStore::new();
        let url = Url::parse(FICTION).unwrap();
        let report =
            ingest::ingest_fiction(
                &store,
                &fetcher,
                registry.get("royalroad").unwrap(),
                &url,
                &crate::fetch::FetchOptions::default(),
            )
            .unwrap();

        let out = dir.path().join("none.epub");
        let err = export_book(
            &store,
            &fetcher,
            &registry,
            report.book.id,
            &ExportSettings::default(),
            &out,
        )
        .unwrap_err();
        assert!(matches!(err, Error::EmptyBook(_)));
        assert!(!out.exists());
    }

    #[test]
    fn output_path_is_derived_from_provider_and_uid() {
        let store = MemoryBookStore::new();
        let meta = FictionMeta {
            title: "T".to_string(),
            author: "A".to_string(),
            language: "en".to_string(),
            cover: None,
        };
        let url = Url::parse(FICTION).unwrap();
        let (book, _) = upsert_book_meta(&store, "royalroad", "4/x", &url, &meta).unwrap();
        assert_eq!(
            default_output_path(Path::new("out"), &book),
            Path::new("out").join("royalroad-4_x.epub")
        );
    }
}
