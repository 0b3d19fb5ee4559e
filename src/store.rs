//! Book and chapter persistence.
//!
//! Uniqueness of (provider, fiction uid) and (book, provider chapter id) is
//! enforced here, as is the write-once rule for chapter bodies.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub type BookId = u64;
pub type ChapterId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub provider: String,
    pub fiction_uid: String,
    pub source_url: String,
    pub title: String,
    pub author: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBook {
    pub provider: String,
    pub fiction_uid: String,
    pub source_url: String,
    pub title: String,
    pub author: String,
    pub language: String,
    pub cover: Option<String>,
}

/// `None` leaves the stored value alone.
#[derive(Debug, Clone, Default)]
pub struct BookMetaUpdate {
    pub title: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
    pub cover: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: ChapterId,
    pub book_id: BookId,
    pub index: usize,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub provider_chapter_id: String,
    pub source_url: String,
    pub fetched: bool,
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewChapter {
    pub book_id: BookId,
    pub index: usize,
    pub title: String,
    pub provider_chapter_id: String,
    pub source_url: String,
}

#[derive(Debug, Clone)]
pub struct ChapterBody {
    /// Replaces the stored title when present.
    pub title: Option<String>,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyWrite {
    /// Apply only if the chapter has not been fetched yet.
    IfMissing,
    /// Explicit re-fetch: overwrite whatever is stored.
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChapterFilter {
    #[default]
    All,
    Missing,
    Fetched,
}

impl ChapterFilter {
    fn accepts(self, chapter: &Chapter) -> bool {
        match self {
            Self::All => true,
            Self::Missing => chapter.body.is_none(),
            Self::Fetched => chapter.fetched && chapter.body.is_some(),
        }
    }
}

pub trait BookStore: Send + Sync {
    fn find_book(&self, provider: &str, fiction_uid: &str) -> Result<Option<Book>, StoreError>;
    fn get_book(&self, id: BookId) -> Result<Book, StoreError>;
    fn insert_book(&self, book: NewBook) -> Result<Book, StoreError>;
    fn update_book_meta(&self, id: BookId, update: &BookMetaUpdate) -> Result<Book, StoreError>;
    fn list_books(&self) -> Result<Vec<Book>, StoreError>;

    fn find_chapter(
        &self,
        book_id: BookId,
        provider_chapter_id: &str,
    ) -> Result<Option<Chapter>, StoreError>;
    fn get_chapter(&self, id: ChapterId) -> Result<Chapter, StoreError>;
    fn insert_chapter(&self, chapter: NewChapter) -> Result<Chapter, StoreError>;
    /// Position, title and URL only. Body and fetched state are untouched.
    fn update_chapter_ref(
        &self,
        id: ChapterId,
        index: usize,
        title: Option<&str>,
        source_url: &str,
    ) -> Result<Chapter, StoreError>;
    /// Returns whether the write was applied.
    fn write_chapter_body(
        &self,
        id: ChapterId,
        body: &ChapterBody,
        mode: BodyWrite,
    ) -> Result<bool, StoreError>;
    /// Ordered by index.
    fn list_chapters(
        &self,
        book_id: BookId,
        filter: ChapterFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Chapter>, StoreError>;
    fn count_chapters(&self, book_id: BookId, filter: ChapterFilter) -> Result<usize, StoreError>;
}

/// The whole persisted state. Both stores delegate to this.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Library {
    #[serde(default)]
    next_book_id: BookId,
    #[serde(default)]
    next_chapter_id: ChapterId,
    #[serde(default)]
    books: Vec<Book>,
    #[serde(default)]
    chapters: Vec<Chapter>,
}

impl Library {
    fn find_book(&self, provider: &str, fiction_uid: &str) -> Option<&Book> {
        self.books
            .iter()
            .find(|book| book.provider == provider && book.fiction_uid == fiction_uid)
    }

    fn book_mut(&mut self, id: BookId) -> Result<&mut Book, StoreError> {
        self.books
            .iter_mut()
            .find(|book| book.id == id)
            .ok_or(StoreError::BookNotFound(id))
    }

    fn get_book(&self, id: BookId) -> Result<Book, StoreError> {
        self.books
            .iter()
            .find(|book| book.id == id)
            .cloned()
            .ok_or(StoreError::BookNotFound(id))
    }

    fn insert_book(&mut self, new: NewBook) -> Result<Book, StoreError> {
        if self.find_book(&new.provider, &new.fiction_uid).is_some() {
            return Err(StoreError::DuplicateKey(format!(
                "book ({}, {})",
                new.provider, new.fiction_uid
            )));
        }

        self.next_book_id += 1;
        let now = Utc::now();
        let book = Book {
            id: self.next_book_id,
            provider: new.provider,
            fiction_uid: new.fiction_uid,
            source_url: new.source_url,
            title: new.title,
            author: new.author,
            language: new.language,
            cover: new.cover,
            created_at: now,
            updated_at: now,
        };
        self.books.push(book.clone());
        Ok(book)
    }

    fn update_book_meta(&mut self, id: BookId, update: &BookMetaUpdate) -> Result<Book, StoreError> {
        let book = self.book_mut(id)?;
        if let Some(title) = &update.title {
            book.title.clone_from(title);
        }
        if let Some(author) = &update.author {
            book.author.clone_from(author);
        }
        if let Some(language) = &update.language {
            book.language.clone_from(language);
        }
        if let Some(cover) = &update.cover {
            book.cover = Some(cover.clone());
        }
        book.updated_at = Utc::now();
        Ok(book.clone())
    }

    fn find_chapter(&self, book_id: BookId, provider_chapter_id: &str) -> Option<&Chapter> {
        self.chapters.iter().find(|chapter| {
            chapter.book_id == book_id && chapter.provider_chapter_id == provider_chapter_id
        })
    }

    fn chapter_mut(&mut self, id: ChapterId) -> Result<&mut Chapter, StoreError> {
        self.chapters
            .iter_mut()
            .find(|chapter| chapter.id == id)
            .ok_or(StoreError::ChapterNotFound(id))
    }

    fn get_chapter(&self, id: ChapterId) -> Result<Chapter, StoreError> {
        self.chapters
            .iter()
            .find(|chapter| chapter.id == id)
            .cloned()
            .ok_or(StoreError::ChapterNotFound(id))
    }

    fn insert_chapter(&mut self, new: NewChapter) -> Result<Chapter, StoreError> {
        self.get_book(new.book_id)?;
        if self
            .find_chapter(new.book_id, &new.provider_chapter_id)
            .is_some()
        {
            return Err(StoreError::DuplicateKey(format!(
                "chapter ({}, {})",
                new.book_id, new.provider_chapter_id
            )));
        }

        self.next_chapter_id += 1;
        let chapter = Chapter {
            id: self.next_chapter_id,
            book_id: new.book_id,
            index: new.index,
            title: new.title,
            body: None,
            provider_chapter_id: new.provider_chapter_id,
            source_url: new.source_url,
            fetched: false,
            fetched_at: None,
            created_at: Utc::now(),
        };
        self.chapters.push(chapter.clone());
        Ok(chapter)
    }

    fn update_chapter_ref(
        &mut self,
        id: ChapterId,
        index: usize,
        title: Option<&str>,
        source_url: &str,
    ) -> Result<Chapter, StoreError> {
        let chapter = self.chapter_mut(id)?;
        chapter.index = index;
        if let Some(title) = title {
            chapter.title = title.to_string();
        }
        chapter.source_url = source_url.to_string();
        Ok(chapter.clone())
    }

    fn write_chapter_body(
        &mut self,
        id: ChapterId,
        body: &ChapterBody,
        mode: BodyWrite,
    ) -> Result<bool, StoreError> {
        let chapter = self.chapter_mut(id)?;
        if mode == BodyWrite::IfMissing && (chapter.fetched || chapter.body.is_some()) {
            return Ok(false);
        }

        if let Some(title) = &body.title {
            chapter.title.clone_from(title);
        }
        chapter.body = Some(body.body.clone());
        chapter.fetched = true;
        chapter.fetched_at = Some(body.fetched_at);
        Ok(true)
    }

    fn list_chapters(
        &self,
        book_id: BookId,
        filter: ChapterFilter,
        limit: Option<usize>,
    ) -> Vec<Chapter> {
        let mut chapters: Vec<Chapter> = self
            .chapters
            .iter()
            .filter(|chapter| chapter.book_id == book_id && filter.accepts(chapter))
            .cloned()
            .collect();
        chapters.sort_by_key(|chapter| (chapter.index, chapter.id));
        if let Some(limit) = limit {
            chapters.truncate(limit);
        }
        chapters
    }
}

/// Process-local store, mostly for tests and one-shot runs.
#[derive(Debug, Default)]
pub struct MemoryBookStore {
    library: Mutex<Library>,
}

impl MemoryBookStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(
        &self,
        f: impl FnOnce(&mut Library) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut library = self.library.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut library)
    }
}

/// `library.json` under the data dir. Every mutation is a read-modify-write
/// under an exclusive lock on the sibling `library.lock`, followed by an
/// atomic replace of the file. Reads hold the same lock shared, so separate
/// instances and separate processes see each other's writes.
#[derive(Debug)]
pub struct LocalFsBookStore {
    path: PathBuf,
}

impl LocalFsBookStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// The lock is released when the returned handle is dropped.
    fn acquire(&self, exclusive: bool) -> Result<File, StoreError> {
        let lock_path = self.lock_path();
        let io_err = |source| StoreError::Io {
            path: lock_path.clone(),
            source,
        };
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(io_err)?;
        let locked = if exclusive {
            fs4::fs_std::FileExt::lock_exclusive(&file)
        } else {
            fs4::fs_std::FileExt::lock_shared(&file)
        };
        locked.map_err(io_err)?;
        Ok(file)
    }

    fn load(&self) -> Result<Library, StoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
                path: self.path.clone(),
                source,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Library::default()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Library) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let library = {
            let _lock = self.acquire(false)?;
            self.load()?
        };
        f(&library)
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut Library) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _lock = self.acquire(true)?;
        let mut library = self.load()?;
        let out = f(&mut library)?;
        write_json_atomic(&self.path, &library)?;
        Ok(out)
    }
}

macro_rules! delegate_book_store {
    ($store:ty, $read:ident, $write:ident) => {
        impl BookStore for $store {
            fn find_book(
                &self,
                provider: &str,
                fiction_uid: &str,
            ) -> Result<Option<Book>, StoreError> {
                self.$read(|lib| Ok(lib.find_book(provider, fiction_uid).cloned()))
            }

            fn get_book(&self, id: BookId) -> Result<Book, StoreError> {
                self.$read(|lib| lib.get_book(id))
            }

            fn insert_book(&self, book: NewBook) -> Result<Book, StoreError> {
                self.$write(|lib| lib.insert_book(book))
            }

            fn update_book_meta(
                &self,
                id: BookId,
                update: &BookMetaUpdate,
            ) -> Result<Book, StoreError> {
                self.$write(|lib| lib.update_book_meta(id, update))
            }

            fn list_books(&self) -> Result<Vec<Book>, StoreError> {
                self.$read(|lib| Ok(lib.books.clone()))
            }

            fn find_chapter(
                &self,
                book_id: BookId,
                provider_chapter_id: &str,
            ) -> Result<Option<Chapter>, StoreError> {
                self.$read(|lib| Ok(lib.find_chapter(book_id, provider_chapter_id).cloned()))
            }

            fn get_chapter(&self, id: ChapterId) -> Result<Chapter, StoreError> {
                self.$read(|lib| lib.get_chapter(id))
            }

            fn insert_chapter(&self, chapter: NewChapter) -> Result<Chapter, StoreError> {
                self.$write(|lib| lib.insert_chapter(chapter))
            }

            fn update_chapter_ref(
                &self,
                id: ChapterId,
                index: usize,
                title: Option<&str>,
                source_url: &str,
            ) -> Result<Chapter, StoreError> {
                self.$write(|lib| lib.update_chapter_ref(id, index, title, source_url))
            }

            fn write_chapter_body(
                &self,
                id: ChapterId,
                body: &ChapterBody,
                mode: BodyWrite,
            ) -> Result<bool, StoreError> {
                self.$write(|lib| lib.write_chapter_body(id, body, mode))
            }

            fn list_chapters(
                &self,
                book_id: BookId,
                filter: ChapterFilter,
                limit: Option<usize>,
            ) -> Result<Vec<Chapter>, StoreError> {
                self.$read(|lib| Ok(lib.list_chapters(book_id, filter, limit)))
            }

            fn count_chapters(
                &self,
                book_id: BookId,
                filter: ChapterFilter,
            ) -> Result<usize, StoreError> {
                self.$read(|lib| Ok(lib.list_chapters(book_id, filter, None).len()))
            }
        }
    };
}

delegate_book_store!(MemoryBookStore, with, with);
delegate_book_store!(LocalFsBookStore, read, write);

/// Serialize to a uniquely named sibling and rename it over `path`.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
        path: parent.to_path_buf(),
        source,
    })?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(&tmp_path, &data).map_err(|source| StoreError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
