use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure the ingestion/assembly core can surface.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("no provider registered for key: {0}")]
    UnknownProvider(String),

    #[error("could not derive a fiction id from url: {0}")]
    InvalidFictionUrl(String),

    #[error("assemble document {path}: {source}")]
    Assembly {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("package document: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("book {0} has no fetched chapters to export")]
    EmptyBook(u64),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },

    #[error("fetch {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("fetch {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache entry {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Extraction failures. `tried` lists every locator (or ToC tier) attempted.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("fiction parse failed: {reason}. tried selectors: {tried:?} | url={url}")]
    Fiction {
        reason: String,
        url: String,
        tried: Vec<String>,
    },

    #[error("chapter parse failed: {reason}. tried selectors: {tried:?}{}", url_suffix(.url))]
    Chapter {
        reason: String,
        url: Option<String>,
        tried: Vec<String>,
    },

    #[error("invalid selector {selector:?}: {message}")]
    InvalidSelector { selector: String, message: String },
}

fn url_suffix(url: &Option<String>) -> String {
    match url {
        Some(url) => format!(" | url={url}"),
        None => String::new(),
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("book not found: {0}")]
    BookNotFound(u64),

    #[error("chapter not found: {0}")]
    ChapterNotFound(u64),

    #[error("store file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("decode image {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: image::ImageError,
    },

    #[error("encode image {url}: {source}")]
    Encode {
        url: String,
        #[source]
        source: image::ImageError,
    },
}
