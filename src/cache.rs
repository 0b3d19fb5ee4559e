use std::io::Write as _;
use std::path::{Path, PathBuf};

use sha2::Digest as _;
use url::Url;

use crate::error::CacheError;

/// Derived forms of a source that must never share a key with the raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    /// Image downscaled to fit inside `max_width` x `max_height`, re-encoded.
    Image { max_width: u32, max_height: u32 },
}

impl Variant {
    fn tag(&self) -> String {
        match self {
            Variant::Image {
                max_width,
                max_height,
            } => format!("image:{max_width}x{max_height}"),
        }
    }
}

/// Fragments never reach the server, so they never distinguish content.
pub fn normalize_url(url: &Url) -> Url {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    normalized
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_url(url: &Url, variant: Option<Variant>) -> Self {
        let normalized = normalize_url(url);
        let mut hasher = sha2::Sha256::new();
        hasher.update(normalized.as_str().as_bytes());
        if let Some(variant) = variant {
            hasher.update(b"\n");
            hasher.update(variant.tag().as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Filesystem blob store addressed by [`CacheKey`]. Entries are written once
/// through a temp file + rename, so a reader sees either nothing or a complete
/// blob.
#[derive(Debug, Clone)]
pub struct ContentCache {
    root: PathBuf,
}

impl ContentCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let key = key.as_str();
        self.root.join(&key[..2]).join(key)
    }

    /// `Ok(None)` on a miss. A present but unreadable entry is reported as an
    /// error so the caller can decide to refetch.
    pub fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.entry_path(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entry_path(key).is_file()
    }

    pub fn put(&self, key: &CacheKey, bytes: &[u8]) -> Result<PathBuf, CacheError> {
        let path = self.entry_path(key);
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        std::fs::create_dir_all(&parent).map_err(|source| CacheError::Io {
            path: parent.clone(),
            source,
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(&parent).map_err(|source| {
            CacheError::Io {
                path: parent.clone(),
                source,
            }
        })?;
        let tmp_path = tmp.path().to_path_buf();
        tmp.write_all(bytes)
            .and_then(|()| tmp.flush())
            .map_err(|source| CacheError::Io {
                path: tmp_path,
                source,
            })?;
        tmp.persist(&path).map_err(|err| CacheError::Io {
            path: path.clone(),
            source: err.error,
        })?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn fragment_does_not_change_key() {
        let a = CacheKey::for_url(&url("https://Example.com/a/b#top"), None);
        let b = CacheKey::for_url(&url("https://example.com/a/b"), None);
        assert_eq!(a, b);
    }

    #[test]
    fn variant_keys_never_collide_with_raw() {
        let u = url("https://example.com/cover.png");
        let raw = CacheKey::for_url(&u, None);
        let small = CacheKey::for_url(
            &u,
            Some(Variant::Image {
                max_width: 256,
                max_height: 256,
            }),
        );
        let large = CacheKey::for_url(
            &u,
            Some(Variant::Image {
                max_width: 1024,
                max_height: 1024,
            }),
        );
        assert_ne!(raw, small);
        assert_ne!(small, large);
    }

    #[test]
    fn put_then_get_roundtrips_and_replaces() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = ContentCache::new(dir.path());
        let key = CacheKey::for_url(&url("https://example.com/page"), None);

        assert!(cache.get(&key).unwrap().is_none());
        cache.put(&key, b"first").unwrap();
        assert_eq!(cache.get(&key).unwrap().as_deref(), Some(&b"first"[..]));

        cache.put(&key, b"second").unwrap();
        assert_eq!(cache.get(&key).unwrap().as_deref(), Some(&b"second"[..]));
        assert!(cache.entry_path(&key).starts_with(dir.path()));
    }
}
