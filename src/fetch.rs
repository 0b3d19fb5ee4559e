use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView as _, RgbImage};
use reqwest::header::ACCEPT;
use url::Url;

use crate::cache::{CacheKey, ContentCache, Variant};
use crate::error::{FetchError, ImageError, Result};

const JPEG_QUALITY: u8 = 85;

/// The only place bytes enter the process from the network.
pub trait Transport: Send + Sync {
    fn get(&self, url: &Url) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "text/html,application/xhtml+xml,image/*;q=0.9,*/*;q=0.8")
            .send()
            .map_err(|err| classify(url, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().map_err(|err| classify(url, err))?;
        Ok(bytes.to_vec())
    }
}

fn classify(url: &Url, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Network {
            url: url.to_string(),
            source: err,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Skip the cache lookup and overwrite the stored entry.
    pub ignore_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageBounds {
    pub max_width: u32,
    pub max_height: u32,
}

impl ImageBounds {
    pub fn new(max_width: u32, max_height: u32) -> Self {
        Self {
            max_width,
            max_height,
        }
    }

    fn variant(&self) -> Variant {
        Variant::Image {
            max_width: self.max_width,
            max_height: self.max_height,
        }
    }
}

impl Default for ImageBounds {
    fn default() -> Self {
        Self::new(1024, 1024)
    }
}

/// Fetch-or-serve-from-cache. Passed explicitly to everything that does I/O.
pub struct Fetcher {
    cache: ContentCache,
    transport: Arc<dyn Transport>,
    network_fetches: AtomicUsize,
}

impl Fetcher {
    pub fn new(cache: ContentCache, transport: Arc<dyn Transport>) -> Self {
        Self {
            cache,
            transport,
            network_fetches: AtomicUsize::new(0),
        }
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    /// Number of requests that actually went to the transport.
    pub fn network_fetches(&self) -> usize {
        self.network_fetches.load(Ordering::Relaxed)
    }

    pub fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        self.fetch_with(url, &FetchOptions::default())
    }

    pub fn fetch_with(&self, url: &Url, options: &FetchOptions) -> Result<Vec<u8>> {
        let key = CacheKey::for_url(url, None);
        if !options.ignore_cache
            && let Some(bytes) = self.cached(&key, url)
        {
            return Ok(bytes);
        }

        let bytes = self.download(url)?;
        self.cache.put(&key, &bytes)?;
        Ok(bytes)
    }

    pub fn fetch_html(&self, url: &Url, options: &FetchOptions) -> Result<scraper::Html> {
        let bytes = self.fetch_with(url, options)?;
        let html = String::from_utf8_lossy(&bytes);
        Ok(scraper::Html::parse_document(&html))
    }

    /// Serve the resized/re-encoded variant of an image, deriving (and caching)
    /// it from the raw bytes on a miss.
    pub fn fetch_image(&self, url: &Url, bounds: ImageBounds, ignore_cache: bool) -> Result<Vec<u8>> {
        let key = CacheKey::for_url(url, Some(bounds.variant()));
        if !ignore_cache && let Some(bytes) = self.cached(&key, url) {
            return Ok(bytes);
        }

        let raw = self.fetch_with(url, &FetchOptions { ignore_cache })?;
        let encoded = normalize_image(url.as_str(), &raw, bounds)?;
        self.cache.put(&key, &encoded)?;
        Ok(encoded)
    }

    fn cached(&self, key: &CacheKey, url: &Url) -> Option<Vec<u8>> {
        match self.cache.get(key) {
            Ok(Some(bytes)) => {
                tracing::debug!(url = %url, key = key.as_str(), "cache hit");
                Some(bytes)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(url = %url, ?err, "unreadable cache entry; refetching");
                None
            }
        }
    }

    fn download(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        tracing::debug!(url = %url, "downloading");
        self.network_fetches.fetch_add(1, Ordering::Relaxed);
        self.transport.get(url)
    }
}

/// Read a local image and put it through the same resize/flatten path as
/// remote ones.
pub fn load_local_image(path: &Path, bounds: ImageBounds) -> anyhow::Result<Vec<u8>> {
    let raw = std::fs::read(path).with_context(|| format!("read image: {}", path.display()))?;
    let encoded = normalize_image(&path.display().to_string(), &raw, bounds)
        .with_context(|| format!("normalize image: {}", path.display()))?;
    Ok(encoded)
}

/// Decode, downscale to fit `bounds` (aspect preserved, never upscaled),
/// flatten any alpha onto white and encode as JPEG.
pub fn normalize_image(
    source: &str,
    bytes: &[u8],
    bounds: ImageBounds,
) -> Result<Vec<u8>, ImageError> {
    let decoded = image::load_from_memory(bytes).map_err(|source_err| ImageError::Decode {
        url: source.to_string(),
        source: source_err,
    })?;

    let (width, height) = decoded.dimensions();
    let fitted = if width > bounds.max_width || height > bounds.max_height {
        decoded.resize(bounds.max_width, bounds.max_height, FilterType::Lanczos3)
    } else {
        decoded
    };

    let opaque = flatten_alpha(&fitted);

    let mut out = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    opaque
        .write_with_encoder(encoder)
        .map_err(|source_err| ImageError::Encode {
            url: source.to_string(),
            source: source_err,
        })?;
    Ok(out.into_inner())
}

fn flatten_alpha(img: &DynamicImage) -> DynamicImage {
    if !img.color().has_alpha() {
        return DynamicImage::ImageRgb8(img.to_rgb8());
    }

    let rgba = img.to_rgba8();
    let flattened = RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let a = u16::from(a);
        let blend = |c: u8| ((u16::from(c) * a + 255 * (255 - a)) / 255) as u8;
        image::Rgb([blend(r), blend(g), blend(b)])
    });
    DynamicImage::ImageRgb8(flattened)
}
