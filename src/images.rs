//! Per-document image registry: discovery, de-duplication and rewriting of
//! `<img>` references to packaged paths.

use std::collections::{HashMap, HashSet};

use sha2::Digest as _;
use url::Url;

use crate::fetch::{Fetcher, ImageBounds};
use crate::html::{ElementAction, transform_fragment};

pub const IMAGE_MEDIA_TYPE: &str = "image/jpeg";
pub const IMAGES_DIR: &str = "images";

pub type ImageId = String;

/// Hex SHA-256 of the absolute source URL.
pub fn image_id(url: &Url) -> ImageId {
    hex::encode(sha2::Sha256::digest(url.as_str().as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAsset {
    pub id: ImageId,
    pub url: Url,
}

impl ImageAsset {
    /// Path inside the package, relative to the chapter documents.
    pub fn package_path(&self) -> String {
        package_path(&self.id)
    }
}

fn package_path(id: &str) -> String {
    format!("{IMAGES_DIR}/{id}.jpg")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewrittenFragment {
    pub html: String,
    /// Images referenced by this fragment, in document order, without repeats.
    pub images: Vec<ImageId>,
}

#[derive(Debug, Default)]
pub struct ResolvedImages {
    /// Encoded bytes in registration order.
    pub images: Vec<(ImageAsset, Vec<u8>)>,
    pub dropped: HashSet<ImageId>,
}

/// One per assembled document. Images are de-duplicated by absolute URL.
#[derive(Debug, Default)]
pub struct ImagePipeline {
    assets: Vec<ImageAsset>,
    by_url: HashMap<String, usize>,
}

impl ImagePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assets(&self) -> &[ImageAsset] {
        &self.assets
    }

    pub fn register(&mut self, url: Url) -> &ImageAsset {
        let position = match self.by_url.get(url.as_str()) {
            Some(&position) => position,
            None => {
                let position = self.assets.len();
                self.by_url.insert(url.to_string(), position);
                self.assets.push(ImageAsset {
                    id: image_id(&url),
                    url,
                });
                position
            }
        };
        &self.assets[position]
    }

    /// Resolve every `<img src>` against `base_url`, register it and point
    /// it at its packaged path. Images with no resolvable source are removed.
    pub fn rewrite_fragment(&mut self, html: &str, base_url: Option<&Url>) -> RewrittenFragment {
        let mut images: Vec<ImageId> = Vec::new();
        let html = transform_fragment(html, &mut |el| {
            if el.value().name() != "img" {
                return ElementAction::Keep;
            }
            let Some(url) = el.value().attr("src").and_then(|src| resolve_src(src, base_url))
            else {
                tracing::debug!(base_url = ?base_url.map(Url::as_str), "dropping img without usable src");
                return ElementAction::Drop;
            };

            let asset = self.register(url);
            if !images.contains(&asset.id) {
                images.push(asset.id.clone());
            }

            let mut attrs = vec![("src".to_string(), asset.package_path())];
            let mut has_alt = false;
            for (name, value) in el.value().attrs() {
                match name {
                    "src" | "srcset" | "sizes" | "loading" => {}
                    _ => {
                        has_alt |= name == "alt";
                        attrs.push((name.to_string(), value.to_string()));
                    }
                }
            }
            if !has_alt {
                attrs.push(("alt".to_string(), String::new()));
            }
            ElementAction::Rewrite(attrs)
        });

        RewrittenFragment { html, images }
    }

    /// Fetch each registered image once. Failures are logged and reported in
    /// `dropped`; they never fail the batch.
    pub fn resolve(&self, fetcher: &Fetcher, bounds: ImageBounds) -> ResolvedImages {
        let mut resolved = ResolvedImages::default();
        for asset in &self.assets {
            match fetcher.fetch_image(&asset.url, bounds, false) {
                Ok(bytes) => resolved.images.push((asset.clone(), bytes)),
                Err(err) => {
                    tracing::warn!(url = %asset.url, err = %err, "image unavailable; dropping");
                    resolved.dropped.insert(asset.id.clone());
                }
            }
        }
        resolved
    }
}

fn resolve_src(src: &str, base_url: Option<&Url>) -> Option<Url> {
    let src = src.trim();
    if src.is_empty() {
        return None;
    }
    let url = match base_url {
        Some(base) => base.join(src).ok()?,
        None => Url::parse(src).ok()?,
    };
    matches!(url.scheme(), "http" | "https").then_some(url)
}

/// Remove every `<img>`.
pub fn strip_images(html: &str) -> String {
    transform_fragment(html, &mut |el| {
        if el.value().name() == "img" {
            ElementAction::Drop
        } else {
            ElementAction::Keep
        }
    })
}

/// Remove `<img>` elements that point at one of the `dropped` images.
pub fn drop_references(html: &str, dropped: &HashSet<ImageId>) -> String {
    if dropped.is_empty() {
        return html.to_string();
    }
    let dropped_paths: HashSet<String> = dropped.iter().map(|id| package_path(id)).collect();
    transform_fragment(html, &mut |el| {
        let is_dropped = el.value().name() == "img"
            && el
                .value()
                .attr("src")
                .is_some_and(|src| dropped_paths.contains(src));
        if is_dropped {
            ElementAction::Drop
        } else {
            ElementAction::Keep
        }
    })
}
