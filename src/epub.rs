use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use url::Url;
use zip::write::SimpleFileOptions;

use crate::error::{Error, Result};
use crate::fetch::{self, Fetcher, ImageBounds};
use crate::html::{escape_attr, escape_text};
use crate::images::{self, IMAGE_MEDIA_TYPE, ImagePipeline};
use crate::provider::CoverSource;

const COVER_PATH: &str = "cover.jpg";

#[derive(Debug, Clone)]
pub struct BookMetadata {
    /// Stable identifier written to `dc:identifier`.
    pub identifier: String,
    pub title: String,
    pub author: String,
    /// BCP-47 tag; empty means `und`.
    pub language: String,
}

#[derive(Debug, Clone, Copy)]
pub struct AssemblyOptions {
    pub include_images: bool,
    /// Prepend an `<h1>` with the chapter title to each chapter body.
    pub include_chapter_titles: bool,
    pub image_bounds: ImageBounds,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            include_images: true,
            include_chapter_titles: false,
            image_bounds: ImageBounds::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblyReport {
    pub chapters: usize,
    pub images_packaged: usize,
    pub images_dropped: usize,
    pub cover: bool,
}

#[derive(Debug)]
struct ChapterUnit {
    stem: String,
    title: String,
    body_html: String,
}

/// Collects chapters in the order given and writes them out as one EPUB 3
/// package.
#[derive(Debug)]
pub struct EpubAssembler {
    metadata: BookMetadata,
    options: AssemblyOptions,
    cover: Option<CoverSource>,
    stylesheet: Option<String>,
    chapters: Vec<ChapterUnit>,
    images: ImagePipeline,
}

impl EpubAssembler {
    pub fn new(metadata: BookMetadata, options: AssemblyOptions) -> Self {
        Self {
            metadata,
            options,
            cover: None,
            stylesheet: None,
            chapters: Vec::new(),
            images: ImagePipeline::new(),
        }
    }

    pub fn with_cover(mut self, cover: Option<CoverSource>) -> Self {
        self.cover = cover;
        self
    }

    pub fn with_stylesheet(mut self, css: impl Into<String>) -> Self {
        self.stylesheet = Some(css.into());
        self
    }

    pub fn chapter_count(&self) -> usize {
        self.chapters.len()
    }

    /// `base_url` resolves relative image references in `body_html`.
    pub fn add_chapter(&mut self, title: &str, body_html: &str, base_url: Option<&Url>) {
        let body = if self.options.include_images {
            self.images.rewrite_fragment(body_html, base_url).html
        } else {
            images::strip_images(body_html)
        };
        let body_html = if self.options.include_chapter_titles {
            format!("<h1>{}</h1>\n{body}", escape_text(title))
        } else {
            body
        };

        self.chapters.push(ChapterUnit {
            stem: format!("chapter_{}", self.chapters.len() + 1),
            title: title.to_string(),
            body_html,
        });
    }

    /// Fetch images and cover, then write the package to `out_path` through a
    /// temp file in the same directory.
    pub fn write(&self, fetcher: &Fetcher, out_path: &Path) -> Result<AssemblyReport> {
        let bounds = self.options.image_bounds;
        let resolved = self.images.resolve(fetcher, bounds);
        let cover = self.load_cover(fetcher);

        let lang = match self.metadata.language.trim() {
            "" => "und",
            lang => lang,
        };
        let modified = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let image_paths: Vec<String> = resolved
            .images
            .iter()
            .map(|(asset, _)| asset.package_path())
            .collect();

        let parent = match out_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|source| assembly(&parent, source))?;
        let mut tmp =
            tempfile::NamedTempFile::new_in(&parent).map_err(|source| assembly(&parent, source))?;

        {
            let mut zip = zip::ZipWriter::new(tmp.as_file_mut());

            let mimetype_options = SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Stored)
                .unix_permissions(0o644);
            zip.start_file("mimetype", mimetype_options)?;
            zip.write_all(b"application/epub+zip")
                .map_err(|source| assembly(out_path, source))?;

            let deflated = SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated)
                .unix_permissions(0o644);
            let mut entry = |name: &str, bytes: &[u8]| -> Result<()> {
                zip.start_file(name, deflated)?;
                zip.write_all(bytes).map_err(|source| assembly(out_path, source))
            };

            entry("META-INF/container.xml", render_container_xml().as_bytes())?;
            entry(
                "OEBPS/content.opf",
                render_content_opf(
                    &self.metadata,
                    lang,
                    &modified,
                    &self.chapters,
                    &image_paths,
                    cover.is_some(),
                )
                .as_bytes(),
            )?;
            entry(
                "OEBPS/nav.xhtml",
                render_nav_xhtml(&self.metadata.title, lang, &self.chapters).as_bytes(),
            )?;
            entry(
                "OEBPS/toc.ncx",
                render_toc_ncx(&self.metadata, &self.chapters).as_bytes(),
            )?;
            let css = self.stylesheet.as_deref().unwrap_or(DEFAULT_STYLE_CSS);
            entry("OEBPS/style.css", css.as_bytes())?;

            if let Some(cover) = &cover {
                entry(&format!("OEBPS/{COVER_PATH}"), cover)?;
            }

            for chapter in &self.chapters {
                let body = images::drop_references(&chapter.body_html, &resolved.dropped);
                let xhtml = wrap_xhtml_document(&chapter.title, lang, &body);
                entry(&format!("OEBPS/{}.xhtml", chapter.stem), xhtml.as_bytes())?;
            }

            for (asset, bytes) in &resolved.images {
                entry(&format!("OEBPS/{}", asset.package_path()), bytes)?;
            }

            zip.finish()?;
        }

        tmp.persist(out_path)
            .map_err(|err| assembly(out_path, err.error))?;

        let report = AssemblyReport {
            chapters: self.chapters.len(),
            images_packaged: resolved.images.len(),
            images_dropped: resolved.dropped.len(),
            cover: cover.is_some(),
        };
        tracing::info!(
            out = %out_path.display(),
            chapters = report.chapters,
            images = report.images_packaged,
            dropped = report.images_dropped,
            cover = report.cover,
            "epub written"
        );
        Ok(report)
    }

    fn load_cover(&self, fetcher: &Fetcher) -> Option<Vec<u8>> {
        let bounds = self.options.image_bounds;
        let loaded = match self.cover.as_ref()? {
            CoverSource::Remote(url) => fetcher
                .fetch_image(url, bounds, false)
                .map_err(anyhow::Error::from),
            CoverSource::Local(path) => fetch::load_local_image(path, bounds),
        };
        match loaded {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::warn!(err = %format!("{err:#}"), "cover unavailable; omitting");
                None
            }
        }
    }
}

fn assembly(path: &Path, source: std::io::Error) -> Error {
    Error::Assembly {
        path: path.to_path_buf(),
        source,
    }
}

const DEFAULT_STYLE_CSS: &str = r#"@charset "utf-8";

html { font-family: serif; }
body { margin: 0; padding: 0 1.2em; line-height: 1.6; }
h1 { font-size: 1.4em; margin: 1em 0 0.8em; }
p { margin: 0 0 0.8em; text-indent: 1em; }
img { max-width: 100%; height: auto; }
table { border-collapse: collapse; margin: 1em 0; }
td, th { border: 1px solid #999; padding: 0.3em 0.5em; }
blockquote { margin: 1em 0; padding: 0 1em; border-left: 4px solid #ddd; color: #333; }
"#;

fn render_container_xml() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#
    .to_string()
}

fn render_nav_xhtml(title: &str, lang: &str, chapters: &[ChapterUnit]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" lang=\"{}\" xml:lang=\"{}\">\n",
        xml_escape(lang),
        xml_escape(lang)
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("  <link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(&format!("  <h1>{}</h1>\n", xml_escape(title)));
    out.push_str("  <nav epub:type=\"toc\" id=\"toc\">\n");
    out.push_str("    <ol>\n");
    for ch in chapters {
        out.push_str(&format!(
            "      <li><a href=\"{}.xhtml\">{}</a></li>\n",
            xml_escape(&ch.stem),
            xml_escape(&ch.title)
        ));
    }
    out.push_str("    </ol>\n");
    out.push_str("  </nav>\n");
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

fn render_toc_ncx(metadata: &BookMetadata, chapters: &[ChapterUnit]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(
        "<!DOCTYPE ncx PUBLIC \"-//NISO//DTD ncx 2005-1//EN\" \"http://www.daisy.org/z3986/2005/ncx-2005-1.dtd\">\n",
    );
    out.push_str("<ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\">\n");
    out.push_str("  <head>\n");
    out.push_str(&format!(
        "    <meta name=\"dtb:uid\" content=\"{}\" />\n",
        xml_escape(&metadata.identifier)
    ));
    out.push_str("    <meta name=\"dtb:depth\" content=\"1\" />\n");
    out.push_str("    <meta name=\"dtb:totalPageCount\" content=\"0\" />\n");
    out.push_str("    <meta name=\"dtb:maxPageNumber\" content=\"0\" />\n");
    out.push_str("  </head>\n");
    out.push_str("  <docTitle><text>");
    out.push_str(&xml_escape(&metadata.title));
    out.push_str("</text></docTitle>\n");
    out.push_str("  <docAuthor><text>");
    out.push_str(&xml_escape(&metadata.author));
    out.push_str("</text></docAuthor>\n");
    out.push_str("  <navMap>\n");
    for (idx, ch) in chapters.iter().enumerate() {
        let play = idx + 1;
        out.push_str(&format!(
            "    <navPoint id=\"navPoint-{play}\" playOrder=\"{play}\">\n"
        ));
        out.push_str("      <navLabel><text>");
        out.push_str(&xml_escape(&ch.title));
        out.push_str("</text></navLabel>\n");
        out.push_str(&format!(
            "      <content src=\"{}.xhtml\" />\n",
            xml_escape(&ch.stem)
        ));
        out.push_str("    </navPoint>\n");
    }
    out.push_str("  </navMap>\n");
    out.push_str("</ncx>\n");
    out
}

fn render_content_opf(
    metadata: &BookMetadata,
    lang: &str,
    modified: &str,
    chapters: &[ChapterUnit],
    image_paths: &[String],
    has_cover: bool,
) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(&format!(
        "<package xmlns=\"http://www.idpf.org/2007/opf\" unique-identifier=\"bookid\" version=\"3.0\" xml:lang=\"{}\">\n",
        xml_escape(lang)
    ));
    out.push_str("  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n");
    out.push_str(&format!(
        "    <dc:identifier id=\"bookid\">{}</dc:identifier>\n",
        xml_escape(&metadata.identifier)
    ));
    out.push_str(&format!(
        "    <dc:title>{}</dc:title>\n",
        xml_escape(&metadata.title)
    ));
    out.push_str(&format!(
        "    <dc:creator>{}</dc:creator>\n",
        xml_escape(&metadata.author)
    ));
    out.push_str(&format!(
        "    <dc:language>{}</dc:language>\n",
        xml_escape(lang)
    ));
    out.push_str(&format!(
        "    <meta property=\"dcterms:modified\">{}</meta>\n",
        xml_escape(modified)
    ));
    if has_cover {
        out.push_str("    <meta name=\"cover\" content=\"cover-image\" />\n");
    }
    out.push_str("  </metadata>\n");
    out.push_str("  <manifest>\n");
    out.push_str(
        "    <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\" />\n",
    );
    out.push_str(
        "    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\" />\n",
    );
    out.push_str("    <item id=\"css\" href=\"style.css\" media-type=\"text/css\" />\n");
    if has_cover {
        out.push_str(&format!(
            "    <item id=\"cover-image\" href=\"{COVER_PATH}\" media-type=\"{IMAGE_MEDIA_TYPE}\" properties=\"cover-image\" />\n"
        ));
    }

    for ch in chapters {
        out.push_str(&format!(
            "    <item id=\"{}\" href=\"{}.xhtml\" media-type=\"application/xhtml+xml\" />\n",
            xml_escape(&ch.stem),
            xml_escape(&ch.stem)
        ));
    }

    for (idx, path) in image_paths.iter().enumerate() {
        out.push_str(&format!(
            "    <item id=\"image-{}\" href=\"{}\" media-type=\"{IMAGE_MEDIA_TYPE}\" />\n",
            idx + 1,
            xml_escape(path)
        ));
    }

    out.push_str("  </manifest>\n");
    out.push_str("  <spine toc=\"ncx\">\n");
    for ch in chapters {
        out.push_str(&format!(
            "    <itemref idref=\"{}\" />\n",
            xml_escape(&ch.stem)
        ));
    }
    out.push_str("  </spine>\n");
    out.push_str("</package>\n");
    out
}

fn wrap_xhtml_document(title: &str, lang: &str, body_html: &str) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" lang=\"{}\" xml:lang=\"{}\">\n",
        xml_escape(lang),
        xml_escape(lang)
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("  <link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(body_html);
    if !body_html.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

fn xml_escape(input: &str) -> String {
    escape_attr(input).replace('\'', "&apos;")
}
