//! Ordered-locator extraction of chapter content and table-of-contents links.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::ParseError;
use crate::html::{ElementAction, outer_html_with};

pub const PLACEHOLDER_TITLE: &str = "Untitled Chapter";

static CSS_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("css comment regex"));
static CSS_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^{}]+)\{([^{}]*)\}").expect("css rule regex"));
static DISPLAY_NONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)display\s*:\s*none").expect("display none regex"));
static CLASS_SELECTOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\.(-?[_a-zA-Z][_a-zA-Z0-9-]*)$").expect("class selector regex")
});
static HEAD_STYLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("head style").expect("head style selector"));
static CONTENT_HEADING: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1, h2").expect("heading selector"));
static ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("anchor selector"));

/// Ordered candidate selectors. The source strings are kept for diagnostics.
#[derive(Debug, Clone)]
pub struct Locators {
    entries: Vec<(String, Selector)>,
}

impl Locators {
    pub fn parse(sources: &[&str]) -> Result<Self, ParseError> {
        let entries = sources
            .iter()
            .map(|source| compile(source).map(|selector| (source.to_string(), selector)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    pub fn sources(&self) -> Vec<String> {
        self.entries.iter().map(|(source, _)| source.clone()).collect()
    }

    /// First element, trying locators in order, that satisfies `accept`.
    pub fn first_match<'a>(
        &self,
        doc: &'a Html,
        accept: impl Fn(&ElementRef<'a>) -> bool,
    ) -> Option<ElementRef<'a>> {
        self.entries
            .iter()
            .find_map(|(_, selector)| doc.select(selector).find(|el| accept(el)))
    }

    /// Collapsed text of the first element with non-empty text.
    pub fn first_text(&self, doc: &Html) -> Option<String> {
        self.first_match(doc, |el| !element_text(el).is_empty())
            .map(|el| element_text(&el))
    }

    /// First non-empty value of `attr` among matched elements.
    pub fn first_attr(&self, doc: &Html, attr: &str) -> Option<String> {
        self.first_match(doc, |el| {
            el.value()
                .attr(attr)
                .is_some_and(|value| !value.trim().is_empty())
        })
        .and_then(|el| el.value().attr(attr).map(|value| value.trim().to_string()))
    }
}

fn compile(source: &str) -> Result<Selector, ParseError> {
    Selector::parse(source).map_err(|err| ParseError::InvalidSelector {
        selector: source.to_string(),
        message: format!("{err:?}"),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strictness {
    /// Failures are typed errors.
    Strict,
    /// Failures come back as an empty result for the caller to skip.
    #[default]
    Lenient,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Page URL, only used in diagnostics.
    pub url: Option<String>,
    pub strictness: Strictness,
    pub fallback_title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChapterLocators {
    pub title: Locators,
    pub content: Locators,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedChapter {
    pub title: String,
    pub content_html: String,
}

pub fn extract_chapter(
    doc: &Html,
    locators: &ChapterLocators,
    options: &ExtractOptions,
) -> Result<Option<ExtractedChapter>, ParseError> {
    let hidden = hidden_classes(doc);
    let Some(content) = locators
        .content
        .first_match(doc, |el| !is_hidden(el, &hidden) && has_visible_content(el, &hidden))
    else {
        if options.strictness == Strictness::Strict {
            return Err(ParseError::Chapter {
                reason: "Could not locate chapter content".to_string(),
                url: options.url.clone(),
                tried: locators.content.sources(),
            });
        }
        tracing::debug!(url = ?options.url, "no content locator matched");
        return Ok(None);
    };

    let title = match locators
        .title
        .first_match(doc, |el| !is_hidden(el, &hidden) && !element_text(el).is_empty())
    {
        Some(el) => element_text(&el),
        None => fallback_title(content, &hidden, locators, options)?,
    };

    let content_html = outer_html_with(content, &mut |el| {
        if has_hidden_class(&el, &hidden) {
            ElementAction::Drop
        } else {
            ElementAction::Keep
        }
    });

    Ok(Some(ExtractedChapter {
        title,
        content_html,
    }))
}

fn fallback_title(
    content: ElementRef<'_>,
    hidden: &HashSet<String>,
    locators: &ChapterLocators,
    options: &ExtractOptions,
) -> Result<String, ParseError> {
    if let Some(title) = options
        .fallback_title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty())
    {
        return Ok(title.to_string());
    }

    if let Some(heading) = content
        .select(&CONTENT_HEADING)
        .filter(|el| !is_hidden(el, hidden))
        .map(|el| element_text(&el))
        .find(|text| !text.is_empty())
    {
        return Ok(heading);
    }

    if options.strictness == Strictness::Strict {
        return Err(ParseError::Chapter {
            reason: "Could not locate chapter title".to_string(),
            url: options.url.clone(),
            tried: locators.title.sources(),
        });
    }

    Ok(PLACEHOLDER_TITLE.to_string())
}

/// Classes hidden by a `display: none` rule in an inline head stylesheet.
pub fn hidden_classes(doc: &Html) -> HashSet<String> {
    let mut hidden = HashSet::new();
    for style in doc.select(&HEAD_STYLE) {
        let css = style.text().collect::<String>();
        let css = CSS_COMMENT.replace_all(&css, "");
        for rule in CSS_RULE.captures_iter(&css) {
            if !DISPLAY_NONE.is_match(&rule[2]) {
                continue;
            }
            for selector in rule[1].split(',') {
                if let Some(class) = CLASS_SELECTOR.captures(selector.trim()) {
                    hidden.insert(class[1].to_string());
                }
            }
        }
    }
    hidden
}

fn has_hidden_class(el: &ElementRef<'_>, hidden: &HashSet<String>) -> bool {
    el.value().classes().any(|class| hidden.contains(class))
}

/// True when `el` or any of its ancestors carries a hidden class.
fn is_hidden(el: &ElementRef<'_>, hidden: &HashSet<String>) -> bool {
    !hidden.is_empty()
        && (has_hidden_class(el, hidden)
            || el
                .ancestors()
                .filter_map(ElementRef::wrap)
                .any(|ancestor| has_hidden_class(&ancestor, hidden)))
}

/// Non-blank text or an image that survives hidden-class stripping.
fn has_visible_content(el: &ElementRef<'_>, hidden: &HashSet<String>) -> bool {
    el.children().any(|child| match ElementRef::wrap(child) {
        Some(child) => {
            !has_hidden_class(&child, hidden)
                && (child.value().name() == "img" || has_visible_content(&child, hidden))
        }
        None => child
            .value()
            .as_text()
            .is_some_and(|text| !text.trim().is_empty()),
    })
}

/// Text content with whitespace runs collapsed to single spaces.
pub fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Where chapter links live on a fiction page, from most to least specific.
#[derive(Debug, Clone)]
pub struct TocLocators {
    canonical: (String, Selector),
    broader: (String, Selector),
    link_pattern: Regex,
}

impl TocLocators {
    /// `link_pattern` must capture the chapter id in a group named `id`.
    pub fn new(canonical: &str, broader: &[&str], link_pattern: &str) -> Result<Self, ParseError> {
        let link_pattern = Regex::new(link_pattern).map_err(|err| ParseError::InvalidSelector {
            selector: link_pattern.to_string(),
            message: err.to_string(),
        })?;
        if !link_pattern.capture_names().any(|name| name == Some("id")) {
            return Err(ParseError::InvalidSelector {
                selector: link_pattern.to_string(),
                message: "link pattern has no `id` capture group".to_string(),
            });
        }

        let broader = broader.join(", ");
        Ok(Self {
            canonical: (canonical.to_string(), compile(canonical)?),
            broader: (broader.clone(), compile(&broader)?),
            link_pattern,
        })
    }

    pub fn link_pattern(&self) -> &Regex {
        &self.link_pattern
    }

    fn tier_descriptions(&self) -> [String; 3] {
        [
            self.canonical.0.clone(),
            self.broader.0.clone(),
            format!("a[href] ~ /{}/ (global)", self.link_pattern.as_str()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterLink {
    pub id: String,
    pub url: Url,
    pub title: Option<String>,
}

/// Chapter links in document order, deduplicated by id, escalating through
/// up to `max_tier` tiers until one yields something.
pub fn discover_chapter_links(
    base_url: &Url,
    doc: &Html,
    toc: &TocLocators,
    max_tier: u8,
    strictness: Strictness,
) -> Result<Vec<ChapterLink>, ParseError> {
    let max_tier = max_tier.clamp(1, 3);
    let descriptions = toc.tier_descriptions();

    for tier in 1..=max_tier {
        let links = match tier {
            1 => doc
                .select(&toc.canonical.1)
                .next()
                .map(|container| collect_links(base_url, container, &toc.link_pattern))
                .unwrap_or_default(),
            2 => doc
                .select(&toc.broader.1)
                .map(|container| collect_links(base_url, container, &toc.link_pattern))
                .find(|links| !links.is_empty())
                .unwrap_or_default(),
            _ => collect_links(base_url, doc.root_element(), &toc.link_pattern),
        };

        if !links.is_empty() {
            tracing::debug!(url = %base_url, tier, links = links.len(), "chapter links found");
            return Ok(links);
        }
    }

    if strictness == Strictness::Strict {
        return Err(ParseError::Fiction {
            reason: "Could not locate chapter table of contents".to_string(),
            url: base_url.to_string(),
            tried: descriptions[..usize::from(max_tier)].to_vec(),
        });
    }
    Ok(Vec::new())
}

fn collect_links(base_url: &Url, scope: ElementRef<'_>, pattern: &Regex) -> Vec<ChapterLink> {
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for anchor in scope.select(&ANCHOR) {
        let Some(href) = anchor.value().attr("href").map(str::trim) else {
            continue;
        };
        if href.is_empty() || href.starts_with('#') {
            continue;
        }
        let Ok(url) = base_url.join(href) else {
            continue;
        };
        if !pattern.is_match(url.as_str()) {
            continue;
        }
        let Some(id) = pattern
            .captures(url.as_str())
            .and_then(|caps| caps.name("id"))
            .map(|id| id.as_str().to_string())
            .filter(|id| !id.is_empty())
        else {
            tracing::warn!(url = %url, "chapter link has no derivable id; rejected");
            continue;
        };
        if !seen.insert(id.clone()) {
            continue;
        }

        let title = Some(element_text(&anchor)).filter(|text| !text.is_empty());
        links.push(ChapterLink { id, url, title });
    }

    links
}
