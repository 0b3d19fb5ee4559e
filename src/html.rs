//! Serialization of parsed HTML subtrees into XHTML-compatible markup.
//!
//! Parsed documents are never mutated. Callers describe what to drop or
//! rewrite with a per-element visitor and get a new string back.

use scraper::{ElementRef, Html, Node};

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// What to do with an element while serializing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementAction {
    Keep,
    /// Leave out the element and its whole subtree.
    Drop,
    /// Keep the element with these attributes instead of the parsed ones.
    Rewrite(Vec<(String, String)>),
}

/// Serialize `element` itself (outer markup).
pub fn outer_html_with<F>(element: ElementRef<'_>, visit: &mut F) -> String
where
    F: FnMut(&ElementRef<'_>) -> ElementAction,
{
    let mut out = String::new();
    write_element(&mut out, element, visit);
    out
}

/// Parse an HTML fragment and serialize it back through `visit`.
pub fn transform_fragment<F>(fragment: &str, visit: &mut F) -> String
where
    F: FnMut(&ElementRef<'_>) -> ElementAction,
{
    let parsed = Html::parse_fragment(fragment);
    let mut out = String::new();
    write_children(&mut out, parsed.root_element(), visit);
    out
}

/// Parse and re-serialize without changes. Normalizes void tags etc.
pub fn normalize_fragment(fragment: &str) -> String {
    transform_fragment(fragment, &mut |_| ElementAction::Keep)
}

fn write_element<F>(out: &mut String, element: ElementRef<'_>, visit: &mut F)
where
    F: FnMut(&ElementRef<'_>) -> ElementAction,
{
    let attrs = match visit(&element) {
        ElementAction::Drop => return,
        ElementAction::Keep => element
            .value()
            .attrs()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect::<Vec<_>>(),
        ElementAction::Rewrite(attrs) => attrs,
    };

    let name = element.value().name();
    out.push('<');
    out.push_str(name);
    for (attr, value) in &attrs {
        out.push(' ');
        out.push_str(attr);
        out.push_str("=\"");
        out.push_str(&escape_attr(value));
        out.push('"');
    }

    if VOID_TAGS.contains(&name) {
        out.push_str(" />");
        return;
    }

    out.push('>');
    write_children(out, element, visit);
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn write_children<F>(out: &mut String, element: ElementRef<'_>, visit: &mut F)
where
    F: FnMut(&ElementRef<'_>) -> ElementAction,
{
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(&escape_text(text)),
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    write_element(out, child, visit);
                }
            }
            _ => {}
        }
    }
}

/// Escapes markup characters and drops characters XML 1.0 cannot carry,
/// such as C0 controls and noncharacters.
pub fn escape_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars().filter(|&ch| is_xml_char(ch)) {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

fn is_xml_char(ch: char) -> bool {
    matches!(
        ch,
        '\t' | '\n' | '\r' | '\u{20}'..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..
    )
}

pub fn escape_attr(input: &str) -> String {
    escape_text(input).replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use scraper::Selector;

    use super::*;

    #[test]
    fn void_tags_are_self_closed_and_text_escaped() {
        let out = normalize_fragment("<p>a &amp; b <br> 日本語</p><img src=\"x.png\">");
        assert_eq!(out, "<p>a &amp; b <br /> 日本語</p><img src=\"x.png\" />");
    }

    #[test]
    fn characters_invalid_in_xml_are_dropped() {
        assert_eq!(escape_text("a\u{1}b\u{8}\tc\u{FFFE}<d>"), "ab\tc&lt;d&gt;");
        assert_eq!(escape_attr("x\u{B}\"y\""), "x&quot;y&quot;");

        let out = normalize_fragment("<p title=\"t\u{1F}\">one\u{C}two \u{1F600}</p>");
        assert_eq!(out, "<p title=\"t\">onetwo \u{1F600}</p>");
    }

    #[test]
    fn dropped_elements_take_their_subtree_with_them() {
        let out = transform_fragment(
            "<div><p class=\"decoy\">hidden <b>bold</b></p><p>shown</p></div>",
            &mut |el| {
                if el.value().has_class("decoy", scraper::CaseSensitivity::CaseSensitive) {
                    ElementAction::Drop
                } else {
                    ElementAction::Keep
                }
            },
        );
        assert_eq!(out, "<div><p>shown</p></div>");
    }

    #[test]
    fn rewrite_replaces_attributes() {
        let out = transform_fragment("<img src=\"a.png\" alt=\"A\">", &mut |el| {
            if el.value().name() == "img" {
                ElementAction::Rewrite(vec![("src".to_string(), "images/1.jpg".to_string())])
            } else {
                ElementAction::Keep
            }
        });
        assert_eq!(out, "<img src=\"images/1.jpg\" />");
    }

    #[test]
    fn outer_html_leaves_the_document_untouched() {
        let doc = Html::parse_document("<html><body><div id=\"c\"><p>x</p><i>y</i></div></body></html>");
        let selector = Selector::parse("#c").unwrap();
        let element = doc.select(&selector).next().unwrap();

        let out = outer_html_with(element, &mut |el| {
            if el.value().name() == "i" {
                ElementAction::Drop
            } else {
                ElementAction::Keep
            }
        });
        assert_eq!(out, "<div id=\"c\"><p>x</p></div>");
        assert!(element.html().contains("<i>y</i>"));
    }
}
