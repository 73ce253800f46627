//! Secondary text extractor and structural readers (headings, links,
//! breadcrumbs, meta). Adapted from the teacher's `parse_html` —
//! selector-driven reads over a parsed `scraper::Html` document, kept as
//! the fallback-before-last extractor in the text cascade and the source
//! of truth for link discovery and markdown rendering.

use scraper::{ElementRef, Html, Node, Selector};
use url::Url;

use crawlhub_core::Section;

pub struct HtmlParts {
    pub title: Option<String>,
    pub body_text: String,
    pub links: Vec<Url>,
    pub meta_description: Option<String>,
    pub last_modified: Option<String>,
}

pub fn parse(html_str: &str, base_url: &Url) -> HtmlParts {
    let document = Html::parse_document(html_str);

    let title = selector("title")
        .and_then(|s| document.select(&s).next())
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    let body_text = selector("body")
        .and_then(|s| document.select(&s).next())
        .map(|el| {
            el.text()
                .collect::<Vec<_>>()
                .join(" ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();

    let links = extract_links(&document, base_url);
    let meta_description = meta_content(&document, "description");
    let last_modified = meta_content(&document, "last-modified")
        .or_else(|| meta_property(&document, "article:modified_time"))
        .or_else(|| first_time_datetime(&document));

    HtmlParts {
        title,
        body_text,
        links,
        meta_description,
        last_modified,
    }
}

fn selector(s: &str) -> Option<Selector> {
    Selector::parse(s).ok()
}

fn extract_links(document: &Html, base_url: &Url) -> Vec<Url> {
    let Some(sel) = selector("a[href]") else {
        return Vec::new();
    };
    document
        .select(&sel)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| base_url.join(href).ok())
        .collect()
}

fn meta_content(document: &Html, name: &str) -> Option<String> {
    let sel = selector(&format!("meta[name='{name}']"))?;
    document
        .select(&sel)
        .next()
        .and_then(|el| el.value().attr("content"))
        .map(|s| s.to_string())
}

fn meta_property(document: &Html, property: &str) -> Option<String> {
    let sel = selector(&format!("meta[property='{property}']"))?;
    document
        .select(&sel)
        .next()
        .and_then(|el| el.value().attr("content"))
        .map(|s| s.to_string())
}

fn first_time_datetime(document: &Html) -> Option<String> {
    let sel = selector("time[datetime]")?;
    document
        .select(&sel)
        .next()
        .and_then(|el| el.value().attr("datetime"))
        .map(|s| s.to_string())
}

/// Extracts the breadcrumb trail from common nav containers.
pub fn breadcrumbs(document: &Html) -> Vec<String> {
    for sel_str in [
        "nav.breadcrumb a, nav.breadcrumbs a",
        ".breadcrumb a, .breadcrumbs a",
        "[aria-label='breadcrumb'] a, [aria-label='Breadcrumb'] a",
    ] {
        if let Some(sel) = selector(sel_str) {
            let items: Vec<String> = document
                .select(&sel)
                .map(|el| el.text().collect::<String>().trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            if !items.is_empty() {
                return items;
            }
        }
    }
    Vec::new()
}

/// Walks headings and paragraphs in document order, rendering Markdown
/// with anchor links preserved, and returns the section outline built
/// from the same pass. This is the "simplest primitive that preserves
/// anchors" — a direct DOM walk rather than a full HTML-to-Markdown
/// converter.
pub fn render_markdown(document: &Html) -> (String, Vec<Section>) {
    let Some(sel) = selector("h1, h2, h3, h4, h5, h6, p, li") else {
        return (String::new(), Vec::new());
    };

    let mut markdown = String::new();
    let mut sections = Vec::new();

    for el in document.select(&sel) {
        let tag = el.value().name();
        let inline = render_inline(el);
        if inline.trim().is_empty() {
            continue;
        }

        match tag {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level: u8 = tag[1..].parse().unwrap_or(1);
                let anchor = el
                    .value()
                    .attr("id")
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| slugify(&inline));
                markdown.push_str(&"#".repeat(level as usize));
                markdown.push(' ');
                markdown.push_str(&inline);
                markdown.push_str("\n\n");
                sections.push(Section {
                    level,
                    title: inline.clone(),
                    anchor,
                });
            }
            "li" => {
                markdown.push_str("- ");
                markdown.push_str(&inline);
                markdown.push('\n');
            }
            _ => {
                markdown.push_str(&inline);
                markdown.push_str("\n\n");
            }
        }
    }

    (markdown.trim_end().to_string(), sections)
}

/// Renders an element's direct text/anchor children, turning `<a href>`
/// into `[text](href)` and collapsing everything else to plain text.
fn render_inline(el: ElementRef) -> String {
    let mut out = String::new();
    for child in el.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text.trim()),
            Node::Element(elem) if elem.name() == "a" => {
                if let Some(anchor) = ElementRef::wrap(child) {
                    let text = anchor.text().collect::<String>();
                    let text = text.trim();
                    if let Some(href) = elem.attr("href") {
                        if !text.is_empty() {
                            out.push_str(&format!("[{text}]({href})"));
                        }
                    } else if !text.is_empty() {
                        out.push_str(text);
                    }
                }
            }
            Node::Element(_) => {
                if let Some(nested) = ElementRef::wrap(child) {
                    out.push_str(nested.text().collect::<String>().trim());
                }
            }
            _ => {}
        }
        out.push(' ');
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn slugify(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
