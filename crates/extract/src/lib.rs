//! Extraction pipeline (C5, §4.5). Turns one fetched HTML page into a
//! `RawPageRecord`: text extraction cascade, quality scoring, cleanup,
//! content-hash identity, budget accounting, markdown + metadata, and a
//! blocking-tally hook, in that fixed order.
//!
//! Adapted from the teacher's `parse_response`/`parse_html` (selector
//! reads over `scraper::Html`); the entity-extraction half of the
//! teacher's pipeline has no counterpart here and was dropped.

pub mod cleanup;
pub mod html;
pub mod identity;
pub mod quality;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;
use sha2::{Digest, Sha256};
use url::Url;

use crawlhub_core::{ExtractionMode, RawPageRecord};

pub use identity::IdentityTracker;
pub use quality::MIN_TEXT_LENGTH_SUCCESS;

static TAG_STRIP: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<[^>]+>").expect("static tag-strip pattern"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static whitespace pattern"));

/// One fetched response, as handed off by a `Fetcher` implementation.
pub struct FetchedPage {
    pub url: Url,
    pub canonical_url: String,
    pub fetched_at: DateTime<Utc>,
    pub status_code: u16,
    pub content_type: Option<String>,
    pub html: String,
    pub depth: u32,
}

/// Runs stages 1-3 and 6-7 of the pipeline and assembles a `RawPageRecord`.
/// Stage 4 (identity) and stage 5 (budget) are applied by the caller via
/// `IdentityTracker`/the fetcher's own page counter, since both need
/// cross-page, per-job state this function doesn't own.
pub fn extract(page: &FetchedPage) -> RawPageRecord {
    if page.status_code >= 400 {
        return error_record(page, format!("http_status_{}", page.status_code));
    }

    let document = Html::parse_document(&page.html);
    let parts = html::parse(&page.html, &page.url);

    let (text, extraction_mode) = text_cascade(&page.html, &parts.body_text);
    let text_hash = format!("sha256:{}", hex::encode(Sha256::digest(normalize(&text).as_bytes())));

    let link_text_len: usize = parts.links.len() * 8;
    let quality = quality::score(&text, parts.title.is_some(), page.html.len(), link_text_len);
    let cleaned_text = cleanup::clean(&text);

    let (markdown, sections) = html::render_markdown(&document);
    let breadcrumbs = html::breadcrumbs(&document);

    RawPageRecord {
        url: page.url.to_string(),
        canonical_url: page.canonical_url.clone(),
        fetched_at: page.fetched_at,
        status_code: page.status_code,
        content_type: page.content_type.clone(),
        title: parts.title,
        text: cleaned_text,
        markdown,
        text_hash,
        extraction_mode,
        depth: page.depth,
        outlinks_count: parts.links.len() as u32,
        sections,
        breadcrumbs,
        last_modified: parts.last_modified,
        quality_score: quality.score,
        quality_passed: quality.passed,
        quality_reasons: quality.reasons,
        document_id: None,
        is_duplicate: false,
        counts_toward_budget: false,
        error: None,
    }
}

fn error_record(page: &FetchedPage, error: String) -> RawPageRecord {
    RawPageRecord {
        url: page.url.to_string(),
        canonical_url: page.canonical_url.clone(),
        fetched_at: page.fetched_at,
        status_code: page.status_code,
        content_type: page.content_type.clone(),
        title: None,
        text: String::new(),
        markdown: String::new(),
        text_hash: format!("sha256:{}", hex::encode(Sha256::digest(b""))),
        extraction_mode: ExtractionMode::Fallback,
        depth: page.depth,
        outlinks_count: 0,
        sections: Vec::new(),
        breadcrumbs: Vec::new(),
        last_modified: None,
        quality_score: 0.0,
        quality_passed: false,
        quality_reasons: vec!["http_error".to_string()],
        document_id: None,
        is_duplicate: false,
        counts_toward_budget: false,
        error: Some(error),
    }
}

/// Stage 1. Tries the primary extractor (`html2text`), then the
/// secondary extractor's body text, then a raw tag-strip fallback, and
/// keeps the first whose stripped length clears `MIN_TEXT_LENGTH_SUCCESS`.
/// Falls back to the best (longest) candidate if none clear the bar.
fn text_cascade(html_str: &str, secondary_text: &str) -> (String, ExtractionMode) {
    let primary = html2text::from_read(html_str.as_bytes(), usize::MAX).unwrap_or_default();
    let primary = primary.trim().to_string();
    if primary.chars().count() >= MIN_TEXT_LENGTH_SUCCESS {
        return (primary, ExtractionMode::Primary);
    }

    let secondary = secondary_text.trim().to_string();
    if secondary.chars().count() >= MIN_TEXT_LENGTH_SUCCESS {
        return (secondary, ExtractionMode::Secondary);
    }

    let fallback = TAG_STRIP.replace_all(html_str, " ").trim().to_string();
    let fallback = WHITESPACE.replace_all(&fallback, " ").to_string();

    [
        (primary, ExtractionMode::Primary),
        (secondary, ExtractionMode::Secondary),
        (fallback, ExtractionMode::Fallback),
    ]
    .into_iter()
    .max_by_key(|(text, _)| text.chars().count())
    .expect("non-empty candidate list")
}

fn normalize(text: &str) -> String {
    WHITESPACE.replace_all(&text.to_lowercase(), " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_page(html: &str) -> FetchedPage {
        FetchedPage {
            url: Url::parse("https://example.org/a").unwrap(),
            canonical_url: "https://example.org/a".to_string(),
            fetched_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            status_code: 200,
            content_type: Some("text/html".to_string()),
            html: html.to_string(),
            depth: 0,
        }
    }

    #[test]
    fn long_page_extracts_and_passes_quality() {
        let body = format!("<p>{}</p>", "word ".repeat(200));
        let html = format!("<html><head><title>Sample</title></head><body>{body}</body></html>");
        let record = extract(&sample_page(&html));
        assert!(record.quality_score > 0.0);
        assert!(!record.text.is_empty());
        assert!(record.error.is_none());
    }

    #[test]
    fn http_error_status_short_circuits_to_error_record() {
        let mut page = sample_page("<html></html>");
        page.status_code = 503;
        let record = extract(&page);
        assert!(!record.quality_passed);
        assert!(record.error.is_some());
    }

    #[test]
    fn text_hash_is_stable_for_equivalent_content() {
        let a = normalize("Hello   World");
        let b = normalize("hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn markdown_preserves_anchor_links() {
        let html = "<html><body><p>see <a href=\"/docs\">the docs</a> for more</p></body></html>";
        let document = Html::parse_document(html);
        let (markdown, _) = html::render_markdown(&document);
        assert!(markdown.contains("[the docs](/docs)"));
    }

    #[test]
    fn sections_capture_heading_outline() {
        let html = "<html><body><h1 id=\"intro\">Intro</h1><p>text</p></body></html>";
        let document = Html::parse_document(html);
        let (_, sections) = html::render_markdown(&document);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].anchor, "intro");
        assert_eq!(sections[0].level, 1);
    }
}
