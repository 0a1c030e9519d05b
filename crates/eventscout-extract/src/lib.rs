//! HTML parsing and heuristic event extraction for civil-society listing pages.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{NaiveDate, Utc};
use eventscout_core::{truncate_chars, CandidateEvent, TITLE_MAX_CHARS};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub mod patterns;
pub mod scoring;
mod strategies;

pub use strategies::{date_anchored, keyword_links, structured_containers};

pub const CRATE_NAME: &str = "eventscout-extract";

const ID_MAX_CHARS: usize = 50;

const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "template"];

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "li", "ul", "ol", "h1", "h2", "h3", "h4", "h5", "h6", "br", "section", "article",
    "tr", "td", "th", "table", "header", "footer", "dt", "dd", "blockquote", "time",
];

/// Path fragments and link words that point at listing pages.
const LISTING_HINTS: &[&str] = &[
    "event",
    "calendar",
    "news",
    "activit",
    "program",
    "opportunit",
    "فعاليات",
    "فعالية",
    "أخبار",
    "نشاطات",
    "أنشطة",
];

static TITLE_NOISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"[^\w\s\-\x{0600}-\x{06FF}\x{0750}-\x{077F}\x{08A0}-\x{08FF}\x{FB50}-\x{FDFF}\x{FE70}-\x{FEFF}]",
    )
    .expect("valid title noise regex")
});

static ANCHORS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid anchor selector"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("document is empty")]
    Empty,
    #[error("document contains no markup")]
    NotMarkup,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("source url is not an absolute http(s) url: {0}")]
    InvalidSourceUrl(String),
}

/// Parses raw markup. The HTML5 tree builder recovers from most damage, so only
/// input with nothing to recover is refused.
pub fn parse_document(html: &str) -> Result<Html, ParseError> {
    if html.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    if !html.contains('<') {
        return Err(ParseError::NotMarkup);
    }
    let document = Html::parse_document(html);
    if !document.errors.is_empty() {
        debug!(recovered = document.errors.len(), "html parser recovered from errors");
    }
    Ok(document)
}

/// Per-page inputs shared by every strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractContext {
    pub source: String,
    pub base: Url,
    pub organizer: String,
    pub today: NaiveDate,
}

impl ExtractContext {
    pub fn new(source_url: &str) -> Result<Self, ExtractError> {
        let base = Url::parse(source_url)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
            .ok_or_else(|| ExtractError::InvalidSourceUrl(source_url.to_string()))?;
        Ok(Self {
            source: source_url.to_string(),
            organizer: organizer_from_url(&base),
            base,
            today: Utc::now().date_naive(),
        })
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }
}

/// Runs all three strategies over one page and returns their union, unvalidated.
pub fn extract(html: &str, source_url: &str) -> Result<Vec<CandidateEvent>, ExtractError> {
    let ctx = ExtractContext::new(source_url)?;
    let document = parse_document(html)?;
    Ok(extract_document(&document, &ctx))
}

pub fn extract_document(document: &Html, ctx: &ExtractContext) -> Vec<CandidateEvent> {
    let containers = structured_containers(document, ctx);
    let dated = date_anchored(document, ctx);
    let links = keyword_links(document, ctx);
    debug!(
        source = %ctx.source,
        containers = containers.len(),
        dated = dated.len(),
        links = links.len(),
        "extracted candidates"
    );

    let mut out = containers;
    out.extend(dated);
    out.extend(links);
    out
}

/// Same-site links whose text or href suggests an events/news listing.
pub fn discover_event_links(document: &Html, ctx: &ExtractContext) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for anchor in document.select(&ANCHORS) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let text = collapse_whitespace(&anchor.text().collect::<String>()).to_lowercase();
        let href_lower = href.to_lowercase();
        let hinted = LISTING_HINTS
            .iter()
            .any(|hint| text.contains(hint) || href_lower.contains(hint))
            || scoring::is_event_like(&text);
        if !hinted {
            continue;
        }
        let Some(resolved) = resolve_link(&ctx.base, href) else {
            continue;
        };
        let same_site = Url::parse(&resolved)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .is_some_and(|host| Some(host.as_str()) == ctx.base.host_str());
        if same_site && resolved != ctx.base.as_str() && seen.insert(resolved.clone()) {
            out.push(resolved);
        }
    }
    out
}

pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whitespace-collapsed, symbol-free title limited to 200 characters.
pub fn clean_title(raw: &str) -> String {
    let collapsed = collapse_whitespace(raw);
    let stripped = TITLE_NOISE.replace_all(&collapsed, "");
    let cleaned = collapse_whitespace(&stripped);
    truncate_chars(&cleaned, TITLE_MAX_CHARS).trim().to_string()
}

pub fn slugify(value: &str) -> String {
    value
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

pub fn make_id(organizer: &str, identifier: &str) -> String {
    truncate_chars(&format!("{organizer}-{}", slugify(identifier)), ID_MAX_CHARS)
}

/// First DNS label of the host, without a leading `www.`.
pub fn organizer_from_url(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let host = host.strip_prefix("www.").unwrap_or(host);
    host.split('.').next().unwrap_or(host).to_string()
}

pub fn resolve_link(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    let lower = href.to_ascii_lowercase();
    if href.is_empty()
        || href.starts_with('#')
        || ["javascript:", "mailto:", "tel:"]
            .iter()
            .any(|scheme| lower.starts_with(scheme))
    {
        return None;
    }
    let resolved = base.join(href).ok()?;
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

fn push_block_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
        } else if let Some(child_element) = ElementRef::wrap(child) {
            let name = child_element.value().name();
            if SKIPPED_TAGS.contains(&name) {
                continue;
            }
            let block = BLOCK_TAGS.contains(&name);
            if block {
                out.push('\n');
            }
            push_block_text(child_element, out);
            if block {
                out.push('\n');
            }
        }
    }
}

/// Visible text split into trimmed, non-empty lines at block boundaries.
pub fn text_lines(element: ElementRef<'_>) -> Vec<String> {
    let mut raw = String::new();
    push_block_text(element, &mut raw);
    raw.lines()
        .map(collapse_whitespace)
        .filter(|line| !line.is_empty())
        .collect()
}
