//! The three independent extraction heuristics. Each is a pure function of the
//! parsed page and its context; overlap between them is resolved downstream.

use std::collections::HashSet;
use std::sync::LazyLock;

use eventscout_core::{truncate_chars, CandidateEvent, DESCRIPTION_MAX_CHARS, TITLE_MIN_CHARS};
use scraper::{ElementRef, Html, Selector};

use crate::patterns::{self, find_date, find_location, find_time};
use crate::scoring::{categorize, detect_tags, is_deadline, is_event_like, score_priority};
use crate::{clean_title, collapse_whitespace, make_id, resolve_link, text_lines, ExtractContext};

const LINE_TITLE_MIN: usize = 10;
const LINE_TITLE_MAX: usize = 200;
const SENTENCE_MIN_CHARS: usize = 20;

static CONTAINERS: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(
        ".event, .event-item, .events-item, .activity, .news-item, .calendar-item, \
         [class*='event'], [class*='activity'], [class*='calendar'], [id*='event'], \
         article, .content-item, .list-item, .post",
    )
    .expect("valid container selector")
});

static HEADINGS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1, h2, h3, h4, h5, h6").expect("valid heading selector"));

static TITLE_CLASSES: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".title, .headline").expect("valid title selector"));

static DESCRIPTIONS: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("p, .description, .summary").expect("valid description selector")
});

static ANY_ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a").expect("valid anchor selector"));

static LINKS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid link selector"));

const CONTEXT_BLOCKS: &[&str] = &["div", "article", "section", "li"];

const UNSCANNED: &[&str] = &["script", "style", "noscript", "template"];

fn char_len(value: &str) -> usize {
    value.chars().count()
}

fn first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .map(|n| collapse_whitespace(&n.text().collect::<String>()))
        .find(|text| !text.is_empty())
}

fn usable_title(raw: &str) -> Option<String> {
    let title = clean_title(raw);
    (char_len(&title) >= TITLE_MIN_CHARS).then_some(title)
}

fn line_title_window(line: &str) -> bool {
    (LINE_TITLE_MIN..=LINE_TITLE_MAX).contains(&char_len(line))
}

fn container_title(element: ElementRef<'_>, lines: &[String]) -> Option<String> {
    let candidates = [
        first_text(element, &HEADINGS),
        first_text(element, &TITLE_CLASSES),
        first_text(element, &ANY_ANCHOR),
        lines.iter().find(|line| line_title_window(line)).cloned(),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|raw| usable_title(&raw))
}

fn description(element: ElementRef<'_>, lines: &[String]) -> Option<String> {
    let text = first_text(element, &DESCRIPTIONS).or_else(|| {
        let sentences = lines
            .join(" ")
            .split(['.', '!', '?', '؟'])
            .map(str::trim)
            .filter(|s| char_len(s) >= SENTENCE_MIN_CHARS)
            .take(2)
            .map(str::to_string)
            .collect::<Vec<_>>();
        (!sentences.is_empty()).then(|| sentences.join(". "))
    })?;
    Some(truncate_chars(&text, DESCRIPTION_MAX_CHARS).trim_end().to_string())
}

fn first_link(element: ElementRef<'_>, ctx: &ExtractContext) -> Option<String> {
    element
        .select(&LINKS)
        .filter_map(|a| a.value().attr("href"))
        .find_map(|href| resolve_link(&ctx.base, href))
}

#[derive(Debug, Default)]
struct Found {
    title: String,
    description: Option<String>,
    date: Option<String>,
    time: Option<String>,
    location: Option<String>,
    link: Option<String>,
}

fn candidate(ctx: &ExtractContext, found: Found) -> CandidateEvent {
    let scored_text = match &found.description {
        Some(description) => format!("{} {description}", found.title),
        None => found.title.clone(),
    };
    let parsed_date = found.date.as_deref().and_then(patterns::parse_date);

    CandidateEvent {
        id: make_id(&ctx.organizer, &found.title),
        priority: score_priority(&scored_text, parsed_date, ctx.today),
        category: categorize(&scored_text).to_string(),
        deadline: is_deadline(&scored_text),
        tags: detect_tags(&scored_text),
        title: found.title,
        description: found.description,
        date: found.date,
        time: found.time,
        location: found.location,
        link: found.link,
        source: ctx.source.clone(),
        organizer: ctx.organizer.clone(),
    }
}

/// Strategy A: elements whose class, id or tag marks them as an event card.
pub fn structured_containers(document: &Html, ctx: &ExtractContext) -> Vec<CandidateEvent> {
    let mut out = Vec::new();
    for element in document.select(&CONTAINERS) {
        let lines = text_lines(element);
        let Some(title) = container_title(element, &lines) else {
            continue;
        };
        let text = lines.join("\n");
        out.push(candidate(
            ctx,
            Found {
                title,
                description: description(element, &lines),
                date: find_date(&text).map(|m| m.text),
                time: find_time(&text),
                location: find_location(&text),
                link: first_link(element, ctx),
            },
        ));
    }
    out
}

/// Strategy B: every date mention, expanded to its nearest block container.
pub fn date_anchored(document: &Html, ctx: &ExtractContext) -> Vec<CandidateEvent> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    'nodes: for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let dates = patterns::find_all_dates(text);
        if dates.is_empty() {
            continue;
        }

        let mut container = None;
        for ancestor in node.ancestors().filter_map(ElementRef::wrap) {
            let name = ancestor.value().name();
            if UNSCANNED.contains(&name) {
                continue 'nodes;
            }
            if container.is_none() && CONTEXT_BLOCKS.contains(&name) {
                container = Some(ancestor);
            }
        }
        let Some(container) = container else {
            continue;
        };

        let lines = text_lines(container);
        let block = lines.join("\n");
        for date in dates {
            if !seen.insert((container.id(), date.text.clone())) {
                continue;
            }
            let title = lines
                .iter()
                .filter(|line| line_title_window(line))
                .filter(|line| !line.starts_with(|c: char| c.is_numeric()))
                .filter(|line| line.as_str() != date.text)
                .find_map(|line| usable_title(line));
            let Some(title) = title else {
                continue;
            };
            out.push(candidate(
                ctx,
                Found {
                    title,
                    description: description(container, &lines),
                    date: Some(date.text),
                    time: find_time(&block),
                    location: find_location(&block),
                    link: first_link(container, ctx),
                },
            ));
        }
    }
    out
}

/// Strategy C: anchors whose text carries event vocabulary.
pub fn keyword_links(document: &Html, ctx: &ExtractContext) -> Vec<CandidateEvent> {
    let mut out = Vec::new();
    for anchor in document.select(&LINKS) {
        let text = collapse_whitespace(&anchor.text().collect::<String>());
        if !line_title_window(&text) || !is_event_like(&text) {
            continue;
        }
        let Some(title) = usable_title(&text) else {
            continue;
        };
        let link = anchor
            .value()
            .attr("href")
            .and_then(|href| resolve_link(&ctx.base, href));
        out.push(candidate(
            ctx,
            Found {
                title,
                date: find_date(&text).map(|m| m.text),
                time: find_time(&text),
                link,
                ..Found::default()
            },
        ));
    }
    out
}
